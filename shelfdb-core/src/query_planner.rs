// src/query_planner.rs
// Query planner - index selection, index-backed sort, explain output

use std::collections::BTreeSet;

use log::debug;
use serde::Serialize;
use serde_json::Value;

use crate::index::{Index, IndexBounds, IndexKey, IndexManager, KeyRange, RangeOp, SortDirection};
use crate::query::{FieldOp, Query};

/// Upper bound on equality tuples generated from `$in` lists for one index
const MAX_IN_EXPANSION: usize = 64;

/// Bounded scan of one index. Several bounds are a union (`$in`).
#[derive(Debug, Clone, PartialEq)]
pub struct IndexScan {
    pub index_name: String,
    /// Index fields constrained by the bounds
    pub fields: Vec<String>,
    pub bounds: Vec<IndexBounds>,
}

/// Result order taken straight from an index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSort {
    pub index_name: String,
    pub prefix_len: usize,
    pub reverse: bool,
}

/// Query plan - how candidates are found and ordered.
/// No scans means a full collection scan; several scans are intersected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPlan {
    pub scans: Vec<IndexScan>,
    pub sort: Option<IndexSort>,
}

impl QueryPlan {
    pub fn collection_scan() -> Self {
        Self::default()
    }

    pub fn is_collection_scan(&self) -> bool {
        self.scans.is_empty()
    }

    pub fn stage(&self) -> &'static str {
        if self.scans.is_empty() && self.sort.is_none() {
            "COLLSCAN"
        } else {
            "IXSCAN"
        }
    }

    /// Every index the plan touches, seeding indexes first
    pub fn indexes_used(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scans.iter().map(|s| s.index_name.clone()).collect();
        if let Some(sort) = &self.sort {
            if !names.contains(&sort.index_name) {
                names.push(sort.index_name.clone());
            }
        }
        names
    }

    /// Candidate slots (ascending) or `None` for "every document"
    pub fn candidates(&self, indexes: &IndexManager) -> Option<BTreeSet<u64>> {
        let mut result: Option<BTreeSet<u64>> = None;
        for scan in &self.scans {
            let Some(index) = indexes.get(&scan.index_name) else {
                continue;
            };
            let slots: BTreeSet<u64> = scan.bounds.iter().flat_map(|b| index.scan(b)).collect();
            result = Some(match result {
                Some(acc) => acc.intersection(&slots).copied().collect(),
                None => slots,
            });
        }
        result
    }

    /// Slots in index sort order, when the plan sorts from an index
    pub fn index_order(&self, indexes: &IndexManager) -> Option<Vec<u64>> {
        let sort = self.sort.as_ref()?;
        let index = indexes.get(&sort.index_name)?;
        Some(index.sorted(sort.prefix_len, sort.reverse))
    }
}

/// Query planner - analyzes filters and selects an execution plan
pub struct QueryPlanner;

impl QueryPlanner {
    pub fn plan(query: &Query, sort: &[(String, SortDirection)], indexes: &IndexManager) -> QueryPlan {
        let leaves = query.conjuncts();

        let mut candidates: Vec<(usize, IndexScan)> = indexes
            .indexes()
            .iter()
            .filter_map(|index| Self::analyze_index(index, &leaves))
            .collect();
        // best first; stable so creation order breaks ties
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let mut covered: BTreeSet<String> = BTreeSet::new();
        let mut scans = Vec::new();
        for (_, scan) in candidates {
            if scan.fields.iter().all(|f| covered.contains(f)) {
                continue;
            }
            covered.extend(scan.fields.iter().cloned());
            scans.push(scan);
        }

        let plan = QueryPlan {
            scans,
            sort: Self::analyze_sort(sort, indexes),
        };
        debug!(
            "planned {} scan(s) {:?}, sort from index: {:?}",
            plan.stage(),
            plan.indexes_used(),
            plan.sort.as_ref().map(|s| &s.index_name)
        );
        plan
    }

    /// Bounds for one index: longest equality prefix, then an optional
    /// range on the next field. Returns (score, scan).
    fn analyze_index(index: &Index, leaves: &[(&str, &FieldOp)]) -> Option<(usize, IndexScan)> {
        let mut prefixes: Vec<Vec<IndexKey>> = vec![Vec::new()];
        let mut fields = Vec::new();
        let mut range = None;

        for (field, _) in &index.definition().fields {
            if let Some(keys) = Self::equality_keys(field, leaves) {
                if prefixes.len() * keys.len() > MAX_IN_EXPANSION {
                    break;
                }
                prefixes = prefixes
                    .into_iter()
                    .flat_map(|prefix| {
                        keys.iter().map(move |key| {
                            let mut next = prefix.clone();
                            next.push(key.clone());
                            next
                        })
                    })
                    .collect();
                fields.push(field.clone());
                continue;
            }

            range = Self::range_for(field, leaves);
            if range.is_some() {
                fields.push(field.clone());
            }
            break;
        }

        if fields.is_empty() {
            return None;
        }

        let score = prefixes[0].len() * 2 + usize::from(range.is_some());
        let bounds = prefixes
            .into_iter()
            .map(|equals| IndexBounds {
                equals,
                range: range.clone(),
            })
            .collect();

        Some((
            score,
            IndexScan {
                index_name: index.name().to_string(),
                fields,
                bounds,
            },
        ))
    }

    /// Keys a field must equal: `$eq` wins over `$in`
    fn equality_keys(field: &str, leaves: &[(&str, &FieldOp)]) -> Option<Vec<IndexKey>> {
        let mut in_keys = None;
        for (leaf_field, op) in leaves {
            if *leaf_field != field {
                continue;
            }
            match op {
                FieldOp::Eq(value) => return Some(vec![IndexKey::from(value)]),
                FieldOp::In(values) if in_keys.is_none() && !values.is_empty() => {
                    let mut keys: Vec<IndexKey> = values.iter().map(IndexKey::from).collect();
                    keys.sort();
                    keys.dedup();
                    in_keys = Some(keys);
                }
                _ => {}
            }
        }
        in_keys
    }

    fn range_for(field: &str, leaves: &[(&str, &FieldOp)]) -> Option<KeyRange> {
        let mut range: Option<KeyRange> = None;
        for (leaf_field, op) in leaves {
            if *leaf_field != field {
                continue;
            }
            let (range_op, value) = match op {
                FieldOp::Gt(v) => (RangeOp::Gt, v),
                FieldOp::Gte(v) => (RangeOp::Gte, v),
                FieldOp::Lt(v) => (RangeOp::Lt, v),
                FieldOp::Lte(v) => (RangeOp::Lte, v),
                _ => continue,
            };
            let next = KeyRange::from_op(range_op, IndexKey::from(value));
            range = Some(match range {
                Some(current) => current.intersect(next),
                None => next,
            });
        }
        range.map(KeyRange::within_type)
    }

    /// Index whose leading fields match the sort spec, all directions equal or all reversed
    fn analyze_sort(sort: &[(String, SortDirection)], indexes: &IndexManager) -> Option<IndexSort> {
        if sort.is_empty() {
            return None;
        }

        indexes.indexes().iter().find_map(|index| {
            let fields = &index.definition().fields;
            if fields.len() < sort.len() {
                return None;
            }
            let pairs = || fields.iter().zip(sort);
            if !pairs().all(|((a, _), (b, _))| a == b) {
                return None;
            }
            let reverse = if pairs().all(|((_, a), (_, b))| a == b) {
                false
            } else if pairs().all(|((_, a), (_, b))| *a == b.reverse()) {
                true
            } else {
                return None;
            };
            Some(IndexSort {
                index_name: index.name().to_string(),
                prefix_len: sort.len(),
                reverse,
            })
        })
    }
}

/// `explain` output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Explain {
    pub query_plan: String,
    pub used_index: Option<String>,
    pub indexes_used: Vec<String>,
    pub sort_from_index: bool,
    pub considered_docs_count: usize,
    pub returned_docs_count: usize,
}

impl Explain {
    pub fn new(plan: &QueryPlan, considered: usize, returned: usize) -> Self {
        let indexes_used = plan.indexes_used();
        Explain {
            query_plan: plan.stage().to_string(),
            used_index: indexes_used.first().cloned(),
            indexes_used,
            sort_from_index: plan.sort.is_some(),
            considered_docs_count: considered,
            returned_docs_count: returned,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexDefinition;
    use serde_json::json;

    fn manager(specs: &[Value]) -> IndexManager {
        let mut manager = IndexManager::new();
        for spec in specs {
            let def = IndexDefinition::from_json(spec, false).unwrap();
            manager.create_index(def, std::iter::empty()).unwrap();
        }
        manager
    }

    fn plan(filter: Value, sort: &[(&str, SortDirection)], indexes: &IndexManager) -> QueryPlan {
        let query = Query::from_json(&filter).unwrap();
        let sort: Vec<(String, SortDirection)> = sort.iter().map(|(f, d)| (f.to_string(), *d)).collect();
        QueryPlanner::plan(&query, &sort, indexes)
    }

    #[test]
    fn test_equality_query_uses_index() {
        let indexes = manager(&[json!({"title": 1})]);
        let plan = plan(json!({"title": "Dune"}), &[], &indexes);

        assert_eq!(plan.stage(), "IXSCAN");
        assert_eq!(plan.scans.len(), 1);
        assert_eq!(plan.scans[0].index_name, "title_1");
        assert_eq!(plan.scans[0].bounds[0].equals, vec![IndexKey::String("Dune".into())]);
    }

    #[test]
    fn test_range_query_analysis() {
        let indexes = manager(&[json!({"price": 1})]);
        let plan = plan(json!({"price": {"$gte": 10, "$lt": 20}}), &[], &indexes);

        let range = plan.scans[0].bounds[0].range.clone().unwrap();
        assert_eq!(range.lower, Some((IndexKey::from(&json!(10)), true)));
        assert_eq!(range.upper, Some((IndexKey::from(&json!(20)), false)));
    }

    #[test]
    fn test_no_index_available() {
        let indexes = manager(&[json!({"price": 1})]);
        let plan = plan(json!({"author": "Frank Herbert"}), &[], &indexes);
        assert!(plan.is_collection_scan());
        assert_eq!(plan.stage(), "COLLSCAN");
    }

    #[test]
    fn test_or_is_not_indexed() {
        let indexes = manager(&[json!({"genre": 1})]);
        let plan = plan(json!({"$or": [{"genre": "A"}, {"genre": "B"}]}), &[], &indexes);
        assert!(plan.is_collection_scan());
    }

    #[test]
    fn test_compound_prefix_and_range() {
        let indexes = manager(&[json!({"author": 1, "published_year": 1})]);
        let plan = plan(
            json!({"author": "Ursula K. Le Guin", "published_year": {"$gt": 1970}}),
            &[],
            &indexes,
        );

        let scan = &plan.scans[0];
        assert_eq!(scan.index_name, "author_1_published_year_1");
        assert_eq!(scan.fields, vec!["author".to_string(), "published_year".to_string()]);
        assert_eq!(scan.bounds[0].equals.len(), 1);
        assert!(scan.bounds[0].range.is_some());
    }

    #[test]
    fn test_compound_needs_leading_field() {
        let indexes = manager(&[json!({"author": 1, "published_year": 1})]);
        let plan = plan(json!({"published_year": 1970}), &[], &indexes);
        assert!(plan.is_collection_scan());
    }

    #[test]
    fn test_in_expands_to_union() {
        let indexes = manager(&[json!({"genre": 1})]);
        let plan = plan(json!({"genre": {"$in": ["Poetry", "Fiction", "Poetry"]}}), &[], &indexes);
        assert_eq!(plan.scans[0].bounds.len(), 2);
    }

    #[test]
    fn test_multiple_indexes_are_intersected() {
        let indexes = manager(&[json!({"genre": 1}), json!({"in_stock": 1}), json!({"genre": 1, "price": -1})]);
        let plan = plan(json!({"genre": "Fiction", "in_stock": true}), &[], &indexes);

        let names = plan.indexes_used();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"in_stock_1".to_string()));
    }

    #[test]
    fn test_best_index_first() {
        let indexes = manager(&[json!({"author": 1}), json!({"author": 1, "published_year": 1})]);
        let plan = plan(json!({"author": "A", "published_year": {"$lt": 2000}}), &[], &indexes);
        assert_eq!(plan.scans.len(), 1);
        assert_eq!(plan.scans[0].index_name, "author_1_published_year_1");
    }

    #[test]
    fn test_sort_from_index() {
        let indexes = manager(&[json!({"price": 1, "title": 1})]);

        let asc = plan(json!({}), &[("price", SortDirection::Ascending)], &indexes);
        assert_eq!(asc.stage(), "IXSCAN");
        assert_eq!(asc.sort.as_ref().map(|s| s.reverse), Some(false));

        let desc = plan(
            json!({}),
            &[("price", SortDirection::Descending), ("title", SortDirection::Descending)],
            &indexes,
        );
        assert_eq!(desc.sort.as_ref().map(|s| (s.reverse, s.prefix_len)), Some((true, 2)));

        let mixed = plan(
            json!({}),
            &[("price", SortDirection::Ascending), ("title", SortDirection::Descending)],
            &indexes,
        );
        assert!(mixed.sort.is_none());
        assert_eq!(mixed.stage(), "COLLSCAN");
    }

    #[test]
    fn test_explain_json_shape() {
        let indexes = manager(&[json!({"title": 1})]);
        let plan = plan(json!({"title": "Dune"}), &[], &indexes);
        let explain = Explain::new(&plan, 1, 1).to_json();

        assert_eq!(explain["queryPlan"], json!("IXSCAN"));
        assert_eq!(explain["usedIndex"], json!("title_1"));
        assert_eq!(explain["consideredDocsCount"], json!(1));
        assert_eq!(explain["sortFromIndex"], json!(false));
    }
}
