// shelfdb-core/src/collection_core.rs
// In-memory collection: documents, indexes, CRUD, queries, aggregation

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ahash::AHashSet;
use log::{debug, info, trace};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::aggregation::Pipeline;
use crate::config::{DatabaseConfig, IdStrategy};
use crate::cursor::Cursor;
use crate::document::{Document, DocumentId, ID_FIELD};
use crate::error::{Result, ShelfError};
use crate::find_options::{apply_limit_skip, apply_sort, FindOptions};
use crate::index::{IndexDefinition, IndexKey, IndexManager, SortDirection};
use crate::query::Query;
use crate::query_planner::{Explain, QueryPlan, QueryPlanner};

/// Name of the index every collection keeps on `_id`
pub const ID_INDEX: &str = "_id_1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertManyResult {
    pub inserted_ids: Vec<DocumentId>,
    pub inserted_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
}

/// Everything guarded by the collection lock
#[derive(Debug)]
struct CollectionState {
    /// Insertion sequence number -> document
    docs: BTreeMap<u64, Arc<Document>>,
    next_slot: u64,
    last_id: u64,
    indexes: IndexManager,
}

/// Matches found under the lock, in result order
struct Selection {
    matches: Vec<(u64, Arc<Document>)>,
    plan: QueryPlan,
    examined: usize,
}

impl CollectionState {
    fn new() -> Result<Self> {
        let mut indexes = IndexManager::new();
        indexes.create_index(
            IndexDefinition::new(vec![(ID_FIELD.to_string(), SortDirection::Ascending)], true)?,
            std::iter::empty(),
        )?;
        Ok(CollectionState {
            docs: BTreeMap::new(),
            next_slot: 0,
            last_id: 0,
            indexes,
        })
    }

    fn slot_of(&self, id: &Value) -> Option<u64> {
        self.indexes
            .lookup(ID_FIELD, id)
            .and_then(|slots| slots.first().copied())
    }

    /// Evaluate `query`, seeding candidates from indexes when allowed.
    /// Without an index-provided order, matches come back in insertion order.
    fn select(
        &self,
        query: &Query,
        sort: &[(String, SortDirection)],
        use_indexes: bool,
        first_only: bool,
    ) -> Selection {
        let plan = if use_indexes {
            QueryPlanner::plan(query, sort, &self.indexes)
        } else {
            QueryPlan::collection_scan()
        };

        let candidates = plan.candidates(&self.indexes);
        let order: Box<dyn Iterator<Item = u64> + '_> = match (plan.index_order(&self.indexes), candidates) {
            (Some(order), Some(set)) => Box::new(order.into_iter().filter(move |slot| set.contains(slot))),
            (Some(order), None) => Box::new(order.into_iter()),
            (None, Some(set)) => Box::new(set.into_iter()),
            (None, None) => Box::new(self.docs.keys().copied()),
        };

        let mut matches = Vec::new();
        let mut examined = 0;
        for slot in order {
            let Some(doc) = self.docs.get(&slot) else {
                continue;
            };
            examined += 1;
            if query.matches(&**doc) {
                matches.push((slot, Arc::clone(doc)));
                if first_only {
                    break;
                }
            }
        }

        Selection { matches, plan, examined }
    }

    /// Id for a new document plus the counter value to commit on success
    fn assign_id(&self, fields: &mut HashMap<String, Value>, strategy: IdStrategy) -> Result<(DocumentId, u64)> {
        if let Some(supplied) = fields.remove(ID_FIELD) {
            let id = DocumentId::from_value(&supplied)?;
            let last_id = match &id {
                DocumentId::Int(n) if *n > 0 => self.last_id.max(*n as u64),
                _ => self.last_id,
            };
            return Ok((id, last_id));
        }

        match strategy {
            IdStrategy::AutoIncrement => {
                let mut last_id = self.last_id;
                loop {
                    let id = DocumentId::new_auto(last_id)?;
                    last_id += 1;
                    if self.slot_of(&id.to_value()).is_none() {
                        return Ok((id, last_id));
                    }
                }
            }
            IdStrategy::ObjectId => Ok((DocumentId::new_object_id(), self.last_id)),
        }
    }

    fn insert(&mut self, mut fields: HashMap<String, Value>, strategy: IdStrategy) -> Result<(DocumentId, u64)> {
        let (id, last_id) = self.assign_id(&mut fields, strategy)?;
        let doc = Document::new(id.clone(), fields);
        let slot = self.next_slot;

        self.indexes.on_insert(&doc, slot)?;
        self.next_slot += 1;
        self.last_id = last_id;
        self.docs.insert(slot, Arc::new(doc));
        Ok((id, slot))
    }

    fn remove(&mut self, slot: u64) -> Option<Arc<Document>> {
        let doc = self.docs.remove(&slot)?;
        self.indexes.on_delete(&doc, slot);
        Some(doc)
    }

    /// Swap in a new version of the document stored at `slot`
    fn replace(&mut self, slot: u64, after: Document) -> Result<()> {
        let before = self
            .docs
            .get(&slot)
            .cloned()
            .ok_or(ShelfError::DocumentNotFound)?;
        self.indexes.on_update(&before, &after, slot)?;
        self.docs.insert(slot, Arc::new(after));
        Ok(())
    }
}

/// Single update operator
#[derive(Debug, Clone)]
enum UpdateOp {
    Set(String, Value),
    Unset(String),
    Inc(String, Number),
}

/// Parsed update document
#[derive(Debug, Clone)]
struct UpdateSpec {
    ops: Vec<UpdateOp>,
}

impl UpdateSpec {
    /// `{$set: {...}, $unset: {...}, $inc: {...}}`; a document without
    /// operators is a `$set` of its fields.
    fn from_json(update_json: &Value) -> Result<Self> {
        let map = update_json
            .as_object()
            .ok_or_else(|| ShelfError::InvalidQuery("update must be an object".into()))?;
        if map.is_empty() {
            return Err(ShelfError::InvalidQuery("update document is empty".into()));
        }

        let has_operators = map.keys().any(|k| k.starts_with('$'));
        if has_operators && !map.keys().all(|k| k.starts_with('$')) {
            return Err(ShelfError::InvalidQuery(
                "update cannot mix operators and plain fields".into(),
            ));
        }

        let mut ops = Vec::new();
        if !has_operators {
            for (path, value) in map {
                ops.push(UpdateOp::Set(Self::checked_path(path)?, value.clone()));
            }
            return Ok(UpdateSpec { ops });
        }

        for (op, fields) in map {
            let fields = fields
                .as_object()
                .ok_or_else(|| ShelfError::InvalidQuery(format!("{} requires an object", op)))?;
            for (path, value) in fields {
                let path = Self::checked_path(path)?;
                ops.push(match op.as_str() {
                    "$set" => UpdateOp::Set(path, value.clone()),
                    "$unset" => UpdateOp::Unset(path),
                    "$inc" => match value {
                        Value::Number(n) => UpdateOp::Inc(path, n.clone()),
                        other => {
                            return Err(ShelfError::InvalidQuery(format!(
                                "$inc requires a numeric amount, got {}",
                                other
                            )));
                        }
                    },
                    _ => {
                        return Err(ShelfError::InvalidQuery(format!("Unsupported update operator: {}", op)));
                    }
                });
            }
        }
        Ok(UpdateSpec { ops })
    }

    fn checked_path(path: &str) -> Result<String> {
        if path == ID_FIELD || path.starts_with("_id.") {
            return Err(ShelfError::InvalidQuery("_id is immutable".into()));
        }
        if path.is_empty() || path.split('.').any(|seg| seg.is_empty() || seg.starts_with('$')) {
            return Err(ShelfError::InvalidQuery(format!("invalid update path: '{}'", path)));
        }
        Ok(path.to_string())
    }

    /// New version of `doc`, or `None` when the update changes nothing
    fn apply(&self, doc: &Document) -> Result<Option<Document>> {
        let mut updated = doc.clone();
        for op in &self.ops {
            match op {
                UpdateOp::Set(path, value) => updated.set_path(path, value.clone())?,
                UpdateOp::Unset(path) => {
                    updated.remove_path(path);
                }
                UpdateOp::Inc(path, amount) => {
                    let next = match updated.value_at(path).as_deref() {
                        None => Value::Number(amount.clone()),
                        Some(Value::Number(current)) => Self::add(current, amount),
                        Some(other) => {
                            return Err(ShelfError::TypeMismatch(format!(
                                "cannot $inc non-numeric field '{}' ({})",
                                path, other
                            )));
                        }
                    };
                    updated.set_path(path, next)?;
                }
            }
        }
        Ok(if updated == *doc { None } else { Some(updated) })
    }

    fn add(current: &Number, amount: &Number) -> Value {
        if let (Some(a), Some(b)) = (current.as_i64(), amount.as_i64()) {
            if let Some(sum) = a.checked_add(b) {
                return Value::from(sum);
            }
        }
        let sum = current.as_f64().unwrap_or(0.0) + amount.as_f64().unwrap_or(0.0);
        Number::from_f64(sum).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Named, insertion-ordered set of documents with its indexes
pub struct CollectionCore {
    pub name: String,
    config: DatabaseConfig,
    state: RwLock<CollectionState>,
}

impl CollectionCore {
    /// Create an empty collection with its `_id` index
    pub fn new(name: String, config: DatabaseConfig) -> Result<Self> {
        Ok(CollectionCore {
            name,
            config,
            state: RwLock::new(CollectionState::new()?),
        })
    }

    pub fn len(&self) -> usize {
        self.state.read().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========== CRUD OPERATIONS ==========

    /// Insert one document - returns inserted DocumentId
    pub fn insert_one(&self, fields: HashMap<String, Value>) -> Result<DocumentId> {
        let mut state = self.state.write();
        let (id, slot) = state.insert(fields, self.config.id_strategy)?;
        trace!("{}: inserted {} at slot {}", self.name, id, slot);
        Ok(id)
    }

    /// Insert many documents; either all are stored or none
    pub fn insert_many(&self, documents: Vec<HashMap<String, Value>>) -> Result<InsertManyResult> {
        let mut state = self.state.write();
        let (next_slot, last_id) = (state.next_slot, state.last_id);
        let mut inserted_ids = Vec::with_capacity(documents.len());

        for fields in documents {
            match state.insert(fields, self.config.id_strategy) {
                Ok((id, _)) => inserted_ids.push(id),
                Err(e) => {
                    for slot in (next_slot..state.next_slot).rev() {
                        state.remove(slot);
                    }
                    state.next_slot = next_slot;
                    state.last_id = last_id;
                    debug!("{}: insert_many rolled back: {}", self.name, e);
                    return Err(e);
                }
            }
        }

        trace!("{}: inserted {} documents", self.name, inserted_ids.len());
        Ok(InsertManyResult {
            inserted_count: inserted_ids.len(),
            inserted_ids,
        })
    }

    /// Document by id
    pub fn get(&self, id: &DocumentId) -> Result<Value> {
        let state = self.state.read();
        state
            .slot_of(&id.to_value())
            .and_then(|slot| state.docs.get(&slot))
            .map(|doc| doc.to_value())
            .ok_or(ShelfError::DocumentNotFound)
    }

    /// Every document in insertion order
    pub fn scan(&self) -> Cursor {
        let docs = self.state.read().docs.values().cloned().collect();
        Cursor::from_documents(docs, None)
    }

    // ========== QUERY OPERATIONS ==========

    /// Find documents matching query
    pub fn find(&self, query_json: &Value) -> Result<Cursor> {
        self.find_with_options(query_json, FindOptions::default())
    }

    /// Find documents with options (projection, sort, limit, skip)
    pub fn find_with_options(&self, query_json: &Value, options: FindOptions) -> Result<Cursor> {
        let query = Query::from_json(query_json)?;
        let (docs, _, _) = self.run_find(&query, &options);
        Ok(Cursor::from_documents(docs, options.projection))
    }

    /// Filter, order, then paginate. Sorting and slicing happen outside the lock.
    fn run_find(&self, query: &Query, options: &FindOptions) -> (Vec<Arc<Document>>, QueryPlan, usize) {
        let sort = options.sort_spec();
        let selection = self
            .state
            .read()
            .select(query, sort, self.config.use_indexes, false);

        let mut docs: Vec<Arc<Document>> = selection.matches.into_iter().map(|(_, doc)| doc).collect();
        if selection.plan.sort.is_none() {
            apply_sort(&mut docs, sort);
        }
        let docs = apply_limit_skip(docs, options.limit, options.skip);
        (docs, selection.plan, selection.examined)
    }

    /// First match in natural order
    pub fn find_one(&self, query_json: &Value) -> Result<Option<Value>> {
        let query = Query::from_json(query_json)?;
        let selection = self
            .state
            .read()
            .select(&query, &[], self.config.use_indexes, true);
        Ok(selection.matches.first().map(|(_, doc)| doc.to_value()))
    }

    pub fn count_documents(&self, query_json: &Value) -> Result<u64> {
        let query = Query::from_json(query_json)?;
        if query.is_empty() {
            return Ok(self.len() as u64);
        }
        let selection = self
            .state
            .read()
            .select(&query, &[], self.config.use_indexes, false);
        Ok(selection.matches.len() as u64)
    }

    /// Distinct values of `field` among matching documents, in first-seen order
    pub fn distinct(&self, field: &str, query_json: &Value) -> Result<Vec<Value>> {
        let query = Query::from_json(query_json)?;
        let selection = self
            .state
            .read()
            .select(&query, &[], self.config.use_indexes, false);

        let mut seen = AHashSet::new();
        let mut values = Vec::new();
        for (_, doc) in &selection.matches {
            if let Some(value) = doc.value_at(field) {
                if seen.insert(IndexKey::from(&*value)) {
                    values.push(value.into_owned());
                }
            }
        }
        Ok(values)
    }

    /// Update the first matching document
    pub fn update_one(&self, query_json: &Value, update_json: &Value) -> Result<UpdateResult> {
        self.update(query_json, update_json, true)
    }

    /// Apply `partial` (an update document) to the document with this id
    pub fn update_by_id(&self, id: &DocumentId, partial: &Value) -> Result<u64> {
        let mut filter = serde_json::Map::new();
        filter.insert(ID_FIELD.to_string(), id.to_value());
        Ok(self.update(&Value::Object(filter), partial, true)?.matched_count)
    }

    /// Update every matching document
    pub fn update_many(&self, query_json: &Value, update_json: &Value) -> Result<UpdateResult> {
        self.update(query_json, update_json, false)
    }

    /// All new versions are computed before any is stored; a unique
    /// violation part-way restores the documents already swapped.
    fn update(&self, query_json: &Value, update_json: &Value, first_only: bool) -> Result<UpdateResult> {
        let query = Query::from_json(query_json)?;
        let spec = UpdateSpec::from_json(update_json)?;

        let mut state = self.state.write();
        let selection = state.select(&query, &[], self.config.use_indexes, first_only);

        let mut changes = Vec::new();
        for (slot, doc) in &selection.matches {
            if let Some(updated) = spec.apply(doc)? {
                changes.push((*slot, Arc::clone(doc), updated));
            }
        }

        let mut applied: Vec<(u64, Arc<Document>)> = Vec::with_capacity(changes.len());
        for (slot, before, after) in changes {
            if let Err(e) = state.replace(slot, after) {
                for (slot, before) in applied.into_iter().rev() {
                    if let Some(current) = state.docs.get(&slot).cloned() {
                        state.indexes.on_delete(&current, slot);
                        let _ = state.indexes.on_insert(&before, slot);
                        state.docs.insert(slot, before);
                    }
                }
                return Err(e);
            }
            applied.push((slot, before));
        }

        let result = UpdateResult {
            matched_count: selection.matches.len() as u64,
            modified_count: applied.len() as u64,
        };
        trace!(
            "{}: update matched {} modified {}",
            self.name,
            result.matched_count,
            result.modified_count
        );
        Ok(result)
    }

    /// Delete the first matching document - returns 0 or 1
    pub fn delete_one(&self, query_json: &Value) -> Result<u64> {
        self.delete(query_json, true)
    }

    /// Delete every matching document
    pub fn delete_many(&self, query_json: &Value) -> Result<u64> {
        self.delete(query_json, false)
    }

    fn delete(&self, query_json: &Value, first_only: bool) -> Result<u64> {
        let query = Query::from_json(query_json)?;

        let mut state = self.state.write();
        let selection = state.select(&query, &[], self.config.use_indexes, first_only);
        let mut deleted = 0;
        for (slot, _) in &selection.matches {
            if state.remove(*slot).is_some() {
                deleted += 1;
            }
        }

        trace!("{}: deleted {}", self.name, deleted);
        Ok(deleted)
    }

    // ========== QUERY OPTIMIZATION OPERATIONS ==========

    /// Run the query and report how it was answered
    pub fn explain(&self, query_json: &Value, options: &FindOptions) -> Result<Explain> {
        let query = Query::from_json(query_json)?;
        let (docs, plan, examined) = self.run_find(&query, options);
        Ok(Explain::new(&plan, examined, docs.len()))
    }

    // ========== AGGREGATION ==========

    /// Execute aggregation pipeline
    ///
    /// # Example
    /// ```
    /// use shelfdb_core::{CollectionCore, DatabaseConfig};
    /// use serde_json::json;
    ///
    /// let books = CollectionCore::new("books".into(), DatabaseConfig::default()).unwrap();
    /// books.insert_one(shelfdb_core::document::fields_from_value(json!({"genre": "Poetry"})).unwrap()).unwrap();
    ///
    /// let results: Vec<_> = books.aggregate(&json!([
    ///     {"$group": {"_id": "$genre", "count": {"$sum": 1}}},
    ///     {"$sort": {"count": -1}}
    /// ])).unwrap().collect();
    /// assert_eq!(results, vec![json!({"_id": "Poetry", "count": 1})]);
    /// ```
    pub fn aggregate(&self, pipeline_json: &Value) -> Result<Cursor> {
        let pipeline = Pipeline::from_json(pipeline_json)?;
        if pipeline.len() > self.config.max_pipeline_stages {
            return Err(ShelfError::AggregationError(format!(
                "pipeline has {} stages, limit is {}",
                pipeline.len(),
                self.config.max_pipeline_stages
            )));
        }

        let results = match pipeline.leading_match() {
            Some(query) => {
                let selection = self
                    .state
                    .read()
                    .select(query, &[], self.config.use_indexes, false);
                debug!(
                    "{}: aggregate $match via {} examined {}",
                    self.name,
                    selection.plan.stage(),
                    selection.examined
                );
                let docs = selection.matches.iter().map(|(_, doc)| doc.to_value()).collect();
                pipeline.execute_after_match(docs)?
            }
            None => {
                let docs = self.state.read().docs.values().cloned().collect::<Vec<_>>();
                pipeline.execute(docs.iter().map(|doc| doc.to_value()).collect())?
            }
        };
        Ok(Cursor::from_values(results))
    }

    // ========== INDEX OPERATIONS ==========

    /// Create (or find) an index from a `{field: 1, other: -1}` spec and back-fill it
    pub fn create_index(&self, spec: &Value, unique: bool) -> Result<String> {
        let definition = IndexDefinition::from_json(spec, unique)?;

        let mut state = self.state.write();
        let CollectionState { docs, indexes, .. } = &mut *state;
        let (name, created) = indexes.create_index(
            definition,
            docs.iter().map(|(slot, doc)| (*slot, doc.as_ref())),
        )?;

        if created {
            info!("{}: created index {} over {} documents", self.name, name, docs.len());
        }
        Ok(name)
    }

    /// Drop an index
    pub fn drop_index(&self, index_name: &str) -> Result<()> {
        if index_name == ID_INDEX {
            return Err(ShelfError::InvalidQuery("cannot drop the _id index".into()));
        }
        self.state.write().indexes.drop_index(index_name)?;
        info!("{}: dropped index {}", self.name, index_name);
        Ok(())
    }

    /// List all indexes
    pub fn list_indexes(&self) -> Vec<String> {
        self.state.read().indexes.list_indexes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::fields_from_value;
    use serde_json::json;

    fn collection() -> CollectionCore {
        CollectionCore::new("books".to_string(), DatabaseConfig::default()).unwrap()
    }

    fn insert(coll: &CollectionCore, doc: Value) -> DocumentId {
        coll.insert_one(fields_from_value(doc).unwrap()).unwrap()
    }

    fn seeded() -> CollectionCore {
        let coll = collection();
        insert(&coll, json!({"title": "Dune", "genre": "Science Fiction", "price": 9.99, "in_stock": true}));
        insert(&coll, json!({"title": "Emma", "genre": "Classic", "price": 7.5, "in_stock": false}));
        insert(&coll, json!({"title": "Beloved", "genre": "Fiction", "price": 14, "in_stock": true}));
        coll
    }

    #[test]
    fn test_insert_assigns_sequential_ids() {
        let coll = collection();
        assert_eq!(insert(&coll, json!({"title": "A"})), DocumentId::Int(1));
        assert_eq!(insert(&coll, json!({"title": "B"})), DocumentId::Int(2));
        assert_eq!(coll.len(), 2);
        assert_eq!(coll.list_indexes(), vec![ID_INDEX.to_string()]);
    }

    #[test]
    fn test_insert_with_supplied_id() {
        let coll = collection();
        assert_eq!(insert(&coll, json!({"_id": 10, "title": "A"})), DocumentId::Int(10));
        assert_eq!(insert(&coll, json!({"title": "B"})), DocumentId::Int(11));

        let dup = coll.insert_one(fields_from_value(json!({"_id": 10})).unwrap());
        assert!(matches!(dup, Err(ShelfError::DuplicateKey(_))));
        assert_eq!(coll.len(), 2);
    }

    #[test]
    fn test_auto_ids_do_not_wrap() {
        let coll = collection();
        insert(&coll, json!({"_id": i64::MAX, "title": "Last"}));

        let err = coll.insert_one(fields_from_value(json!({"title": "Overflow"})).unwrap()).unwrap_err();
        assert!(matches!(err, ShelfError::IdSpaceExhausted(_)));
        assert_eq!(coll.len(), 1);
    }

    #[test]
    fn test_large_integer_ids_are_distinct() {
        let coll = collection();
        insert(&coll, json!({"_id": 9_007_199_254_740_992_i64, "n": 1}));
        insert(&coll, json!({"_id": 9_007_199_254_740_993_i64, "n": 2}));

        assert_eq!(coll.len(), 2);
        let found = coll.find_one(&json!({"_id": 9_007_199_254_740_993_i64})).unwrap().unwrap();
        assert_eq!(found["n"], json!(2));
        assert_eq!(coll.count_documents(&json!({"n": {"$gt": 1}})).unwrap(), 1);
    }

    #[test]
    fn test_object_id_strategy() {
        let config = DatabaseConfig::default().with_id_strategy(IdStrategy::ObjectId);
        let coll = CollectionCore::new("books".into(), config).unwrap();
        let id = coll.insert_one(HashMap::new()).unwrap();
        assert!(matches!(id, DocumentId::ObjectId(_)));
    }

    #[test]
    fn test_get_by_id() {
        let coll = seeded();
        assert_eq!(coll.get(&DocumentId::Int(2)).unwrap()["title"], json!("Emma"));
        assert!(matches!(coll.get(&DocumentId::Int(9)), Err(ShelfError::DocumentNotFound)));
    }

    #[test]
    fn test_find_filters_and_orders_by_insertion() {
        let coll = seeded();
        let titles: Vec<Value> = coll
            .find(&json!({"in_stock": true}))
            .unwrap()
            .map(|d| d["title"].clone())
            .collect();
        assert_eq!(titles, vec![json!("Dune"), json!("Beloved")]);
    }

    #[test]
    fn test_find_with_options() {
        let coll = seeded();
        let options = FindOptions::from_json(&json!({
            "projection": {"title": 1},
            "sort": {"price": -1},
            "limit": 2
        }))
        .unwrap();

        let docs: Vec<Value> = coll.find_with_options(&json!({}), options).unwrap().collect();
        assert_eq!(docs, vec![json!({"title": "Beloved"}), json!({"title": "Dune"})]);
    }

    #[test]
    fn test_find_one_count_distinct() {
        let coll = seeded();
        insert(&coll, json!({"title": "Sula", "genre": "Fiction", "price": 12}));

        assert_eq!(coll.find_one(&json!({"genre": "Fiction"})).unwrap().unwrap()["title"], json!("Beloved"));
        assert!(coll.find_one(&json!({"genre": "Horror"})).unwrap().is_none());
        assert_eq!(coll.count_documents(&json!({"price": {"$gt": 9}})).unwrap(), 3);
        assert_eq!(coll.count_documents(&json!({})).unwrap(), 4);
        assert_eq!(
            coll.distinct("genre", &json!({})).unwrap(),
            vec![json!("Science Fiction"), json!("Classic"), json!("Fiction")]
        );
    }

    #[test]
    fn test_update_one_set_and_inc() {
        let coll = seeded();
        let result = coll
            .update_one(&json!({"title": "Emma"}), &json!({"$set": {"in_stock": true}, "$inc": {"price": 1}}))
            .unwrap();
        assert_eq!(result, UpdateResult { matched_count: 1, modified_count: 1 });

        let emma = coll.get(&DocumentId::Int(2)).unwrap();
        assert_eq!(emma["in_stock"], json!(true));
        assert_eq!(emma["price"], json!(8.5));
    }

    #[test]
    fn test_update_plain_document_is_set() {
        let coll = seeded();
        coll.update_one(&json!({"_id": 1}), &json!({"price": 11})).unwrap();
        let dune = coll.get(&DocumentId::Int(1)).unwrap();
        assert_eq!(dune["price"], json!(11));
        assert_eq!(dune["title"], json!("Dune"));
    }

    #[test]
    fn test_update_unchanged_counts_match_only() {
        let coll = seeded();
        let result = coll.update_one(&json!({"title": "Dune"}), &json!({"$set": {"price": 9.99}})).unwrap();
        assert_eq!(result, UpdateResult { matched_count: 1, modified_count: 0 });
    }

    #[test]
    fn test_update_by_id() {
        let coll = seeded();
        assert_eq!(coll.update_by_id(&DocumentId::Int(3), &json!({"price": 15})).unwrap(), 1);
        assert_eq!(coll.get(&DocumentId::Int(3)).unwrap()["price"], json!(15));
        assert_eq!(coll.update_by_id(&DocumentId::Int(42), &json!({"price": 1})).unwrap(), 0);
    }

    #[test]
    fn test_update_no_match() {
        let coll = seeded();
        let result = coll.update_one(&json!({"title": "Ulysses"}), &json!({"$set": {"x": 1}})).unwrap();
        assert_eq!(result, UpdateResult::default());
    }

    #[test]
    fn test_update_rejects_id_and_bad_inc() {
        let coll = seeded();
        assert!(coll.update_one(&json!({}), &json!({"$set": {"_id": 5}})).is_err());
        assert!(coll.update_one(&json!({}), &json!({"$rename": {"a": "b"}})).is_err());
        assert!(coll.update_one(&json!({}), &json!({"$set": {"a": 1}, "b": 2})).is_err());

        let err = coll.update_many(&json!({}), &json!({"$inc": {"title": 1}})).unwrap_err();
        assert!(matches!(err, ShelfError::TypeMismatch(_)));
        assert_eq!(coll.get(&DocumentId::Int(1)).unwrap()["title"], json!("Dune"));
    }

    #[test]
    fn test_update_many_and_unset() {
        let coll = seeded();
        let result = coll.update_many(&json!({"in_stock": true}), &json!({"$unset": {"in_stock": ""}})).unwrap();
        assert_eq!(result.modified_count, 2);
        assert_eq!(coll.count_documents(&json!({"in_stock": {"$exists": false}})).unwrap(), 2);
    }

    #[test]
    fn test_unique_violation_rolls_back_update_many() {
        let coll = seeded();
        coll.create_index(&json!({"title": 1}), true).unwrap();

        let err = coll.update_many(&json!({}), &json!({"$set": {"title": "Same"}})).unwrap_err();
        assert!(matches!(err, ShelfError::DuplicateKey(_)));
        assert_eq!(coll.count_documents(&json!({"title": "Same"})).unwrap(), 0);
        assert_eq!(coll.get(&DocumentId::Int(1)).unwrap()["title"], json!("Dune"));

        let explain = coll.explain(&json!({"title": "Dune"}), &FindOptions::default()).unwrap();
        assert_eq!(explain.returned_docs_count, 1);
    }

    #[test]
    fn test_insert_many_is_atomic() {
        let coll = seeded();
        let batch = vec![
            fields_from_value(json!({"title": "New"})).unwrap(),
            fields_from_value(json!({"_id": 1, "title": "Clash"})).unwrap(),
        ];
        assert!(coll.insert_many(batch).is_err());
        assert_eq!(coll.len(), 3);
        assert_eq!(coll.count_documents(&json!({"title": "New"})).unwrap(), 0);

        let ok = coll
            .insert_many(vec![fields_from_value(json!({"title": "New"})).unwrap()])
            .unwrap();
        assert_eq!(ok.inserted_ids, vec![DocumentId::Int(4)]);
    }

    #[test]
    fn test_delete_one_and_many() {
        let coll = seeded();
        assert_eq!(coll.delete_one(&json!({"in_stock": true})).unwrap(), 1);
        assert!(coll.find_one(&json!({"title": "Dune"})).unwrap().is_none());
        assert_eq!(coll.delete_one(&json!({"title": "Dune"})).unwrap(), 0);
        assert_eq!(coll.delete_many(&json!({})).unwrap(), 2);
        assert!(coll.is_empty());
    }

    #[test]
    fn test_create_index_backfills_and_is_idempotent() {
        let coll = seeded();
        assert_eq!(coll.create_index(&json!({"title": 1}), false).unwrap(), "title_1");
        assert_eq!(coll.create_index(&json!({"title": 1}), false).unwrap(), "title_1");
        assert_eq!(coll.list_indexes(), vec![ID_INDEX.to_string(), "title_1".to_string()]);

        let explain = coll.explain(&json!({"title": "Emma"}), &FindOptions::default()).unwrap();
        assert_eq!(explain.query_plan, "IXSCAN");
        assert_eq!(explain.used_index.as_deref(), Some("title_1"));
        assert_eq!(explain.considered_docs_count, 1);
        assert_eq!(explain.returned_docs_count, 1);
    }

    #[test]
    fn test_create_index_on_id_reuses_automatic_index() {
        let coll = seeded();
        assert_eq!(coll.create_index(&json!({"_id": 1}), false).unwrap(), ID_INDEX);
        assert_eq!(coll.create_index(&json!({"_id": 1}), true).unwrap(), ID_INDEX);
        assert_eq!(coll.list_indexes(), vec![ID_INDEX.to_string()]);
    }

    #[test]
    fn test_drop_index() {
        let coll = seeded();
        coll.create_index(&json!({"title": 1}), false).unwrap();
        coll.drop_index("title_1").unwrap();
        assert!(matches!(coll.drop_index("title_1"), Err(ShelfError::IndexNotFound(_))));
        assert!(coll.drop_index(ID_INDEX).is_err());
    }

    #[test]
    fn test_explain_collection_scan() {
        let coll = seeded();
        let explain = coll.explain(&json!({"genre": "Classic"}), &FindOptions::default()).unwrap();
        assert_eq!(explain.query_plan, "COLLSCAN");
        assert_eq!(explain.used_index, None);
        assert_eq!(explain.considered_docs_count, 3);
        assert_eq!(explain.returned_docs_count, 1);
    }

    #[test]
    fn test_aggregate_with_leading_match() {
        let coll = seeded();
        coll.create_index(&json!({"in_stock": 1}), false).unwrap();

        let results: Vec<Value> = coll
            .aggregate(&json!([
                {"$match": {"in_stock": true}},
                {"$group": {"_id": null, "total": {"$sum": "$price"}}}
            ]))
            .unwrap()
            .collect();
        assert_eq!(results.len(), 1);
        assert!((results[0]["total"].as_f64().unwrap() - 23.99).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_stage_limit() {
        let config = DatabaseConfig::default().with_max_pipeline_stages(1);
        let coll = CollectionCore::new("books".into(), config).unwrap();
        assert!(coll.aggregate(&json!([{"$limit": 1}, {"$skip": 0}])).is_err());
    }

    #[test]
    fn test_cursor_is_a_snapshot() {
        let coll = seeded();
        let cursor = coll.find(&json!({})).unwrap();
        coll.delete_many(&json!({})).unwrap();
        assert_eq!(cursor.count(), 3);
    }
}
