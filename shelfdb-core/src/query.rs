// src/query.rs
// Filter parsing and evaluation

use std::borrow::Cow;
use std::cmp::Ordering;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::document::{resolve_path, Document};
use crate::error::{Result, ShelfError};
use crate::index::IndexKey;

/// Anything a filter can be evaluated against
pub trait FieldSource {
    fn field(&self, path: &str) -> Option<Cow<'_, Value>>;
}

impl FieldSource for Document {
    fn field(&self, path: &str) -> Option<Cow<'_, Value>> {
        self.value_at(path)
    }
}

impl FieldSource for Value {
    fn field(&self, path: &str) -> Option<Cow<'_, Value>> {
        resolve_path(self, path).map(Cow::Borrowed)
    }
}

impl<T: FieldSource + ?Sized> FieldSource for Arc<T> {
    fn field(&self, path: &str) -> Option<Cow<'_, Value>> {
        (**self).field(path)
    }
}

/// Operator applied to a single field
#[derive(Debug, Clone)]
pub enum FieldOp {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Regex),
    /// Negation of the conjunction of the inner operators
    Not(Vec<FieldOp>),
}

/// Predicate tree
#[derive(Debug, Clone)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    Field { path: String, op: FieldOp },
}

/// Parsed filter document
#[derive(Debug, Clone)]
pub struct Query {
    pub filter: Filter,
}

impl Query {
    /// Match-everything query
    pub fn new() -> Self {
        Query {
            filter: Filter::And(Vec::new()),
        }
    }

    /// Parse `{field: value}` / `{field: {$op: value}}` / `{$or: [...]}`
    pub fn from_json(json: &Value) -> Result<Self> {
        Ok(Query {
            filter: Self::parse_filter(json)?,
        })
    }

    fn parse_filter(json: &Value) -> Result<Filter> {
        let map = json
            .as_object()
            .ok_or_else(|| ShelfError::InvalidQuery(format!("filter must be an object, got {}", json)))?;

        let mut clauses = Vec::new();
        for (key, condition) in map {
            if key.starts_with('$') {
                clauses.push(Self::parse_logical_operator(key, condition)?);
            } else {
                for op in Self::parse_field_condition(condition)? {
                    clauses.push(Filter::Field {
                        path: key.clone(),
                        op,
                    });
                }
            }
        }

        if clauses.len() == 1 {
            Ok(clauses.remove(0))
        } else {
            Ok(Filter::And(clauses))
        }
    }

    fn parse_logical_operator(op: &str, value: &Value) -> Result<Filter> {
        let parse_list = |value: &Value| -> Result<Vec<Filter>> {
            match value {
                Value::Array(items) if !items.is_empty() => items.iter().map(Self::parse_filter).collect(),
                _ => Err(ShelfError::InvalidQuery(format!("{} requires a non-empty array", op))),
            }
        };

        match op {
            "$and" => Ok(Filter::And(parse_list(value)?)),
            "$or" => Ok(Filter::Or(parse_list(value)?)),
            "$nor" => Ok(Filter::Nor(parse_list(value)?)),
            _ => Err(ShelfError::InvalidQuery(format!("Unknown logical operator: {}", op))),
        }
    }

    /// Operators for one field. Several operators on the same field are a conjunction.
    fn parse_field_condition(condition: &Value) -> Result<Vec<FieldOp>> {
        let ops = match condition {
            Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => map,
            // plain value or embedded document: equality
            _ => return Ok(vec![FieldOp::Eq(condition.clone())]),
        };

        let options = ops.get("$options");
        let mut parsed = Vec::with_capacity(ops.len());
        for (op, val) in ops {
            let field_op = match op.as_str() {
                "$eq" => FieldOp::Eq(val.clone()),
                "$ne" => FieldOp::Ne(val.clone()),
                "$gt" => FieldOp::Gt(Self::range_operand(op, val)?),
                "$gte" => FieldOp::Gte(Self::range_operand(op, val)?),
                "$lt" => FieldOp::Lt(Self::range_operand(op, val)?),
                "$lte" => FieldOp::Lte(Self::range_operand(op, val)?),
                "$in" => FieldOp::In(Self::parse_array(op, val)?),
                "$nin" => FieldOp::Nin(Self::parse_array(op, val)?),
                "$exists" => match val {
                    Value::Bool(b) => FieldOp::Exists(*b),
                    _ => return Err(ShelfError::InvalidQuery("$exists requires bool".into())),
                },
                "$regex" => FieldOp::Regex(Self::parse_regex(val, options)?),
                "$options" => {
                    if !ops.contains_key("$regex") {
                        return Err(ShelfError::InvalidQuery("$options requires $regex".into()));
                    }
                    continue;
                }
                "$not" => match val {
                    Value::Object(_) => FieldOp::Not(Self::parse_field_condition(val)?),
                    _ => return Err(ShelfError::InvalidQuery("$not requires an operator object".into())),
                },
                _ => return Err(ShelfError::InvalidQuery(format!("Unknown operator: {}", op))),
            };
            parsed.push(field_op);
        }

        Ok(parsed)
    }

    /// Range operators only order numbers, strings and null
    fn range_operand(op: &str, value: &Value) -> Result<Value> {
        match value {
            Value::Null | Value::Number(_) | Value::String(_) => Ok(value.clone()),
            other => Err(ShelfError::TypeMismatch(format!("{} cannot compare against {}", op, other))),
        }
    }

    fn parse_array(op: &str, value: &Value) -> Result<Vec<Value>> {
        match value {
            Value::Array(arr) => Ok(arr.clone()),
            _ => Err(ShelfError::InvalidQuery(format!("{} requires array", op))),
        }
    }

    fn parse_regex(pattern: &Value, options: Option<&Value>) -> Result<Regex> {
        let pattern = pattern
            .as_str()
            .ok_or_else(|| ShelfError::InvalidQuery("$regex requires string".into()))?;
        let flags = match options {
            None => "",
            Some(Value::String(s)) => s.as_str(),
            Some(_) => return Err(ShelfError::InvalidQuery("$options requires string".into())),
        };

        let mut builder = RegexBuilder::new(pattern);
        for flag in flags.chars() {
            match flag {
                'i' => builder.case_insensitive(true),
                'm' => builder.multi_line(true),
                's' => builder.dot_matches_new_line(true),
                'x' => builder.ignore_whitespace(true),
                other => {
                    return Err(ShelfError::InvalidQuery(format!("Unknown $regex option: {}", other)));
                }
            };
        }
        builder
            .build()
            .map_err(|e| ShelfError::InvalidQuery(format!("Invalid $regex: {}", e)))
    }

    /// Does the document satisfy the filter?
    pub fn matches<S: FieldSource + ?Sized>(&self, source: &S) -> bool {
        Self::matches_filter(&self.filter, source)
    }

    fn matches_filter<S: FieldSource + ?Sized>(filter: &Filter, source: &S) -> bool {
        match filter {
            Filter::And(filters) => filters.iter().all(|f| Self::matches_filter(f, source)),
            Filter::Or(filters) => filters.iter().any(|f| Self::matches_filter(f, source)),
            Filter::Nor(filters) => !filters.iter().any(|f| Self::matches_filter(f, source)),
            Filter::Field { path, op } => {
                let value = source.field(path);
                Self::matches_operator(value.as_deref(), op)
            }
        }
    }

    /// A missing field only satisfies explicit null equality and the negating operators.
    fn matches_operator(value: Option<&Value>, operator: &FieldOp) -> bool {
        match operator {
            FieldOp::Eq(target) => Self::equals(value, target),
            FieldOp::Ne(target) => !Self::equals(value, target),
            FieldOp::Gt(target) => Self::compare(value, target) == Some(Ordering::Greater),
            FieldOp::Gte(target) => {
                matches!(Self::compare(value, target), Some(Ordering::Greater | Ordering::Equal))
            }
            FieldOp::Lt(target) => Self::compare(value, target) == Some(Ordering::Less),
            FieldOp::Lte(target) => {
                matches!(Self::compare(value, target), Some(Ordering::Less | Ordering::Equal))
            }
            FieldOp::In(targets) => targets.iter().any(|t| Self::equals(value, t)),
            FieldOp::Nin(targets) => !targets.iter().any(|t| Self::equals(value, t)),
            FieldOp::Exists(should_exist) => value.is_some() == *should_exist,
            FieldOp::Regex(re) => matches!(value, Some(Value::String(s)) if re.is_match(s)),
            FieldOp::Not(inner) => !inner.iter().all(|op| Self::matches_operator(value, op)),
        }
    }

    fn equals(value: Option<&Value>, target: &Value) -> bool {
        match value {
            Some(v) => IndexKey::from(v) == IndexKey::from(target),
            None => target.is_null(),
        }
    }

    /// Ordering of a present value against the operand; `None` when missing or
    /// when the two are of different types.
    fn compare(value: Option<&Value>, target: &Value) -> Option<Ordering> {
        let left = IndexKey::from(value?);
        let right = IndexKey::from(target);
        if left.type_rank() != right.type_rank() {
            return None;
        }
        Some(left.cmp(&right))
    }

    /// Leaf comparisons reachable through conjunctions only
    pub fn conjuncts(&self) -> Vec<(&str, &FieldOp)> {
        let mut leaves = Vec::new();
        Self::collect_conjuncts(&self.filter, &mut leaves);
        leaves
    }

    fn collect_conjuncts<'a>(filter: &'a Filter, leaves: &mut Vec<(&'a str, &'a FieldOp)>) {
        match filter {
            Filter::And(filters) => {
                for f in filters {
                    Self::collect_conjuncts(f, leaves);
                }
            }
            Filter::Field { path, op } => leaves.push((path.as_str(), op)),
            Filter::Or(_) | Filter::Nor(_) => {}
        }
    }

    /// True for the empty filter `{}`
    pub fn is_empty(&self) -> bool {
        matches!(&self.filter, Filter::And(filters) if filters.is_empty())
    }
}

impl Default for Query {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentId;
    use serde_json::json;
    use std::collections::HashMap;

    fn book(id: i64, fields: Value) -> Document {
        let field_map: HashMap<String, Value> = fields
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Document::new(DocumentId::Int(id), field_map)
    }

    #[test]
    fn test_query_eq_shorthand() {
        let query = Query::from_json(&json!({"genre": "Fiction"})).unwrap();

        assert!(query.matches(&book(1, json!({"genre": "Fiction"}))));
        assert!(!query.matches(&book(2, json!({"genre": "Poetry"}))));
        assert!(!query.matches(&book(3, json!({"title": "No genre"}))));
    }

    #[test]
    fn test_query_eq_numeric_normalisation() {
        let query = Query::from_json(&json!({"price": 15})).unwrap();
        assert!(query.matches(&book(1, json!({"price": 15.0}))));
        assert!(!query.matches(&book(2, json!({"price": "15"}))));
    }

    #[test]
    fn test_query_gt_operator() {
        let query = Query::from_json(&json!({"published_year": {"$gt": 2010}})).unwrap();

        assert!(query.matches(&book(1, json!({"published_year": 2015}))));
        assert!(!query.matches(&book(2, json!({"published_year": 2010}))));
        assert!(!query.matches(&book(3, json!({"published_year": 1960}))));
        // type mismatch and missing field never match a range
        assert!(!query.matches(&book(4, json!({"published_year": "2020"}))));
        assert!(!query.matches(&book(5, json!({}))));
    }

    #[test]
    fn test_query_range_conjunction_on_one_field() {
        let query = Query::from_json(&json!({"price": {"$gte": 10, "$lt": 20}})).unwrap();

        assert!(query.matches(&book(1, json!({"price": 10}))));
        assert!(query.matches(&book(2, json!({"price": 19.99}))));
        assert!(!query.matches(&book(3, json!({"price": 20}))));
        assert!(!query.matches(&book(4, json!({"price": 9.5}))));
    }

    #[test]
    fn test_query_lte_operator() {
        let query = Query::from_json(&json!({"pages": {"$lte": 300}})).unwrap();

        assert!(query.matches(&book(1, json!({"pages": 300}))));
        assert!(query.matches(&book(2, json!({"pages": 120}))));
        assert!(!query.matches(&book(3, json!({"pages": 301}))));
    }

    #[test]
    fn test_query_implicit_and() {
        let query = Query::from_json(&json!({"in_stock": true, "published_year": {"$gt": 2010}})).unwrap();

        assert!(query.matches(&book(1, json!({"in_stock": true, "published_year": 2015}))));
        assert!(!query.matches(&book(2, json!({"in_stock": false, "published_year": 2015}))));
        assert!(!query.matches(&book(3, json!({"in_stock": true, "published_year": 2001}))));
    }

    #[test]
    fn test_query_null_equality_matches_missing() {
        let query = Query::from_json(&json!({"isbn": null})).unwrap();

        assert!(query.matches(&book(1, json!({"isbn": null}))));
        assert!(query.matches(&book(2, json!({"title": "x"}))));
        assert!(!query.matches(&book(3, json!({"isbn": "978"}))));
    }

    #[test]
    fn test_query_ne_and_nin_match_missing() {
        let ne = Query::from_json(&json!({"genre": {"$ne": "Fiction"}})).unwrap();
        assert!(ne.matches(&book(1, json!({"genre": "Poetry"}))));
        assert!(ne.matches(&book(2, json!({}))));
        assert!(!ne.matches(&book(3, json!({"genre": "Fiction"}))));

        let nin = Query::from_json(&json!({"genre": {"$nin": ["Fiction", "Fantasy"]}})).unwrap();
        assert!(nin.matches(&book(4, json!({"genre": "Poetry"}))));
        assert!(!nin.matches(&book(5, json!({"genre": "Fantasy"}))));
    }

    #[test]
    fn test_query_in_operator() {
        let query = Query::from_json(&json!({"author": {"$in": ["Harper Lee", "George Orwell"]}})).unwrap();

        assert!(query.matches(&book(1, json!({"author": "Harper Lee"}))));
        assert!(!query.matches(&book(2, json!({"author": "Jane Austen"}))));
    }

    #[test]
    fn test_query_or_and_nor() {
        let or = Query::from_json(&json!({
            "$or": [{"price": {"$lt": 10}}, {"genre": "Poetry"}]
        })).unwrap();
        assert!(or.matches(&book(1, json!({"price": 8, "genre": "Fiction"}))));
        assert!(or.matches(&book(2, json!({"price": 30, "genre": "Poetry"}))));
        assert!(!or.matches(&book(3, json!({"price": 30, "genre": "Fiction"}))));

        let nor = Query::from_json(&json!({
            "$nor": [{"genre": "Horror"}, {"in_stock": false}]
        })).unwrap();
        assert!(nor.matches(&book(4, json!({"genre": "Fiction", "in_stock": true}))));
        assert!(!nor.matches(&book(5, json!({"genre": "Fiction", "in_stock": false}))));
    }

    #[test]
    fn test_query_exists_operator() {
        let exists = Query::from_json(&json!({"isbn": {"$exists": true}})).unwrap();
        let absent = Query::from_json(&json!({"isbn": {"$exists": false}})).unwrap();

        let with = book(1, json!({"isbn": null}));
        let without = book(2, json!({"title": "x"}));

        assert!(exists.matches(&with));
        assert!(!exists.matches(&without));
        assert!(!absent.matches(&with));
        assert!(absent.matches(&without));
    }

    #[test]
    fn test_query_regex_with_options() {
        let query = Query::from_json(&json!({"title": {"$regex": "^the", "$options": "i"}})).unwrap();

        assert!(query.matches(&book(1, json!({"title": "The Hobbit"}))));
        assert!(!query.matches(&book(2, json!({"title": "Moby Dick"}))));
        assert!(!query.matches(&book(3, json!({"title": 42}))));
    }

    #[test]
    fn test_query_not_operator() {
        let query = Query::from_json(&json!({"price": {"$not": {"$gt": 20}}})).unwrap();

        assert!(query.matches(&book(1, json!({"price": 10}))));
        assert!(query.matches(&book(2, json!({}))));
        assert!(!query.matches(&book(3, json!({"price": 25}))));
    }

    #[test]
    fn test_query_on_id_and_nested_path() {
        let by_id = Query::from_json(&json!({"_id": 7})).unwrap();
        assert!(by_id.matches(&book(7, json!({}))));
        assert!(!by_id.matches(&book(8, json!({}))));

        let nested = Query::from_json(&json!({"publisher.city": "London"})).unwrap();
        assert!(nested.matches(&book(1, json!({"publisher": {"city": "London"}}))));
        assert!(nested.matches(&json!({"publisher": {"city": "London"}})));
    }

    #[test]
    fn test_query_embedded_document_equality() {
        let query = Query::from_json(&json!({"dims": {"w": 10, "h": 20}})).unwrap();
        assert!(query.matches(&book(1, json!({"dims": {"w": 10, "h": 20}}))));
        assert!(!query.matches(&book(2, json!({"dims": {"w": 10}}))));
    }

    #[test]
    fn test_query_parse_errors() {
        assert!(Query::from_json(&json!({"price": {"$between": [1, 2]}})).is_err());
        assert!(Query::from_json(&json!({"$xor": []})).is_err());
        assert!(Query::from_json(&json!({"$or": []})).is_err());
        assert!(Query::from_json(&json!({"genre": {"$in": "Fiction"}})).is_err());
        assert!(Query::from_json(&json!({"isbn": {"$exists": 1}})).is_err());
        assert!(Query::from_json(&json!({"title": {"$regex": "("}})).is_err());
        assert!(Query::from_json(&json!(["genre"])).is_err());
    }

    #[test]
    fn test_query_range_on_unorderable_operand() {
        for operand in [json!({"a": 1}), json!([1, 2]), json!(true)] {
            let err = Query::from_json(&json!({"price": {"$gt": operand}})).unwrap_err();
            assert!(matches!(err, ShelfError::TypeMismatch(_)));
        }
        let err = Query::from_json(&json!({"price": {"$not": {"$lte": false}}})).unwrap_err();
        assert!(matches!(err, ShelfError::TypeMismatch(_)));
    }

    #[test]
    fn test_query_range_across_type_classes_does_not_match() {
        let query = Query::from_json(&json!({"price": {"$gt": "abc"}})).unwrap();

        assert!(!query.matches(&book(1, json!({"price": 10}))));
        assert!(query.matches(&book(2, json!({"price": "cheap"}))));
    }

    #[test]
    fn test_conjuncts_flatten_and() {
        let query = Query::from_json(&json!({
            "$and": [{"genre": "Fiction"}, {"price": {"$gt": 5, "$lt": 50}}],
            "$or": [{"a": 1}, {"b": 2}]
        })).unwrap();

        let fields: Vec<&str> = query.conjuncts().iter().map(|(f, _)| *f).collect();
        assert_eq!(fields, vec!["genre", "price", "price"]);
    }

    #[test]
    fn test_empty_query_matches_everything() {
        let query = Query::from_json(&json!({})).unwrap();
        assert!(query.is_empty());
        assert!(query.matches(&book(1, json!({"anything": 1}))));
        assert!(Query::default().is_empty());
    }
}
