// shelfdb-core/src/find_options.rs
// Find query options: projection, sort, limit, skip

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::document::{resolve_path, ID_FIELD};
use crate::error::{Result, ShelfError};
use crate::index::{IndexKey, SortDirection};
use crate::query::FieldSource;

/// Field selection applied to result documents
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Only the listed paths; `_id` only when explicitly requested
    Include { fields: Vec<String>, include_id: bool },
    /// Everything but the listed paths
    Exclude(Vec<String>),
}

impl Projection {
    pub fn include<S: AsRef<str>>(fields: &[S]) -> Self {
        let mut include_id = false;
        let fields = fields
            .iter()
            .map(|f| f.as_ref())
            .filter(|f| {
                let is_id = *f == ID_FIELD;
                include_id |= is_id;
                !is_id
            })
            .map(str::to_string)
            .collect();
        Projection::Include { fields, include_id }
    }

    pub fn exclude<S: AsRef<str>>(fields: &[S]) -> Self {
        Projection::Exclude(fields.iter().map(|f| f.as_ref().to_string()).collect())
    }

    /// Parse `{title: 1, author: 1}` or `{isbn: 0}`. `_id` may be toggled in either mode.
    pub fn from_json(spec: &Value) -> Result<Self> {
        let map = spec
            .as_object()
            .ok_or_else(|| ShelfError::InvalidQuery("projection must be an object".into()))?;
        if map.is_empty() {
            return Ok(Projection::Exclude(Vec::new()));
        }

        let mut included = Vec::new();
        let mut excluded = Vec::new();
        let mut id_flag = None;

        for (field, flag) in map {
            let include = match flag {
                Value::Bool(b) => *b,
                Value::Number(n) if n.as_f64() == Some(0.0) => false,
                Value::Number(n) if n.as_f64() == Some(1.0) => true,
                other => {
                    return Err(ShelfError::InvalidQuery(format!(
                        "projection value for '{}' must be 0 or 1, got {}",
                        field, other
                    )));
                }
            };
            if field == ID_FIELD {
                id_flag = Some(include);
            } else if include {
                included.push(field.clone());
            } else {
                excluded.push(field.clone());
            }
        }

        if !included.is_empty() && !excluded.is_empty() {
            return Err(ShelfError::InvalidQuery(
                "projection cannot mix inclusion and exclusion".into(),
            ));
        }

        if !excluded.is_empty() || (id_flag == Some(false) && included.is_empty()) {
            if id_flag == Some(false) {
                excluded.push(ID_FIELD.to_string());
            }
            return Ok(Projection::Exclude(excluded));
        }

        Ok(Projection::Include {
            fields: included,
            include_id: id_flag == Some(true),
        })
    }

    pub fn apply(&self, doc: &Value) -> Value {
        apply_projection(doc, self)
    }
}

/// Options for find queries
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub projection: Option<Projection>,

    /// Sort: [(field, direction)], applied left to right
    pub sort: Option<Vec<(String, SortDirection)>>,

    /// Limit: maximum number of documents to return; 0 means no limit
    pub limit: Option<usize>,

    /// Skip: number of documents to skip (for pagination)
    pub skip: Option<usize>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_sort(mut self, sort: Vec<(String, SortDirection)>) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Append one sort key
    pub fn sort_by(mut self, field: &str, direction: SortDirection) -> Self {
        self.sort
            .get_or_insert_with(Vec::new)
            .push((field.to_string(), direction));
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Parse `{"projection": {...}, "sort": {...}, "skip": n, "limit": n}`
    pub fn from_json(json: &Value) -> Result<Self> {
        let map = json
            .as_object()
            .ok_or_else(|| ShelfError::InvalidQuery("find options must be an object".into()))?;

        let mut options = FindOptions::new();
        for (key, value) in map {
            match key.as_str() {
                "projection" => options.projection = Some(Projection::from_json(value)?),
                "sort" => options.sort = Some(parse_sort(value)?),
                "skip" => options.skip = Some(parse_count("skip", value)?),
                "limit" => options.limit = Some(parse_count("limit", value)?),
                other => {
                    return Err(ShelfError::InvalidQuery(format!("Unknown find option: {}", other)));
                }
            }
        }
        Ok(options)
    }

    pub fn sort_spec(&self) -> &[(String, SortDirection)] {
        self.sort.as_deref().unwrap_or(&[])
    }
}

/// Parse `{price: 1, title: -1}` into ordered sort keys
pub fn parse_sort(spec: &Value) -> Result<Vec<(String, SortDirection)>> {
    let map = spec
        .as_object()
        .ok_or_else(|| ShelfError::InvalidQuery("sort must be an object".into()))?;
    map.iter()
        .map(|(field, dir)| Ok((field.clone(), SortDirection::from_json(dir)?)))
        .collect()
}

fn parse_count(name: &str, value: &Value) -> Result<usize> {
    value
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| ShelfError::InvalidQuery(format!("{} must be a non-negative integer", name)))
}

/// Apply projection to a document
pub fn apply_projection(doc: &Value, projection: &Projection) -> Value {
    let Value::Object(obj) = doc else {
        return doc.clone();
    };

    match projection {
        Projection::Include { fields, include_id } => {
            let mut result = Map::new();
            if *include_id {
                if let Some(id) = obj.get(ID_FIELD) {
                    result.insert(ID_FIELD.to_string(), id.clone());
                }
            }
            for field in fields {
                if let Some(value) = resolve_path(doc, field) {
                    insert_path(&mut result, field, value.clone());
                }
            }
            Value::Object(result)
        }
        Projection::Exclude(fields) => {
            let mut result = obj.clone();
            for field in fields {
                remove_path(&mut result, field);
            }
            Value::Object(result)
        }
    }
}

pub(crate) fn insert_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(child) = child {
                insert_path(child, rest, value);
            }
        }
    }
}

pub(crate) fn remove_path(map: &mut Map<String, Value>, path: &str) {
    match path.split_once('.') {
        None => {
            map.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = map.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

/// Compare two key tuples under per-field directions
pub fn compare_keys(a: &[IndexKey], b: &[IndexKey], sort: &[(String, SortDirection)]) -> Ordering {
    a.iter()
        .zip(b)
        .zip(sort)
        .map(|((x, y), (_, dir))| dir.apply(x.cmp(y)))
        .find(|ord| *ord != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

/// Sort key tuple of one document
pub fn sort_key<S: FieldSource + ?Sized>(doc: &S, sort: &[(String, SortDirection)]) -> Vec<IndexKey> {
    sort.iter()
        .map(|(field, _)| IndexKey::from_option(doc.field(field).as_deref()))
        .collect()
}

/// Stable sort; documents with equal keys keep their incoming order
pub fn apply_sort<T: FieldSource>(docs: &mut Vec<T>, sort: &[(String, SortDirection)]) {
    if sort.is_empty() {
        return;
    }

    let mut keyed: Vec<(Vec<IndexKey>, T)> = docs
        .drain(..)
        .map(|doc| (sort_key(&doc, sort), doc))
        .collect();
    keyed.sort_by(|(a, _), (b, _)| compare_keys(a, b, sort));
    docs.extend(keyed.into_iter().map(|(_, doc)| doc));
}

/// Apply skip then limit
pub fn apply_limit_skip<T>(docs: Vec<T>, limit: Option<usize>, skip: Option<usize>) -> Vec<T> {
    let skip_count = skip.unwrap_or(0);
    if skip_count >= docs.len() {
        return Vec::new();
    }

    let take = match limit {
        Some(0) | None => usize::MAX,
        Some(n) => n,
    };
    docs.into_iter().skip(skip_count).take(take).collect()
}
