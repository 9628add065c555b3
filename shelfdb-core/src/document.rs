// src/document.rs
use serde::{Serialize, Deserialize};
use serde_json::Value;
use uuid::Uuid;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use crate::error::{Result, ShelfError};

pub const ID_FIELD: &str = "_id";

/// Schema-less document: an identifier plus a map of JSON values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: DocumentId,

    #[serde(flatten)]
    pub fields: HashMap<String, Value>,
}

/// Document identifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum DocumentId {
    Int(i64),
    String(String),
    ObjectId(String),
}

impl DocumentId {
    /// Next auto-increment id after `last_id`
    pub fn new_auto(last_id: u64) -> Result<Self> {
        last_id
            .checked_add(1)
            .and_then(|next| i64::try_from(next).ok())
            .map(DocumentId::Int)
            .ok_or(ShelfError::IdSpaceExhausted(last_id))
    }

    /// Random ObjectId (UUID v4 text)
    pub fn new_object_id() -> Self {
        DocumentId::ObjectId(Uuid::new_v4().to_string())
    }

    /// Caller-supplied `_id`. Only integers and strings are accepted.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(DocumentId::Int)
                .ok_or_else(|| ShelfError::InvalidQuery(format!("_id must be an integer, got {}", n))),
            Value::String(s) => Ok(DocumentId::String(s.clone())),
            other => Err(ShelfError::InvalidQuery(format!(
                "_id must be an integer or a string, got {}",
                other
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            DocumentId::Int(i) => Value::from(*i),
            DocumentId::String(s) | DocumentId::ObjectId(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentId::Int(i) => write!(f, "{}", i),
            DocumentId::String(s) => write!(f, "\"{}\"", s),
            DocumentId::ObjectId(s) => write!(f, "ObjectId(\"{}\")", s),
        }
    }
}

impl Document {
    pub fn new(id: DocumentId, fields: HashMap<String, Value>) -> Self {
        Document { id, fields }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Top-level field lookup. `_id` lives outside `fields`, use [`Document::value_at`].
    pub fn get(&self, field: &str) -> Option<&Value> {
        if field == ID_FIELD {
            None
        } else {
            self.fields.get(field)
        }
    }

    /// Resolve a dotted path (`"address.city"`, `"tags.0"`), including `_id`
    pub fn value_at(&self, path: &str) -> Option<Cow<'_, Value>> {
        if path == ID_FIELD {
            return Some(Cow::Owned(self.id.to_value()));
        }

        let mut parts = path.split('.');
        let head = parts.next()?;
        let mut current = self.fields.get(head)?;
        for part in parts {
            current = step_into(current, part)?;
        }
        Some(Cow::Borrowed(current))
    }

    pub fn set(&mut self, field: String, value: Value) {
        self.fields.insert(field, value);
    }

    /// Set a dotted path, creating intermediate objects as needed.
    /// Fails when an intermediate segment holds a non-object value.
    pub fn set_path(&mut self, path: &str, value: Value) -> Result<()> {
        let (head, rest) = match path.split_once('.') {
            None => {
                self.fields.insert(path.to_string(), value);
                return Ok(());
            }
            Some(split) => split,
        };

        let slot = self
            .fields
            .entry(head.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        set_in_value(slot, rest, value, path)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// Remove a dotted path; returns the removed value if there was one
    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        let (head, rest) = match path.split_once('.') {
            None => return self.fields.remove(path),
            Some(split) => split,
        };

        let mut current = self.fields.get_mut(head)?;
        let mut segments = rest.split('.').peekable();
        while let Some(segment) = segments.next() {
            let map = current.as_object_mut()?;
            if segments.peek().is_none() {
                return map.remove(segment);
            }
            current = map.get_mut(segment)?;
        }
        None
    }

    pub fn contains(&self, field: &str) -> bool {
        field == ID_FIELD || self.fields.contains_key(field)
    }

    /// Full JSON form, `_id` included
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::with_capacity(self.fields.len() + 1);
        map.insert(ID_FIELD.to_string(), self.id.to_value());
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        let mut map = serde_json::Map::new();
        map.insert(ID_FIELD.to_string(), doc.id.to_value());
        for (k, v) in doc.fields {
            map.insert(k, v);
        }
        Value::Object(map)
    }
}

/// Split a JSON object into document fields (`_id` included if present)
pub fn fields_from_value(value: Value) -> Result<HashMap<String, Value>> {
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(ShelfError::InvalidQuery(format!("document must be an object, got {}", other))),
    }
}

/// Descend one path segment into an object or array
pub(crate) fn step_into<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// Resolve a dotted path inside a plain JSON value (aggregation stream documents)
pub(crate) fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, step_into)
}

fn set_in_value(slot: &mut Value, path: &str, value: Value, full_path: &str) -> Result<()> {
    let mut current = slot;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let map = current.as_object_mut().ok_or_else(|| {
            ShelfError::TypeMismatch(format!("cannot create field '{}' inside a non-object value", full_path))
        })?;
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return Ok(());
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    Ok(())
}
