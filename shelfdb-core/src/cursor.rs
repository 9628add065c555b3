// src/cursor.rs
// Result cursor over a point-in-time snapshot

use std::sync::Arc;

use serde_json::Value;

use crate::document::Document;
use crate::find_options::Projection;

#[derive(Debug, Clone)]
enum Batch {
    /// Stored documents, projected on the way out
    Documents {
        docs: Vec<Arc<Document>>,
        projection: Option<Projection>,
    },
    /// Already-shaped values (aggregation output)
    Values(Vec<Value>),
}

/// Lazy, restartable sequence of result documents.
///
/// The cursor owns its snapshot, so later writes to the collection never
/// show up in (or disturb) an open cursor.
#[derive(Debug, Clone)]
pub struct Cursor {
    batch: Batch,
    position: usize,
}

impl Cursor {
    pub(crate) fn from_documents(docs: Vec<Arc<Document>>, projection: Option<Projection>) -> Self {
        Cursor {
            batch: Batch::Documents { docs, projection },
            position: 0,
        }
    }

    pub(crate) fn from_values(values: Vec<Value>) -> Self {
        Cursor {
            batch: Batch::Values(values),
            position: 0,
        }
    }

    pub fn empty() -> Self {
        Self::from_values(Vec::new())
    }

    fn total(&self) -> usize {
        match &self.batch {
            Batch::Documents { docs, .. } => docs.len(),
            Batch::Values(values) => values.len(),
        }
    }

    fn render(&self, i: usize) -> Option<Value> {
        match &self.batch {
            Batch::Documents { docs, projection } => {
                let value = docs.get(i)?.to_value();
                Some(match projection {
                    Some(projection) => projection.apply(&value),
                    None => value,
                })
            }
            Batch::Values(values) => values.get(i).cloned(),
        }
    }

    /// Fetch the next chunk of documents (up to `chunk_size`)
    pub fn next_chunk(&mut self, chunk_size: usize) -> Vec<Value> {
        let end = (self.position + chunk_size).min(self.total());
        let chunk = (self.position..end).filter_map(|i| self.render(i)).collect();
        self.position = end.max(self.position);
        chunk
    }

    /// Remaining documents in the cursor
    pub fn remaining(&self) -> usize {
        self.total().saturating_sub(self.position)
    }

    pub fn is_finished(&self) -> bool {
        self.position >= self.total()
    }

    /// Start again from the first document of the same snapshot
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// Drain the rest of the cursor
    pub fn to_vec(&mut self) -> Vec<Value> {
        let rest = self.remaining();
        self.next_chunk(rest)
    }
}

impl Iterator for Cursor {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        let value = self.render(self.position)?;
        self.position += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.remaining();
        (rest, Some(rest))
    }
}

impl ExactSizeIterator for Cursor {}
