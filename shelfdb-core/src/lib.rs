// shelfdb-core/src/lib.rs
// In-memory document store: collections, indexes, queries, aggregation

pub mod error;
pub mod config;
pub mod document;
pub mod index;
pub mod query;
pub mod expression;
pub mod query_planner;
pub mod find_options;
pub mod cursor;
pub mod aggregation;
pub mod collection_core;
pub mod database;

// Public exports
pub use error::{ErrorKind, Result, ShelfError};
pub use config::{DatabaseConfig, IdStrategy};
pub use document::{Document, DocumentId};
pub use index::SortDirection;
pub use query::Query;
pub use query_planner::Explain;
pub use find_options::{FindOptions, Projection};
pub use cursor::Cursor;
pub use aggregation::Pipeline;
pub use collection_core::{CollectionCore, InsertManyResult, UpdateResult};
pub use database::{Client, Database};
