// shelfdb-core/src/database.rs
// Database and client handles over a registry of in-memory collections

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::info;
use serde_json::{json, Value};

use crate::collection_core::{CollectionCore, InsertManyResult, UpdateResult};
use crate::config::DatabaseConfig;
use crate::cursor::Cursor;
use crate::document::{fields_from_value, DocumentId};
use crate::error::{Result, ShelfError};
use crate::find_options::FindOptions;
use crate::query_planner::Explain;

/// Named set of collections
pub struct Database {
    name: String,
    config: DatabaseConfig,
    collections: DashMap<String, Arc<CollectionCore>>,
}

impl Database {
    pub fn new(name: &str, config: DatabaseConfig) -> Self {
        Database {
            name: name.to_string(),
            config,
            collections: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Create an empty collection; fails if the name is taken
    pub fn create_collection(&self, name: &str) -> Result<Arc<CollectionCore>> {
        match self.collections.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ShelfError::CollectionExists(name.to_string())),
            Entry::Vacant(slot) => {
                let collection = Arc::new(CollectionCore::new(name.to_string(), self.config.clone())?);
                slot.insert(Arc::clone(&collection));
                info!("{}: created collection {}", self.name, name);
                Ok(collection)
            }
        }
    }

    /// Get collection handle
    pub fn collection(&self, name: &str) -> Result<Arc<CollectionCore>> {
        self.collections
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ShelfError::CollectionNotFound(name.to_string()))
    }

    /// Existing collection, or a new one (inserts create collections implicitly)
    fn collection_or_create(&self, name: &str) -> Result<Arc<CollectionCore>> {
        if let Some(entry) = self.collections.get(name) {
            return Ok(Arc::clone(entry.value()));
        }
        match self.create_collection(name) {
            Err(ShelfError::CollectionExists(_)) => self.collection(name),
            other => other,
        }
    }

    /// List all collection names, sorted
    pub fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Drop collection together with its documents and indexes
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        self.collections
            .remove(name)
            .ok_or_else(|| ShelfError::CollectionNotFound(name.to_string()))?;
        info!("{}: dropped collection {}", self.name, name);
        Ok(())
    }

    /// Document and index counts as JSON
    pub fn stats(&self) -> Value {
        let collections: serde_json::Map<String, Value> = self
            .collections
            .iter()
            .map(|entry| {
                let coll = entry.value();
                (
                    entry.key().clone(),
                    json!({"documents": coll.len(), "indexes": coll.list_indexes()}),
                )
            })
            .collect();
        json!({
            "database": self.name,
            "collection_count": collections.len(),
            "collections": collections,
        })
    }

    // ========== COMMANDS ==========

    pub fn insert_one(&self, collection: &str, document: Value) -> Result<DocumentId> {
        let fields = fields_from_value(document)?;
        self.collection_or_create(collection)?.insert_one(fields)
    }

    pub fn insert_many(&self, collection: &str, documents: Vec<Value>) -> Result<InsertManyResult> {
        let documents = documents
            .into_iter()
            .map(fields_from_value)
            .collect::<Result<Vec<_>>>()?;
        self.collection_or_create(collection)?.insert_many(documents)
    }

    pub fn find(&self, collection: &str, filter: &Value, options: FindOptions) -> Result<Cursor> {
        self.collection(collection)?.find_with_options(filter, options)
    }

    pub fn update_one(&self, collection: &str, filter: &Value, update: &Value) -> Result<UpdateResult> {
        self.collection(collection)?.update_one(filter, update)
    }

    pub fn delete_one(&self, collection: &str, filter: &Value) -> Result<u64> {
        self.collection(collection)?.delete_one(filter)
    }

    pub fn create_index(&self, collection: &str, spec: &Value, unique: bool) -> Result<String> {
        self.collection(collection)?.create_index(spec, unique)
    }

    pub fn explain(&self, collection: &str, filter: &Value, options: &FindOptions) -> Result<Explain> {
        self.collection(collection)?.explain(filter, options)
    }

    pub fn aggregate(&self, collection: &str, pipeline: &Value) -> Result<Cursor> {
        self.collection(collection)?.aggregate(pipeline)
    }
}

/// Entry point holding named databases
#[derive(Default)]
pub struct Client {
    config: DatabaseConfig,
    databases: DashMap<String, Arc<Database>>,
}

impl Client {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DatabaseConfig) -> Self {
        Client {
            config,
            databases: DashMap::new(),
        }
    }

    /// Handle to the named database, created on first use
    pub fn database(&self, name: &str) -> Arc<Database> {
        let entry = self
            .databases
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Database::new(name, self.config.clone())));
        Arc::clone(entry.value())
    }

    pub fn list_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn drop_database(&self, name: &str) -> bool {
        self.databases.remove(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_create_and_list_collections() {
        let db = Database::new("bookstore", DatabaseConfig::default());
        db.create_collection("books").unwrap();
        db.create_collection("authors").unwrap();

        assert_eq!(db.list_collections(), vec!["authors", "books"]);
        assert!(matches!(
            db.create_collection("books"),
            Err(ShelfError::CollectionExists(_))
        ));
    }

    #[test]
    fn test_missing_collection_is_not_found() {
        let db = Database::new("bookstore", DatabaseConfig::default());

        let err = db.find("books", &json!({}), FindOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(
            db.create_index("books", &json!({"title": 1}), false).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(db.drop_collection("books").is_err());
    }

    #[test]
    fn test_insert_creates_collection() {
        let db = Database::new("bookstore", DatabaseConfig::default());
        let id = db.insert_one("books", json!({"title": "Dune"})).unwrap();

        assert_eq!(id, DocumentId::Int(1));
        assert_eq!(db.list_collections(), vec!["books"]);
        assert_eq!(db.collection("books").unwrap().len(), 1);
    }

    #[test]
    fn test_insert_rejects_non_object() {
        let db = Database::new("bookstore", DatabaseConfig::default());
        assert!(db.insert_one("books", json!([1, 2])).is_err());
        assert!(db.insert_many("books", vec![json!({"a": 1}), json!(3)]).is_err());
        assert!(db.collection("books").is_err());
    }

    #[test]
    fn test_drop_collection_discards_documents() {
        let db = Database::new("bookstore", DatabaseConfig::default());
        db.insert_one("books", json!({"title": "Dune"})).unwrap();
        db.drop_collection("books").unwrap();

        db.create_collection("books").unwrap();
        assert_eq!(db.collection("books").unwrap().len(), 0);
    }

    #[test]
    fn test_stats() {
        let db = Database::new("bookstore", DatabaseConfig::default());
        db.insert_one("books", json!({"title": "Dune"})).unwrap();
        let stats = db.stats();
        assert_eq!(stats["collection_count"], json!(1));
        assert_eq!(stats["collections"]["books"]["documents"], json!(1));
    }

    #[test]
    fn test_client_reuses_database_handles() {
        let client = Client::new();
        client.database("bookstore").insert_one("books", json!({"title": "Dune"})).unwrap();

        let again = client.database("bookstore");
        assert_eq!(again.collection("books").unwrap().len(), 1);
        assert_eq!(client.list_databases(), vec!["bookstore"]);

        assert!(client.drop_database("bookstore"));
        assert!(client.database("bookstore").collection("books").is_err());
    }
}
