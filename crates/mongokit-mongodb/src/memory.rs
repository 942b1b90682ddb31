//! In-memory store and connector with failure injection.
//!
//! Stand-ins for a live server in unit tests of code built on
//! [`ConnectionManager`](crate::ConnectionManager) and
//! [`ResetEngine`](crate::ResetEngine).

use async_trait::async_trait;
use bson::Document as BsonDocument;
use mongokit_common::{MongoKitError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::collections::{ResettableStore, ResourceDescriptor};
use crate::config::ConnectOptions;
use crate::manager::{Connector, ManagedConnection};

/// Name of the index every collection keeps
pub const ID_INDEX: &str = "_id_";

#[derive(Debug, Default)]
struct MemoryCollection {
    documents: Vec<BsonDocument>,
    indexes: Vec<String>,
}

impl MemoryCollection {
    fn new() -> Self {
        Self {
            documents: Vec::new(),
            indexes: vec![ID_INDEX.to_string()],
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    collections: BTreeMap<String, MemoryCollection>,
    failing_batches: u32,
    fail_always: bool,
    delete_failures: HashMap<String, u32>,
    drop_index_failures: HashMap<String, u32>,
    mutations: HashMap<String, usize>,
    close_error: Option<String>,
    closed: bool,
}

impl StoreState {
    fn record_mutation(&mut self, collection: &str) {
        *self.mutations.entry(collection.to_string()).or_insert(0) += 1;
    }
}

/// Consume one pending failure for `collection`, if any
fn take_failure(failures: &mut HashMap<String, u32>, collection: &str) -> bool {
    match failures.get_mut(collection) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

/// Shared in-memory database; clones see the same collections
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    enumerations: Arc<AtomicUsize>,
    close_calls: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty collection (no-op if it exists)
    pub fn create_collection(&self, name: &str) {
        self.state
            .lock()
            .collections
            .entry(name.to_string())
            .or_insert_with(MemoryCollection::new);
    }

    /// Insert a document, creating the collection on demand
    pub fn insert(&self, collection: &str, document: BsonDocument) {
        self.state
            .lock()
            .collections
            .entry(collection.to_string())
            .or_insert_with(MemoryCollection::new)
            .documents
            .push(document);
    }

    /// Add a secondary index, creating the collection on demand
    pub fn create_index(&self, collection: &str, index: &str) {
        self.state
            .lock()
            .collections
            .entry(collection.to_string())
            .or_insert_with(MemoryCollection::new)
            .indexes
            .push(index.to_string());
    }

    /// Remove a collection
    pub fn drop_collection(&self, name: &str) {
        self.state.lock().collections.remove(name);
    }

    /// Number of documents in `collection` (0 if it does not exist)
    pub fn count(&self, collection: &str) -> usize {
        self.state
            .lock()
            .collections
            .get(collection)
            .map_or(0, |c| c.documents.len())
    }

    /// Index names of `collection`
    pub fn indexes(&self, collection: &str) -> Vec<String> {
        self.state
            .lock()
            .collections
            .get(collection)
            .map(|c| c.indexes.clone())
            .unwrap_or_default()
    }

    /// Make the next `n` enumerations fail, which fails `n` whole reset batches
    pub fn fail_next_batches(&self, n: u32) {
        self.state.lock().failing_batches = n;
    }

    /// Make every enumeration fail
    pub fn fail_always(&self) {
        self.state.lock().fail_always = true;
    }

    /// Make the next `n` deletes on `collection` fail, leaving its documents in place
    pub fn fail_delete_on(&self, collection: &str, n: u32) {
        self.state
            .lock()
            .delete_failures
            .insert(collection.to_string(), n);
    }

    /// Make the next `n` index drops on `collection` fail
    pub fn fail_drop_indexes_on(&self, collection: &str, n: u32) {
        self.state
            .lock()
            .drop_index_failures
            .insert(collection.to_string(), n);
    }

    /// Delete and index-drop calls made against `collection`, failed ones included
    pub fn mutation_calls(&self, collection: &str) -> usize {
        self.state
            .lock()
            .mutations
            .get(collection)
            .copied()
            .unwrap_or(0)
    }

    /// Make `close` return an error with `message`
    pub fn fail_close(&self, message: &str) {
        self.state.lock().close_error = Some(message.to_string());
    }

    /// How many times the collections were enumerated
    pub fn enumerations(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl ResettableStore for MemoryStore {
    type Handle = String;

    async fn resources(&self) -> Result<Vec<ResourceDescriptor<String>>> {
        let attempt = self.enumerations.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.lock();
        if state.fail_always {
            return Err(MongoKitError::Transient(format!(
                "injected failure on enumeration {}",
                attempt
            )));
        }
        if state.failing_batches > 0 {
            state.failing_batches -= 1;
            return Err(MongoKitError::Transient(format!(
                "injected failure on enumeration {}",
                attempt
            )));
        }
        Ok(state
            .collections
            .keys()
            .map(|name| ResourceDescriptor::new(name.clone(), name.clone()))
            .collect())
    }

    async fn delete_all_documents(&self, handle: &String) -> Result<u64> {
        let mut state = self.state.lock();
        state.record_mutation(handle);
        if take_failure(&mut state.delete_failures, handle) {
            return Err(MongoKitError::MongoDB(format!(
                "injected delete failure on {}",
                handle
            )));
        }
        let deleted = state
            .collections
            .get_mut(handle)
            .map_or(0, |c| std::mem::take(&mut c.documents).len());
        Ok(deleted as u64)
    }

    async fn drop_all_indexes(&self, handle: &String) -> Result<()> {
        let mut state = self.state.lock();
        state.record_mutation(handle);
        if take_failure(&mut state.drop_index_failures, handle) {
            return Err(MongoKitError::MongoDB(format!(
                "injected index drop failure on {}",
                handle
            )));
        }
        match state.collections.get_mut(handle) {
            Some(collection) => {
                collection.indexes.retain(|name| name == ID_INDEX);
                Ok(())
            }
            None => Err(MongoKitError::MongoDB(format!("ns not found: {}", handle))),
        }
    }
}

#[async_trait]
impl ManagedConnection for MemoryStore {
    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(message) = state.close_error.clone() {
            return Err(MongoKitError::MongoDB(message));
        }
        state.closed = true;
        Ok(())
    }
}

/// Connector that hands out clones of one [`MemoryStore`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    store: MemoryStore,
    delay: Duration,
    errors: Arc<Mutex<VecDeque<MongoKitError>>>,
    calls: Arc<AtomicUsize>,
    last_uri: Arc<Mutex<Option<String>>>,
}

impl MemoryConnector {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            delay: Duration::ZERO,
            errors: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(AtomicUsize::new(0)),
            last_uri: Arc::new(Mutex::new(None)),
        }
    }

    /// Wait `delay` before each connect attempt completes
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the first connect attempts with `errors`, in order
    pub fn fail_with(self, errors: Vec<MongoKitError>) -> Self {
        self.errors.lock().extend(errors);
        self
    }

    pub fn connect_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_uri(&self) -> Option<String> {
        self.last_uri.lock().clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryStore;

    async fn connect(&self, uri: &str, _options: &ConnectOptions) -> Result<MemoryStore> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_uri.lock() = Some(uri.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next_error = self.errors.lock().pop_front();
        match next_error {
            Some(err) => Err(err),
            None => Ok(self.store.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[tokio::test]
    async fn test_drop_indexes_keeps_id_index() {
        let store = MemoryStore::new();
        store.create_index("users", "email_1");
        store.drop_all_indexes(&"users".to_string()).await.unwrap();
        assert_eq!(store.indexes("users"), vec![ID_INDEX.to_string()]);
    }

    #[tokio::test]
    async fn test_delete_all_documents_reports_count() {
        let store = MemoryStore::new();
        store.insert("users", doc! { "name": "a" });
        store.insert("users", doc! { "name": "b" });
        let deleted = store
            .delete_all_documents(&"users".to_string())
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.count("users"), 0);
    }

    #[tokio::test]
    async fn test_injected_batch_failures_run_out() {
        let store = MemoryStore::new();
        store.fail_next_batches(1);
        assert!(store.resources().await.is_err());
        assert!(store.resources().await.is_ok());
        assert_eq!(store.enumerations(), 2);
    }

    #[tokio::test]
    async fn test_injected_delete_failure_keeps_documents() {
        let store = MemoryStore::new();
        store.insert("users", doc! { "name": "a" });
        store.fail_delete_on("users", 1);
        let users = "users".to_string();

        assert!(store.delete_all_documents(&users).await.is_err());
        assert_eq!(store.count("users"), 1);
        assert_eq!(store.delete_all_documents(&users).await.unwrap(), 1);
        assert_eq!(store.mutation_calls("users"), 2);
    }
}
