//! MongoDB helpers for mongokit
//!
//! This crate provides the pieces test harnesses and services share when
//! talking to MongoDB through the official driver.
//!
//! # Features
//! - Environment-driven connection settings with caller overrides
//! - A single, injectable connection handle with an await-once-open future
//! - Enumeration of user collections (system collections excluded)
//! - Bounded-retry reset of all documents or all indexes
//! - Pure schema decoration helpers (indexes, virtuals, query hooks)
//! - ObjectId identity helpers
//! - In-memory store and connector for unit tests

pub mod collections;
pub mod config;
pub mod connection;
pub mod document;
pub mod identity;
pub mod manager;
pub mod memory;
pub mod reset;
pub mod schema;

pub use collections::{
    is_system_collection, list_resettable_resources, ResettableStore, ResourceDescriptor,
    SYSTEM_COLLECTION_PREFIX,
};
pub use config::{ConnectOptions, ConnectOverrides, DatabaseConfig, Environment};
pub use connection::{Connection, MongoConnector};
pub use document::Document;
pub use identity::{get_id, get_ids, get_object_id, is_object_id, is_same_object_id, pick_ids};
pub use manager::{
    ConnectionManager, ConnectionState, Connector, LifecycleEvent, ManagedConnection,
};
pub use mongokit_common::{MongoKitError, Result};
pub use reset::{ResetEngine, ResetReport, RetryPolicy};
pub use schema::{
    add_indexes, add_unique_indexes, add_virtual_getters, apply_all_hooks, hook_all_methods,
    IndexSpec, Model, ModelRegistry, QueryHook, QueryMethod, SchemaDescriptor,
};
