//! Common utilities for mongokit
//!
//! This crate provides the error taxonomy shared by every mongokit crate.

pub mod error;

pub use error::{is_connection_refused_message, MongoKitError, Result};
