//! Document trait for types stored in a MongoDB collection
//!
//! Gives the identity helpers and test assertions a uniform way to reach a
//! typed document's `_id` and its BSON form.

use bson::{oid::ObjectId, Document as BsonDocument};
use mongodb::{Collection, Database};
use mongokit_common::{MongoKitError, Result};
use serde::{de::DeserializeOwned, Serialize};

/// A serde type persisted in a named collection
///
/// # Example
///
/// ```ignore
/// use serde::{Deserialize, Serialize};
/// use mongokit_mongodb::Document;
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct User {
///     #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
///     id: Option<ObjectId>,
///     email: String,
/// }
///
/// impl Document for User {
///     fn collection_name() -> &'static str {
///         "users"
///     }
///
///     fn get_id(&self) -> Option<ObjectId> {
///         self.id
///     }
/// }
/// ```
pub trait Document: Serialize + DeserializeOwned + Send + Sync + Sized {
    /// Get the collection name for this document type
    fn collection_name() -> &'static str;

    /// Get the document's ObjectId (if it has one)
    fn get_id(&self) -> Option<ObjectId> {
        None
    }

    /// Set the document's ObjectId
    fn set_id(&mut self, _id: ObjectId) {}

    /// Convert document to BSON
    fn to_bson(&self) -> Result<BsonDocument> {
        bson::to_document(self).map_err(|e| MongoKitError::Serialization(e.to_string()))
    }

    /// Create document from BSON
    fn from_bson(doc: BsonDocument) -> Result<Self> {
        bson::from_document(doc).map_err(|e| MongoKitError::Deserialization(e.to_string()))
    }

    /// Get the untyped collection for this document
    fn collection(db: &Database) -> Collection<BsonDocument> {
        db.collection(Self::collection_name())
    }
}
