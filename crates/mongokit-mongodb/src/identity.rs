//! Helpers for reading and comparing document `_id`s

use bson::{oid::ObjectId, Bson, Document as BsonDocument};
use mongokit_common::{MongoKitError, Result};
use std::collections::BTreeMap;

/// Field holding a document's identifier
pub const ID_FIELD: &str = "_id";

/// The `_id` of `doc`, whatever its type
pub fn get_id(doc: &BsonDocument) -> Option<&Bson> {
    doc.get(ID_FIELD)
}

/// The `_id` of every document, in order
pub fn get_ids<'a, I>(docs: I) -> Vec<Option<&'a Bson>>
where
    I: IntoIterator<Item = &'a BsonDocument>,
{
    docs.into_iter().map(get_id).collect()
}

/// The `_id` of `doc` if it is an ObjectId
pub fn get_object_id(doc: &BsonDocument) -> Option<ObjectId> {
    get_id(doc).and_then(Bson::as_object_id)
}

pub fn is_object_id(value: &Bson) -> bool {
    matches!(value, Bson::ObjectId(_))
}

/// Compare two ObjectIds by value.
///
/// Fails if either argument is not an ObjectId rather than returning false,
/// so a string id never silently compares unequal to its ObjectId.
pub fn is_same_object_id(a: &Bson, b: &Bson) -> Result<bool> {
    let a = a
        .as_object_id()
        .ok_or_else(|| MongoKitError::Validation("1st argument is not an ObjectId".to_string()))?;
    let b = b
        .as_object_id()
        .ok_or_else(|| MongoKitError::Validation("2nd argument is not an ObjectId".to_string()))?;
    Ok(a == b)
}

/// Replace every document in `docs` by its `_id`, keeping the keys
pub fn pick_ids<K>(docs: &BTreeMap<K, BsonDocument>) -> BTreeMap<K, Option<Bson>>
where
    K: Ord + Clone,
{
    docs.iter()
        .map(|(key, doc)| (key.clone(), get_id(doc).cloned()))
        .collect()
}
