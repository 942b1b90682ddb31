//! Deep-equality assertions for documents and ObjectIds
//!
//! Every assertion returns an [`AssertionResult`] so tests can chain them
//! with `?`. Failure messages embed the offending values as pretty JSON.

use bson::{Bson, Document as BsonDocument};
use mongokit_mongodb::Document;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for assertions
pub type AssertionResult = Result<(), AssertionError>;

/// Assertion error with context
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("{message}")]
pub struct AssertionError {
    /// Error message
    pub message: String,
    /// Expected value (stringified)
    pub expected: Option<String>,
    /// Actual value (stringified)
    pub actual: Option<String>,
    /// Assertion that failed (e.g., "assert_same_document")
    pub assertion_type: String,
}

impl AssertionError {
    /// Create a new assertion error
    pub fn new(message: impl Into<String>, assertion_type: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            expected: None,
            actual: None,
            assertion_type: assertion_type.into(),
        }
    }

    /// Add expected value
    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    /// Add actual value
    pub fn with_actual(mut self, actual: impl Into<String>) -> Self {
        self.actual = Some(actual.into());
        self
    }

    /// Replace the generated message; expected and actual values are kept
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    fn prefixed(mut self, prefix: &str) -> Self {
        self.message = format!("{} {}", prefix, self.message);
        self
    }
}

/// Custom failure messages for any assertion result
///
/// ```ignore
/// assert_same_document(&reloaded, &saved).with_message("user changed after reload")?;
/// ```
pub trait AssertionResultExt {
    fn with_message(self, message: impl Into<String>) -> AssertionResult;
}

impl AssertionResultExt for AssertionResult {
    fn with_message(self, message: impl Into<String>) -> AssertionResult {
        self.map_err(|err| err.with_message(message))
    }
}

/// Pretty JSON (relaxed extended JSON) for failure messages
fn pretty(value: &Bson) -> String {
    serde_json::to_string_pretty(&value.clone().into_relaxed_extjson())
        .unwrap_or_else(|_| format!("{:?}", value))
}

fn pretty_doc(doc: &BsonDocument) -> String {
    pretty(&Bson::Document(doc.clone()))
}

fn stringify_object_id(value: &Bson, assertion: &str) -> Result<String, AssertionError> {
    match value {
        Bson::ObjectId(id) => Ok(id.to_hex()),
        other => Err(AssertionError::new(
            format!("Argument is not an ObjectId: {}", pretty(other)),
            assertion,
        )),
    }
}

/// Assert both values are the same ObjectId
pub fn assert_same_object_id(actual: &Bson, expected: &Bson) -> AssertionResult {
    const NAME: &str = "assert_same_object_id";
    let a = stringify_object_id(actual, NAME)?;
    let e = stringify_object_id(expected, NAME)?;
    if a == e {
        Ok(())
    } else {
        Err(AssertionError::new(
            format!("Expected ObjectId {} to equal {}", a, e),
            NAME,
        )
        .with_expected(e)
        .with_actual(a))
    }
}

/// Assert both values are ObjectIds and differ
pub fn assert_not_same_object_id(actual: &Bson, expected: &Bson) -> AssertionResult {
    const NAME: &str = "assert_not_same_object_id";
    let a = stringify_object_id(actual, NAME)?;
    let e = stringify_object_id(expected, NAME)?;
    if a != e {
        Ok(())
    } else {
        Err(AssertionError::new(
            format!("Expected ObjectId {} not to equal {}", a, e),
            NAME,
        )
        .with_expected(e)
        .with_actual(a))
    }
}

/// Assert two documents have the same ObjectId `_id` and equal contents.
///
/// Field order is ignored, nested values are compared deeply.
pub fn assert_same_document(actual: &BsonDocument, expected: &BsonDocument) -> AssertionResult {
    const NAME: &str = "assert_same_document";
    let actual_id = actual.get("_id").ok_or_else(|| {
        AssertionError::new(
            "assert_same_document: 1st argument is not a document with an _id",
            NAME,
        )
    })?;
    let expected_id = expected.get("_id").ok_or_else(|| {
        AssertionError::new(
            "assert_same_document: 2nd argument is not a document with an _id",
            NAME,
        )
    })?;
    assert_same_object_id(actual_id, expected_id)?;

    if actual == expected {
        Ok(())
    } else {
        let (a, e) = (pretty_doc(actual), pretty_doc(expected));
        Err(AssertionError::new(
            format!("Expected document\n{}\nto equal\n{}", a, e),
            NAME,
        )
        .with_expected(e)
        .with_actual(a))
    }
}

/// [`assert_same_document`] for typed documents
pub fn assert_same_model<T: Document>(actual: &T, expected: &T) -> AssertionResult {
    let to_doc = |value: &T, which: &str| {
        value.to_bson().map_err(|e| {
            AssertionError::new(
                format!("assert_same_model: {} argument could not be serialized: {}", which, e),
                "assert_same_model",
            )
        })
    };
    assert_same_document(&to_doc(actual, "1st")?, &to_doc(expected, "2nd")?)
}

fn check_array_sizes(name: &str, actual: usize, expected: usize) -> AssertionResult {
    if actual == 0 && expected == 0 {
        return Err(AssertionError::new(
            format!("{}: Received two empty arrays.", name),
            name,
        ));
    }
    if actual != expected {
        return Err(AssertionError::new(
            format!("{}: arrays different sizes", name),
            name,
        )
        .with_expected(expected.to_string())
        .with_actual(actual.to_string()));
    }
    Ok(())
}

fn sorted_hex_ids(values: &[Bson], name: &str, which: &str) -> Result<Vec<String>, AssertionError> {
    let mut ids = values
        .iter()
        .map(|v| stringify_object_id(v, name))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.prefixed(&format!("{} {} argument:", name, which)))?;
    ids.sort();
    Ok(ids)
}

/// Assert two arrays hold the same ObjectIds, in any order
pub fn assert_same_object_id_array(actual: &[Bson], expected: &[Bson]) -> AssertionResult {
    const NAME: &str = "assert_same_object_id_array";
    check_array_sizes(NAME, actual.len(), expected.len())?;
    let a = sorted_hex_ids(actual, NAME, "1st")?;
    let e = sorted_hex_ids(expected, NAME, "2nd")?;
    if a == e {
        Ok(())
    } else {
        Err(AssertionError::new(
            format!("Expected ObjectIds {:?} to equal {:?}", a, e),
            NAME,
        )
        .with_expected(format!("{:?}", e))
        .with_actual(format!("{:?}", a)))
    }
}

fn ids_of(docs: &[BsonDocument]) -> Vec<Bson> {
    docs.iter()
        .map(|d| d.get("_id").cloned().unwrap_or(Bson::Null))
        .collect()
}

/// Assert two arrays of documents hold the same `_id`s, in any order
pub fn assert_same_document_id_array(
    actual: &[BsonDocument],
    expected: &[BsonDocument],
) -> AssertionResult {
    check_array_sizes("assert_same_document_id_array", actual.len(), expected.len())?;
    assert_same_object_id_array(&ids_of(actual), &ids_of(expected))
}

/// Sort key for documents: ObjectIds by hex, anything else by its display form
fn id_sort_key(doc: &BsonDocument) -> String {
    match doc.get("_id") {
        Some(Bson::ObjectId(id)) => id.to_hex(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Assert two arrays hold the same documents, matched by `_id` regardless of order
pub fn assert_same_document_array(
    actual: &[BsonDocument],
    expected: &[BsonDocument],
) -> AssertionResult {
    check_array_sizes("assert_same_document_array", actual.len(), expected.len())?;

    let mut actual_sorted: Vec<&BsonDocument> = actual.iter().collect();
    let mut expected_sorted: Vec<&BsonDocument> = expected.iter().collect();
    actual_sorted.sort_by_key(|d| id_sort_key(d));
    expected_sorted.sort_by_key(|d| id_sort_key(d));

    for (a, e) in actual_sorted.into_iter().zip(expected_sorted) {
        assert_same_document(a, e)?;
    }
    Ok(())
}

/// Assert `result` is an error whose message is exactly `expected_message`.
///
/// Unlike pattern-based checks, a message that merely contains the expected
/// text does not pass.
pub fn assert_err_message<T, E>(result: Result<T, E>, expected_message: &str) -> AssertionResult
where
    T: fmt::Debug,
    E: fmt::Display,
{
    const NAME: &str = "assert_err_message";
    match result {
        Ok(value) => Err(AssertionError::new(
            format!("assert_err_message: didn't fail, got Ok({:?})", value),
            NAME,
        )),
        Err(err) => {
            let message = err.to_string();
            if message == expected_message {
                Ok(())
            } else {
                Err(AssertionError::new(
                    format!(
                        "Expected error message {:?} but got {:?}",
                        expected_message, message
                    ),
                    NAME,
                )
                .with_expected(expected_message)
                .with_actual(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId};
    use mongokit_mongodb::MongoKitError;

    fn oid() -> Bson {
        Bson::ObjectId(ObjectId::new())
    }

    #[test]
    fn test_same_object_id() {
        let id = ObjectId::new();
        let copy = ObjectId::parse_str(id.to_hex()).unwrap();
        assert!(assert_same_object_id(&Bson::ObjectId(id), &Bson::ObjectId(copy)).is_ok());
        assert!(assert_same_object_id(&Bson::ObjectId(id), &oid()).is_err());
    }

    #[test]
    fn test_same_object_id_rejects_strings() {
        let id = ObjectId::new();
        let err = assert_same_object_id(&Bson::String(id.to_hex()), &Bson::ObjectId(id)).unwrap_err();
        assert!(err.message.starts_with("Argument is not an ObjectId"));
        assert_eq!(err.assertion_type, "assert_same_object_id");
    }

    #[test]
    fn test_not_same_object_id() {
        let id = oid();
        assert!(assert_not_same_object_id(&id, &oid()).is_ok());
        assert!(assert_not_same_object_id(&id, &id).is_err());
        assert!(assert_not_same_object_id(&Bson::Int32(1), &id).is_err());
    }

    #[test]
    fn test_same_document_ignores_field_order() {
        let id = ObjectId::new();
        let a = doc! { "_id": id, "name": "a", "tags": ["x", "y"] };
        let b = doc! { "tags": ["x", "y"], "name": "a", "_id": id };
        assert!(assert_same_document(&a, &b).is_ok());
    }

    #[test]
    fn test_same_document_detects_deep_difference() {
        let id = ObjectId::new();
        let a = doc! { "_id": id, "raw": { "deleted": false } };
        let b = doc! { "_id": id, "raw": { "deleted": true } };
        let err = assert_same_document(&a, &b).unwrap_err();
        assert!(err.message.contains("\"deleted\": true"));
        assert!(err.actual.unwrap().contains("\"deleted\": false"));
    }

    #[test]
    fn test_same_document_requires_ids() {
        let id = ObjectId::new();
        let err = assert_same_document(&doc! { "name": "a" }, &doc! { "_id": id }).unwrap_err();
        assert_eq!(
            err.message,
            "assert_same_document: 1st argument is not a document with an _id"
        );
        let err = assert_same_document(&doc! { "_id": id }, &doc! { "name": "a" }).unwrap_err();
        assert_eq!(
            err.message,
            "assert_same_document: 2nd argument is not a document with an _id"
        );
    }

    #[test]
    fn test_same_document_different_ids() {
        let a = doc! { "_id": ObjectId::new(), "name": "a" };
        let b = doc! { "_id": ObjectId::new(), "name": "a" };
        assert!(assert_same_document(&a, &b).is_err());
    }

    #[test]
    fn test_object_id_array_order_insensitive() {
        let (a, b, c) = (oid(), oid(), oid());
        assert!(assert_same_object_id_array(
            &[a.clone(), b.clone(), c.clone()],
            &[c.clone(), a.clone(), b.clone()]
        )
        .is_ok());
        assert!(assert_same_object_id_array(&[a.clone(), b.clone()], &[a, c]).is_err());
    }

    #[test]
    fn test_object_id_array_size_checks() {
        let err = assert_same_object_id_array(&[], &[]).unwrap_err();
        assert_eq!(
            err.message,
            "assert_same_object_id_array: Received two empty arrays."
        );
        let err = assert_same_object_id_array(&[oid()], &[oid(), oid()]).unwrap_err();
        assert_eq!(err.message, "assert_same_object_id_array: arrays different sizes");
    }

    #[test]
    fn test_object_id_array_names_bad_argument() {
        let err = assert_same_object_id_array(&[oid()], &[Bson::String("x".to_string())])
            .unwrap_err();
        assert!(err
            .message
            .starts_with("assert_same_object_id_array 2nd argument: Argument is not an ObjectId"));
    }

    #[test]
    fn test_document_id_array() {
        let (a, b) = (ObjectId::new(), ObjectId::new());
        let actual = vec![doc! { "_id": a, "v": 1 }, doc! { "_id": b, "v": 2 }];
        let expected = vec![doc! { "_id": b, "v": 99 }, doc! { "_id": a }];
        assert!(assert_same_document_id_array(&actual, &expected).is_ok());

        let missing = vec![doc! { "v": 1 }, doc! { "_id": b }];
        assert!(assert_same_document_id_array(&missing, &expected).is_err());
    }

    #[test]
    fn test_document_array_matches_by_id() {
        let (a, b) = (ObjectId::new(), ObjectId::new());
        let actual = vec![doc! { "_id": a, "v": 1 }, doc! { "_id": b, "v": 2 }];
        let expected = vec![doc! { "_id": b, "v": 2 }, doc! { "_id": a, "v": 1 }];
        assert!(assert_same_document_array(&actual, &expected).is_ok());

        let changed = vec![doc! { "_id": b, "v": 3 }, doc! { "_id": a, "v": 1 }];
        assert!(assert_same_document_array(&actual, &changed).is_err());
        assert!(assert_same_document_array(&[], &[]).is_err());
    }

    #[test]
    fn test_err_message_exact_match() {
        let result: Result<(), MongoKitError> =
            Err(MongoKitError::Validation("Model name not given".to_string()));
        assert!(assert_err_message(result.clone(), "Validation error: Model name not given").is_ok());

        let err = assert_err_message(result, "Model name not given").unwrap_err();
        assert_eq!(err.assertion_type, "assert_err_message");

        let ok: Result<u8, MongoKitError> = Ok(7);
        let err = assert_err_message(ok, "anything").unwrap_err();
        assert_eq!(err.message, "assert_err_message: didn't fail, got Ok(7)");
    }

    #[test]
    fn test_custom_message_replaces_generated_one() {
        let (a, b) = (oid(), oid());
        let err = assert_same_object_id(&a, &b)
            .with_message("owner should not change")
            .unwrap_err();
        assert_eq!(err.message, "owner should not change");
        assert_eq!(err.assertion_type, "assert_same_object_id");
        assert!(err.expected.is_some());

        assert!(assert_same_object_id(&a, &a).with_message("unused").is_ok());
    }
}
