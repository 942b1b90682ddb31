//! Test support for suites that run against MongoDB
//!
//! - [`assertions`]: deep-equality assertions over documents and ObjectIds
//! - [`fixtures`]: a database fixture that clears collections and indexes
//!   between tests and stops the run if the database cannot be reset

pub mod assertions;
pub mod fixtures;

pub use assertions::{
    assert_err_message, assert_not_same_object_id, assert_same_document,
    assert_same_document_array, assert_same_document_id_array, assert_same_model,
    assert_same_object_id, assert_same_object_id_array, AssertionError, AssertionResult,
    AssertionResultExt,
};
pub use fixtures::{DatabaseFixture, ExitHandler, ProcessExit};
