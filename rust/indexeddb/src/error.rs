//! The DOMException-equivalent error taxonomy client code actually matches
//! against.

use idb_codec::key::KeyError;
use idb_codec::value::ValueError;
use idb_storage::BackendError;
use thiserror::Error;

/// Every way a request against this engine can fail.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IdbError {
    /// A key, key range, or stored value is malformed or inadmissible.
    #[error("data error: {0}")]
    Data(String),

    /// A uniqueness or key-generator constraint was violated.
    #[error("constraint error: {0}")]
    Constraint(String),

    /// A named database, store, or index does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation is not valid given the current state of the object
    /// (e.g. creating a store outside a version-change transaction).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The transaction this request was issued against is no longer active.
    #[error("transaction is not active")]
    TransactionInactive,

    /// A mutating operation was attempted on a read-only transaction.
    #[error("transaction is read-only")]
    ReadOnly,

    /// The operation's parameters are not valid in this context.
    #[error("invalid access: {0}")]
    InvalidAccess(String),

    /// A requested database version is not reachable from its current one.
    #[error("version error: {0}")]
    Version(String),

    /// The transaction was aborted; this request's effects are undone.
    #[error("the transaction was aborted")]
    Abort,

    /// A value was not of the type an operation requires.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
}

impl From<BackendError> for IdbError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Constraint(msg) => IdbError::Constraint(msg),
            BackendError::NotFound(msg) => IdbError::NotFound(msg),
            BackendError::GeneratorExhausted => {
                IdbError::Constraint("key generator exhausted".into())
            }
            BackendError::Io(msg) => IdbError::InvalidState(msg),
            BackendError::Corrupt(msg) => IdbError::InvalidState(msg),
        }
    }
}

impl From<KeyError> for IdbError {
    fn from(KeyError::DataError(msg): KeyError) -> Self {
        IdbError::Data(msg)
    }
}

impl From<ValueError> for IdbError {
    fn from(err: ValueError) -> Self {
        match err {
            ValueError::Malformed(msg) => IdbError::Data(msg),
        }
    }
}
