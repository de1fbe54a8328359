use thiserror::Error;

/// The common error type produced by a [`crate::Backend`] or [`crate::BackendTx`].
///
/// The engine crate maps these onto the full named-condition error taxonomy
/// (`DataError`, `ConstraintError`, ...); backends only need to distinguish
/// the handful of conditions that change control flow.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// A uniqueness constraint (store key, index key, auto-increment
    /// exhaustion, duplicate store/index name) was violated.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// The named store or index does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The auto-increment counter for a store has reached 2^53.
    #[error("auto-increment counter exhausted")]
    GeneratorExhausted,

    /// Underlying I/O (file system, SQLite) failure.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// Persisted data is internally inconsistent (corrupt metadata,
    /// unexpected column shape, etc).
    #[error("corrupt storage state: {0}")]
    Corrupt(String),
}
