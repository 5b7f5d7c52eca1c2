use ambar::ValidationError;
use thiserror::Error;

/// Errors returned by ref operations and [`dosync`](crate::dosync).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StmError {
    /// A validator rejected a value the transaction tried to install.
    /// Nothing was committed.
    #[error("transaction rejected: {0}")]
    Validation(#[from] ValidationError),
    /// A ref write operation was called outside of `dosync`.
    #[error("no transaction running")]
    NoTransaction,
    /// The attempt observed a concurrent commit and must be re-run.
    /// `dosync` handles this itself; it never reaches the caller.
    #[error("transaction conflict, retry required")]
    Conflict,
    /// The configured retry bound was exceeded.
    #[error("transaction gave up after {attempts} attempts")]
    Timeout {
        /// Attempts made, the first one included.
        attempts: u32,
    },
    /// `alter` or `set` was called on a ref already commuted in this transaction.
    #[error("can't alter or set a ref after commuting it in the same transaction")]
    AlterAfterCommute,
    /// The transaction body gave up on its own.
    #[error("transaction aborted: {0}")]
    Aborted(String),
}
