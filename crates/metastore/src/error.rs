use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Writing the pre-destroy snapshot failed.
    #[error("backup failed: {0}")]
    Backup(String),

    /// The initializer was driven through a transition its current state
    /// does not allow.
    #[error("invalid initializer transition from {0}")]
    InvalidTransition(&'static str),

    /// IO operation failed.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] std::io::Error),

    /// A statement was rejected by the metadata store.
    #[error("statement failed: {0}")]
    Statement(String),

    /// The schema remained invalid after the tool reported success. Usually
    /// a version mismatch the operator must resolve by hand.
    #[error("schema still invalid after initialization: {0}")]
    StillInvalid(String),

    /// The metadata store could not be reached at all. Distinct from a
    /// reachable store with no schema.
    #[error("metadata store unreachable: {0}")]
    StoreUnreachable(String),

    /// The schema tool never succeeded within its retry budget.
    #[error("schema tool gave up after {attempts} attempts: {last}")]
    ToolExhausted {
        /// Attempts made before giving up.
        attempts: u32,

        /// The failure from the final attempt.
        #[source]
        last: Box<Error>,
    },

    /// The schema tool exited with a failure status.
    #[error("schema tool exited with status {status}: {stderr}")]
    ToolFailed {
        /// Exit status reported by the tool.
        status: i32,

        /// Captured stderr tail.
        stderr: String,
    },
}
