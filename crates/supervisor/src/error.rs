use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A supervisor command exited with a failure status.
    #[error("{0}: {1}")]
    CommandFailed(&'static str, String),

    /// IO operation failed.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] std::io::Error),

    /// The named service is not known to the supervisor.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The supervisor backend itself could not be reached.
    #[error("supervisor unreachable: {0}")]
    Unreachable(String),
}
