//! Abstract interface for the container supervisor driving cluster services.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use async_trait::async_trait;
use serde::Serialize;

/// Runtime state of a supervised service.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// The service process is up.
    Running,

    /// The service exists but is not running.
    Stopped,

    /// The supervisor does not know the service.
    Unknown,
}

/// Tail of a service's recent output, oldest line first.
#[derive(Clone, Debug, Default)]
pub struct LogTail {
    /// The captured lines.
    pub lines: Vec<String>,
}

impl LogTail {
    /// Returns whether any captured line contains the given needle.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|line| line.contains(needle))
    }
}

/// Trait for container/process supervisors.
///
/// The orchestrator drives every service through these four operations and
/// never inspects process internals beyond them.
#[async_trait]
pub trait Supervisor
where
    Self: Send + Sync + 'static,
{
    /// Starts the named service.
    async fn start(&self, service: &str) -> Result<(), Error>;

    /// Stops the named service.
    async fn stop(&self, service: &str) -> Result<(), Error>;

    /// Fetches the most recent `tail` lines of the named service's output.
    async fn logs(&self, service: &str, tail: usize) -> Result<LogTail, Error>;

    /// Reports the current status of the named service.
    async fn status(&self, service: &str) -> Result<ServiceStatus, Error>;
}
