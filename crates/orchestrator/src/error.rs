use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Classified kind of a stage failure, as recorded in the status report.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A required tool or path is absent.
    PrerequisiteMissing,

    /// A dependency never became ready within its retry budget.
    DependencyUnready,

    /// The persisted schema failed validation.
    SchemaInvalid,

    /// The repair path itself failed.
    SchemaRepairFailed,

    /// The overall run deadline expired.
    Timeout,
}

/// Errors that can occur in this crate.
///
/// Stages return these as typed results; the orchestrator alone decides
/// whether a given failure is retryable, escalatable, or run-ending.
#[derive(Debug, Error)]
pub enum Error {
    /// A dependency never became ready within its retry budget. Retryable
    /// inside the budget, fatal once exhausted.
    #[error("dependency {name} unready: {reason}")]
    DependencyUnready {
        /// The service that never became ready.
        name: String,

        /// Why the final attempt failed.
        reason: String,
    },

    /// A required tool or path is absent. Fatal, never retried.
    #[error("prerequisite missing: {0}")]
    PrerequisiteMissing(String),

    /// The persisted schema failed validation.
    #[error("schema invalid: {0}")]
    SchemaInvalid(String),

    /// The repair path itself failed. Never silently retried because it
    /// may indicate an unsafe half-applied state.
    #[error("schema repair failed: {0}")]
    SchemaRepairFailed(#[source] datalab_metastore::Error),

    /// The overall run deadline expired. Distinguished from
    /// [`Error::DependencyUnready`] exhaustion so operators can tell
    /// "slow" from "genuinely broken".
    #[error("run deadline of {0:?} expired")]
    Timeout(Duration),
}

impl Error {
    /// The classified kind for reporting.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::DependencyUnready { .. } => ErrorKind::DependencyUnready,
            Self::PrerequisiteMissing(_) => ErrorKind::PrerequisiteMissing,
            Self::SchemaInvalid(_) => ErrorKind::SchemaInvalid,
            Self::SchemaRepairFailed(_) => ErrorKind::SchemaRepairFailed,
            Self::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// The service this failure names, when it names one.
    #[must_use]
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::DependencyUnready { name, .. } => Some(name),
            _ => None,
        }
    }
}
