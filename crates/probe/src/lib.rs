//! Readiness probes for the services of the analytics cluster.
//!
//! Three probe flavors cover the heterogeneous readiness signals the cluster
//! exposes: TCP connects for infrastructure nodes, log-marker scans for
//! services that announce readiness on their output, and functional queries
//! for services whose sockets open before they are logically ready. Probes
//! are side-effect-free and always complete within a bounded timeout.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod log_pattern;
mod query;
mod tcp;

pub use log_pattern::{LogPatternProbe, LogPatternProbeOptions};
pub use query::{CommandQuery, CommandQueryOptions, QueryFailure, QueryProbe, QueryRunner};
pub use tcp::TcpProbe;

use async_trait::async_trait;

/// Outcome of a single readiness check.
///
/// Never partially valid: a probe either confirms full readiness of its one
/// target or it does not.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProbeResult {
    /// The target answered its designated readiness signal.
    Ready,

    /// The target did not answer its readiness signal yet.
    NotReady(String),

    /// The check itself could not be performed.
    Error(String),
}

impl ProbeResult {
    /// Returns whether the target is ready.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// The reason or cause when the target is not ready.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Ready => None,
            Self::NotReady(reason) | Self::Error(reason) => Some(reason),
        }
    }
}

/// A single readiness check for one dependency.
#[async_trait]
pub trait HealthProbe
where
    Self: Send + Sync + 'static,
{
    /// Human-readable description of the probe target.
    fn describe(&self) -> String;

    /// Performs one side-effect-free readiness check.
    async fn check(&self) -> ProbeResult;
}
