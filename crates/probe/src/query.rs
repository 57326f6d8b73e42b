use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::{HealthProbe, ProbeResult};

/// Failure modes of a functional readiness query.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum QueryFailure {
    /// The service rejected or could not answer the query.
    Unanswered(String),

    /// The query could not be issued at all.
    Unissuable(String),
}

impl fmt::Display for QueryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unanswered(reason) => write!(f, "query unanswered: {reason}"),
            Self::Unissuable(cause) => write!(f, "query unissuable: {cause}"),
        }
    }
}

/// Capability to run a trivial read-only command against a service's own
/// protocol.
#[async_trait]
pub trait QueryRunner
where
    Self: Send + Sync + 'static,
{
    /// Runs the query and returns its raw output.
    async fn run_query(&self, query: &str) -> Result<String, QueryFailure>;
}

/// Readiness probe that issues a functional query against the service's own
/// protocol and classifies the response rather than mere connectivity.
///
/// Preferred over TCP and log-marker probes whenever the service speaks a
/// query protocol, since such services may accept sockets long before they
/// can answer.
pub struct QueryProbe {
    runner: Arc<dyn QueryRunner>,
    query: String,
    target: String,
}

impl QueryProbe {
    /// Creates a new probe issuing `query` against `target` via the runner.
    #[must_use]
    pub fn new(runner: Arc<dyn QueryRunner>, query: String, target: String) -> Self {
        Self {
            runner,
            query,
            target,
        }
    }
}

#[async_trait]
impl HealthProbe for QueryProbe {
    fn describe(&self) -> String {
        format!("query against {}", self.target)
    }

    async fn check(&self) -> ProbeResult {
        debug!("issuing readiness query against {}", self.target);

        match self.runner.run_query(&self.query).await {
            Ok(_) => ProbeResult::Ready,
            Err(QueryFailure::Unanswered(reason)) => ProbeResult::NotReady(reason),
            Err(QueryFailure::Unissuable(cause)) => ProbeResult::Error(cause),
        }
    }
}

/// Options for configuring `CommandQuery`.
pub struct CommandQueryOptions {
    /// The client binary to invoke.
    pub bin: String,

    /// Arguments placed before the query (connection parameters).
    pub args: Vec<String>,

    /// Timeout applied to every invocation.
    pub timeout: Duration,
}

/// Query runner that shells out to a client binary, passing the query via
/// the conventional `-e` flag.
pub struct CommandQuery {
    bin: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandQuery {
    /// Creates a new instance of `CommandQuery`.
    #[must_use]
    pub fn new(
        CommandQueryOptions { bin, args, timeout }: CommandQueryOptions,
    ) -> Self {
        Self { bin, args, timeout }
    }
}

#[async_trait]
impl QueryRunner for CommandQuery {
    async fn run_query(&self, query: &str) -> Result<String, QueryFailure> {
        let invocation = timeout(
            self.timeout,
            Command::new(&self.bin)
                .args(&self.args)
                .arg("-e")
                .arg(query)
                .output(),
        )
        .await;

        match invocation {
            Ok(Ok(output)) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(Ok(output)) => Err(QueryFailure::Unanswered(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
            Ok(Err(e)) => Err(QueryFailure::Unissuable(format!(
                "failed to spawn {}: {}",
                self.bin, e
            ))),
            Err(_) => Err(QueryFailure::Unanswered(format!(
                "no answer within {:?}",
                self.timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedRunner(Result<String, QueryFailure>);

    #[async_trait]
    impl QueryRunner for ScriptedRunner {
        async fn run_query(&self, _query: &str) -> Result<String, QueryFailure> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_answered_query_is_ready() {
        let probe = QueryProbe::new(
            Arc::new(ScriptedRunner(Ok("default".to_string()))),
            "SHOW DATABASES".to_string(),
            "hiveserver2".to_string(),
        );

        assert_eq!(probe.check().await, ProbeResult::Ready);
    }

    #[tokio::test]
    async fn test_unanswered_query_is_not_ready() {
        let probe = QueryProbe::new(
            Arc::new(ScriptedRunner(Err(QueryFailure::Unanswered(
                "connection refused".to_string(),
            )))),
            "SHOW DATABASES".to_string(),
            "hiveserver2".to_string(),
        );

        assert_eq!(
            probe.check().await,
            ProbeResult::NotReady("connection refused".to_string())
        );
    }

    #[tokio::test]
    async fn test_unissuable_query_is_an_error() {
        let probe = QueryProbe::new(
            Arc::new(ScriptedRunner(Err(QueryFailure::Unissuable(
                "no such binary".to_string(),
            )))),
            "SHOW DATABASES".to_string(),
            "hiveserver2".to_string(),
        );

        assert_eq!(
            probe.check().await,
            ProbeResult::Error("no such binary".to_string())
        );
    }

    #[tokio::test]
    async fn test_command_query_reports_missing_binary_as_unissuable() {
        let runner = CommandQuery::new(CommandQueryOptions {
            bin: "/nonexistent/definitely-not-a-binary".to_string(),
            args: vec![],
            timeout: Duration::from_secs(1),
        });

        assert!(matches!(
            runner.run_query("SELECT 1").await,
            Err(QueryFailure::Unissuable(_))
        ));
    }
}
