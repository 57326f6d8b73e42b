use std::sync::Arc;

use async_trait::async_trait;
use datalab_supervisor::Supervisor;
use regex::Regex;
use tracing::debug;

use crate::{HealthProbe, ProbeResult};

/// Options for configuring `LogPatternProbe`.
pub struct LogPatternProbeOptions {
    /// The supervisor providing access to service output.
    pub supervisor: Arc<dyn Supervisor>,

    /// The service whose output is inspected.
    pub service: String,

    /// Markers whose appearance signals readiness.
    pub markers: Vec<Regex>,

    /// How many trailing lines to inspect.
    pub tail: usize,
}

/// Readiness probe that scans the tail of a service's recent output for a
/// configured set of success markers.
pub struct LogPatternProbe {
    supervisor: Arc<dyn Supervisor>,
    service: String,
    markers: Vec<Regex>,
    tail: usize,
}

impl LogPatternProbe {
    /// Creates a new instance of `LogPatternProbe`.
    #[must_use]
    pub fn new(
        LogPatternProbeOptions {
            supervisor,
            service,
            markers,
            tail,
        }: LogPatternProbeOptions,
    ) -> Self {
        Self {
            supervisor,
            service,
            markers,
            tail,
        }
    }
}

#[async_trait]
impl HealthProbe for LogPatternProbe {
    fn describe(&self) -> String {
        format!("log markers of {}", self.service)
    }

    async fn check(&self) -> ProbeResult {
        debug!("scanning logs of {} for readiness markers", self.service);

        match self.supervisor.logs(&self.service, self.tail).await {
            Ok(tail) => {
                let found = tail
                    .lines
                    .iter()
                    .any(|line| self.markers.iter().any(|marker| marker.is_match(line)));

                if found {
                    ProbeResult::Ready
                } else {
                    ProbeResult::NotReady(format!(
                        "no readiness marker in last {} log lines",
                        self.tail
                    ))
                }
            }
            Err(e) => ProbeResult::Error(format!("log source unreachable: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use datalab_supervisor_mock::MockSupervisor;

    fn probe_for(supervisor: &MockSupervisor) -> LogPatternProbe {
        LogPatternProbe::new(LogPatternProbeOptions {
            supervisor: Arc::new(supervisor.clone()),
            service: "namenode".to_string(),
            markers: vec![Regex::new(r"NameNode RPC up at").unwrap()],
            tail: 50,
        })
    }

    #[tokio::test]
    async fn test_ready_when_marker_present() {
        let supervisor = MockSupervisor::new();
        supervisor.set_logs(
            "namenode",
            vec![
                "STARTUP_MSG: Starting NameNode".to_string(),
                "NameNode RPC up at: 0.0.0.0/0.0.0.0:9000".to_string(),
            ],
        );

        assert_eq!(probe_for(&supervisor).check().await, ProbeResult::Ready);
    }

    #[tokio::test]
    async fn test_not_ready_without_marker() {
        let supervisor = MockSupervisor::new();
        supervisor.set_logs(
            "namenode",
            vec!["STARTUP_MSG: Starting NameNode".to_string()],
        );

        assert!(matches!(
            probe_for(&supervisor).check().await,
            ProbeResult::NotReady(_)
        ));
    }

    #[tokio::test]
    async fn test_error_when_log_source_unreachable() {
        let supervisor = MockSupervisor::new();
        supervisor.set_unreachable(true);

        assert!(matches!(
            probe_for(&supervisor).check().await,
            ProbeResult::Error(_)
        ));
    }
}
