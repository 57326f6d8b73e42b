//! Scripted in-memory supervisor for orchestrator tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use datalab_supervisor::{Error, LogTail, ServiceStatus, Supervisor};

/// A recorded supervisor operation, in call order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SupervisorCall {
    /// `start` was invoked for the named service.
    Start(String),

    /// `stop` was invoked for the named service.
    Stop(String),

    /// `logs` was invoked for the named service.
    Logs(String),

    /// `status` was invoked for the named service.
    Status(String),
}

#[derive(Default)]
struct Inner {
    calls: Vec<SupervisorCall>,
    statuses: HashMap<String, ServiceStatus>,
    logs: HashMap<String, Vec<String>>,
    fail_start: HashMap<String, String>,
    unreachable: bool,
}

/// Scripted supervisor that records every call it receives.
#[derive(Clone, Default)]
pub struct MockSupervisor {
    inner: Arc<Mutex<Inner>>,
}

impl MockSupervisor {
    /// Creates a new mock supervisor with no scripted services.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the status reported for the named service.
    pub fn set_status(&self, service: &str, status: ServiceStatus) {
        self.inner
            .lock()
            .unwrap()
            .statuses
            .insert(service.to_string(), status);
    }

    /// Scripts the log lines returned for the named service.
    pub fn set_logs(&self, service: &str, lines: Vec<String>) {
        self.inner
            .lock()
            .unwrap()
            .logs
            .insert(service.to_string(), lines);
    }

    /// Scripts `start` to fail for the named service with the given reason.
    pub fn fail_start(&self, service: &str, reason: &str) {
        self.inner
            .lock()
            .unwrap()
            .fail_start
            .insert(service.to_string(), reason.to_string());
    }

    /// Makes every operation fail as if the supervisor backend were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unwrap().unreachable = unreachable;
    }

    /// Returns every call received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<SupervisorCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Returns the services passed to `start`, in call order.
    #[must_use]
    pub fn started(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SupervisorCall::Start(service) => Some(service),
                _ => None,
            })
            .collect()
    }

    /// Returns the services passed to `stop`, in call order.
    #[must_use]
    pub fn stopped(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SupervisorCall::Stop(service) => Some(service),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Supervisor for MockSupervisor {
    async fn start(&self, service: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(SupervisorCall::Start(service.to_string()));

        if inner.unreachable {
            return Err(Error::Unreachable("mock supervisor down".to_string()));
        }

        if let Some(reason) = inner.fail_start.get(service) {
            return Err(Error::CommandFailed("start", reason.clone()));
        }

        inner
            .statuses
            .insert(service.to_string(), ServiceStatus::Running);

        Ok(())
    }

    async fn stop(&self, service: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(SupervisorCall::Stop(service.to_string()));

        if inner.unreachable {
            return Err(Error::Unreachable("mock supervisor down".to_string()));
        }

        inner
            .statuses
            .insert(service.to_string(), ServiceStatus::Stopped);

        Ok(())
    }

    async fn logs(&self, service: &str, tail: usize) -> Result<LogTail, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(SupervisorCall::Logs(service.to_string()));

        if inner.unreachable {
            return Err(Error::Unreachable("mock supervisor down".to_string()));
        }

        let lines = inner.logs.get(service).cloned().unwrap_or_default();
        let skip = lines.len().saturating_sub(tail);

        Ok(LogTail {
            lines: lines.into_iter().skip(skip).collect(),
        })
    }

    async fn status(&self, service: &str) -> Result<ServiceStatus, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(SupervisorCall::Status(service.to_string()));

        if inner.unreachable {
            return Err(Error::Unreachable("mock supervisor down".to_string()));
        }

        Ok(inner
            .statuses
            .get(service)
            .copied()
            .unwrap_or(ServiceStatus::Unknown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_flips_status_and_records_call() {
        let supervisor = MockSupervisor::new();

        assert_eq!(
            supervisor.status("namenode").await.unwrap(),
            ServiceStatus::Unknown
        );

        supervisor.start("namenode").await.unwrap();

        assert_eq!(
            supervisor.status("namenode").await.unwrap(),
            ServiceStatus::Running
        );
        assert_eq!(supervisor.started(), vec!["namenode".to_string()]);
    }

    #[tokio::test]
    async fn test_scripted_start_failure() {
        let supervisor = MockSupervisor::new();
        supervisor.fail_start("namenode", "disk full");

        let result = supervisor.start("namenode").await;

        assert!(matches!(result, Err(Error::CommandFailed("start", _))));
        assert_eq!(
            supervisor.status("namenode").await.unwrap(),
            ServiceStatus::Unknown
        );
    }

    #[tokio::test]
    async fn test_logs_respects_tail() {
        let supervisor = MockSupervisor::new();
        supervisor.set_logs(
            "namenode",
            vec!["one".to_string(), "two".to_string(), "three".to_string()],
        );

        let tail = supervisor.logs("namenode", 2).await.unwrap();

        assert_eq!(tail.lines, vec!["two".to_string(), "three".to_string()]);
    }

    #[tokio::test]
    async fn test_unreachable_fails_every_operation() {
        let supervisor = MockSupervisor::new();
        supervisor.set_unreachable(true);

        assert!(matches!(
            supervisor.status("namenode").await,
            Err(Error::Unreachable(_))
        ));
        assert!(matches!(
            supervisor.start("namenode").await,
            Err(Error::Unreachable(_))
        ));
    }
}
