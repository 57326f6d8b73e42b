use std::fmt::Write as _;
use std::path::Path;

use chrono::{DateTime, Utc};
use datalab_metastore::BackupRecord;
use datalab_supervisor::ServiceStatus;
use serde::Serialize;
use url::Url;

use crate::error::{Error, ErrorKind};

/// A unit of work the orchestrator sequences. The first seven are the
/// fixed stages of a full run; the rest back the standalone subcommands.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Static environment checks.
    CheckPrerequisites,

    /// Best-effort stop of the query layer so schema repair cannot race
    /// live traffic.
    StopDependents,

    /// Start and await the stateful foundation services.
    EnsureBaseServices,

    /// Inspect the schema and repair it when invalid or forced.
    VerifyOrRepairSchema,

    /// Start the remaining services in dependency order.
    StartRemainingServices,

    /// Final functional probe pass across every service.
    HealthCheckAll,

    /// Assemble the status report.
    EmitReport,

    /// Inspect the schema without repairing it (`check` subcommand).
    VerifySchema,

    /// Snapshot the metadata database on demand (`backup` subcommand).
    Snapshot,

    /// Stop every service in reverse dependency order (`stop` subcommand).
    StopAll,
}

impl Stage {
    /// Human-readable stage name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CheckPrerequisites => "check-prerequisites",
            Self::StopDependents => "stop-dependents",
            Self::EnsureBaseServices => "ensure-base-services",
            Self::VerifyOrRepairSchema => "verify-or-repair-schema",
            Self::StartRemainingServices => "start-remaining-services",
            Self::HealthCheckAll => "health-check-all",
            Self::EmitReport => "emit-report",
            Self::VerifySchema => "verify-schema",
            Self::Snapshot => "snapshot",
            Self::StopAll => "stop-all",
        }
    }
}

/// How one stage ended.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum StageOutcome {
    /// The stage ran to completion.
    Completed,

    /// The stage failed after exhausting whatever retries it had.
    Failed {
        /// Classified failure kind.
        kind: ErrorKind,

        /// Failure detail.
        detail: String,
    },

    /// An earlier failure meant the stage never ran.
    Skipped,
}

/// Record of one executed (or skipped) stage.
#[derive(Clone, Debug, Serialize)]
pub struct StageResult {
    /// The stage this records.
    pub stage: Stage,

    /// How the stage ended.
    pub outcome: StageOutcome,

    /// When the stage began.
    pub started_at: DateTime<Utc>,

    /// When the stage ended.
    pub finished_at: DateTime<Utc>,

    /// Actions recorded instead of executed in dry-run mode.
    pub planned: Vec<String>,
}

/// Overall outcome of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Every stage completed.
    Success,

    /// A stage failed; later stages were skipped but the run ended in an
    /// orderly report.
    PartialFailure,

    /// The run ended on a hard stop.
    Fatal,
}

/// Snapshot of one service for the report.
#[derive(Clone, Debug, Serialize)]
pub struct ServiceReport {
    /// Service name.
    pub name: String,

    /// Supervisor-reported status.
    pub status: ServiceStatus,

    /// Result of the final readiness probe, when one ran.
    pub ready: Option<bool>,

    /// Client-facing endpoint, when the service exposes one.
    pub endpoint: Option<Url>,
}

/// Mutable record of a run in progress. Created fresh for every
/// invocation, appended to as stages complete, and finalized into a
/// [`StatusReport`]; never persisted across runs.
pub struct OrchestrationRun {
    started_at: DateTime<Utc>,
    dry_run: bool,
    stages: Vec<StageResult>,
}

impl OrchestrationRun {
    /// Begins a fresh run.
    #[must_use]
    pub fn new(dry_run: bool) -> Self {
        Self {
            started_at: Utc::now(),
            dry_run,
            stages: Vec::new(),
        }
    }

    /// Appends a completed stage record.
    pub fn push(&mut self, result: StageResult) {
        self.stages.push(result);
    }

    /// Stage results so far.
    #[must_use]
    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    /// Finalizes the run into the report handed to the caller.
    #[must_use]
    pub fn finalize(
        self,
        services: Vec<ServiceReport>,
        schema_version: Option<String>,
        backup: Option<BackupRecord>,
        failure: Option<(Stage, Error)>,
        remediation: Option<String>,
    ) -> StatusReport {
        let outcome = match &failure {
            None => Outcome::Success,
            Some((_, error)) => match error.kind() {
                ErrorKind::SchemaInvalid => Outcome::PartialFailure,
                _ => Outcome::Fatal,
            },
        };

        let (failed_stage, failed_service, error_kind, error_detail) = match &failure {
            None => (None, None, None, None),
            Some((stage, error)) => (
                Some(*stage),
                error.service().map(ToString::to_string),
                Some(error.kind()),
                Some(error.to_string()),
            ),
        };

        StatusReport {
            outcome,
            dry_run: self.dry_run,
            started_at: self.started_at,
            finished_at: Utc::now(),
            stages: self.stages,
            services,
            schema_version,
            backup,
            failed_stage,
            failed_service,
            error_kind,
            error_detail,
            remediation,
        }
    }
}

/// Structured record of what a run did.
///
/// Always produced, even on fatal outcomes; a silent non-zero exit with no
/// report is treated as an orchestrator bug.
#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    /// Overall outcome.
    pub outcome: Outcome,

    /// Whether the run was a dry run.
    pub dry_run: bool,

    /// When the run began.
    pub started_at: DateTime<Utc>,

    /// When the run ended.
    pub finished_at: DateTime<Utc>,

    /// Per-stage results in execution order.
    pub stages: Vec<StageResult>,

    /// Per-service snapshot at the end of the run.
    pub services: Vec<ServiceReport>,

    /// Schema version, when one was observed.
    pub schema_version: Option<String>,

    /// The pre-destroy snapshot, when one was written.
    pub backup: Option<BackupRecord>,

    /// The stage that failed, when one did.
    pub failed_stage: Option<Stage>,

    /// The service named by the failure, when it names one.
    pub failed_service: Option<String>,

    /// Classified failure kind, when a stage failed.
    pub error_kind: Option<ErrorKind>,

    /// Failure detail, when a stage failed.
    pub error_detail: Option<String>,

    /// Concrete command the operator should run next, when one applies.
    pub remediation: Option<String>,
}

impl StatusReport {
    /// The process exit code for this report.
    ///
    /// `0` success or already valid, `1` generic failure, `2` dependency
    /// unreachable, `3` schema verification failed, `4` timeout.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        if matches!(self.outcome, Outcome::Success) {
            return 0;
        }

        match self.error_kind {
            Some(ErrorKind::Timeout) => 4,
            Some(ErrorKind::SchemaInvalid | ErrorKind::SchemaRepairFailed) => 3,
            Some(ErrorKind::DependencyUnready) => 2,
            _ => 1,
        }
    }

    /// Serializes the report as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Writes the JSON form of the report to the given path.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization or the write fails.
    pub async fn write_json(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = self.to_json().map_err(std::io::Error::other)?;

        tokio::fs::write(path, json).await
    }

    /// Renders the human-readable summary.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();

        let mode = if self.dry_run { " (dry run)" } else { "" };
        let _ = writeln!(out, "outcome: {:?}{}", self.outcome, mode);
        let _ = writeln!(out, "started:  {}", self.started_at.to_rfc3339());
        let _ = writeln!(out, "finished: {}", self.finished_at.to_rfc3339());

        let _ = writeln!(out, "\nstages:");
        for stage in &self.stages {
            let status = match &stage.outcome {
                StageOutcome::Completed => "completed".to_string(),
                StageOutcome::Failed { kind, detail } => {
                    format!("failed ({kind:?}): {detail}")
                }
                StageOutcome::Skipped => "skipped".to_string(),
            };
            let _ = writeln!(out, "  {:<26} {}", stage.stage.name(), status);

            for action in &stage.planned {
                let _ = writeln!(out, "    planned: {action}");
            }
        }

        if !self.services.is_empty() {
            let _ = writeln!(out, "\nservices:");
            for service in &self.services {
                let ready = match service.ready {
                    Some(true) => "ready",
                    Some(false) => "not ready",
                    None => "-",
                };
                let endpoint = service
                    .endpoint
                    .as_ref()
                    .map_or(String::new(), ToString::to_string);
                let _ = writeln!(
                    out,
                    "  {:<18} {:<8?} {:<10} {}",
                    service.name, service.status, ready, endpoint
                );
            }
        }

        if let Some(version) = &self.schema_version {
            let _ = writeln!(out, "\nschema version: {version}");
        }

        if let Some(backup) = &self.backup {
            let _ = writeln!(
                out,
                "backup: {} ({} bytes)",
                backup.path.display(),
                backup.size_bytes
            );
        }

        if let Some(detail) = &self.error_detail {
            let _ = writeln!(out, "\nerror: {detail}");
        }

        if let Some(remediation) = &self.remediation {
            let _ = writeln!(out, "remediation: {remediation}");
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_with(outcome: Outcome, kind: Option<ErrorKind>) -> StatusReport {
        let now = Utc::now();

        StatusReport {
            outcome,
            dry_run: false,
            started_at: now,
            finished_at: now,
            stages: Vec::new(),
            services: Vec::new(),
            schema_version: None,
            backup: None,
            failed_stage: None,
            failed_service: None,
            error_kind: kind,
            error_detail: kind.map(|k| format!("{k:?}")),
            remediation: None,
        }
    }

    #[test]
    fn test_exit_codes_follow_the_contract() {
        assert_eq!(report_with(Outcome::Success, None).exit_code(), 0);
        assert_eq!(
            report_with(Outcome::Fatal, Some(ErrorKind::PrerequisiteMissing)).exit_code(),
            1
        );
        assert_eq!(
            report_with(Outcome::Fatal, Some(ErrorKind::DependencyUnready)).exit_code(),
            2
        );
        assert_eq!(
            report_with(Outcome::PartialFailure, Some(ErrorKind::SchemaInvalid)).exit_code(),
            3
        );
        assert_eq!(
            report_with(Outcome::Fatal, Some(ErrorKind::SchemaRepairFailed)).exit_code(),
            3
        );
        assert_eq!(
            report_with(Outcome::Fatal, Some(ErrorKind::Timeout)).exit_code(),
            4
        );
    }

    #[test]
    fn test_render_lists_failure_and_remediation() {
        let mut report = report_with(Outcome::Fatal, Some(ErrorKind::DependencyUnready));
        report.error_detail = Some("dependency metastore-db unready".to_string());
        report.remediation = Some("re-run `datalab run`".to_string());

        let rendered = report.render();

        assert!(rendered.contains("outcome: Fatal"));
        assert!(rendered.contains("dependency metastore-db unready"));
        assert!(rendered.contains("re-run `datalab run`"));
    }
}
