//! Top-level control loop bootstrapping the analytics cluster.
//!
//! Sequences the fixed bootstrap stages over the service graph, branches
//! into the backup/repair path when the catalog schema is invalid, and
//! always finishes by emitting a structured status report. Stages return
//! typed errors; this crate alone decides which failures are retryable,
//! escalatable, or run-ending.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod report;

pub use error::{Error, ErrorKind};
pub use report::{
    OrchestrationRun, Outcome, ServiceReport, Stage, StageOutcome, StageResult, StatusReport,
};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use datalab_graph::{ServiceGraph, ServiceNode, ServiceTier};
use datalab_metastore::{
    BackupManager, BackupRecord, SchemaInitializer, SchemaInitializerOptions, SchemaStateStore,
    SchemaTool, StatementRunner,
};
use datalab_probe::ProbeResult;
use datalab_retry::{retry, RetryPolicy};
use datalab_supervisor::{ServiceStatus, Supervisor};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Options for configuring `Orchestrator`.
pub struct OrchestratorOptions {
    /// The static dependency graph of cluster services.
    pub graph: ServiceGraph,

    /// The supervisor driving service lifecycle.
    pub supervisor: Arc<dyn Supervisor>,

    /// Read-only inspector of the catalog schema.
    pub state_store: SchemaStateStore,

    /// Snapshot producer for the pre-destroy backup.
    pub backup_manager: BackupManager,

    /// Runner for administrative drop/create/grant statements.
    pub admin_runner: Arc<dyn StatementRunner>,

    /// The external schema-creation tool.
    pub schema_tool: Arc<dyn SchemaTool>,

    /// Statements run after the metadata database is recreated.
    pub grants: Vec<String>,

    /// Retry budget for the schema tool invocation.
    pub tool_retry: RetryPolicy,

    /// Retry budget for schema inspection while the store warms up.
    pub inspect_retry: RetryPolicy,

    /// Interval between readiness probes of one service.
    pub probe_interval: Duration,

    /// Upper bound on concurrently probed services within one wave.
    pub max_concurrent_probes: usize,

    /// Binaries that must resolve before anything else runs.
    pub required_binaries: Vec<String>,

    /// Graph node backing the metadata store, named in failures.
    pub metastore_service: String,

    /// Bypass the idempotency skip and recreate a valid schema.
    pub force: bool,

    /// Record planned actions instead of performing mutations.
    pub dry_run: bool,

    /// Overall wall-clock deadline for a run.
    pub deadline: Option<Duration>,
}

#[derive(Default)]
struct RunState {
    schema_version: Option<String>,
    backup: Option<BackupRecord>,
    ready: HashMap<String, bool>,
    failure: Option<(Stage, Error)>,
}

/// Sequences cluster bootstrap stages and assembles the status report.
///
/// Assumes single-instance execution: no concurrent orchestrator runs
/// against the same cluster. This is a documented precondition, not an
/// enforced mutex.
pub struct Orchestrator {
    graph: ServiceGraph,
    supervisor: Arc<dyn Supervisor>,
    state_store: SchemaStateStore,
    backup_manager: BackupManager,
    admin_runner: Arc<dyn StatementRunner>,
    schema_tool: Arc<dyn SchemaTool>,
    grants: Vec<String>,
    tool_retry: RetryPolicy,
    inspect_retry: RetryPolicy,
    probe_interval: Duration,
    max_concurrent_probes: usize,
    required_binaries: Vec<String>,
    metastore_service: String,
    force: bool,
    dry_run: bool,
    deadline: Option<Duration>,
}

impl Orchestrator {
    /// Creates a new instance of `Orchestrator`.
    #[must_use]
    pub fn new(
        OrchestratorOptions {
            graph,
            supervisor,
            state_store,
            backup_manager,
            admin_runner,
            schema_tool,
            grants,
            tool_retry,
            inspect_retry,
            probe_interval,
            max_concurrent_probes,
            required_binaries,
            metastore_service,
            force,
            dry_run,
            deadline,
        }: OrchestratorOptions,
    ) -> Self {
        Self {
            graph,
            supervisor,
            state_store,
            backup_manager,
            admin_runner,
            schema_tool,
            grants,
            tool_retry,
            inspect_retry,
            probe_interval,
            max_concurrent_probes,
            required_binaries,
            metastore_service,
            force,
            dry_run,
            deadline,
        }
    }

    /// Runs every bootstrap stage.
    pub async fn run(&self) -> StatusReport {
        self.execute(&[
            Stage::CheckPrerequisites,
            Stage::StopDependents,
            Stage::EnsureBaseServices,
            Stage::VerifyOrRepairSchema,
            Stage::StartRemainingServices,
            Stage::HealthCheckAll,
            Stage::EmitReport,
        ])
        .await
    }

    /// Verifies prerequisites and the schema without repairing anything.
    pub async fn check(&self) -> StatusReport {
        self.execute(&[
            Stage::CheckPrerequisites,
            Stage::VerifySchema,
            Stage::EmitReport,
        ])
        .await
    }

    /// Snapshots the metadata database on demand.
    pub async fn backup(&self) -> StatusReport {
        self.execute(&[
            Stage::CheckPrerequisites,
            Stage::EnsureBaseServices,
            Stage::Snapshot,
            Stage::EmitReport,
        ])
        .await
    }

    /// Verifies the schema and repairs it when invalid or forced.
    pub async fn init_schema(&self) -> StatusReport {
        self.execute(&[
            Stage::CheckPrerequisites,
            Stage::StopDependents,
            Stage::EnsureBaseServices,
            Stage::VerifyOrRepairSchema,
            Stage::EmitReport,
        ])
        .await
    }

    /// Starts every service in dependency order without touching the
    /// schema.
    pub async fn start(&self) -> StatusReport {
        self.execute(&[
            Stage::CheckPrerequisites,
            Stage::EnsureBaseServices,
            Stage::StartRemainingServices,
            Stage::HealthCheckAll,
            Stage::EmitReport,
        ])
        .await
    }

    /// Stops every service in reverse dependency order, best effort.
    pub async fn stop(&self) -> StatusReport {
        self.execute(&[Stage::StopAll, Stage::EmitReport]).await
    }

    /// Reports current service health and schema state without mutating
    /// anything.
    pub async fn status(&self) -> StatusReport {
        self.execute(&[Stage::HealthCheckAll, Stage::VerifySchema, Stage::EmitReport])
            .await
    }

    async fn execute(&self, stages: &[Stage]) -> StatusReport {
        let mut run = OrchestrationRun::new(self.dry_run);
        let mut state = RunState::default();
        let deadline = self.deadline.map(|t| Instant::now() + t);

        for &stage in stages {
            if state.failure.is_some() && stage != Stage::EmitReport {
                let now = Utc::now();
                run.push(StageResult {
                    stage,
                    outcome: StageOutcome::Skipped,
                    started_at: now,
                    finished_at: now,
                    planned: Vec::new(),
                });
                continue;
            }

            info!("stage {}", stage.name());

            let started_at = Utc::now();
            let mut planned = Vec::new();
            let result = self
                .run_stage(stage, &mut state, &mut planned, deadline)
                .await;

            let outcome = match result {
                Ok(()) => StageOutcome::Completed,
                Err(e) => {
                    error!("stage {} failed: {}", stage.name(), e);

                    let outcome = StageOutcome::Failed {
                        kind: e.kind(),
                        detail: e.to_string(),
                    };
                    state.failure = Some((stage, e));
                    outcome
                }
            };

            run.push(StageResult {
                stage,
                outcome,
                started_at,
                finished_at: Utc::now(),
                planned,
            });
        }

        let services = self.service_reports(&state.ready).await;
        let remediation = state
            .failure
            .as_ref()
            .map(|(_, e)| self.remediation_for(e));

        run.finalize(
            services,
            state.schema_version.take(),
            state.backup.take(),
            state.failure.take(),
            remediation,
        )
    }

    async fn run_stage(
        &self,
        stage: Stage,
        state: &mut RunState,
        planned: &mut Vec<String>,
        deadline: Option<Instant>,
    ) -> Result<(), Error> {
        let fut = async {
            match stage {
                Stage::CheckPrerequisites => self.check_prerequisites(planned).await,
                Stage::StopDependents => self.stop_services(false, planned).await,
                Stage::StopAll => self.stop_services(true, planned).await,
                Stage::EnsureBaseServices => {
                    self.bring_up(|node| node.tier() == ServiceTier::Base, planned)
                        .await
                }
                Stage::VerifyOrRepairSchema => self.verify_or_repair(state, true, planned).await,
                Stage::VerifySchema => self.verify_or_repair(state, false, planned).await,
                Stage::StartRemainingServices => {
                    self.bring_up(|node| node.tier() == ServiceTier::Query, planned)
                        .await
                }
                Stage::HealthCheckAll => self.health_check_all(state).await,
                Stage::Snapshot => self.snapshot(state, planned).await,
                Stage::EmitReport => Ok(()),
            }
        };

        // In-flight work is dropped, not awaited, once the deadline passes.
        match deadline {
            Some(at) => tokio::time::timeout_at(at, fut)
                .await
                .unwrap_or_else(|_| Err(Error::Timeout(self.deadline.unwrap_or_default()))),
            None => fut.await,
        }
    }

    async fn check_prerequisites(&self, planned: &mut Vec<String>) -> Result<(), Error> {
        let missing: Vec<String> = self
            .required_binaries
            .iter()
            .filter(|bin| !binary_available(bin))
            .cloned()
            .collect();

        if !missing.is_empty() {
            return Err(Error::PrerequisiteMissing(format!(
                "required binaries not found: {}",
                missing.join(", ")
            )));
        }

        let backup_dir = self.backup_manager.backup_dir();

        if self.dry_run {
            planned.push(format!("create backup directory {}", backup_dir.display()));
        } else {
            tokio::fs::create_dir_all(backup_dir).await.map_err(|e| {
                Error::PrerequisiteMissing(format!(
                    "backup directory {} not writable: {e}",
                    backup_dir.display()
                ))
            })?;
        }

        Ok(())
    }

    async fn stop_services(&self, all: bool, planned: &mut Vec<String>) -> Result<(), Error> {
        for node in self.graph.reverse_order() {
            if !all && node.tier() != ServiceTier::Query {
                continue;
            }

            if self.dry_run {
                planned.push(format!("stop {}", node.name()));
                continue;
            }

            match self.supervisor.stop(node.name()).await {
                Ok(()) => info!("{} stopped", node.name()),
                Err(e) => warn!("best-effort stop of {} failed: {}", node.name(), e),
            }
        }

        Ok(())
    }

    async fn bring_up(
        &self,
        keep: impl Fn(&ServiceNode) -> bool,
        planned: &mut Vec<String>,
    ) -> Result<(), Error> {
        if self.dry_run {
            for wave in self.graph.waves_where(&keep) {
                for node in wave {
                    let status = self
                        .supervisor
                        .status(node.name())
                        .await
                        .unwrap_or(ServiceStatus::Unknown);

                    if status != ServiceStatus::Running {
                        planned.push(format!("start {}", node.name()));
                    }
                    planned.push(format!(
                        "await readiness of {} via {}",
                        node.name(),
                        node.probe().describe()
                    ));
                }
            }

            return Ok(());
        }

        for wave in self.graph.waves_where(&keep) {
            let semaphore = Arc::new(Semaphore::new(self.max_concurrent_probes));
            let mut tasks: JoinSet<Result<(), Error>> = JoinSet::new();

            for node in wave {
                let supervisor = self.supervisor.clone();
                let probe = node.probe();
                let name = node.name().to_string();
                let policy = self.probe_policy(node.max_wait());
                let semaphore = semaphore.clone();

                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();

                    supervisor.start(&name).await.map_err(|e| {
                        Error::DependencyUnready {
                            name: name.clone(),
                            reason: format!("start failed: {e}"),
                        }
                    })?;

                    info!("{} started, awaiting readiness", name);

                    retry(&policy, |_| {
                        let probe = probe.clone();
                        async move {
                            match probe.check().await {
                                ProbeResult::Ready => Ok(()),
                                ProbeResult::NotReady(reason) | ProbeResult::Error(reason) => {
                                    Err(reason)
                                }
                            }
                        }
                    })
                    .await
                    .map_err(|exhausted| Error::DependencyUnready {
                        name: name.clone(),
                        reason: format!(
                            "gave up after {} probes: {}",
                            exhausted.attempts, exhausted.last
                        ),
                    })?;

                    info!("{} ready", name);

                    Ok(())
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(e) => {
                        return Err(Error::DependencyUnready {
                            name: "probe worker".to_string(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    async fn verify_or_repair(
        &self,
        state: &mut RunState,
        repair_allowed: bool,
        planned: &mut Vec<String>,
    ) -> Result<(), Error> {
        let store = self.state_store.clone();
        let inspected = retry(&self.inspect_retry, |_| {
            let store = store.clone();
            async move { store.inspect().await }
        })
        .await;

        let schema = match inspected {
            Ok(schema) => schema,
            Err(exhausted) => {
                return Err(self.classify_metastore_error(exhausted.last));
            }
        };

        state.schema_version = schema.version.clone();

        if schema.is_valid() && !(self.force && repair_allowed) {
            info!(
                "schema already valid at version {}; nothing to do",
                schema.version.as_deref().unwrap_or("unknown")
            );
            return Ok(());
        }

        if !repair_allowed {
            return Err(Error::SchemaInvalid(schema.describe_invalid()));
        }

        let database = self.state_store.database();

        if self.dry_run {
            if schema.exists && !schema.present_tables.is_empty() {
                planned.push(format!(
                    "back up {} under {}",
                    database,
                    self.backup_manager.backup_dir().display()
                ));
            }
            planned.push(format!("drop and recreate {database}"));
            planned.push("run the schema tool".to_string());
            planned.push("reverify the schema".to_string());

            return Ok(());
        }

        let mut initializer = SchemaInitializer::new(SchemaInitializerOptions {
            runner: self.admin_runner.clone(),
            store: self.state_store.clone(),
            tool: self.schema_tool.clone(),
            tool_retry: self.tool_retry,
            grants: self.grants.clone(),
        });

        let checked = initializer
            .check()
            .await
            .map_err(|e| self.classify_metastore_error(e))?;

        if self.force {
            initializer.force_invalid();
        }

        let backup = self
            .backup_manager
            .snapshot_if_non_empty(&checked)
            .await
            .map_err(Error::SchemaRepairFailed)?;
        state.backup = backup.record().cloned();

        let repaired = initializer
            .repair(&backup)
            .await
            .map_err(Error::SchemaRepairFailed)?;

        info!(
            "schema repaired to version {}",
            repaired.version.as_deref().unwrap_or("unknown")
        );
        state.schema_version = repaired.version;

        Ok(())
    }

    async fn snapshot(
        &self,
        state: &mut RunState,
        planned: &mut Vec<String>,
    ) -> Result<(), Error> {
        let schema = self
            .state_store
            .inspect()
            .await
            .map_err(|e| self.classify_metastore_error(e))?;

        state.schema_version = schema.version.clone();

        if self.dry_run {
            if schema.exists && !schema.present_tables.is_empty() {
                planned.push(format!(
                    "back up {} under {}",
                    self.state_store.database(),
                    self.backup_manager.backup_dir().display()
                ));
            } else {
                planned.push("nothing to back up".to_string());
            }

            return Ok(());
        }

        let outcome = self
            .backup_manager
            .snapshot_if_non_empty(&schema)
            .await
            .map_err(Error::SchemaRepairFailed)?;
        state.backup = outcome.record().cloned();

        Ok(())
    }

    async fn health_check_all(&self, state: &mut RunState) -> Result<(), Error> {
        let mut first_unready: Option<(String, String)> = None;

        for node in self.graph.nodes() {
            let result = node.probe().check().await;
            state
                .ready
                .insert(node.name().to_string(), result.is_ready());

            if !result.is_ready() {
                let reason = result.reason().unwrap_or("unknown").to_string();
                warn!("{} not healthy: {}", node.name(), reason);

                if first_unready.is_none() {
                    first_unready = Some((node.name().to_string(), reason));
                }
            }
        }

        // A dry run only observes; services were never started.
        if self.dry_run {
            return Ok(());
        }

        match first_unready {
            None => Ok(()),
            Some((name, reason)) => Err(Error::DependencyUnready { name, reason }),
        }
    }

    async fn service_reports(&self, ready: &HashMap<String, bool>) -> Vec<ServiceReport> {
        let mut services = Vec::new();

        for node in self.graph.nodes() {
            let status = self
                .supervisor
                .status(node.name())
                .await
                .unwrap_or(ServiceStatus::Unknown);

            services.push(ServiceReport {
                name: node.name().to_string(),
                status,
                ready: ready.get(node.name()).copied(),
                endpoint: node.endpoint().cloned(),
            });
        }

        services
    }

    fn classify_metastore_error(&self, e: datalab_metastore::Error) -> Error {
        match e {
            datalab_metastore::Error::StoreUnreachable(reason) => Error::DependencyUnready {
                name: self.metastore_service.clone(),
                reason,
            },
            other => Error::SchemaRepairFailed(other),
        }
    }

    fn remediation_for(&self, error: &Error) -> String {
        match error {
            Error::DependencyUnready { name, .. } => {
                format!("inspect the service with `docker logs {name}`, then re-run `datalab run`")
            }
            Error::PrerequisiteMissing(_) => {
                "install the missing prerequisite and re-run `datalab run`".to_string()
            }
            Error::SchemaInvalid(_) => {
                "run `datalab init-schema` to repair the schema".to_string()
            }
            Error::SchemaRepairFailed(_) => format!(
                "inspect the snapshot under {} and re-run `datalab init-schema --force` once the cause is resolved",
                self.backup_manager.backup_dir().display()
            ),
            Error::Timeout(_) => "re-run with a larger --timeout".to_string(),
        }
    }

    fn probe_policy(&self, max_wait: Duration) -> RetryPolicy {
        let interval = self.probe_interval.max(Duration::from_millis(1));
        let attempts = max_wait.as_millis() / interval.as_millis();
        let attempts = u32::try_from(attempts.max(1)).unwrap_or(u32::MAX);

        RetryPolicy::fixed(attempts, interval)
    }
}

fn binary_available(bin: &str) -> bool {
    let path = Path::new(bin);

    if path.is_absolute() {
        return path.exists();
    }

    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| dir.join(bin).exists())
    })
}
