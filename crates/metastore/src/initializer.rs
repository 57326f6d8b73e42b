use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use datalab_retry::{retry, RetryPolicy};
use serde::Serialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::backup::BackupOutcome;
use crate::state::{SchemaState, SchemaStateStore};
use crate::statement::StatementRunner;
use crate::Error;

/// Capability to populate an empty metadata database with the catalog
/// schema.
///
/// From the orchestrator's view the tool's whole contract is "exit code
/// plus resulting schema state".
#[async_trait]
pub trait SchemaTool
where
    Self: Send + Sync + 'static,
{
    /// Runs the one-shot schema creation.
    async fn init_schema(&self) -> Result<(), Error>;
}

/// Options for configuring `Schematool`.
pub struct SchematoolOptions {
    /// Program to invoke.
    pub bin: String,

    /// Arguments placed before the tool's own flags. Running the tool
    /// inside a container is expressed here (`exec <container> <path>`).
    pub args: Vec<String>,

    /// Database flavor passed as `-dbType`.
    pub db_type: String,

    /// Timeout applied to the whole invocation.
    pub timeout: Duration,
}

/// Schema tool that invokes Hive's `schematool` as a one-shot process.
pub struct Schematool {
    bin: String,
    args: Vec<String>,
    db_type: String,
    timeout: Duration,
}

impl Schematool {
    /// Creates a new instance of `Schematool`.
    #[must_use]
    pub fn new(
        SchematoolOptions {
            bin,
            args,
            db_type,
            timeout,
        }: SchematoolOptions,
    ) -> Self {
        Self {
            bin,
            args,
            db_type,
            timeout,
        }
    }
}

#[async_trait]
impl SchemaTool for Schematool {
    async fn init_schema(&self) -> Result<(), Error> {
        info!("running schematool -initSchema");

        let output = timeout(
            self.timeout,
            Command::new(&self.bin)
                .args(&self.args)
                .arg("-dbType")
                .arg(&self.db_type)
                .arg("-initSchema")
                .output(),
        )
        .await
        .map_err(|_| Error::ToolFailed {
            status: -1,
            stderr: format!("no answer within {:?}", self.timeout),
        })?
        .map_err(|e| Error::Io("failed to spawn schematool", e))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();

            Err(Error::ToolFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: tail.into_iter().rev().collect::<Vec<_>>().join("\n"),
            })
        }
    }
}

/// States of the schema initialization state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitializerState {
    /// No inspection has happened yet.
    NotChecked,

    /// Inspection found a valid schema; terminal on the happy path.
    Valid,

    /// Inspection found an invalid schema; repair may begin.
    Invalid,

    /// The metadata database is being dropped and recreated.
    Recreating,

    /// The schema tool is populating the empty database.
    Initializing,

    /// Re-inspection confirmed a valid schema after repair; terminal.
    Reverified,

    /// The repair path failed; terminal.
    Failed,
}

impl InitializerState {
    const fn name(self) -> &'static str {
        match self {
            Self::NotChecked => "not_checked",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Recreating => "recreating",
            Self::Initializing => "initializing",
            Self::Reverified => "reverified",
            Self::Failed => "failed",
        }
    }
}

/// Options for configuring `SchemaInitializer`.
pub struct SchemaInitializerOptions {
    /// Runner for the administrative drop/create/grant statements.
    pub runner: Arc<dyn StatementRunner>,

    /// The read-only inspector used for checking and reverification.
    pub store: SchemaStateStore,

    /// The external schema-creation tool.
    pub tool: Arc<dyn SchemaTool>,

    /// Retry budget for the tool invocation, which may race the store
    /// accepting connections.
    pub tool_retry: RetryPolicy,

    /// Statements run right after the database is recreated, typically
    /// grants for the metadata service account.
    pub grants: Vec<String>,
}

/// Drives the catalog schema from any state to valid, destructively when
/// necessary and only ever behind a completed backup step.
///
/// Invoking the initializer when the schema is already valid is a pure
/// no-op, which is what makes the whole bootstrap safe to re-run.
pub struct SchemaInitializer {
    runner: Arc<dyn StatementRunner>,
    store: SchemaStateStore,
    tool: Arc<dyn SchemaTool>,
    tool_retry: RetryPolicy,
    grants: Vec<String>,
    state: InitializerState,
}

impl SchemaInitializer {
    /// Creates a new instance of `SchemaInitializer`.
    #[must_use]
    pub fn new(
        SchemaInitializerOptions {
            runner,
            store,
            tool,
            tool_retry,
            grants,
        }: SchemaInitializerOptions,
    ) -> Self {
        Self {
            runner,
            store,
            tool,
            tool_retry,
            grants,
            state: InitializerState::NotChecked,
        }
    }

    /// The machine's current state.
    #[must_use]
    pub const fn state(&self) -> InitializerState {
        self.state
    }

    /// Inspects the schema and settles into `Valid` or `Invalid`.
    ///
    /// # Errors
    ///
    /// Propagates inspection failures, including
    /// [`Error::StoreUnreachable`].
    pub async fn check(&mut self) -> Result<SchemaState, Error> {
        let schema = self.store.inspect().await?;

        self.state = if schema.is_valid() {
            InitializerState::Valid
        } else {
            InitializerState::Invalid
        };

        Ok(schema)
    }

    /// Treats a valid schema as invalid so the repair path may run anyway.
    /// Operator override behind a force flag; a no-op in any other state.
    pub fn force_invalid(&mut self) {
        if self.state == InitializerState::Valid {
            self.state = InitializerState::Invalid;
        }
    }

    /// Runs the destructive repair path: recreate, initialize, reverify.
    ///
    /// Requiring a [`BackupOutcome`] makes backup-before-destroy
    /// structural: only
    /// [`BackupManager::snapshot_if_non_empty`](crate::BackupManager::snapshot_if_non_empty)
    /// produces that value, so the drop cannot be reached without the
    /// backup step having completed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] unless the machine is in
    /// `Invalid`, [`Error::ToolExhausted`] or [`Error::ToolFailed`] when
    /// the tool never succeeds, and [`Error::StillInvalid`] when the tool
    /// reported success but reverification disagrees.
    pub async fn repair(&mut self, backup: &BackupOutcome) -> Result<SchemaState, Error> {
        if self.state != InitializerState::Invalid {
            return Err(Error::InvalidTransition(self.state.name()));
        }

        self.recreate(backup).await?;
        self.initialize().await?;
        self.reverify().await
    }

    async fn recreate(&mut self, backup: &BackupOutcome) -> Result<(), Error> {
        self.state = InitializerState::Recreating;

        let database = self.store.database().to_string();

        match backup.record() {
            Some(record) => info!(
                "recreating {} (snapshot at {})",
                database,
                record.path.display()
            ),
            None => info!("recreating {} (no prior data)", database),
        }

        let statements: Vec<String> = [
            format!("DROP DATABASE IF EXISTS `{database}`"),
            format!("CREATE DATABASE `{database}`"),
        ]
        .into_iter()
        .chain(self.grants.iter().cloned())
        .collect();

        for statement in statements {
            if let Err(e) = self.runner.run(&statement).await {
                self.state = InitializerState::Failed;
                return Err(e);
            }
        }

        Ok(())
    }

    async fn initialize(&mut self) -> Result<(), Error> {
        self.state = InitializerState::Initializing;

        let tool = self.tool.clone();
        let result = retry(&self.tool_retry, |attempt| {
            let tool = tool.clone();
            async move {
                if attempt > 1 {
                    warn!("schema tool attempt {}", attempt);
                }
                tool.init_schema().await
            }
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(exhausted) => {
                self.state = InitializerState::Failed;
                Err(Error::ToolExhausted {
                    attempts: exhausted.attempts,
                    last: Box::new(exhausted.last),
                })
            }
        }
    }

    async fn reverify(&mut self) -> Result<SchemaState, Error> {
        let schema = match self.store.inspect().await {
            Ok(schema) => schema,
            Err(e) => {
                self.state = InitializerState::Failed;
                return Err(e);
            }
        };

        if schema.is_valid() {
            info!(
                "schema reverified at version {}",
                schema.version.as_deref().unwrap_or("unknown")
            );
            self.state = InitializerState::Reverified;
            Ok(schema)
        } else {
            self.state = InitializerState::Failed;
            Err(Error::StillInvalid(schema.describe_invalid()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use crate::state::{SchemaStateStoreOptions, REQUIRED_TABLES};
    use crate::statement::StatementOutput;

    /// In-memory stand-in for the metadata store, answering the exact
    /// statements the inspector and initializer issue.
    #[derive(Default)]
    struct Sim {
        exists: bool,
        tables: BTreeSet<String>,
        version: Option<String>,
        statements: Vec<String>,
    }

    impl Sim {
        fn populated_partial() -> Self {
            Self {
                exists: true,
                tables: ["VERSION", "DBS", "TBLS", "COLUMNS_V2", "PARTITIONS"]
                    .into_iter()
                    .map(ToString::to_string)
                    .collect(),
                version: Some("3.1.0".to_string()),
                statements: Vec::new(),
            }
        }

        fn fully_populated() -> Self {
            Self {
                exists: true,
                tables: REQUIRED_TABLES.iter().map(|t| (*t).to_string()).collect(),
                version: Some("3.1.0".to_string()),
                statements: Vec::new(),
            }
        }
    }

    #[derive(Clone, Default)]
    struct SimRunner {
        sim: Arc<Mutex<Sim>>,
    }

    #[async_trait]
    impl StatementRunner for SimRunner {
        async fn run(&self, statement: &str) -> Result<StatementOutput, Error> {
            let mut sim = self.sim.lock().unwrap();
            sim.statements.push(statement.to_string());

            let rows = if statement.starts_with("SHOW DATABASES LIKE") {
                if sim.exists {
                    vec!["metastore".to_string()]
                } else {
                    vec![]
                }
            } else if statement.starts_with("SHOW TABLES IN") {
                sim.tables.iter().cloned().collect()
            } else if statement.starts_with("SELECT COUNT(*)") {
                vec![if sim.version.is_some() { "1" } else { "0" }.to_string()]
            } else if statement.starts_with("SELECT SCHEMA_VERSION") {
                sim.version.iter().cloned().collect()
            } else if statement.starts_with("DROP DATABASE") {
                sim.exists = false;
                sim.tables.clear();
                sim.version = None;
                vec![]
            } else if statement.starts_with("CREATE DATABASE") {
                sim.exists = true;
                vec![]
            } else if statement.starts_with("GRANT") {
                vec![]
            } else {
                return Err(Error::Statement(format!(
                    "unexpected statement: {statement}"
                )));
            };

            Ok(StatementOutput { rows })
        }
    }

    impl SimRunner {
        fn destructive_statements(&self) -> Vec<String> {
            self.sim
                .lock()
                .unwrap()
                .statements
                .iter()
                .filter(|s| s.starts_with("DROP") || s.starts_with("CREATE"))
                .cloned()
                .collect()
        }
    }

    /// Tool that populates the sim the way a successful run would.
    struct SimTool {
        sim: Arc<Mutex<Sim>>,
    }

    #[async_trait]
    impl SchemaTool for SimTool {
        async fn init_schema(&self) -> Result<(), Error> {
            let mut sim = self.sim.lock().unwrap();
            sim.tables = REQUIRED_TABLES.iter().map(|t| (*t).to_string()).collect();
            sim.version = Some("3.1.0".to_string());
            Ok(())
        }
    }

    /// Tool that always exits non-zero.
    struct BrokenTool;

    #[async_trait]
    impl SchemaTool for BrokenTool {
        async fn init_schema(&self) -> Result<(), Error> {
            Err(Error::ToolFailed {
                status: 1,
                stderr: "Failed to get schema version".to_string(),
            })
        }
    }

    /// Tool that exits zero without writing anything.
    struct VacuousTool;

    #[async_trait]
    impl SchemaTool for VacuousTool {
        async fn init_schema(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    fn initializer_over(runner: SimRunner, tool: Arc<dyn SchemaTool>) -> SchemaInitializer {
        let store = SchemaStateStore::new(SchemaStateStoreOptions {
            runner: Arc::new(runner.clone()),
            database: "metastore".to_string(),
        });

        SchemaInitializer::new(SchemaInitializerOptions {
            runner: Arc::new(runner),
            store,
            tool,
            tool_retry: RetryPolicy::fixed(2, Duration::from_millis(1)),
            grants: vec!["GRANT ALL PRIVILEGES ON `metastore`.* TO 'hive'@'%'".to_string()],
        })
    }

    #[tokio::test]
    async fn test_valid_schema_settles_without_destruction() {
        let runner = SimRunner {
            sim: Arc::new(Mutex::new(Sim::fully_populated())),
        };
        let sim = runner.sim.clone();
        let mut initializer = initializer_over(runner.clone(), Arc::new(SimTool { sim }));

        let schema = initializer.check().await.unwrap();

        assert!(schema.is_valid());
        assert_eq!(initializer.state(), InitializerState::Valid);
        assert!(runner.destructive_statements().is_empty());
    }

    #[tokio::test]
    async fn test_repair_refused_before_check() {
        let runner = SimRunner::default();
        let sim = runner.sim.clone();
        let mut initializer = initializer_over(runner, Arc::new(SimTool { sim }));

        assert!(matches!(
            initializer.repair(&BackupOutcome::NothingToBackup).await,
            Err(Error::InvalidTransition("not_checked"))
        ));
    }

    #[tokio::test]
    async fn test_repair_refused_when_already_valid() {
        let runner = SimRunner {
            sim: Arc::new(Mutex::new(Sim::fully_populated())),
        };
        let sim = runner.sim.clone();
        let mut initializer = initializer_over(runner, Arc::new(SimTool { sim }));

        initializer.check().await.unwrap();

        assert!(matches!(
            initializer.repair(&BackupOutcome::NothingToBackup).await,
            Err(Error::InvalidTransition("valid"))
        ));
    }

    #[tokio::test]
    async fn test_partial_schema_is_repaired_and_reverified() {
        let runner = SimRunner {
            sim: Arc::new(Mutex::new(Sim::populated_partial())),
        };
        let sim = runner.sim.clone();
        let mut initializer = initializer_over(runner.clone(), Arc::new(SimTool { sim }));

        let schema = initializer.check().await.unwrap();
        assert!(!schema.is_valid());
        assert_eq!(initializer.state(), InitializerState::Invalid);

        let repaired = initializer
            .repair(&BackupOutcome::NothingToBackup)
            .await
            .unwrap();

        assert!(repaired.is_valid());
        assert_eq!(initializer.state(), InitializerState::Reverified);
        assert_eq!(
            runner.destructive_statements(),
            vec![
                "DROP DATABASE IF EXISTS `metastore`".to_string(),
                "CREATE DATABASE `metastore`".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_tool_exhausts_and_fails() {
        let runner = SimRunner {
            sim: Arc::new(Mutex::new(Sim::populated_partial())),
        };
        let mut initializer = initializer_over(runner, Arc::new(BrokenTool));

        initializer.check().await.unwrap();
        let result = initializer.repair(&BackupOutcome::NothingToBackup).await;

        match result {
            Err(Error::ToolExhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, Error::ToolFailed { status: 1, .. }));
            }
            other => panic!("expected ToolExhausted, got {other:?}"),
        }
        assert_eq!(initializer.state(), InitializerState::Failed);
    }

    #[tokio::test]
    async fn test_vacuous_tool_success_is_still_invalid() {
        let runner = SimRunner {
            sim: Arc::new(Mutex::new(Sim::populated_partial())),
        };
        let mut initializer = initializer_over(runner, Arc::new(VacuousTool));

        initializer.check().await.unwrap();
        let result = initializer.repair(&BackupOutcome::NothingToBackup).await;

        assert!(matches!(result, Err(Error::StillInvalid(_))));
        assert_eq!(initializer.state(), InitializerState::Failed);
    }
}
