use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::info;

use crate::state::SchemaState;
use crate::Error;

/// Immutable record of a pre-destroy snapshot.
///
/// Written once, never auto-deleted; retention is an external concern.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BackupRecord {
    /// Timestamp namespace the snapshot was written under.
    pub timestamp_id: String,

    /// The system the snapshot was taken from.
    pub source_system: String,

    /// Where the dump was written.
    pub path: PathBuf,

    /// Size of the dump in bytes.
    pub size_bytes: u64,
}

/// Proof that the backup step ran before any destructive action.
///
/// [`SchemaInitializer::repair`](crate::SchemaInitializer::repair) requires
/// this value, so destruction without a completed backup step does not
/// compile into the call graph.
#[derive(Clone, Debug)]
pub enum BackupOutcome {
    /// A snapshot was written.
    Snapshotted(BackupRecord),

    /// Nothing existed worth snapshotting.
    NothingToBackup,
}

impl BackupOutcome {
    /// The record, when a snapshot was written.
    #[must_use]
    pub const fn record(&self) -> Option<&BackupRecord> {
        match self {
            Self::Snapshotted(record) => Some(record),
            Self::NothingToBackup => None,
        }
    }
}

/// Capability to produce a full logical dump of a database.
#[async_trait]
pub trait DumpTool
where
    Self: Send + Sync + 'static,
{
    /// Dumps the named database to `dest`, returning the bytes written.
    async fn dump(&self, database: &str, dest: &Path) -> Result<u64, Error>;
}

/// Options for configuring `MysqlDump`.
pub struct MysqlDumpOptions {
    /// Path to the mysqldump binary.
    pub bin: String,

    /// Host the metadata store listens on.
    pub host: String,

    /// Port the metadata store listens on.
    pub port: u16,

    /// Username for the administrative account.
    pub username: String,

    /// Password for the administrative account.
    pub password: String,

    /// Timeout applied to the dump.
    pub timeout: Duration,
}

/// Dump tool that shells out to `mysqldump`.
pub struct MysqlDump {
    bin: String,
    host: String,
    port: u16,
    username: String,
    password: String,
    timeout: Duration,
}

impl MysqlDump {
    /// Creates a new instance of `MysqlDump`.
    #[must_use]
    pub fn new(
        MysqlDumpOptions {
            bin,
            host,
            port,
            username,
            password,
            timeout,
        }: MysqlDumpOptions,
    ) -> Self {
        Self {
            bin,
            host,
            port,
            username,
            password,
            timeout,
        }
    }
}

#[async_trait]
impl DumpTool for MysqlDump {
    async fn dump(&self, database: &str, dest: &Path) -> Result<u64, Error> {
        let output = timeout(
            self.timeout,
            Command::new(&self.bin)
                .arg("-h")
                .arg(&self.host)
                .arg("-P")
                .arg(self.port.to_string())
                .arg("-u")
                .arg(&self.username)
                .env("MYSQL_PWD", &self.password)
                .arg("--single-transaction")
                .arg(database)
                .output(),
        )
        .await
        .map_err(|_| Error::Backup(format!("mysqldump gave no answer within {:?}", self.timeout)))?
        .map_err(|e| Error::Io("failed to spawn mysqldump", e))?;

        if !output.status.success() {
            return Err(Error::Backup(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        tokio::fs::write(dest, &output.stdout)
            .await
            .map_err(|e| Error::Io("failed to write dump", e))?;

        Ok(u64::try_from(output.stdout.len()).unwrap_or(u64::MAX))
    }
}

/// Options for configuring `BackupManager`.
pub struct BackupManagerOptions {
    /// The tool producing the logical dump.
    pub tool: Arc<dyn DumpTool>,

    /// Root directory snapshots are namespaced under.
    pub backup_dir: PathBuf,

    /// The metadata database to snapshot.
    pub database: String,

    /// Label recorded as the snapshot's source system.
    pub source_system: String,
}

/// Snapshots existing persisted state before any destructive operation.
#[derive(Clone)]
pub struct BackupManager {
    tool: Arc<dyn DumpTool>,
    backup_dir: PathBuf,
    database: String,
    source_system: String,
}

impl BackupManager {
    /// Creates a new instance of `BackupManager`.
    #[must_use]
    pub fn new(
        BackupManagerOptions {
            tool,
            backup_dir,
            database,
            source_system,
        }: BackupManagerOptions,
    ) -> Self {
        Self {
            tool,
            backup_dir,
            database,
            source_system,
        }
    }

    /// Root directory snapshots are namespaced under.
    #[must_use]
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Snapshots the metadata database when it exists and holds any tables;
    /// a no-op otherwise.
    ///
    /// # Errors
    ///
    /// A failed snapshot is fatal to the caller's run: a destructive
    /// operation must never proceed when data existed but could not be
    /// backed up.
    pub async fn snapshot_if_non_empty(
        &self,
        state: &SchemaState,
    ) -> Result<BackupOutcome, Error> {
        if !state.exists || state.present_tables.is_empty() {
            info!("nothing to back up for {}", self.database);

            return Ok(BackupOutcome::NothingToBackup);
        }

        let timestamp_id = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let dir = self.backup_dir.join(&timestamp_id);

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Io("failed to create backup directory", e))?;

        let path = dir.join(format!("{}.sql", self.database));
        let size_bytes = self.tool.dump(&self.database, &path).await?;

        let record = BackupRecord {
            timestamp_id,
            source_system: self.source_system.clone(),
            path: path.clone(),
            size_bytes,
        };

        let json = serde_json::to_vec_pretty(&record).map_err(|e| Error::Backup(e.to_string()))?;
        tokio::fs::write(dir.join("record.json"), json)
            .await
            .map_err(|e| Error::Io("failed to write backup record", e))?;

        info!(
            "snapshotted {} ({} bytes) to {}",
            self.database,
            size_bytes,
            path.display()
        );

        Ok(BackupOutcome::Snapshotted(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeSet;

    use tempfile::tempdir;

    use crate::state::REQUIRED_TABLES;

    struct FakeDump;

    #[async_trait]
    impl DumpTool for FakeDump {
        async fn dump(&self, database: &str, dest: &Path) -> Result<u64, Error> {
            let dump = format!("-- dump of {database}\n");
            tokio::fs::write(dest, &dump)
                .await
                .map_err(|e| Error::Io("failed to write dump", e))?;

            Ok(u64::try_from(dump.len()).unwrap_or(u64::MAX))
        }
    }

    struct FailingDump;

    #[async_trait]
    impl DumpTool for FailingDump {
        async fn dump(&self, _database: &str, _dest: &Path) -> Result<u64, Error> {
            Err(Error::Backup("access denied".to_string()))
        }
    }

    fn populated_state() -> SchemaState {
        let required: BTreeSet<String> =
            REQUIRED_TABLES.iter().map(|t| (*t).to_string()).collect();

        SchemaState {
            exists: true,
            version: Some("3.1.0".to_string()),
            present_tables: required.clone(),
            required_tables: required,
        }
    }

    fn absent_state() -> SchemaState {
        SchemaState {
            exists: false,
            version: None,
            present_tables: BTreeSet::new(),
            required_tables: REQUIRED_TABLES.iter().map(|t| (*t).to_string()).collect(),
        }
    }

    fn manager(tool: Arc<dyn DumpTool>, backup_dir: PathBuf) -> BackupManager {
        BackupManager::new(BackupManagerOptions {
            tool,
            backup_dir,
            database: "metastore".to_string(),
            source_system: "mysql".to_string(),
        })
    }

    #[tokio::test]
    async fn test_snapshot_writes_dump_and_record() {
        let dir = tempdir().unwrap();
        let manager = manager(Arc::new(FakeDump), dir.path().to_path_buf());

        let outcome = manager
            .snapshot_if_non_empty(&populated_state())
            .await
            .unwrap();

        let record = outcome.record().unwrap();
        assert_eq!(record.source_system, "mysql");
        assert!(record.size_bytes > 0);
        assert!(record.path.exists());
        assert!(record.path.parent().unwrap().join("record.json").exists());
    }

    #[tokio::test]
    async fn test_absent_database_is_a_no_op() {
        let dir = tempdir().unwrap();
        let manager = manager(Arc::new(FakeDump), dir.path().to_path_buf());

        let outcome = manager.snapshot_if_non_empty(&absent_state()).await.unwrap();

        assert!(outcome.record().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_dump_is_fatal() {
        let dir = tempdir().unwrap();
        let manager = manager(Arc::new(FailingDump), dir.path().to_path_buf());

        assert!(matches!(
            manager.snapshot_if_non_empty(&populated_state()).await,
            Err(Error::Backup(_))
        ));
    }
}
