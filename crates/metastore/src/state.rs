use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::statement::StatementRunner;
use crate::Error;

/// Catalog tables whose presence defines "schema initialized".
pub const REQUIRED_TABLES: &[&str] = &[
    "VERSION",
    "DBS",
    "TBLS",
    "COLUMNS_V2",
    "PARTITIONS",
    "TABLE_PARAMS",
    "SERDE_PARAMS",
];

/// Classified state of the persisted catalog schema.
///
/// Derived by querying the store; recomputed on every run and never
/// persisted by the orchestrator itself.
#[derive(Clone, Debug, Serialize)]
pub struct SchemaState {
    /// Whether the metadata database exists at all.
    pub exists: bool,

    /// The recorded schema version, when a version row is present.
    pub version: Option<String>,

    /// Tables present in the metadata database.
    pub present_tables: BTreeSet<String>,

    /// Tables that must be present for the schema to be valid.
    pub required_tables: BTreeSet<String>,
}

impl SchemaState {
    /// Whether the schema is fully initialized.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.exists
            && self.version.is_some()
            && self.required_tables.is_subset(&self.present_tables)
    }

    /// Required tables not currently present.
    #[must_use]
    pub fn missing_tables(&self) -> BTreeSet<String> {
        self.required_tables
            .difference(&self.present_tables)
            .cloned()
            .collect()
    }

    /// Short explanation of why the schema is not valid.
    #[must_use]
    pub fn describe_invalid(&self) -> String {
        if !self.exists {
            return "metadata database does not exist".to_string();
        }

        let missing = self.missing_tables();
        if missing.is_empty() && self.version.is_none() {
            return "no version record".to_string();
        }

        let mut parts = Vec::new();
        if self.version.is_none() {
            parts.push("no version record".to_string());
        }
        if !missing.is_empty() {
            parts.push(format!(
                "missing tables: {}",
                missing.into_iter().collect::<Vec<_>>().join(", ")
            ));
        }

        parts.join("; ")
    }
}

/// Options for configuring `SchemaStateStore`.
pub struct SchemaStateStoreOptions {
    /// The statement runner used for the read-only queries.
    pub runner: Arc<dyn StatementRunner>,

    /// The metadata database holding the catalog.
    pub database: String,
}

/// Read-only inspector of the persisted catalog schema.
///
/// Never mutates the store.
#[derive(Clone)]
pub struct SchemaStateStore {
    runner: Arc<dyn StatementRunner>,
    database: String,
}

impl SchemaStateStore {
    /// Creates a new instance of `SchemaStateStore`.
    #[must_use]
    pub fn new(SchemaStateStoreOptions { runner, database }: SchemaStateStoreOptions) -> Self {
        Self { runner, database }
    }

    /// The metadata database this store inspects.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Classifies the current schema state with four read-only queries:
    /// database existence, table presence, version row count, and version
    /// value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnreachable`] when the store cannot be reached
    /// at all, which callers must treat as "not ready yet" rather than
    /// "definitively empty".
    pub async fn inspect(&self) -> Result<SchemaState, Error> {
        let required: BTreeSet<String> = REQUIRED_TABLES
            .iter()
            .map(|table| (*table).to_string())
            .collect();

        let databases = self
            .runner
            .run(&format!("SHOW DATABASES LIKE '{}'", self.database))
            .await?;

        if !databases
            .rows
            .iter()
            .any(|row| row.trim() == self.database)
        {
            debug!("metadata database {} does not exist", self.database);

            return Ok(SchemaState {
                exists: false,
                version: None,
                present_tables: BTreeSet::new(),
                required_tables: required,
            });
        }

        let tables = self
            .runner
            .run(&format!("SHOW TABLES IN `{}`", self.database))
            .await?;

        let present: BTreeSet<String> = tables
            .rows
            .iter()
            .map(|row| row.trim().to_string())
            .filter(|row| !row.is_empty())
            .collect();

        let version = if present.contains("VERSION") {
            self.version_value().await?
        } else {
            None
        };

        Ok(SchemaState {
            exists: true,
            version,
            present_tables: present,
            required_tables: required,
        })
    }

    async fn version_value(&self) -> Result<Option<String>, Error> {
        let count = self
            .runner
            .run(&format!(
                "SELECT COUNT(*) FROM `{}`.VERSION",
                self.database
            ))
            .await?;

        let rows: u64 = count
            .rows
            .first()
            .map_or(0, |row| row.trim().parse().unwrap_or(0));

        if rows == 0 {
            return Ok(None);
        }

        let value = self
            .runner
            .run(&format!(
                "SELECT SCHEMA_VERSION FROM `{}`.VERSION LIMIT 1",
                self.database
            ))
            .await?;

        Ok(value
            .rows
            .first()
            .map(|row| row.trim().to_string())
            .filter(|version| !version.is_empty()))
    }
}
