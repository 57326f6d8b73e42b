//! Inspection, backup, and repair of the catalog schema in the metadata
//! store.
//!
//! The metadata store is a shared external resource; everything here
//! mediates access to it behind narrow traits so the orchestrator never
//! holds a live connection handle. Destructive writes happen in exactly one
//! place, the [`SchemaInitializer`], and only behind a completed
//! [`BackupManager`] step.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod backup;
mod error;
mod initializer;
mod state;
mod statement;

pub use backup::{
    BackupManager, BackupManagerOptions, BackupOutcome, BackupRecord, DumpTool, MysqlDump,
    MysqlDumpOptions,
};
pub use error::Error;
pub use initializer::{
    InitializerState, SchemaInitializer, SchemaInitializerOptions, SchemaTool, Schematool,
    SchematoolOptions,
};
pub use state::{REQUIRED_TABLES, SchemaState, SchemaStateStore, SchemaStateStoreOptions};
pub use statement::{MysqlShell, MysqlShellOptions, StatementOutput, StatementRunner};
