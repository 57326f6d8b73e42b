//! Command-line entrypoint bootstrapping the Datalab analytics cluster.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use clap::{Parser, Subcommand};
use datalab_graph::{ServiceGraph, ServiceNode, ServiceNodeOptions, ServiceTier};
use datalab_metastore::{
    BackupManager, BackupManagerOptions, MysqlDump, MysqlDumpOptions, MysqlShell,
    MysqlShellOptions, SchemaStateStore, SchemaStateStoreOptions, SchemaTool, Schematool,
    SchematoolOptions, StatementRunner,
};
use datalab_orchestrator::{Orchestrator, OrchestratorOptions};
use datalab_probe::{
    CommandQuery, CommandQueryOptions, HealthProbe, LogPatternProbe, LogPatternProbeOptions,
    QueryProbe, TcpProbe,
};
use datalab_retry::RetryPolicy;
use datalab_supervisor::Supervisor;
use datalab_supervisor_docker::{DockerSupervisor, DockerSupervisorOptions};
use regex::Regex;
use tracing::error;
use tracing_subscriber::EnvFilter;
use url::Url;

static METASTORE_DB: &str = "metastore-db";
static NAMENODE: &str = "namenode";
static RESOURCEMANAGER: &str = "resourcemanager";
static HIVE_METASTORE: &str = "hive-metastore";
static HIVESERVER2: &str = "hiveserver2";

/// Namenode output lines that mark the RPC server as actually serving.
static NAMENODE_READY: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"NameNode RPC up at").expect("Invalid regex pattern"),
        Regex::new(r"Quota initialization completed").expect("Invalid regex pattern"),
    ]
});

const METASTORE_DB_MAX_WAIT: Duration = Duration::from_secs(150);
const NAMENODE_MAX_WAIT: Duration = Duration::from_secs(120);
const RESOURCEMANAGER_MAX_WAIT: Duration = Duration::from_secs(60);
const HIVE_METASTORE_MAX_WAIT: Duration = Duration::from_secs(120);
const HIVESERVER2_MAX_WAIT: Duration = Duration::from_secs(50);

#[derive(Clone, Debug, Parser)]
#[command(name = "datalab", version, about = "Bootstraps the Datalab analytics cluster", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Bypass the idempotency skip and recreate a valid schema.
    #[arg(long, global = true)]
    force: bool,

    /// Log planned actions without performing any mutation.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Overall deadline for the run, in seconds.
    #[arg(long, global = true, value_name = "SECONDS", env = "DATALAB_TIMEOUT")]
    timeout: Option<u64>,

    /// Where to write the JSON status report.
    #[arg(
        long,
        global = true,
        default_value = "datalab-status.json",
        env = "DATALAB_REPORT_PATH"
    )]
    report_path: PathBuf,

    #[arg(long, default_value = "docker", env = "DATALAB_DOCKER_BIN")]
    docker_bin: String,

    #[arg(long, default_value = "mysql", env = "DATALAB_MYSQL_BIN")]
    mysql_bin: String,

    #[arg(long, default_value = "mysqldump", env = "DATALAB_MYSQLDUMP_BIN")]
    mysqldump_bin: String,

    #[arg(long, default_value = "127.0.0.1", env = "DATALAB_MYSQL_HOST")]
    mysql_host: String,

    #[arg(long, default_value_t = 3306, env = "DATALAB_MYSQL_PORT")]
    mysql_port: u16,

    #[arg(long, default_value = "root", env = "DATALAB_MYSQL_USER")]
    mysql_user: String,

    #[arg(
        long,
        default_value = "secret",
        env = "DATALAB_MYSQL_PASSWORD",
        hide_env_values = true
    )]
    mysql_password: String,

    #[arg(long, default_value = "metastore", env = "DATALAB_METASTORE_DATABASE")]
    metastore_database: String,

    /// Account the metadata service connects to the store with.
    #[arg(long, default_value = "hive", env = "DATALAB_HIVE_DB_USER")]
    hive_db_user: String,

    #[arg(
        long,
        default_value = "/var/backups/datalab",
        env = "DATALAB_BACKUP_DIR"
    )]
    backup_dir: PathBuf,

    #[arg(
        long,
        default_value = "/opt/hive/bin/schematool",
        env = "DATALAB_SCHEMATOOL_PATH"
    )]
    schematool_path: String,

    #[arg(long, default_value = "/opt/hive/bin/hive", env = "DATALAB_HIVE_CLI_PATH")]
    hive_cli_path: String,

    #[arg(
        long,
        default_value = "/opt/hive/bin/beeline",
        env = "DATALAB_BEELINE_PATH"
    )]
    beeline_path: String,

    /// Host the cluster's published ports are reachable on.
    #[arg(long, default_value = "localhost", env = "DATALAB_CLUSTER_HOST")]
    cluster_host: String,

    #[arg(long, default_value_t = 9000, env = "DATALAB_NAMENODE_RPC_PORT")]
    namenode_rpc_port: u16,

    #[arg(long, default_value_t = 8088, env = "DATALAB_RESOURCEMANAGER_PORT")]
    resourcemanager_port: u16,

    #[arg(long, default_value_t = 9083, env = "DATALAB_HIVE_METASTORE_PORT")]
    hive_metastore_port: u16,

    #[arg(long, default_value_t = 10000, env = "DATALAB_HIVESERVER2_PORT")]
    hiveserver2_port: u16,

    #[arg(long, default_value_t = 4, env = "DATALAB_MAX_CONCURRENT_PROBES")]
    max_concurrent_probes: usize,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Verify prerequisites and the schema without changing anything.
    Check,

    /// Snapshot the metadata database.
    Backup,

    /// Verify the schema and repair it when invalid (or forced).
    InitSchema,

    /// Start every service in dependency order.
    Start,

    /// Stop every service in reverse dependency order.
    Stop,

    /// Report current service health and schema state.
    Status,

    /// Run the full bootstrap.
    Run,
}

fn build_orchestrator(args: &Args) -> Result<Orchestrator, datalab_graph::Error> {
    let supervisor: Arc<dyn Supervisor> = Arc::new(DockerSupervisor::new(DockerSupervisorOptions {
        bin: args.docker_bin.clone(),
        command_timeout: Duration::from_secs(30),
    }));

    let mysql = MysqlShell::new(MysqlShellOptions {
        bin: args.mysql_bin.clone(),
        host: args.mysql_host.clone(),
        port: args.mysql_port,
        username: args.mysql_user.clone(),
        password: args.mysql_password.clone(),
        timeout: Duration::from_secs(10),
    });
    let admin_runner: Arc<dyn StatementRunner> = Arc::new(mysql.clone());

    let state_store = SchemaStateStore::new(SchemaStateStoreOptions {
        runner: admin_runner.clone(),
        database: args.metastore_database.clone(),
    });

    let backup_manager = BackupManager::new(BackupManagerOptions {
        tool: Arc::new(MysqlDump::new(MysqlDumpOptions {
            bin: args.mysqldump_bin.clone(),
            host: args.mysql_host.clone(),
            port: args.mysql_port,
            username: args.mysql_user.clone(),
            password: args.mysql_password.clone(),
            timeout: Duration::from_secs(600),
        })),
        backup_dir: args.backup_dir.clone(),
        database: args.metastore_database.clone(),
        source_system: "mysql".to_string(),
    });

    // The schema tool lives inside the metadata service container.
    let schema_tool: Arc<dyn SchemaTool> = Arc::new(Schematool::new(SchematoolOptions {
        bin: args.docker_bin.clone(),
        args: vec![
            "exec".to_string(),
            HIVE_METASTORE.to_string(),
            args.schematool_path.clone(),
        ],
        db_type: "mysql".to_string(),
        timeout: Duration::from_secs(300),
    }));

    let metastore_probe: Arc<dyn HealthProbe> = Arc::new(QueryProbe::new(
        Arc::new(mysql),
        "SELECT 1".to_string(),
        METASTORE_DB.to_string(),
    ));

    let namenode_probe: Arc<dyn HealthProbe> = Arc::new(LogPatternProbe::new(
        LogPatternProbeOptions {
            supervisor: supervisor.clone(),
            service: NAMENODE.to_string(),
            markers: NAMENODE_READY.clone(),
            tail: 200,
        },
    ));

    let resourcemanager_probe: Arc<dyn HealthProbe> = Arc::new(TcpProbe::new(
        args.cluster_host.clone(),
        args.resourcemanager_port,
        Duration::from_secs(5),
    ));

    // The metastore thrift service accepts sockets before it can answer, so
    // readiness is a real query through the hive client, not a connect.
    let hive_metastore_probe: Arc<dyn HealthProbe> = Arc::new(QueryProbe::new(
        Arc::new(CommandQuery::new(CommandQueryOptions {
            bin: args.docker_bin.clone(),
            args: vec![
                "exec".to_string(),
                HIVE_METASTORE.to_string(),
                args.hive_cli_path.clone(),
            ],
            timeout: Duration::from_secs(30),
        })),
        "SHOW DATABASES".to_string(),
        HIVE_METASTORE.to_string(),
    ));

    let hiveserver2_probe: Arc<dyn HealthProbe> = Arc::new(QueryProbe::new(
        Arc::new(CommandQuery::new(CommandQueryOptions {
            bin: args.docker_bin.clone(),
            args: vec![
                "exec".to_string(),
                HIVESERVER2.to_string(),
                args.beeline_path.clone(),
                "-u".to_string(),
                format!("jdbc:hive2://localhost:{}", args.hiveserver2_port),
                "-n".to_string(),
                args.hive_db_user.clone(),
            ],
            timeout: Duration::from_secs(30),
        })),
        "SHOW DATABASES".to_string(),
        HIVESERVER2.to_string(),
    ));

    let host = &args.cluster_host;
    let graph = ServiceGraph::new(vec![
        ServiceNode::new(ServiceNodeOptions {
            name: METASTORE_DB.to_string(),
            depends_on: vec![],
            probe: metastore_probe,
            max_wait: METASTORE_DB_MAX_WAIT,
            tier: ServiceTier::Base,
            endpoint: Url::parse(&format!("mysql://{host}:{}", args.mysql_port)).ok(),
        }),
        ServiceNode::new(ServiceNodeOptions {
            name: NAMENODE.to_string(),
            depends_on: vec![],
            probe: namenode_probe,
            max_wait: NAMENODE_MAX_WAIT,
            tier: ServiceTier::Base,
            endpoint: Url::parse(&format!("hdfs://{host}:{}", args.namenode_rpc_port)).ok(),
        }),
        ServiceNode::new(ServiceNodeOptions {
            name: RESOURCEMANAGER.to_string(),
            depends_on: vec![NAMENODE.to_string()],
            probe: resourcemanager_probe,
            max_wait: RESOURCEMANAGER_MAX_WAIT,
            tier: ServiceTier::Query,
            endpoint: Url::parse(&format!("http://{host}:{}", args.resourcemanager_port)).ok(),
        }),
        ServiceNode::new(ServiceNodeOptions {
            name: HIVE_METASTORE.to_string(),
            depends_on: vec![METASTORE_DB.to_string(), NAMENODE.to_string()],
            probe: hive_metastore_probe,
            max_wait: HIVE_METASTORE_MAX_WAIT,
            tier: ServiceTier::Query,
            endpoint: Url::parse(&format!("thrift://{host}:{}", args.hive_metastore_port)).ok(),
        }),
        ServiceNode::new(ServiceNodeOptions {
            name: HIVESERVER2.to_string(),
            depends_on: vec![HIVE_METASTORE.to_string(), RESOURCEMANAGER.to_string()],
            probe: hiveserver2_probe,
            max_wait: HIVESERVER2_MAX_WAIT,
            tier: ServiceTier::Query,
            endpoint: Url::parse(&format!("hive2://{host}:{}", args.hiveserver2_port)).ok(),
        }),
    ])?;

    Ok(Orchestrator::new(OrchestratorOptions {
        graph,
        supervisor,
        state_store,
        backup_manager,
        admin_runner,
        schema_tool,
        grants: vec![format!(
            "GRANT ALL PRIVILEGES ON `{}`.* TO '{}'@'%'",
            args.metastore_database, args.hive_db_user
        )],
        tool_retry: RetryPolicy::fixed(3, Duration::from_secs(10)),
        inspect_retry: RetryPolicy::fixed(5, Duration::from_secs(5)),
        probe_interval: Duration::from_secs(5),
        max_concurrent_probes: args.max_concurrent_probes,
        required_binaries: vec![
            args.docker_bin.clone(),
            args.mysql_bin.clone(),
            args.mysqldump_bin.clone(),
        ],
        metastore_service: METASTORE_DB.to_string(),
        force: args.force,
        dry_run: args.dry_run,
        deadline: args.timeout.map(Duration::from_secs),
    }))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let orchestrator = match build_orchestrator(&args) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("invalid service graph: {}", e);
            return ExitCode::from(1);
        }
    };

    let report = match args.command {
        Command::Check => orchestrator.check().await,
        Command::Backup => orchestrator.backup().await,
        Command::InitSchema => orchestrator.init_schema().await,
        Command::Start => orchestrator.start().await,
        Command::Stop => orchestrator.stop().await,
        Command::Status => orchestrator.status().await,
        Command::Run => orchestrator.run().await,
    };

    print!("{}", report.render());

    if let Err(e) = report.write_json(&args.report_path).await {
        error!(
            "failed to write status report to {}: {}",
            args.report_path.display(),
            e
        );
    }

    ExitCode::from(report.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::CommandFactory;

    #[test]
    fn test_args_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_run_subcommand_parses_with_flags() {
        let args = Args::parse_from([
            "datalab",
            "run",
            "--force",
            "--dry-run",
            "--timeout",
            "600",
        ]);

        assert!(matches!(args.command, Command::Run));
        assert!(args.force);
        assert!(args.dry_run);
        assert_eq!(args.timeout, Some(600));
    }

    #[test]
    fn test_graph_wiring_is_valid() {
        let args = Args::parse_from(["datalab", "check"]);

        assert!(build_orchestrator(&args).is_ok());
    }
}
