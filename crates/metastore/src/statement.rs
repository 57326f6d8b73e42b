use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use datalab_probe::{QueryFailure, QueryRunner};
use regex::Regex;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::Error;

/// Client error codes that mean the server itself is unreachable, as
/// opposed to a reachable server rejecting the statement.
static CONNECT_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ERROR (2002|2003|2005|2013)").expect("Invalid regex pattern")
});

/// Raw output of a single statement, one tab-separated row per line.
#[derive(Clone, Debug, Default)]
pub struct StatementOutput {
    /// Result rows.
    pub rows: Vec<String>,
}

/// Capability to run a single SQL statement against the metadata store.
///
/// Implementations must distinguish a store that is unreachable from a
/// store that answered with an error, so callers never conflate "not ready
/// yet" with "definitively empty".
#[async_trait]
pub trait StatementRunner
where
    Self: Send + Sync + 'static,
{
    /// Runs one statement and returns its rows.
    async fn run(&self, statement: &str) -> Result<StatementOutput, Error>;
}

/// Options for configuring `MysqlShell`.
pub struct MysqlShellOptions {
    /// Path to the mysql client binary.
    pub bin: String,

    /// Host the metadata store listens on.
    pub host: String,

    /// Port the metadata store listens on.
    pub port: u16,

    /// Username for the administrative account.
    pub username: String,

    /// Password for the administrative account.
    pub password: String,

    /// Timeout applied to every invocation.
    pub timeout: Duration,
}

/// Statement runner that shells out to the `mysql` client binary.
#[derive(Clone)]
pub struct MysqlShell {
    bin: String,
    host: String,
    port: u16,
    username: String,
    password: String,
    timeout: Duration,
}

impl MysqlShell {
    /// Creates a new instance of `MysqlShell`.
    #[must_use]
    pub fn new(
        MysqlShellOptions {
            bin,
            host,
            port,
            username,
            password,
            timeout,
        }: MysqlShellOptions,
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
impl StatementRunner for MysqlShell {
    async fn run(&self, statement: &str) -> Result<StatementOutput, Error> {
        debug!("mysql: {}", statement);

        let invocation = timeout(
            self.timeout,
            Command::new(&self.bin)
                .args(["--batch", "--skip-column-names"])
                .arg("-h")
                .arg(&self.host)
                .arg("-P")
                .arg(self.port.to_string())
                .arg("-u")
                .arg(&self.username)
                .env("MYSQL_PWD", &self.password)
                .arg("-e")
                .arg(statement)
                .output(),
        )
        .await;

        match invocation {
            Err(_) => Err(Error::StoreUnreachable(format!(
                "no answer within {:?}",
                self.timeout
            ))),
            Ok(Err(e)) => Err(Error::Io("failed to spawn mysql client", e)),
            Ok(Ok(output)) if output.status.success() => Ok(StatementOutput {
                rows: String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .map(ToString::to_string)
                    .collect(),
            }),
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

                if CONNECT_ERROR.is_match(&stderr) {
                    Err(Error::StoreUnreachable(stderr))
                } else {
                    Err(Error::Statement(stderr))
                }
            }
        }
    }
}

#[async_trait]
impl QueryRunner for MysqlShell {
    async fn run_query(&self, query: &str) -> Result<String, QueryFailure> {
        match self.run(query).await {
            Ok(output) => Ok(output.rows.join("\n")),
            Err(Error::StoreUnreachable(reason)) => Err(QueryFailure::Unanswered(reason)),
            Err(Error::Io(op, e)) => Err(QueryFailure::Unissuable(format!("{op}: {e}"))),
            Err(e) => Err(QueryFailure::Unanswered(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_errors_are_recognized() {
        assert!(CONNECT_ERROR.is_match(
            "ERROR 2002 (HY000): Can't connect to local MySQL server through socket"
        ));
        assert!(CONNECT_ERROR.is_match(
            "ERROR 2003 (HY000): Can't connect to MySQL server on '127.0.0.1:3306'"
        ));
        assert!(!CONNECT_ERROR.is_match("ERROR 1049 (42000): Unknown database 'metastore'"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_io_error() {
        let shell = MysqlShell::new(MysqlShellOptions {
            bin: "/nonexistent/mysql".to_string(),
            host: "127.0.0.1".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: "secret".to_string(),
            timeout: Duration::from_secs(1),
        });

        assert!(matches!(
            shell.run("SELECT 1").await,
            Err(Error::Io("failed to spawn mysql client", _))
        ));
    }
}
