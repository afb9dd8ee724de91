//! Throwaway PostgreSQL instances.
//!
//! `DbManager` drives `initdb`, `pg_ctl` and `pg_isready` to run a private
//! PostgreSQL cluster in a temporary directory. The integration tests use it
//! when no `TEST_DATABASE_URL` is provided; production deployments always
//! connect to an externally managed database.

use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;

use sqlx::postgres::PgPool;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::sleep;

/// Database name used inside the throwaway cluster.
const DEFAULT_DATABASE: &str = "echo";

/// Maximum time to wait for PostgreSQL to become ready.
const PG_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval when waiting for PostgreSQL readiness.
const PG_READY_POLL: Duration = Duration::from_millis(200);

/// Errors that can occur while provisioning a database.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("PostgreSQL command failed: {0}")]
    Command(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pg_config not found on PATH")]
    PgConfigNotFound,

    #[error("PostgreSQL not ready after {0:?}")]
    ReadyTimeout(Duration),
}

/// Result type for database provisioning.
pub type Result<T> = std::result::Result<T, DbError>;

/// Manages a private PostgreSQL cluster living in a temp directory.
///
/// The cluster is stopped by [`DbManager::stop`]; the data directory is
/// removed when the manager is dropped.
pub struct DbManager {
    bin_dir: PathBuf,
    data_dir: PathBuf,
    port: u16,
    started: bool,
    _tempdir: tempfile::TempDir,
}

impl DbManager {
    /// Locate the PG binaries via `pg_config --bindir` and reserve a temp dir.
    pub async fn ephemeral() -> Result<Self> {
        let output = Command::new("pg_config")
            .arg("--bindir")
            .output()
            .await
            .map_err(|_| DbError::PgConfigNotFound)?;

        if !output.status.success() {
            return Err(DbError::PgConfigNotFound);
        }

        let bin_dir = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let tempdir = tempfile::tempdir()?;

        Ok(Self {
            bin_dir: PathBuf::from(bin_dir),
            data_dir: tempdir.path().join("pgdata"),
            port: 0,
            started: false,
            _tempdir: tempdir,
        })
    }

    /// Initialise the cluster, start it and create the application database.
    pub async fn start(&mut self) -> Result<()> {
        self.initdb().await?;

        if self.port == 0 {
            self.port = find_free_port()?;
        }

        log::info!("Starting PostgreSQL on port {}...", self.port);

        let port_opt = format!(
            "-p {} -k {} -h localhost",
            self.port,
            self.data_dir.display()
        );
        let output = Command::new(self.bin_dir.join("pg_ctl"))
            .arg("-D")
            .arg(&self.data_dir)
            .arg("-o")
            .arg(&port_opt)
            .arg("-l")
            .arg(self.data_dir.join("postgresql.log"))
            .arg("start")
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DbError::Command(format!("pg_ctl start failed: {stderr}")));
        }

        self.wait_for_ready().await?;
        self.started = true;
        self.create_database().await?;

        log::info!("Database ready at {}", self.connection_url());
        Ok(())
    }

    /// Stop the cluster (fast shutdown). A no-op if it never started.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        let output = Command::new(self.bin_dir.join("pg_ctl"))
            .arg("-D")
            .arg(&self.data_dir)
            .arg("-m")
            .arg("fast")
            .arg("stop")
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DbError::Command(format!("pg_ctl stop failed: {stderr}")));
        }

        self.started = false;
        log::info!("PostgreSQL stopped");
        Ok(())
    }

    /// Connection URL for the application database.
    pub fn connection_url(&self) -> String {
        format!("postgresql://localhost:{}/{}", self.port, DEFAULT_DATABASE)
    }

    /// Connect to the application database and apply migrations.
    pub async fn migrated_pool(&self) -> Result<PgPool> {
        Ok(crate::migrate::connect_and_migrate(&self.connection_url(), 10).await?)
    }

    /// Whether the cluster is running.
    pub fn is_started(&self) -> bool {
        self.started
    }

    async fn initdb(&self) -> Result<()> {
        let output = Command::new(self.bin_dir.join("initdb"))
            .arg("-D")
            .arg(&self.data_dir)
            .arg("--no-locale")
            .arg("--encoding=UTF8")
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DbError::Command(format!("initdb failed: {stderr}")));
        }
        Ok(())
    }

    async fn wait_for_ready(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + PG_READY_TIMEOUT;

        loop {
            let output = Command::new(self.bin_dir.join("pg_isready"))
                .arg("-p")
                .arg(self.port.to_string())
                .arg("-h")
                .arg("localhost")
                .output()
                .await?;

            if output.status.success() {
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(DbError::ReadyTimeout(PG_READY_TIMEOUT));
            }

            sleep(PG_READY_POLL).await;
        }
    }

    async fn create_database(&self) -> Result<()> {
        let maintenance_url = format!("postgresql://localhost:{}/postgres", self.port);
        let pool = PgPool::connect(&maintenance_url).await?;

        // CREATE DATABASE cannot use bind parameters
        let sql = format!("CREATE DATABASE \"{DEFAULT_DATABASE}\"");
        sqlx::query(&sql).execute(&pool).await?;

        pool.close().await;
        Ok(())
    }
}

/// Find a free ephemeral port by binding to port 0.
fn find_free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_port_is_non_zero() {
        let port = find_free_port().expect("free port");
        assert_ne!(0, port);
    }

    #[tokio::test]
    async fn stop_before_start_is_noop() {
        // Only meaningful where PostgreSQL binaries are installed.
        let Ok(mut mgr) = DbManager::ephemeral().await else {
            return;
        };
        assert!(!mgr.is_started());
        mgr.stop().await.expect("stop is a no-op");
        assert!(mgr.connection_url().ends_with("/echo"));
    }
}
