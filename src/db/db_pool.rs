use duckdb::{AccessMode, Config, Connection};
use r2d2::ManageConnection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

pub type DbPool = r2d2::Pool<DuckDbConnectionManager>;

/// Hands out clones of one DuckDB connection so every pooled connection
/// shares a single database instance.
pub struct DuckDbConnectionManager {
    connection: Arc<Mutex<Connection>>,
}

impl DuckDbConnectionManager {
    /// Opens the database file. Read-only connections also lose access to
    /// the filesystem and network from SQL (`read_csv`, `COPY`, ...).
    pub fn open(path: &Path, read_only: bool) -> Result<Self, duckdb::Error> {
        let config = if read_only {
            Config::default()
                .access_mode(AccessMode::ReadOnly)?
                .enable_external_access(false)?
        } else {
            Config::default()
        };
        let connection = Connection::open_with_flags(path, config)?;
        Ok(Self::from_connection(connection))
    }

    pub fn memory() -> Result<Self, duckdb::Error> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(connection: Connection) -> Self {
        Self {
            connection: Arc::new(Mutex::new(connection)),
        }
    }
}

impl ManageConnection for DuckDbConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let base = self
            .connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        base.try_clone()
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute_batch("SELECT 1")
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

pub fn create_pool(
    manager: DuckDbConnectionManager,
    pool_size: usize,
) -> Result<DbPool, r2d2::Error> {
    info!("Initializing DuckDB connection pool with {} connections", pool_size);
    r2d2::Pool::builder()
        .max_size(pool_size.max(1) as u32)
        .connection_timeout(Duration::from_secs(10))
        .build(manager)
}
