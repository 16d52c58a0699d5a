//! Administrative database access.
//!
//! The operator holds one pool, authenticated as the administrative role,
//! used to create per-class roles and the shared relations every class is
//! granted access to. The pool connects lazily so that a database that is
//! still starting never blocks operator startup.

mod error;
mod schema;

pub use error::DbError;
pub use schema::{bootstrap_shared_tables, ensure_shared_tables, SHARED_TABLES};

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// Administrative connection settings.
#[derive(Debug, Clone)]
pub struct AdminDbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,

    /// `None` when `POSTGRES_PASSWORD` is unset. Provisioning then fails
    /// until it is configured.
    pub password: Option<String>,

    /// Database the per-class roles are granted CONNECT on.
    pub database: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,
}

impl Default for AdminDbConfig {
    fn default() -> Self {
        Self {
            host: "agentbox-postgresql".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            database: "agentbox".to_string(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

impl AdminDbConfig {
    fn connect_options(&self, password: &str) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(password)
            .database(&self.database)
    }
}

/// Lazily-connected administrative pool.
#[derive(Clone)]
pub struct AdminDatabase {
    pool: PgPool,
    database: String,
}

impl AdminDatabase {
    /// Build the pool without connecting. Fails only if the administrative
    /// password is missing.
    pub fn connect_lazy(config: &AdminDbConfig) -> Result<Self, DbError> {
        let password = config
            .password
            .as_deref()
            .ok_or(DbError::MissingPassword)?;

        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            max_connections = config.max_connections,
            "Configured administrative database pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy_with(config.connect_options(password));

        Ok(Self {
            pool,
            database: config.database.clone(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Target database name.
    pub fn database(&self) -> &str {
        &self.database
    }
}
