//! Shared relations every workload class is granted access to.

use std::time::Duration;

use sqlx::postgres::PgPool;
use tokio::sync::watch;
use tracing::{info, warn};

use super::DbError;

/// Relations in the `public` schema that per-class roles get CRUD on.
pub const SHARED_TABLES: [&str; 3] = ["agent_state", "agent_message_log", "agent_status"];

const MAX_ATTEMPTS: u32 = 20;
const RETRY_DELAY: Duration = Duration::from_secs(5);

const CREATE_STATEMENTS: [&str; 3] = [
    r#"CREATE TABLE IF NOT EXISTS public.agent_state (
        agent_id TEXT PRIMARY KEY,
        state_json JSONB,
        updated_at TIMESTAMPTZ
    )"#,
    r#"CREATE TABLE IF NOT EXISTS public.agent_message_log (
        id UUID PRIMARY KEY,
        agent_id TEXT,
        direction TEXT,
        sender TEXT,
        target TEXT,
        payload JSONB,
        timestamp TIMESTAMPTZ
    )"#,
    r#"CREATE TABLE IF NOT EXISTS public.agent_status (
        agent_id TEXT PRIMARY KEY,
        phase TEXT,
        message TEXT,
        step TEXT,
        updated_at TIMESTAMPTZ
    )"#,
];

/// Create the shared relations if they are missing.
pub async fn ensure_shared_tables(pool: &PgPool) -> Result<(), sqlx::Error> {
    for stmt in CREATE_STATEMENTS {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}

/// Keep trying [`ensure_shared_tables`] until it succeeds, the retry budget
/// runs out, or shutdown is signalled.
pub async fn bootstrap_shared_tables(
    pool: PgPool,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), DbError> {
    let mut attempt = 1;
    loop {
        match ensure_shared_tables(&pool).await {
            Ok(()) => {
                info!(attempt, "Ensured shared agent tables exist");
                return Ok(());
            }
            Err(e) if attempt >= MAX_ATTEMPTS => {
                return Err(DbError::RetriesExhausted {
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) => {
                warn!(
                    attempt,
                    delay_secs = RETRY_DELAY.as_secs(),
                    error = %e,
                    "Failed to create shared agent tables; retrying"
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(RETRY_DELAY) => {}
            _ = shutdown.changed() => {
                info!("Shared table bootstrap cancelled by shutdown");
                return Ok(());
            }
        }
        attempt += 1;
    }
}
