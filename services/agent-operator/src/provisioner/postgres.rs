//! Per-class relational roles.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::db::{AdminDatabase, SHARED_TABLES};

/// The identity and grants a class's role should end up with.
#[derive(Clone, PartialEq, Eq)]
pub struct RoleGrant {
    pub role: String,
    pub password: String,
    pub schema: String,
    pub database: String,
}

impl std::fmt::Debug for RoleGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleGrant")
            .field("role", &self.role)
            .field("password", &"****")
            .field("schema", &self.schema)
            .field("database", &self.database)
            .finish()
    }
}

/// Creates and authorizes class roles.
///
/// Implementations must be re-invocable: an existing role is updated in
/// place, never treated as an error.
#[async_trait]
pub trait RoleAdmin: Send + Sync {
    async fn ensure_role(&self, grant: &RoleGrant) -> Result<(), sqlx::Error>;
}

/// Quote a Postgres identifier.
///
/// Only used for role, schema and database names, which cannot be bound as
/// parameters. Values are always parameters.
pub fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Grant statements run after the role exists and its password is set.
pub fn grant_statements(grant: &RoleGrant) -> Vec<String> {
    let role = quote_identifier(&grant.role);
    let tables = SHARED_TABLES
        .iter()
        .map(|t| format!("public.{}", quote_identifier(t)))
        .collect::<Vec<_>>()
        .join(", ");

    vec![
        "CREATE SCHEMA IF NOT EXISTS public".to_string(),
        format!("GRANT SELECT, INSERT, UPDATE, DELETE ON TABLE {tables} TO {role}"),
        format!(
            "GRANT CONNECT ON DATABASE {} TO {role}",
            quote_identifier(&grant.database)
        ),
        format!(
            "CREATE SCHEMA IF NOT EXISTS {} AUTHORIZATION {role}",
            quote_identifier(&grant.schema)
        ),
        format!("GRANT USAGE ON SCHEMA public TO {role}"),
    ]
}

/// [`RoleAdmin`] backed by the administrative pool.
#[derive(Clone)]
pub struct PgRoleAdmin {
    db: AdminDatabase,
}

impl PgRoleAdmin {
    pub fn new(db: AdminDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RoleAdmin for PgRoleAdmin {
    async fn ensure_role(&self, grant: &RoleGrant) -> Result<(), sqlx::Error> {
        // Dropping the transaction on any `?` rolls it back.
        let mut tx = self.db.pool().begin().await?;

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = $1)")
                .bind(&grant.role)
                .fetch_one(&mut *tx)
                .await?;
        if !exists {
            let create = format!("CREATE ROLE {} WITH LOGIN", quote_identifier(&grant.role));
            sqlx::query(&create).execute(&mut *tx).await?;
            debug!(role = %grant.role, "Created role");
        }

        // Passwords are literals, not parameters, in ALTER ROLE. Let the
        // server do the quoting.
        let alter: String =
            sqlx::query_scalar("SELECT format('ALTER ROLE %I WITH PASSWORD %L', $1::text, $2::text)")
                .bind(&grant.role)
                .bind(&grant.password)
                .fetch_one(&mut *tx)
                .await?;
        sqlx::query(&alter).execute(&mut *tx).await?;

        for stmt in grant_statements(grant) {
            sqlx::query(&stmt).execute(&mut *tx).await?;
        }

        tx.commit().await?;

        info!(
            role = %grant.role,
            schema = %grant.schema,
            database = %grant.database,
            created = !exists,
            "Ensured class role"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn grant() -> RoleGrant {
        RoleGrant {
            role: "agent_scoutingagent".to_string(),
            password: "pw".to_string(),
            schema: "scouting_agent".to_string(),
            database: "agentbox".to_string(),
        }
    }

    #[rstest]
    #[case("agent_scout", "\"agent_scout\"")]
    #[case("we\"ird", "\"we\"\"ird\"")]
    #[case("", "\"\"")]
    fn test_quote_identifier(#[case] ident: &str, #[case] expected: &str) {
        assert_eq!(quote_identifier(ident), expected);
    }

    #[test]
    fn test_grant_statements() {
        let stmts = grant_statements(&grant());
        assert_eq!(
            stmts,
            vec![
                "CREATE SCHEMA IF NOT EXISTS public",
                "GRANT SELECT, INSERT, UPDATE, DELETE ON TABLE public.\"agent_state\", \
                 public.\"agent_message_log\", public.\"agent_status\" TO \"agent_scoutingagent\"",
                "GRANT CONNECT ON DATABASE \"agentbox\" TO \"agent_scoutingagent\"",
                "CREATE SCHEMA IF NOT EXISTS \"scouting_agent\" AUTHORIZATION \"agent_scoutingagent\"",
                "GRANT USAGE ON SCHEMA public TO \"agent_scoutingagent\"",
            ]
        );
    }

    #[test]
    fn test_statements_never_contain_password() {
        let mut grant = grant();
        grant.password = "s3cr3t-value".to_string();
        assert!(grant_statements(&grant)
            .iter()
            .all(|s| !s.contains("s3cr3t-value")));
        assert!(!format!("{grant:?}").contains("s3cr3t-value"));
    }
}
