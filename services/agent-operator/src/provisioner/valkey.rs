//! Per-class cache-store users.

use async_trait::async_trait;
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use tracing::info;

/// The ACL user a class should end up with.
#[derive(Clone, PartialEq, Eq)]
pub struct AclGrant {
    pub username: String,
    pub password: String,
    pub key_patterns: Vec<String>,
}

impl std::fmt::Debug for AclGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AclGrant")
            .field("username", &self.username)
            .field("password", &"****")
            .field("key_patterns", &self.key_patterns)
            .finish()
    }
}

impl AclGrant {
    /// Arguments to `ACL SETUSER`: enabled, password replaced, key access
    /// limited to the class patterns, all commands.
    pub fn setuser_args(&self) -> Vec<String> {
        let mut args = vec![
            "SETUSER".to_string(),
            self.username.clone(),
            "on".to_string(),
            "resetpass".to_string(),
            format!(">{}", self.password),
            "resetkeys".to_string(),
        ];
        args.extend(self.key_patterns.iter().map(|p| format!("~{p}")));
        args.push("+@all".to_string());
        args
    }
}

/// Creates and authorizes class users.
///
/// `ACL SETUSER` upserts, so re-applying a grant is always safe.
#[async_trait]
pub trait AclAdmin: Send + Sync {
    async fn ensure_user(&self, grant: &AclGrant) -> Result<(), redis::RedisError>;
}

/// Administrative connection settings for the cache store.
#[derive(Debug, Clone)]
pub struct ValkeyAdminConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
}

impl ValkeyAdminConfig {
    /// Connection info, or `None` when no administrative password is set.
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        let password = self.password.clone()?;
        Some(ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: 0,
                username: Some(self.user.clone()),
                password: Some(password),
                ..Default::default()
            },
        })
    }
}

/// [`AclAdmin`] talking to the cache store as the administrative user.
#[derive(Clone)]
pub struct RedisAclAdmin {
    client: redis::Client,
}

impl RedisAclAdmin {
    pub fn new(info: ConnectionInfo) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(info)?,
        })
    }
}

#[async_trait]
impl AclAdmin for RedisAclAdmin {
    async fn ensure_user(&self, grant: &AclGrant) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let () = redis::cmd("ACL")
            .arg(grant.setuser_args())
            .query_async(&mut conn)
            .await?;

        info!(
            user = %grant.username,
            key_patterns = ?grant.key_patterns,
            "Ensured class ACL user"
        );
        Ok(())
    }
}
