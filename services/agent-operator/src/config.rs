use std::net::SocketAddr;

use anyhow::{Context, Result};

use crate::db::AdminDbConfig;
use crate::naming;
use crate::provisioner::{StoreEndpoint, ValkeyAdminConfig};

const DEFAULT_OPERATOR_NAMESPACE: &str = "agentbox-system";
const DEFAULT_VALKEY_SERVICE: &str = "agentbox-valkey";

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,

    /// Namespace the backing stores' services live in.
    pub operator_namespace: String,

    pub database: AdminDbConfig,
    pub valkey: ValkeyAdminConfig,

    /// Relational store endpoint written into class secrets.
    pub postgres_endpoint: StoreEndpoint,

    /// Cache store endpoint written into class secrets.
    pub valkey_endpoint: StoreEndpoint,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let listen_addr = var("AGENTBOX_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .context("invalid AGENTBOX_LISTEN_ADDR")?;

        let log_level = var("AGENTBOX_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let operator_namespace =
            var("OPERATOR_NAMESPACE").unwrap_or_else(|| DEFAULT_OPERATOR_NAMESPACE.to_string());

        let mut database = AdminDbConfig::default();
        if let Some(host) = var("POSTGRES_HOST") {
            database.host = host;
        }
        if let Some(port) = var("POSTGRES_PORT") {
            database.port = port.parse().context("invalid POSTGRES_PORT")?;
        }
        if let Some(user) = var("POSTGRES_USER") {
            database.user = user;
        }
        if let Some(db) = var("POSTGRES_DB") {
            database.database = db;
        }
        database.password = var("POSTGRES_PASSWORD");

        let valkey_namespace =
            var("VALKEY_NAMESPACE").unwrap_or_else(|| operator_namespace.clone());
        let valkey_service =
            var("VALKEY_SERVICE_NAME").unwrap_or_else(|| DEFAULT_VALKEY_SERVICE.to_string());
        let valkey_fqdn = naming::service_fqdn(&valkey_service, &valkey_namespace);
        let valkey_port = match var("VALKEY_PORT") {
            Some(port) => port.parse().context("invalid VALKEY_PORT")?,
            None => 6379,
        };

        let valkey = ValkeyAdminConfig {
            host: var("VALKEY_HOST").unwrap_or_else(|| valkey_fqdn.clone()),
            port: valkey_port,
            user: var("VALKEY_ADMIN_USER").unwrap_or_else(|| "default".to_string()),
            password: var("VALKEY_ADMIN_PASSWORD"),
        };

        let postgres_endpoint = StoreEndpoint {
            host: naming::service_fqdn(&database.host, &operator_namespace),
            port: database.port,
        };
        let valkey_endpoint = StoreEndpoint {
            host: valkey_fqdn,
            port: valkey_port,
        };

        Ok(Self {
            listen_addr,
            log_level,
            operator_namespace,
            database,
            valkey,
            postgres_endpoint,
            valkey_endpoint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.listen_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.operator_namespace, "agentbox-system");
        assert_eq!(config.database.host, "agentbox-postgresql");
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.database.user, "postgres");
        assert_eq!(config.database.database, "agentbox");
        assert!(config.database.password.is_none());

        assert_eq!(
            config.valkey.host,
            "agentbox-valkey.agentbox-system.svc.cluster.local"
        );
        assert_eq!(config.valkey.port, 6379);
        assert_eq!(config.valkey.user, "default");
        assert!(config.valkey.password.is_none());

        assert_eq!(
            config.postgres_endpoint.host,
            "agentbox-postgresql.agentbox-system.svc.cluster.local"
        );
        assert_eq!(config.valkey_endpoint.port, 6379);
    }

    #[test]
    fn test_valkey_namespace_falls_back_to_operator_namespace() {
        let config = config_from(&[("OPERATOR_NAMESPACE", "infra")]).unwrap();
        assert_eq!(config.valkey.host, "agentbox-valkey.infra.svc.cluster.local");
        assert_eq!(
            config.postgres_endpoint.host,
            "agentbox-postgresql.infra.svc.cluster.local"
        );
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("AGENTBOX_LISTEN_ADDR", "127.0.0.1:9000"),
            ("POSTGRES_HOST", "pg"),
            ("POSTGRES_PORT", "6543"),
            ("POSTGRES_PASSWORD", "secret"),
            ("VALKEY_NAMESPACE", "cache"),
            ("VALKEY_SERVICE_NAME", "kv"),
            ("VALKEY_HOST", "localhost"),
            ("VALKEY_PORT", "7000"),
            ("VALKEY_ADMIN_PASSWORD", "admin"),
        ])
        .unwrap();

        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.database.password.as_deref(), Some("secret"));
        assert_eq!(config.postgres_endpoint.port, 6543);
        assert_eq!(config.valkey.host, "localhost");
        assert_eq!(config.valkey.port, 7000);
        assert_eq!(config.valkey.password.as_deref(), Some("admin"));
        assert_eq!(config.valkey_endpoint.host, "kv.cache.svc.cluster.local");
        assert_eq!(config.valkey_endpoint.port, 7000);
    }

    #[test]
    fn test_empty_password_is_unset() {
        let config = config_from(&[("POSTGRES_PASSWORD", "")]).unwrap();
        assert!(config.database.password.is_none());
    }

    #[test]
    fn test_invalid_port_is_an_error() {
        assert!(config_from(&[("POSTGRES_PORT", "not-a-port")]).is_err());
    }
}
