//! Credential secret layout for per-class datastore identities.
//!
//! Each workload class gets one secret per backing store. The layout is
//! fixed so that workloads can read it from a well-known mount path:
//!
//! ```text
//! postgres: username, password, database, host, port
//! valkey:   username, password, host, port
//! ```
//!
//! Values are UTF-8 strings. A secret missing any expected field is
//! rejected rather than repaired, since its password can no longer be
//! trusted to match the store.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of generated passwords, in characters.
pub const PASSWORD_LENGTH: usize = 32;

/// Number of random bytes drawn for a password before encoding.
const PASSWORD_ENTROPY_BYTES: usize = 32;

pub const FIELD_USERNAME: &str = "username";
pub const FIELD_PASSWORD: &str = "password";
pub const FIELD_DATABASE: &str = "database";
pub const FIELD_HOST: &str = "host";
pub const FIELD_PORT: &str = "port";

/// Credential layout errors.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// An expected field is absent from the stored secret.
    #[error("{kind} secret is missing field '{field}'")]
    MissingField { kind: StoreKind, field: &'static str },

    /// A field is present but not valid UTF-8.
    #[error("{kind} secret field '{field}' is not valid UTF-8")]
    InvalidUtf8 { kind: StoreKind, field: &'static str },
}

/// The backing store a credential set belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreKind {
    /// Relational database.
    Postgres,

    /// Key-value cache store.
    Valkey,
}

impl StoreKind {
    /// All store kinds, in provisioning order.
    pub const ALL: [StoreKind; 2] = [StoreKind::Postgres, StoreKind::Valkey];

    /// Short identifier used in resource names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Valkey => "valkey",
        }
    }

    /// Fields every secret of this kind must carry.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Postgres => &[
                FIELD_USERNAME,
                FIELD_PASSWORD,
                FIELD_DATABASE,
                FIELD_HOST,
                FIELD_PORT,
            ],
            Self::Valkey => &[FIELD_USERNAME, FIELD_PASSWORD, FIELD_HOST, FIELD_PORT],
        }
    }

    /// Name of the secret holding this kind's credentials for a class.
    pub fn secret_name(&self, agent_type: &str) -> String {
        format!("agent-{agent_type}-{}-creds", self.as_str())
    }

    /// Pod volume name for this kind's secret.
    pub fn volume_name(&self) -> String {
        format!("{}-creds", self.as_str())
    }

    /// Path the secret is mounted at inside agent containers.
    pub fn mount_path(&self) -> String {
        format!("/etc/secrets/{}", self.as_str())
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A complete set of credentials for one class and one store.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialSet {
    pub kind: StoreKind,
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: String,
    /// Only present for [`StoreKind::Postgres`].
    pub database: Option<String>,
}

impl CredentialSet {
    /// Secret data in the fixed layout for this kind.
    pub fn to_secret_data(&self) -> BTreeMap<String, String> {
        let mut data = BTreeMap::new();
        data.insert(FIELD_USERNAME.to_string(), self.username.clone());
        data.insert(FIELD_PASSWORD.to_string(), self.password.clone());
        data.insert(FIELD_HOST.to_string(), self.host.clone());
        data.insert(FIELD_PORT.to_string(), self.port.clone());
        if self.kind == StoreKind::Postgres {
            data.insert(
                FIELD_DATABASE.to_string(),
                self.database.clone().unwrap_or_default(),
            );
        }
        data
    }

    /// Decode a stored secret, requiring every field of `kind`.
    pub fn from_secret_data(
        kind: StoreKind,
        data: &BTreeMap<String, Vec<u8>>,
    ) -> Result<Self, CredentialError> {
        for field in kind.required_fields() {
            read_field(kind, data, field)?;
        }

        Ok(Self {
            kind,
            username: read_field(kind, data, FIELD_USERNAME)?,
            password: read_field(kind, data, FIELD_PASSWORD)?,
            host: read_field(kind, data, FIELD_HOST)?,
            port: read_field(kind, data, FIELD_PORT)?,
            database: match kind {
                StoreKind::Postgres => Some(read_field(kind, data, FIELD_DATABASE)?),
                StoreKind::Valkey => None,
            },
        })
    }

    /// Non-secret identifier for this set's password, safe to log.
    pub fn password_fingerprint(&self) -> String {
        fingerprint(&self.password)
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("kind", &self.kind)
            .field("username", &self.username)
            .field("password", &"****")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .finish()
    }
}

/// Read only the password out of an existing secret.
///
/// Used to carry a previously issued password forward instead of
/// generating a new one.
pub fn existing_password(
    kind: StoreKind,
    data: &BTreeMap<String, Vec<u8>>,
) -> Result<String, CredentialError> {
    read_field(kind, data, FIELD_PASSWORD)
}

fn read_field(
    kind: StoreKind,
    data: &BTreeMap<String, Vec<u8>>,
    field: &'static str,
) -> Result<String, CredentialError> {
    let raw = data
        .get(field)
        .ok_or(CredentialError::MissingField { kind, field })?;
    String::from_utf8(raw.clone()).map_err(|_| CredentialError::InvalidUtf8 { kind, field })
}

/// Generate a random password.
///
/// 32 bytes from the OS-seeded CSPRNG, URL-safe base64 encoded and
/// truncated to [`PASSWORD_LENGTH`] characters, so it never needs quoting
/// in connection strings or environment variables.
pub fn generate_password() -> String {
    let mut bytes = [0u8; PASSWORD_ENTROPY_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    let mut encoded = base64::engine::general_purpose::URL_SAFE.encode(bytes);
    encoded.truncate(PASSWORD_LENGTH);
    encoded
}

/// Short SHA-256 fingerprint of a secret value.
pub fn fingerprint(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(digest)[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_map(pairs: &[(&str, &str)]) -> BTreeMap<String, Vec<u8>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    fn postgres_set() -> CredentialSet {
        CredentialSet {
            kind: StoreKind::Postgres,
            username: "agent_scoutingagent".to_string(),
            password: "s3cret".to_string(),
            host: "agentbox-postgresql.agentbox-system.svc.cluster.local".to_string(),
            port: "5432".to_string(),
            database: Some("agentbox".to_string()),
        }
    }

    #[test]
    fn test_store_kind_names() {
        assert_eq!(
            StoreKind::Postgres.secret_name("scouting-agent"),
            "agent-scouting-agent-postgres-creds"
        );
        assert_eq!(
            StoreKind::Valkey.secret_name("scouting-agent"),
            "agent-scouting-agent-valkey-creds"
        );
        assert_eq!(StoreKind::Postgres.mount_path(), "/etc/secrets/postgres");
        assert_eq!(StoreKind::Valkey.volume_name(), "valkey-creds");
    }

    #[test]
    fn test_postgres_layout() {
        let data = postgres_set().to_secret_data();
        let keys: Vec<_> = data.keys().map(String::as_str).collect();
        assert_eq!(keys, ["database", "host", "password", "port", "username"]);
    }

    #[test]
    fn test_valkey_layout_has_no_database() {
        let set = CredentialSet {
            kind: StoreKind::Valkey,
            database: None,
            ..postgres_set()
        };
        let data = set.to_secret_data();
        assert!(!data.contains_key(FIELD_DATABASE));
        assert_eq!(data.len(), 4);
    }

    #[test]
    fn test_decode_requires_every_field() {
        let data = bytes_map(&[
            ("username", "agent_x"),
            ("password", "pw"),
            ("host", "h"),
            ("port", "5432"),
        ]);

        let err = CredentialSet::from_secret_data(StoreKind::Postgres, &data).unwrap_err();
        assert!(matches!(
            err,
            CredentialError::MissingField {
                field: FIELD_DATABASE,
                ..
            }
        ));

        let valkey = CredentialSet::from_secret_data(StoreKind::Valkey, &data).unwrap();
        assert_eq!(valkey.username, "agent_x");
        assert_eq!(valkey.database, None);
    }

    #[test]
    fn test_existing_password() {
        let data = bytes_map(&[("password", "keepme")]);
        assert_eq!(
            existing_password(StoreKind::Valkey, &data).unwrap(),
            "keepme"
        );

        let empty = BTreeMap::new();
        assert!(existing_password(StoreKind::Valkey, &empty).is_err());
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut data = BTreeMap::new();
        data.insert("password".to_string(), vec![0xff, 0xfe]);
        let err = existing_password(StoreKind::Postgres, &data).unwrap_err();
        assert!(matches!(err, CredentialError::InvalidUtf8 { .. }));
    }

    #[test]
    fn test_generated_password_shape() {
        let a = generate_password();
        let b = generate_password();
        assert_eq!(a.len(), PASSWORD_LENGTH);
        assert_ne!(a, b);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", postgres_set());
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("****"));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
        assert_eq!(fingerprint("abc").len(), 8);
    }
}
