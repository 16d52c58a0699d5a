//! Per-class datastore credentials.
//!
//! For each workload class the provisioner issues one relational role and
//! one cache-store ACL user, then persists their credentials into a secret
//! in the class namespace. A password is generated once and carried
//! forward on every later run, so re-provisioning never rotates it.

mod postgres;
mod valkey;

pub use postgres::{grant_statements, quote_identifier, PgRoleAdmin, RoleAdmin, RoleGrant};
pub use valkey::{AclAdmin, AclGrant, RedisAclAdmin, ValkeyAdminConfig};

use std::collections::BTreeMap;
use std::sync::Arc;

use agentbox_credentials::{
    existing_password, generate_password, CredentialError, CredentialSet, StoreKind,
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::cluster::{ClusterApi, ClusterError, ObjectKey};
use crate::crd::Agent;
use crate::naming;

/// Provisioning errors. All are treated as transient by the controller.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The administrative password for a store is not configured.
    #[error("administrative password for {0} is not configured")]
    MissingAdminPassword(StoreKind),

    /// A stored secret lacks an expected field.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("postgres: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("valkey: {0}")]
    Valkey(#[from] redis::RedisError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The Agent has no uid, so the secret can't be owned by it.
    #[error("agent {0} has no uid")]
    MissingUid(String),
}

/// Where agents reach a store, as written into the secrets.
#[derive(Debug, Clone)]
pub struct StoreEndpoint {
    /// Fully-qualified in-cluster service name.
    pub host: String,
    pub port: u16,
}

/// Issues and persists class credentials.
#[derive(Clone)]
pub struct CredentialProvisioner {
    cluster: Arc<dyn ClusterApi>,
    roles: Option<Arc<dyn RoleAdmin>>,
    acls: Option<Arc<dyn AclAdmin>>,
    postgres: StoreEndpoint,
    database: String,
    valkey: StoreEndpoint,
}

impl CredentialProvisioner {
    /// `roles`/`acls` are `None` when the store's administrative password
    /// is missing; provisioning that store then fails on every attempt.
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        roles: Option<Arc<dyn RoleAdmin>>,
        acls: Option<Arc<dyn AclAdmin>>,
        postgres: StoreEndpoint,
        database: impl Into<String>,
        valkey: StoreEndpoint,
    ) -> Self {
        Self {
            cluster,
            roles,
            acls,
            postgres,
            database: database.into(),
            valkey,
        }
    }

    /// Key of the secret holding `kind` credentials for `agent`'s class.
    pub fn secret_key(agent: &Agent, kind: StoreKind) -> ObjectKey {
        ObjectKey::new(
            agent.namespace().unwrap_or_default(),
            kind.secret_name(agent.agent_type()),
        )
    }

    /// Make sure every credential secret for `agent`'s class exists and is
    /// well-formed, provisioning whichever are missing.
    ///
    /// Returns the kinds whose secrets are available to mount.
    #[instrument(skip_all, fields(agent = %agent.name_any(), agent_type = %agent.agent_type()))]
    pub async fn ensure_all(&self, agent: &Agent) -> Result<Vec<StoreKind>, ProvisionError> {
        for kind in StoreKind::ALL {
            match self.cluster.get_secret(&Self::secret_key(agent, kind)).await? {
                Some(secret) => {
                    CredentialSet::from_secret_data(kind, &secret_bytes(&secret))?;
                }
                None => self.ensure(agent, kind).await?,
            }
        }
        Ok(StoreKind::ALL.to_vec())
    }

    /// Provision one store for `agent`'s class. Safe to call whether or not
    /// the identity or the secret already exist.
    pub async fn ensure(&self, agent: &Agent, kind: StoreKind) -> Result<(), ProvisionError> {
        match kind {
            StoreKind::Postgres => self.ensure_postgres(agent).await,
            StoreKind::Valkey => self.ensure_valkey(agent).await,
        }
    }

    pub async fn ensure_postgres(&self, agent: &Agent) -> Result<(), ProvisionError> {
        let roles = self
            .roles
            .as_ref()
            .ok_or(ProvisionError::MissingAdminPassword(StoreKind::Postgres))?;
        let agent_type = agent.agent_type();

        self.converge(agent, StoreKind::Postgres, |password| async move {
            let grant = RoleGrant {
                role: naming::store_username(agent_type),
                password: password.clone(),
                schema: naming::schema_name(agent_type),
                database: self.database.clone(),
            };
            roles.ensure_role(&grant).await?;
            Ok(CredentialSet {
                kind: StoreKind::Postgres,
                username: grant.role,
                password,
                host: self.postgres.host.clone(),
                port: self.postgres.port.to_string(),
                database: Some(grant.database),
            })
        })
        .await
    }

    pub async fn ensure_valkey(&self, agent: &Agent) -> Result<(), ProvisionError> {
        let acls = self
            .acls
            .as_ref()
            .ok_or(ProvisionError::MissingAdminPassword(StoreKind::Valkey))?;
        let agent_type = agent.agent_type();

        self.converge(agent, StoreKind::Valkey, |password| async move {
            let grant = AclGrant {
                username: naming::store_username(agent_type),
                password: password.clone(),
                key_patterns: naming::key_patterns(agent_type),
            };
            acls.ensure_user(&grant).await?;
            Ok(CredentialSet {
                kind: StoreKind::Valkey,
                username: grant.username,
                password,
                host: self.valkey.host.clone(),
                port: self.valkey.port.to_string(),
                database: None,
            })
        })
        .await
    }

    /// Apply the store identity with the current (or a fresh) password and
    /// persist the resulting credentials.
    ///
    /// If another writer creates the secret between our read and our
    /// create, its password wins: the identity is re-applied with it and
    /// the secret rewritten, so the store and the secret always agree.
    async fn converge<F, Fut>(
        &self,
        agent: &Agent,
        kind: StoreKind,
        mut apply: F,
    ) -> Result<(), ProvisionError>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = Result<CredentialSet, ProvisionError>>,
    {
        let key = Self::secret_key(agent, kind);
        let mut lost_race = false;
        loop {
            let existing = self.cluster.get_secret(&key).await?;
            let password = match &existing {
                Some(secret) => existing_password(kind, &secret_bytes(secret))?,
                None => generate_password(),
            };

            let creds = apply(password).await?;
            let fingerprint = creds.password_fingerprint();

            match existing {
                Some(secret) => {
                    let updated = Secret {
                        metadata: secret.metadata,
                        string_data: Some(creds.to_secret_data()),
                        type_: secret.type_.or_else(|| Some("Opaque".to_string())),
                        ..Default::default()
                    };
                    self.cluster.replace_secret(&updated).await?;
                    info!(secret = %key, %kind, password_fingerprint = %fingerprint, "Updated credential secret");
                    return Ok(());
                }
                None => match self.cluster.create_secret(&new_secret(agent, &key, &creds)?).await {
                    Ok(()) => {
                        info!(secret = %key, %kind, password_fingerprint = %fingerprint, "Created credential secret");
                        return Ok(());
                    }
                    Err(e) if e.is_already_exists() && !lost_race => {
                        warn!(secret = %key, %kind, "Credential secret created concurrently; adopting its password");
                        lost_race = true;
                    }
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }
}

fn new_secret(agent: &Agent, key: &ObjectKey, creds: &CredentialSet) -> Result<Secret, ProvisionError> {
    let owner = agent
        .controller_owner_ref(&())
        .ok_or_else(|| ProvisionError::MissingUid(agent.name_any()))?;
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        string_data: Some(creds.to_secret_data()),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    })
}

/// Secret data as raw bytes.
pub fn secret_bytes(secret: &Secret) -> BTreeMap<String, Vec<u8>> {
    let mut data: BTreeMap<String, Vec<u8>> = secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), v.0.clone()))
        .collect();
    for (k, v) in secret.string_data.iter().flatten() {
        data.insert(k.clone(), v.clone().into_bytes());
    }
    data
}
