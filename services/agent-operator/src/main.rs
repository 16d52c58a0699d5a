//! agentbox Agent Operator
//!
//! Reconciles Agent resources into class namespaces, datastore credentials
//! and pods, and serves the HTTP bridge that relays messages to running
//! agents over their streams.

use std::sync::Arc;
use std::time::Duration;

use agentbox_operator::{
    api,
    bridge::{MessageBridge, RedisStreamStore},
    cluster::{ClusterApi, KubeCluster},
    config,
    controller::{AgentReconciler, ControllerWorker},
    db::{bootstrap_shared_tables, AdminDatabase},
    provisioner::{AclAdmin, CredentialProvisioner, PgRoleAdmin, RedisAclAdmin, RoleAdmin},
    state::AppState,
    status::StatusUpdater,
};
use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to AGENTBOX_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting agentbox agent operator");
    info!(
        listen_addr = %config.listen_addr,
        operator_namespace = %config.operator_namespace,
        "Configuration loaded"
    );

    // Connect to the cluster
    let kube = match KubeCluster::try_default().await {
        Ok(kube) => kube,
        Err(e) => {
            error!(error = %e, "Failed to create cluster client");
            return Err(e.into());
        }
    };
    let client = kube.client();
    let cluster: Arc<dyn ClusterApi> = Arc::new(kube);

    // Administrative datastore access. A missing password leaves the store
    // unprovisionable but never blocks startup.
    let admin_db = match AdminDatabase::connect_lazy(&config.database) {
        Ok(db) => Some(db),
        Err(e) => {
            warn!(error = %e, "Relational provisioning disabled");
            None
        }
    };
    let roles: Option<Arc<dyn RoleAdmin>> = admin_db
        .clone()
        .map(|db| Arc::new(PgRoleAdmin::new(db)) as Arc<dyn RoleAdmin>);

    let valkey_info = config.valkey.connection_info();
    if valkey_info.is_none() {
        warn!("VALKEY_ADMIN_PASSWORD not set; cache provisioning and messaging disabled");
    }
    let acls: Option<Arc<dyn AclAdmin>> = match valkey_info.clone().map(RedisAclAdmin::new) {
        Some(Ok(admin)) => Some(Arc::new(admin)),
        Some(Err(e)) => {
            warn!(error = %e, "Invalid cache store settings; cache provisioning disabled");
            None
        }
        None => None,
    };

    // Messaging bridge. Connects on first use; without settings the API
    // answers 503.
    let bridge = match valkey_info.map(RedisStreamStore::new) {
        Some(Ok(store)) => Some(MessageBridge::new(Arc::new(store))),
        Some(Err(e)) => {
            warn!(error = %e, "Invalid stream store settings; messaging disabled");
            None
        }
        None => None,
    };

    let provisioner = CredentialProvisioner::new(
        cluster.clone(),
        roles,
        acls,
        config.postgres_endpoint.clone(),
        config.database.database.clone(),
        config.valkey_endpoint.clone(),
    );
    let reconciler = AgentReconciler::new(
        cluster.clone(),
        provisioner,
        StatusUpdater::new(cluster.clone()),
    );

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the controller in background
    let controller_worker = ControllerWorker::new(client, reconciler);
    let controller_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            controller_worker.run(shutdown_rx).await;
        }
    });

    // Create the shared tables in background
    let bootstrap_handle = admin_db.map(|db| {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = bootstrap_shared_tables(db.pool().clone(), shutdown_rx).await {
                error!(error = %e, "Failed to create shared agent tables");
            }
        })
    });

    // Create application state
    let state = AppState::new(cluster, bridge);

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Wait for workers to finish
    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, controller_handle).await {
        warn!(error = %e, "Controller did not shut down in time");
    }
    if let Some(handle) = bootstrap_handle {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Shared table bootstrap did not shut down in time");
        }
    }

    info!("Agent operator shut down complete");
    Ok(())
}
