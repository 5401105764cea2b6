//! # tether-agent
//!
//! Tether server binary: loads settings, opens the session store, and serves
//! `/ws`, `/health`, and `/metrics` until ctrl-c.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tether_core::InstanceId;
use tether_core::logging::{LogFormat, init_subscriber};
use tether_server::{
    AuthClaims, ConnectionManager, JwtAuthGate, ManagerConfig, ResumeTokenSigner,
    ShutdownCoordinator, TetherServer,
};
use tether_settings::{StoreBackend, TetherSettings};
use tether_store::{
    MemorySessionStore, ResilienceConfig, ResilientStore, SessionStore, SqliteSessionStore,
};

/// Tether connection server.
#[derive(Parser, Debug)]
#[command(name = "tether-agent", about = "WebSocket connection and session server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the `SQLite` session database (overrides settings).
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Settings file (default `~/.tether/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Instance ID recorded as session owner (overrides settings).
    #[arg(long)]
    instance_id: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a bearer token signed with the configured JWT secret.
    IssueToken {
        /// Subject user ID.
        #[arg(long)]
        user: String,
        /// Tenant ID.
        #[arg(long)]
        tenant: String,
        /// Session to bind the connection to.
        #[arg(long)]
        session: Option<String>,
        /// Token lifetime in seconds.
        #[arg(long, default_value = "3600")]
        ttl_secs: u64,
    },
}

fn load_settings(cli: &Cli) -> Result<TetherSettings> {
    let mut settings = match &cli.config {
        Some(path) => tether_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => tether_settings::load_settings().context("Failed to load settings")?,
    };
    if let Some(host) = &cli.host {
        settings.server.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(path) = &cli.db_path {
        settings.store.db_path = path.to_string_lossy().into_owned();
    }
    if let Some(id) = &cli.instance_id {
        settings.instance_id = Some(id.clone());
    }
    Ok(settings)
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn resilience(settings: &TetherSettings) -> ResilienceConfig {
    let store = &settings.store;
    ResilienceConfig {
        op_timeout: store.op_timeout(),
        retry: store.retry.clone(),
        max_in_flight: store.max_in_flight,
        breaker_failure_threshold: store.breaker_failure_threshold,
        breaker_cooldown: store.breaker_cooldown(),
    }
}

fn open_store(settings: &TetherSettings) -> Result<Arc<dyn SessionStore>> {
    let ttl = settings.store.session_ttl();
    let config = resilience(settings);
    let store: Arc<dyn SessionStore> = match settings.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("memory session store: sessions are not shared across instances");
            Arc::new(ResilientStore::new(MemorySessionStore::new(ttl), config))
        }
        StoreBackend::Sqlite => {
            let path = tether_settings::resolve_db_path(&settings.store.db_path);
            ensure_parent_dir(&path)?;
            let store = SqliteSessionStore::open(&path, ttl)
                .with_context(|| format!("Failed to open session store {}", path.display()))?;
            tracing::info!(path = %path.display(), "sqlite session store opened");
            Arc::new(ResilientStore::new(store, config))
        }
    };
    Ok(store)
}

fn jwt_gate(settings: &TetherSettings) -> Result<JwtAuthGate> {
    let Some(secret) = settings.auth.jwt_secret.as_deref().filter(|s| !s.is_empty()) else {
        bail!("no JWT secret configured (auth.jwtSecret or TETHER_JWT_SECRET)");
    };
    Ok(JwtAuthGate::new(
        secret,
        settings.auth.jwt_issuer.clone(),
        settings.auth.jwt_audience.clone(),
    ))
}

fn issue_token(
    settings: &TetherSettings,
    user: String,
    tenant: String,
    session: Option<String>,
    ttl_secs: u64,
) -> Result<String> {
    let claims = AuthClaims {
        user_id: user.into(),
        tenant_id: tenant.into(),
        roles: Vec::new(),
        session_hint: session,
    };
    jwt_gate(settings)?
        .issue(&claims, Duration::from_secs(ttl_secs))
        .context("Failed to sign token")
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    let settings = load_settings(&cli)?;

    if let Some(Command::IssueToken {
        user,
        tenant,
        session,
        ttl_secs,
    }) = cli.command.take()
    {
        println!("{}", issue_token(&settings, user, tenant, session, ttl_secs)?);
        return Ok(());
    }

    init_subscriber(
        &settings.logging.level,
        LogFormat::from_str_lossy(&settings.logging.format),
    );
    let prometheus = tether_server::metrics::install_recorder();

    let instance_id = settings
        .instance_id
        .clone()
        .map_or_else(InstanceId::new, InstanceId::from);
    let store = open_store(&settings)?;
    let auth = Arc::new(jwt_gate(&settings)?);
    let resume_key = settings
        .auth
        .resume_key()
        .context("no resume token secret configured")?;
    let signer = ResumeTokenSigner::new(resume_key.as_bytes(), settings.reconnect.resume_token_ttl())
        .context("Failed to create resume token signer")?;

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let manager = Arc::new(ConnectionManager::new(
        ManagerConfig::from_settings(&settings, instance_id.clone()),
        auth,
        store,
        signer,
        shutdown.token(),
    ));
    shutdown.track_all(manager.spawn_background());

    let server = TetherServer::new(
        settings.server.clone(),
        Arc::clone(&manager),
        Arc::clone(&shutdown),
        prometheus,
    );
    let (addr, handle) = server.listen().await.context("Failed to bind")?;
    shutdown.track(handle);
    tracing::info!(%instance_id, "tether agent listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    manager.shutdown().await;
    shutdown
        .graceful_shutdown(Some(settings.server.shutdown_timeout()))
        .await;
    tracing::info!("Shutdown complete");
    Ok(())
}
