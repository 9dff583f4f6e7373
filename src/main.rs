//! Arena Guard - security gateway for the arena backend
//!
//! Serves login / refresh / logout / anti-forgery endpoints backed by the
//! in-memory token service, attempt limiter and CSRF store.
//!
//! Environment:
//!   ARENA_SECURITY_CONFIG - TOML config path (optional)
//!   ARENA_JWT_SECRET - signing secret (required unless set in the file)
//!   ARENA_ACCESS_TOKEN_TTL_SECS / ARENA_REFRESH_TOKEN_TTL_SECS - credential lifetimes
//!   ARENA_OPERATOR_USERNAME / ARENA_OPERATOR_PASSWORD - login account (optional)

use anyhow::{Context, Result};
use arena_guard::{
    auth::{router, CredentialVerifier, DenyAll, SecurityState, StaticCredentials},
    SecurityConfig, SystemClock,
};
use axum::{routing::get, Router};
use clap::Parser;
use dotenv::dotenv;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "arena-guard")]
#[command(about = "Credential, attempt-limit and CSRF gateway")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "ARENA_BIND", default_value = "0.0.0.0:3000")]
    bind: SocketAddr,

    /// TOML config file (overrides ARENA_SECURITY_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,arena_guard=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(args: &Args) -> Result<SecurityConfig> {
    match &args.config {
        Some(path) => SecurityConfig::load_with_env(path)
            .with_context(|| format!("Failed to load {}", path.display())),
        None => SecurityConfig::from_env().context("Invalid security configuration"),
    }
}

async fn health_check() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    let args = Args::parse();
    let config = load_config(&args)?;
    info!(
        tokens = ?config.tokens,
        attempts = ?config.attempts,
        csrf = ?config.csrf,
        "Security configuration loaded"
    );

    let verifier: Arc<dyn CredentialVerifier> = match StaticCredentials::from_env() {
        Some(creds) => Arc::new(creds),
        None => {
            warn!("No operator account configured; every login will be rejected");
            Arc::new(DenyAll)
        }
    };

    let state = SecurityState::spawn(config, SystemClock::shared(), verifier)
        .context("Failed to start security components")?;

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(router(state.clone()))
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(args.bind).await?;
    info!("🛡️ Arena Guard listening on {}", args.bind);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
    })
    .await
    .context("Server error")?;

    state.shutdown();
    Ok(())
}
