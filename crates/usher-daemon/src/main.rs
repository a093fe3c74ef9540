//! usher-daemon - guest check-in reconciliation service.
//!
//! Owns the shared guest record and the append-only audit log, and serves
//! the sync and inspection HTTP surface that operator stations talk to.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use usher_core::audit::SqliteAuditLog;
use usher_core::config::UsherConfig;
use usher_core::ratelimit::{RateLimitConfig, RateLimiter};
use usher_daemon::http::{self, AppState, StaticTokenChecker};
use usher_daemon::registry::SqliteGuestRegistry;
use usher_daemon::service::ReconciliationService;

/// usher daemon - check-in reconciliation service
#[derive(Parser, Debug)]
#[command(name = "usher-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the deployment configuration file
    #[arg(short, long, default_value = "usher.toml")]
    config: PathBuf,

    /// Override the bind address from the config
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,

    /// Override the guest registry database path
    #[arg(long)]
    guest_db: Option<PathBuf>,

    /// Override the audit log database path
    #[arg(long)]
    audit_db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = if args.config.exists() {
        UsherConfig::from_file(&args.config)
            .with_context(|| format!("loading config from {}", args.config.display()))?
    } else {
        info!(path = %args.config.display(), "config file not found, using defaults");
        UsherConfig::default()
    };
    let daemon = config.daemon;

    let bind_addr = args.bind.unwrap_or(daemon.bind_addr);
    let guest_db = args.guest_db.unwrap_or(daemon.guest_db);
    let audit_db = args.audit_db.unwrap_or(daemon.audit_db);

    let registry = Arc::new(
        SqliteGuestRegistry::open(&guest_db)
            .with_context(|| format!("opening guest registry at {}", guest_db.display()))?,
    );
    let audit = Arc::new(
        SqliteAuditLog::open(&audit_db)
            .with_context(|| format!("opening audit log at {}", audit_db.display()))?,
    );
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        max_requests: daemon.max_requests_per_window,
        window_secs: daemon.rate_limit_window.as_secs().max(1),
        ..RateLimitConfig::default()
    }));
    let checker = Arc::new(StaticTokenChecker::new(&daemon.operators));

    let state = AppState {
        service: Arc::new(ReconciliationService::new(
            Arc::clone(&registry),
            Arc::clone(&audit),
        )),
        registry,
        audit,
        limiter,
        checker,
    };

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = %bind_addr, "usher daemon listening");

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    info!("usher daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
