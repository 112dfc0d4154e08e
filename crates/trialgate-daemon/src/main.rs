//! trialgate-daemon - Membership Gating Daemon
//!
//! Polls the approval registry for approved and expired registrations,
//! grants and revokes time-boxed trial roles in the community, and serves
//! the health/admin HTTP surface.
//!
//! Startup refuses to proceed on missing required configuration (bot
//! credential, community identifier, registry endpoint). A failed bot
//! credential check is NOT fatal: the registry poll keeps running and the
//! failure is surfaced through `/health` as `loginStatus`.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use trialgate_core::config::BotConfig;
use trialgate_core::gateway::{DiscordGateway, MembershipGateway};
use trialgate_core::registry::{HttpRegistryClient, RegistryClient};
use trialgate_daemon::http::{AppState, refresh_login_status, run_http_server};
use trialgate_daemon::metrics::new_shared_registry;
use trialgate_daemon::reconciler::{Reconciler, ReconcilerConfig};

/// Interval between bot credential re-checks after a failed startup check.
const LOGIN_RECHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "trialgate-daemon", about = "Trial membership gating daemon")]
struct Args {
    /// Override the HTTP listen port (default from PORT, then 10000).
    #[arg(long)]
    port: Option<u16>,

    /// Override the poll interval in seconds (default from
    /// POLL_INTERVAL_SECS, then 30).
    #[arg(long)]
    poll_interval_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = BotConfig::from_env().context("startup configuration invalid")?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(secs) = args.poll_interval_secs {
        config.poll_interval = Duration::from_secs(secs.max(1));
    }

    info!(
        guild_id = %config.guild_id,
        port = config.port,
        poll_interval_secs = config.poll_interval.as_secs(),
        trial_duration_minutes = config.trial_duration_minutes,
        "starting trialgate daemon"
    );

    let registry: Arc<dyn RegistryClient> = Arc::new(HttpRegistryClient::new(
        config.registry_url.clone(),
        config.registry_secret.clone(),
    ));
    let gateway: Arc<dyn MembershipGateway> = Arc::new(DiscordGateway::new(
        config.guild_id.clone(),
        config.bot_token.clone(),
    ));

    // Verify the bot credential at startup; the outcome feeds /health. A
    // transient failure keeps retrying in the background so the health
    // surface does not report disconnected forever.
    let login_status = Arc::new(RwLock::new("disconnected".to_string()));
    if !refresh_login_status(gateway.as_ref(), &login_status).await {
        let gateway = Arc::clone(&gateway);
        let login_status = Arc::clone(&login_status);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(LOGIN_RECHECK_INTERVAL).await;
                if refresh_login_status(gateway.as_ref(), &login_status).await {
                    break;
                }
            }
        });
    }

    let metrics = new_shared_registry().context("failed to initialize metrics registry")?;

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&registry),
        Arc::clone(&gateway),
        ReconcilerConfig::from_bot_config(&config),
        metrics.daemon_metrics(),
    ));
    let shutdown = reconciler.shutdown_handle();

    let mut reconciler_task = tokio::spawn({
        let reconciler = Arc::clone(&reconciler);
        async move { reconciler.run().await }
    });

    let state = AppState {
        reconciler: Arc::clone(&reconciler),
        registry,
        metrics,
        login_status,
        started_at: Instant::now(),
    };
    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let server_task = tokio::spawn(run_http_server(state, addr));

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("received SIGINT");
        }
        result = server_task => {
            match result {
                Ok(Err(err)) => error!(%err, "HTTP surface failed"),
                Err(err) => error!(%err, "HTTP server task panicked"),
                Ok(Ok(())) => {},
            }
        }
    }

    info!("shutting down");
    shutdown.store(true, std::sync::atomic::Ordering::Relaxed);

    // The reconciler notices the flag after its current sleep; don't hold
    // shutdown hostage to a full poll interval.
    tokio::select! {
        _ = &mut reconciler_task => {}
        () = tokio::time::sleep(Duration::from_secs(2)) => {
            info!("reconciler still sleeping, aborting");
            reconciler_task.abort();
        }
    }

    info!("shutdown complete");
    Ok(())
}
