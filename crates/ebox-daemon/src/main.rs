//! Extension Box telemetry daemon
//!
//! Background service that schedules telemetry modules and publishes their
//! readouts over D-Bus and an optional JSON web API.

mod alert;
mod config;
mod dbus;
mod engine;
mod format;
mod modules;
mod rollover;
mod settings;
mod snapshot;
mod state;
mod web;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ebox_access::{CommandChannel, SecondaryChannel, SystemAccess};

use alert::AlertSink;
use config::Config;
use engine::{start_engine, Engine};
use modules::{ModuleContext, ModuleRegistry};
use settings::SettingsStore;
use snapshot::SnapshotStore;
use state::AppState;

const DEFAULT_CONFIG: &str = "config/default.toml";

type WebTask = JoinHandle<std::io::Result<()>>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = Arc::new(Config::load(&config_path).context("Failed to load configuration")?);
    info!("Loaded configuration from: {}", config_path);

    let settings = Arc::new(SettingsStore::load(Path::new(&config.state_dir)));
    let access = connect_access(&config).await;
    let alerts = AlertSink::new();
    let snapshot = Arc::new(SnapshotStore::new());

    let ctx = ModuleContext {
        access: access.clone(),
        settings: settings.clone(),
        alerts: alerts.clone(),
        config: config.clone(),
    };
    let engine = start_engine(Engine::new(ModuleRegistry::builtin(), ctx, snapshot.clone()));
    let state = Arc::new(AppState::new(
        snapshot,
        settings,
        access,
        alerts,
        engine.waker(),
    ));

    // `quit_tx` stays alive here so a missing bus never closes the channel.
    let (quit_tx, quit_rx) = mpsc::channel(1);
    let _bus = publish_dbus(&config, state.clone(), quit_tx.clone()).await;
    let web = serve_web(&config, state).await?;

    let reason = wait_for_shutdown(quit_rx, web).await?;
    info!("Shutting down: {}", reason);
    engine.stop().await;
    drop(quit_tx);
    Ok(())
}

/// Builds the access facade and probes the available privilege tier.
async fn connect_access(config: &Config) -> Arc<SystemAccess> {
    let secondary = config.access.secondary.as_ref().map(|s| {
        Arc::new(CommandChannel::new(
            s.command.clone(),
            s.ping.clone(),
            Duration::from_millis(config.access.command_timeout_ms),
        )) as Arc<dyn SecondaryChannel>
    });
    let access = SystemAccess::connect(&config.access.to_access_config(), secondary).await;
    info!("System access: {}", access.tier_label().await);
    Arc::new(access)
}

/// Registers the D-Bus interface; the daemon keeps running without a bus.
async fn publish_dbus(
    config: &Config,
    state: Arc<AppState>,
    quit_tx: mpsc::Sender<()>,
) -> Option<zbus::Connection> {
    if !config.dbus.enable {
        info!("D-Bus interface disabled");
        return None;
    }
    match dbus::run_dbus_server(state, quit_tx, config.dbus.bus).await {
        Ok(conn) => Some(conn),
        Err(e) => {
            warn!("D-Bus unavailable, continuing without it: {}", e);
            None
        }
    }
}

/// Binds the web API and serves it on its own task.
async fn serve_web(config: &Config, state: Arc<AppState>) -> Result<Option<WebTask>> {
    if !config.web.enable {
        info!("Web API disabled");
        return Ok(None);
    }
    let addr: SocketAddr = config
        .web
        .listen
        .parse()
        .context("Invalid listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Web API listening on http://{}", addr);
    let app = web::create_router(state);
    Ok(Some(tokio::spawn(async move { axum::serve(listener, app).await })))
}

/// Resolves with the reason once the daemon should stop: a signal, a D-Bus
/// quit request, or the web API ending.
async fn wait_for_shutdown(mut quit_rx: mpsc::Receiver<()>, web: Option<WebTask>) -> Result<String> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let web_ended = async move {
        let Some(task) = web else {
            return std::future::pending().await;
        };
        match task.await {
            Ok(Ok(())) => "web API stopped".to_string(),
            Ok(Err(e)) => {
                warn!("Web API failed: {}", e);
                "web API failed".to_string()
            }
            Err(e) => {
                warn!("Web API task failed: {}", e);
                "web API failed".to_string()
            }
        }
    };

    Ok(tokio::select! {
        reason = web_ended => reason,
        _ = quit_rx.recv() => "quit requested over D-Bus".to_string(),
        _ = sigterm.recv() => "SIGTERM".to_string(),
        _ = sigint.recv() => "SIGINT".to_string(),
    })
}
