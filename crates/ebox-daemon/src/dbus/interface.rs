//! D-Bus interface implementation using zbus.
//!
//! Provides the `org.extensionbox.Monitor1` interface.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use zbus::object_server::SignalEmitter;
use zbus::{interface, Connection};

use crate::config::DbusBusType;
use crate::settings::SettingValue;
use crate::snapshot::UNAVAILABLE;
use crate::state::{AppState, StateError};

const OBJECT_PATH: &str = "/org/extensionbox/Monitor";
const BUS_NAME: &str = "org.extensionbox.Monitor";

fn invalid_args(e: StateError) -> zbus::fdo::Error {
    zbus::fdo::Error::InvalidArgs(e.to_string())
}

/// D-Bus interface over the published telemetry.
pub struct Monitor1Interface {
    state: Arc<AppState>,
    shutdown_tx: tokio::sync::mpsc::Sender<()>,
}

impl Monitor1Interface {
    pub fn new(state: Arc<AppState>, shutdown_tx: tokio::sync::mpsc::Sender<()>) -> Self {
        Self { state, shutdown_tx }
    }
}

#[interface(name = "org.extensionbox.Monitor1")]
impl Monitor1Interface {
    /// Returns every published module snapshot as JSON.
    fn get_snapshot(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.state.snapshot())
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Returns the ordered readouts of one module.
    fn get_module_data(&self, key: &str) -> zbus::fdo::Result<Vec<(String, String)>> {
        let snapshot = self.state.module(key).map_err(invalid_args)?;
        Ok(snapshot
            .map(|s| {
                s.readouts
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Lists modules as (key, name, enabled, active).
    fn list_modules(&self) -> Vec<(String, String, bool, bool)> {
        self.state
            .modules()
            .into_iter()
            .map(|m| (m.key.to_string(), m.name.to_string(), m.enabled, m.active))
            .collect()
    }

    fn get_compact(&self, key: &str) -> zbus::fdo::Result<String> {
        let snapshot = self.state.module(key).map_err(invalid_args)?;
        Ok(snapshot
            .map(|s| s.compact)
            .unwrap_or_else(|| UNAVAILABLE.to_string()))
    }

    fn get_detail(&self, key: &str) -> zbus::fdo::Result<String> {
        let snapshot = self.state.module(key).map_err(invalid_args)?;
        Ok(snapshot
            .map(|s| s.detail)
            .unwrap_or_else(|| UNAVAILABLE.to_string()))
    }

    /// Enables or disables a module.
    fn set_module_enabled(&self, key: &str, enabled: bool) -> zbus::fdo::Result<()> {
        self.state
            .set_module_enabled(key, enabled)
            .map_err(invalid_args)?;
        debug!("D-Bus: SetModuleEnabled({}, {})", key, enabled);
        Ok(())
    }

    /// Stores a runtime setting; "true"/"false" and integers are typed.
    fn set_setting(&self, key: &str, value: &str) {
        self.state.set_setting(key, SettingValue::parse(value));
        debug!("D-Bus: SetSetting({}, {})", key, value);
    }

    /// Returns all runtime settings as JSON.
    fn get_settings(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.state.settings())
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Re-probes privileged access and returns the new tier label.
    async fn reprobe(&self) -> String {
        debug!("D-Bus: Reprobe");
        self.state.reprobe().await
    }

    /// Shuts down the daemon.
    async fn quit(&self) -> zbus::fdo::Result<()> {
        info!("D-Bus: Quit requested");
        self.shutdown_tx
            .send(())
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        Ok(())
    }

    // Properties

    /// Current access tier label.
    #[zbus(property)]
    async fn tier(&self) -> String {
        self.state.access_info().await.tier
    }

    /// Whether privileged reads are possible.
    #[zbus(property)]
    async fn enhanced(&self) -> bool {
        self.state.access_info().await.enhanced
    }

    /// Counter bumped each time new readouts are published.
    #[zbus(property)]
    fn snapshot_version(&self) -> u64 {
        self.state.snapshot_version()
    }

    // Signals

    /// Emitted after the engine publishes new readouts.
    #[zbus(signal)]
    async fn snapshot_updated(emitter: &SignalEmitter<'_>, version: u64) -> zbus::Result<()>;

    /// Emitted when a module raises an alert.
    #[zbus(signal)]
    async fn alert_raised(
        emitter: &SignalEmitter<'_>,
        module: &str,
        id: &str,
        title: &str,
        body: &str,
    ) -> zbus::Result<()>;
}

/// Connects to the appropriate D-Bus bus based on configuration.
async fn connect_to_bus(bus_type: DbusBusType) -> anyhow::Result<(Connection, &'static str)> {
    match bus_type {
        DbusBusType::Session => {
            let conn = Connection::session()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to connect to session bus: {}", e))?;
            Ok((conn, "session"))
        }
        DbusBusType::System => {
            let conn = Connection::system()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to connect to system bus: {}", e))?;
            Ok((conn, "system"))
        }
        DbusBusType::Auto => match Connection::session().await {
            Ok(conn) => Ok((conn, "session")),
            Err(session_err) => {
                warn!(
                    "Session bus unavailable ({}), trying system bus",
                    session_err
                );
                let conn = Connection::system().await.map_err(|system_err| {
                    anyhow::anyhow!(
                        "Failed to connect to any D-Bus: session={}, system={}",
                        session_err,
                        system_err
                    )
                })?;
                Ok((conn, "system"))
            }
        },
    }
}

/// Forwards snapshot and alert notifications as D-Bus signals.
async fn forward_signals(emitter: SignalEmitter<'static>, state: Arc<AppState>) {
    let mut snapshot_rx = state.subscribe_snapshot();
    let mut alert_rx = state.subscribe_alerts();
    loop {
        tokio::select! {
            changed = snapshot_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let version = *snapshot_rx.borrow_and_update();
                if let Err(e) = Monitor1Interface::snapshot_updated(&emitter, version).await {
                    debug!("Failed to emit SnapshotUpdated: {}", e);
                }
            }
            alert = alert_rx.recv() => match alert {
                Ok(event) => {
                    let result = Monitor1Interface::alert_raised(
                        &emitter,
                        &event.module,
                        &event.id,
                        &event.title,
                        &event.body,
                    )
                    .await;
                    if let Err(e) = result {
                        debug!("Failed to emit AlertRaised: {}", e);
                    }
                }
                Err(RecvError::Lagged(n)) => debug!("Dropped {} alert signals", n),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Runs the D-Bus server.
pub async fn run_dbus_server(
    state: Arc<AppState>,
    shutdown_tx: tokio::sync::mpsc::Sender<()>,
    bus_type: DbusBusType,
) -> anyhow::Result<Connection> {
    let interface = Monitor1Interface::new(state.clone(), shutdown_tx);

    let (connection, bus_name) = connect_to_bus(bus_type).await?;

    connection
        .object_server()
        .at(OBJECT_PATH, interface)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to register object: {}", e))?;

    connection
        .request_name(BUS_NAME)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to request bus name: {}", e))?;

    let emitter = SignalEmitter::new(&connection, OBJECT_PATH)
        .map_err(|e| anyhow::anyhow!("Failed to create signal emitter: {}", e))?;
    tokio::spawn(forward_signals(emitter, state));

    info!("D-Bus service registered at {} on {} bus", BUS_NAME, bus_name);
    Ok(connection)
}
