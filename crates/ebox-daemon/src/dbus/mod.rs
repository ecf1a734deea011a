//! D-Bus interface for the telemetry daemon.
//!
//! Provides the `org.extensionbox.Monitor1` interface.

mod interface;

pub use interface::run_dbus_server;
