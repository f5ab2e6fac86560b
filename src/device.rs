//! Device identity and connection state types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier for a monitored peripheral.
///
/// Immutable once created; the key for all per-device state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create an identifier from any string-like value.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().to_string())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Peripheral category, used for configuration and operator messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Rotary stage carrying the nozzle.
    Turntable,
    /// Label printer.
    Printer,
    /// Barcode scanner identifying the part.
    BarcodeScanner,
    /// PSU / illumination relay controller.
    Lamp,
    /// Result database link.
    Database,
}

impl DeviceKind {
    /// Human-readable label for operator messages.
    pub fn label(&self) -> &'static str {
        match self {
            DeviceKind::Turntable => "Turntable",
            DeviceKind::Printer => "Printer",
            DeviceKind::BarcodeScanner => "Barcode scanner",
            DeviceKind::Lamp => "Lamp controller",
            DeviceKind::Database => "Database",
        }
    }
}

/// Connection state of one device, written only by its supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No poll has completed yet.
    #[default]
    Unknown,
    /// Last poll or reconnect succeeded.
    Connected,
    /// Device lost, or parked by the operator.
    Disconnected,
    /// A reconnect attempt is running or the last one failed.
    Reconnecting,
}

impl ConnectionState {
    /// True only for `Connected`.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Which periodic loop a supervisor is currently driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ActiveLoop {
    /// Not polling (operator disconnect or shut down).
    #[default]
    None,
    /// Normal-rate health polling.
    HealthPoll,
    /// Faster reconnect attempts.
    Reconnect,
}

/// Published view of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Device this snapshot describes.
    pub device: DeviceId,
    /// Device category.
    pub kind: DeviceKind,
    /// Current connection state.
    pub state: ConnectionState,
    /// Loop the supervisor is running.
    pub active_loop: ActiveLoop,
    /// Last detail string reported by the controller, if any.
    pub detail: Option<String>,
    /// When `state` last changed.
    pub since: DateTime<Utc>,
}

impl DeviceSnapshot {
    /// Initial snapshot at process start.
    pub fn unknown(device: DeviceId, kind: DeviceKind) -> Self {
        Self {
            device,
            kind,
            state: ConnectionState::Unknown,
            active_loop: ActiveLoop::None,
            detail: None,
            since: Utc::now(),
        }
    }
}
