//! Configuration System using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults ([`InspectConfig::default`])
//! 2. A TOML file (`config/inspect.toml` unless another path is given)
//! 3. Environment variables prefixed with `NOZZLE_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! NOZZLE_APPLICATION__LOG_LEVEL=debug
//! NOZZLE_SUPERVISOR__POLL_INTERVAL_MS=2000
//! NOZZLE_CYCLE__TOTAL_STEPS=12
//! ```
//!
//! # Example
//!
//! ```no_run
//! use nozzle_inspect::config::InspectConfig;
//!
//! let config = InspectConfig::load().expect("valid configuration");
//! println!("{} steps per cycle", config.cycle.total_steps);
//! ```

use crate::device::{DeviceId, DeviceKind};
use crate::poller::PollPolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/inspect.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Connection supervision timing
    pub supervisor: SupervisorConfig,
    /// Measurement cycle settings
    pub cycle: CycleConfig,
    /// Monitored devices
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Station name, used in log output
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Health-poll and reconnect timing shared by all supervisors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Interval between health polls while connected
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Interval between reconnect attempts while disconnected
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,
    /// Timeout for a single status/connect call
    #[serde(default = "default_supervisor_timeout")]
    pub call_timeout_ms: u64,
}

/// Measurement cycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Number of pipeline steps per cycle (home step included)
    #[serde(default = "default_total_steps")]
    pub total_steps: usize,
    /// Relative rotation issued by each rotate step
    #[serde(default = "default_movement_amount")]
    pub movement_amount: f64,
    /// Device receiving motion commands
    pub motion_device: String,
    /// Device carrying the illumination relay
    pub lamp_device: String,
    /// Analysis stages run at each position, in order
    #[serde(default = "default_analysis_steps")]
    pub analysis_steps: Vec<String>,
    /// Optional aggregation mode passed to the controller
    #[serde(default)]
    pub aggregate_mode: Option<String>,
    /// Width of the zero-filled sample used when aggregation fails
    #[serde(default = "default_class_count")]
    pub class_count: usize,
    /// Delay between idle queries
    #[serde(default = "default_idle_poll_interval")]
    pub idle_poll_interval_ms: u64,
    /// Idle queries before a motion is declared stuck
    #[serde(default = "default_idle_max_attempts")]
    pub idle_max_attempts: u32,
    /// Timeout for a single pipeline call
    #[serde(default = "default_cycle_timeout")]
    pub call_timeout_ms: u64,
    /// Refuse to start while the motion device is not connected
    #[serde(default)]
    pub require_motion_connected: bool,
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device identifier
    pub id: String,
    /// Device category
    pub kind: DeviceKind,
    /// Whether a supervisor is started for this device
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_poll_interval() -> u64 {
    5000
}

fn default_reconnect_interval() -> u64 {
    3000
}

fn default_supervisor_timeout() -> u64 {
    2000
}

fn default_total_steps() -> usize {
    8
}

fn default_movement_amount() -> f64 {
    45.0
}

fn default_analysis_steps() -> Vec<String> {
    vec!["detect".to_string(), "classify".to_string()]
}

fn default_class_count() -> usize {
    4
}

fn default_idle_poll_interval() -> u64 {
    500
}

fn default_idle_max_attempts() -> u32 {
    60
}

fn default_cycle_timeout() -> u64 {
    10_000
}

fn default_enabled() -> bool {
    true
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "nozzle-inspect".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            reconnect_interval_ms: default_reconnect_interval(),
            call_timeout_ms: default_supervisor_timeout(),
        }
    }
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            total_steps: default_total_steps(),
            movement_amount: default_movement_amount(),
            motion_device: "turntable".to_string(),
            lamp_device: "lamp".to_string(),
            analysis_steps: default_analysis_steps(),
            aggregate_mode: None,
            class_count: default_class_count(),
            idle_poll_interval_ms: default_idle_poll_interval(),
            idle_max_attempts: default_idle_max_attempts(),
            call_timeout_ms: default_cycle_timeout(),
            require_motion_connected: false,
        }
    }
}

impl Default for InspectConfig {
    fn default() -> Self {
        let device = |id: &str, kind| DeviceDefinition {
            id: id.to_string(),
            kind,
            enabled: true,
        };
        Self {
            application: ApplicationConfig::default(),
            supervisor: SupervisorConfig::default(),
            cycle: CycleConfig::default(),
            devices: vec![
                device("turntable", DeviceKind::Turntable),
                device("printer", DeviceKind::Printer),
                device("scanner", DeviceKind::BarcodeScanner),
                device("lamp", DeviceKind::Lamp),
                device("database", DeviceKind::Database),
            ],
        }
    }
}

impl SupervisorConfig {
    /// Health-poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reconnect interval.
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Per-call timeout.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl CycleConfig {
    /// Idle-wait policy for the busy-wait poller.
    pub fn idle_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.idle_poll_interval_ms),
            max_attempts: self.idle_max_attempts,
        }
    }

    /// Per-call timeout.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Motion device identifier.
    pub fn motion_device_id(&self) -> DeviceId {
        DeviceId::new(&self.motion_device)
    }

    /// Lamp device identifier.
    pub fn lamp_device_id(&self) -> DeviceId {
        DeviceId::new(&self.lamp_device)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl InspectConfig {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and environment
    /// variables. A missing file falls back to the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is malformed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Self::default()))
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("NOZZLE_").split("__")),
        )
    }

    /// Parse configuration from a TOML string layered over the defaults.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Self::default())).merge(Toml::string(toml)),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Intervals, timeouts, attempts and step count are non-zero
    /// - Device IDs are unique
    /// - The motion and lamp devices are configured
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let non_zero = [
            ("supervisor.poll_interval_ms", self.supervisor.poll_interval_ms),
            (
                "supervisor.reconnect_interval_ms",
                self.supervisor.reconnect_interval_ms,
            ),
            ("supervisor.call_timeout_ms", self.supervisor.call_timeout_ms),
            ("cycle.idle_poll_interval_ms", self.cycle.idle_poll_interval_ms),
            ("cycle.call_timeout_ms", self.cycle.call_timeout_ms),
            ("cycle.idle_max_attempts", u64::from(self.cycle.idle_max_attempts)),
            ("cycle.total_steps", self.cycle.total_steps as u64),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ValidationError(format!(
                "{name} must be greater than zero"
            )));
        }

        if !self.cycle.movement_amount.is_finite() {
            return Err(ConfigError::ValidationError(
                "cycle.movement_amount must be a finite number".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Device id must not be empty".to_string(),
                ));
            }
            if !ids.insert(device.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate device ID: '{}'",
                    device.id
                )));
            }
        }

        for (role, id) in [
            ("motion_device", &self.cycle.motion_device),
            ("lamp_device", &self.cycle.lamp_device),
        ] {
            if !ids.contains(id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "cycle.{role} '{id}' is not a configured device"
                )));
            }
        }

        Ok(())
    }

    /// Enabled devices with their identifiers.
    pub fn enabled_devices(&self) -> impl Iterator<Item = (DeviceId, DeviceKind)> + '_ {
        self.devices
            .iter()
            .filter(|d| d.enabled)
            .map(|d| (DeviceId::new(&d.id), d.kind))
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationError(format!("Cannot render configuration: {e}")))
    }
}
