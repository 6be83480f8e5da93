//! Configuration management.
//!
//! Settings load from a single TOML file via the `config` crate. Parsing and
//! semantic validation are separate steps: `Settings::load` surfaces file and
//! format problems as [`ConfigError::Parse`], then `validate` catches values
//! that parse fine but are logically invalid (zero intervals, zero run caps,
//! missing serial port paths) as [`ConfigError::Validation`].
//!
//! Schedule entries referencing undefined command names are deliberately NOT
//! a load-time error: the acquisition loop disables those slots for the
//! session and audits them, so one bad entry never blocks a bench run.

use crate::command::catalog::CommandDefinition;
use crate::command::schedule::ScheduledCommandConfig;
use crate::error::ConfigError;
use config::Config;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level application settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Log filter, e.g. "info" or "cx505_daq=debug".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Transport selection.
    pub device: DeviceSettings,

    /// Acquisition loop tuning.
    #[serde(default)]
    pub acquisition: AcquisitionSettings,

    /// Output sinks.
    #[serde(default)]
    pub output: OutputSettings,

    /// Named command definitions.
    #[serde(default)]
    pub commands: HashMap<String, CommandDefinition>,

    /// Scheduled command entries.
    #[serde(default)]
    pub schedule: Vec<ScheduledCommandConfig>,
}

/// Log output format, mirrored by the tracing initialization.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pretty-printed with colors (development).
    #[default]
    Pretty,
    /// Compact single-line (production).
    Compact,
    /// JSON for log aggregation.
    Json,
}

/// Which transport the session uses.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSettings {
    /// Transport kind.
    pub kind: DeviceKind,

    /// Serial port path, e.g. "/dev/ttyUSB0" (serial transport only).
    pub port: Option<String>,

    /// Serial baud rate.
    #[serde(default = "default_baud")]
    pub baud: u32,
}

/// Supported transport kinds.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// In-memory simulated meter; no hardware required.
    Mock,
    /// Real serial device (requires the `transport_serial` feature).
    Serial,
}

/// Acquisition loop tuning knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct AcquisitionSettings {
    /// Duration of one live capture window.
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// Sleep after a capture-window failure before re-opening the device.
    #[serde(default = "default_restart_delay", with = "humantime_serde")]
    pub restart_delay: Duration,

    /// Delay between device-open attempts.
    #[serde(default = "default_open_retry_delay", with = "humantime_serde")]
    pub open_retry_delay: Duration,

    /// Cap on device-open attempts; absent means retry indefinitely.
    pub open_retry_max: Option<u32>,

    /// Run scheduled commands on the background worker instead of inline.
    #[serde(default = "default_true")]
    pub async_commands: bool,

    /// Commands run once, in order, at session start (before any schedule).
    #[serde(default)]
    pub startup_commands: Vec<String>,

    /// Default retry count for commands without an override.
    #[serde(default = "default_retries")]
    pub default_retries: u32,

    /// Default backoff base; attempt N waits `backoff * N`.
    #[serde(default = "default_backoff", with = "humantime_serde")]
    pub default_backoff: Duration,

    /// Retry-count override for calibration-labelled schedule entries.
    pub calibration_retries: Option<u32>,

    /// Backoff override for calibration-labelled schedule entries.
    #[serde(default, with = "humantime_serde::option")]
    pub calibration_backoff: Option<Duration>,

    /// Yield between non-blocking lock attempts while the worker holds the
    /// transport.
    #[serde(default = "default_contention_yield", with = "humantime_serde")]
    pub contention_yield: Duration,

    /// Bound on waiting for the worker to finish at shutdown.
    #[serde(default = "default_worker_join_timeout", with = "humantime_serde")]
    pub worker_join_timeout: Duration,

    /// Optional total runtime budget for the loop.
    #[serde(default, with = "humantime_serde::option")]
    pub max_runtime: Option<Duration>,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            window: default_window(),
            restart_delay: default_restart_delay(),
            open_retry_delay: default_open_retry_delay(),
            open_retry_max: None,
            async_commands: true,
            startup_commands: Vec::new(),
            default_retries: default_retries(),
            default_backoff: default_backoff(),
            calibration_retries: None,
            calibration_backoff: None,
            contention_yield: default_contention_yield(),
            worker_join_timeout: default_worker_join_timeout(),
            max_runtime: None,
        }
    }
}

/// Output sink settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputSettings {
    /// Line-delimited-JSON capture file; logging-only ingestion when absent.
    pub jsonl_path: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud() -> u32 {
    9600
}

fn default_window() -> Duration {
    Duration::from_secs(2)
}

fn default_restart_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_open_retry_delay() -> Duration {
    Duration::from_secs(3)
}

fn default_retries() -> u32 {
    2
}

fn default_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_contention_yield() -> Duration {
    Duration::from_millis(50)
}

fn default_worker_join_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Load and validate settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let parsed = Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(ConfigError::Parse)?;
        let settings: Settings = parsed.try_deserialize().map_err(ConfigError::Parse)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation of parsed settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.kind == DeviceKind::Serial
            && self.device.port.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::Validation(
                "device.kind = \"serial\" requires device.port".to_string(),
            ));
        }
        if self.acquisition.window.is_zero() {
            return Err(ConfigError::Validation(
                "acquisition.window must be greater than zero".to_string(),
            ));
        }
        for entry in &self.schedule {
            if entry.interval.is_some_and(|i| i.is_zero()) {
                return Err(ConfigError::Validation(format!(
                    "schedule entry '{}': interval must be greater than zero",
                    entry.command
                )));
            }
            if entry.max_runs.is_some_and(|m| m == 0) {
                return Err(ConfigError::Validation(format!(
                    "schedule entry '{}': max_runs must be greater than zero",
                    entry.command
                )));
            }
        }
        Ok(())
    }

    /// Schedule entries whose command name is missing from `[commands]`.
    /// Not a load error; the loop disables these slots and audits them.
    pub fn undefined_schedule_commands(&self) -> Vec<&str> {
        self.schedule
            .iter()
            .map(|e| e.command.as_str())
            .filter(|name| !self.commands.contains_key(*name))
            .collect()
    }
}
