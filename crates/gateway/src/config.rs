//! Environment configuration.
//!
//! All knobs come from the environment (optionally via a `.env` file) with
//! defaults suitable for local development.

use crate::error::{GatewayError, Result};
use gt06::HemisphereMode;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable console lines.
    #[default]
    Console,
    /// One JSON document per event.
    Json,
}

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Device-facing TCP listener port.
    pub tcp_port: u16,
    /// Observer-facing HTTP/WebSocket port.
    pub http_port: u16,
    /// Prometheus exporter port.
    pub metrics_port: u16,
    /// Default log filter (ERROR/WARN/INFO/DEBUG), overridable via RUST_LOG.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Directory served on the observer HTTP side (the map UI).
    pub static_dir: PathBuf,
    /// Coordinate sign handling for location payloads.
    pub hemisphere: HemisphereMode,
    /// Per-IMEI pending update cap; oldest entries drop on overflow.
    pub queue_cap: usize,
    /// Idle read timeout for device sessions.
    pub device_idle: Duration,
    /// How long shutdown waits for per-IMEI queues to drain.
    pub drain_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_port: 5000,
            http_port: 8081,
            metrics_port: 9091,
            log_level: "info".to_string(),
            log_format: LogFormat::Console,
            static_dir: PathBuf::from("static"),
            hemisphere: HemisphereMode::Signed,
            queue_cap: 1024,
            device_idle: Duration::from_secs(300),
            drain_grace: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Read configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            tcp_port: parse_var("TCP_PORT", defaults.tcp_port)?,
            http_port: parse_var("HTTP_PORT", defaults.http_port)?,
            metrics_port: parse_var("METRICS_PORT", defaults.metrics_port)?,
            log_level: log_level_from_env()?,
            log_format: log_format_from_env()?,
            static_dir: env::var("STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.static_dir),
            hemisphere: hemisphere_from_env()?,
            queue_cap: parse_var("QUEUE_CAP", defaults.queue_cap)?,
            device_idle: Duration::from_secs(parse_var(
                "DEVICE_IDLE_SECS",
                defaults.device_idle.as_secs(),
            )?),
            drain_grace: Duration::from_secs(parse_var(
                "DRAIN_GRACE_SECS",
                defaults.drain_grace.as_secs(),
            )?),
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| GatewayError::Config(format!("{name} must be a number, got {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn log_level_from_env() -> Result<String> {
    match env::var("LOG_LEVEL") {
        Ok(raw) => match raw.to_ascii_uppercase().as_str() {
            "ERROR" => Ok("error".to_string()),
            "WARN" => Ok("warn".to_string()),
            "INFO" => Ok("info".to_string()),
            "DEBUG" => Ok("debug".to_string()),
            _ => Err(GatewayError::Config(format!(
                "LOG_LEVEL must be one of ERROR, WARN, INFO, DEBUG, got {raw:?}"
            ))),
        },
        Err(_) => Ok("info".to_string()),
    }
}

fn log_format_from_env() -> Result<LogFormat> {
    match env::var("LOG_FORMAT") {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "console" => Ok(LogFormat::Console),
            "json" => Ok(LogFormat::Json),
            _ => Err(GatewayError::Config(format!(
                "LOG_FORMAT must be console or json, got {raw:?}"
            ))),
        },
        Err(_) => Ok(LogFormat::Console),
    }
}

fn hemisphere_from_env() -> Result<HemisphereMode> {
    match env::var("HEMISPHERE_MODE") {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "signed" => Ok(HemisphereMode::Signed),
            "flags" => Ok(HemisphereMode::Flags),
            _ => Err(GatewayError::Config(format!(
                "HEMISPHERE_MODE must be signed or flags, got {raw:?}"
            ))),
        },
        Err(_) => Ok(HemisphereMode::Signed),
    }
}
