//! Log setup for the `chathub` binary.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the program embedding it. Logs go to stderr so that the answer on
//! stdout stays clean.
//!
//! ## Environment Variables
//!
//! - `CHATHUB_LOG` or `RUST_LOG`: filter directive (e.g. `chathub=debug,warn`)
//! - `CHATHUB_LOG_FORMAT`: `pretty`, `compact` or `json`

use std::str::FromStr;

use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_FILTER: &str = "chathub=info,warn";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Pretty,
    /// Single-line output
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive in `EnvFilter` syntax
    pub filter: String,
    pub format: LogFormat,
    /// Include file and line of each event
    pub with_file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::default(),
            with_file: false,
        }
    }
}

impl LogConfig {
    /// Read `CHATHUB_LOG`, `RUST_LOG` and `CHATHUB_LOG_FORMAT`.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let filter = var("CHATHUB_LOG")
            .or_else(|| var("RUST_LOG"))
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let format = var("CHATHUB_LOG_FORMAT")
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        Self {
            filter,
            format,
            ..Default::default()
        }
    }

    /// Everything this crate logs, with source locations.
    pub fn debug() -> Self {
        Self {
            filter: "chathub=debug,info".to_string(),
            with_file: true,
            ..Default::default()
        }
    }

    /// JSON output for log collectors.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            ..Default::default()
        }
    }
}

/// Install the global subscriber.
///
/// Fails when a global subscriber is already installed; the existing one
/// stays in effect.
pub fn init(config: LogConfig) -> Result<(), SetGlobalDefaultError> {
    let env_filter =
        EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_file(config.with_file)
        .with_line_number(config.with_file);

    let registry = tracing_subscriber::registry().with(env_filter);
    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(registry.with(layer.json())),
        LogFormat::Compact => {
            tracing::subscriber::set_global_default(registry.with(layer.compact()))
        }
        LogFormat::Pretty => tracing::subscriber::set_global_default(registry.with(layer.pretty())),
    }
}

pub fn init_from_env() -> Result<(), SetGlobalDefaultError> {
    init(LogConfig::from_env())
}
