//! Diagnostic log setup
//!
//! Builds a `tracing` dispatcher from a `LogConfig`: an optional file sink
//! plus an optional console mirror, both stamped with UTC time to the
//! millisecond. The dispatcher is returned to the caller rather than
//! installed, so only the binary decides what becomes the global default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::Dispatch;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Placeholder in `output_path` replaced with the run's start time
pub const TIMESTAMP_PLACEHOLDER: &str = "{timestamp}";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log file; `{timestamp}` is replaced with the run's start time
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default = "default_level")]
    pub minimum_level: String,
    #[serde(default = "default_mirror")]
    pub mirror_to_console: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_mirror() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            output_path: None,
            minimum_level: default_level(),
            mirror_to_console: default_mirror(),
        }
    }
}

impl LogConfig {
    /// Resolve the log file path for a run started at `timestamp`
    pub fn resolved_path(&self, timestamp: &str) -> Option<PathBuf> {
        self.output_path.as_ref().map(|path| {
            let path = path.to_string_lossy().replace(TIMESTAMP_PLACEHOLDER, timestamp);
            PathBuf::from(path)
        })
    }

    /// Level filter; a valid `RUST_LOG` takes precedence over `minimum_level`
    pub fn filter(&self) -> Result<EnvFilter> {
        let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
        self.filter_with_override(rust_log.as_deref())
    }

    fn filter_with_override(&self, rust_log: Option<&str>) -> Result<EnvFilter> {
        let configured = EnvFilter::try_new(&self.minimum_level)
            .with_context(|| format!("Invalid log level: {}", self.minimum_level))?;
        Ok(rust_log
            .and_then(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or(configured))
    }

    /// Build the dispatcher for a run started at `timestamp`
    pub fn dispatch(&self, timestamp: &str) -> Result<Dispatch> {
        let file_layer = match self.resolved_path(timestamp) {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("Failed to open log file: {}", path.display()))?;

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(Mutex::new(file))
                        .with_ansi(false)
                        .with_target(false)
                        .with_timer(ChronoUtc::new(TIMESTAMP_FORMAT.to_string())),
                )
            }
            None => None,
        };

        let console_layer = self.mirror_to_console.then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_timer(ChronoUtc::new(TIMESTAMP_FORMAT.to_string()))
        });

        let subscriber = tracing_subscriber::registry()
            .with(self.filter()?)
            .with(file_layer)
            .with(console_layer);

        Ok(Dispatch::new(subscriber))
    }
}
