//! File-based logging with per-component files.
//!
//! Components write to separate rolling log files next to a root file:
//!
//! | Log File       | Component                        | Target Prefixes   |
//! |----------------|----------------------------------|-------------------|
//! | flowstore.log  | Root logger (all components)     | (all)             |
//! | store.log      | Rule store and batch coordinator | flowstore_store   |
//! | cluster.log    | Mastership and messaging         | flowstore_core    |
//!
//! Log files are stored in `~/flowstore/logs` by default.
//! Override with `FLOWSTORE_LOG_DIR` or the `flowstore.logs.path` config key.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

const ROOT_LOG_FILE: &str = "flowstore.log";

struct ComponentLogDef {
    /// Log file name (e.g. "store.log")
    file_name: &'static str,
    /// Target module prefixes routed to this file
    targets: &'static [&'static str],
}

/// Each entry produces a separate rolling log file; the root file still
/// captures every event.
const COMPONENT_LOGS: &[ComponentLogDef] = &[
    ComponentLogDef {
        file_name: "store.log",
        targets: &["flowstore_store"],
    },
    ComponentLogDef {
        file_name: "cluster.log",
        targets: &["flowstore_core"],
    },
];

#[derive(Debug, Clone, Copy)]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

fn default_log_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(format!("{}/flowstore/logs", home))
}

/// Logging configuration for the entire application.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub console_output: bool,
    pub console_level: Level,
    pub file_logging: bool,
    pub file_level: Level,
    pub rotation: LogRotation,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            console_output: true,
            console_level: Level::INFO,
            file_logging: false,
            file_level: Level::INFO,
            rotation: LogRotation::Daily,
        }
    }
}

impl LoggingConfig {
    /// Create from environment variables.
    pub fn from_env() -> Self {
        let log_dir = std::env::var("FLOWSTORE_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_log_dir());

        let console_output = std::env::var("FLOWSTORE_LOG_CONSOLE")
            .map(|v| v.to_lowercase() != "false" && v != "0")
            .unwrap_or(true);

        let file_logging = std::env::var("FLOWSTORE_LOG_FILE")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(false);

        let console_level = std::env::var("FLOWSTORE_LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Level::INFO);

        let file_level = std::env::var("FLOWSTORE_LOG_FILE_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(console_level);

        Self {
            log_dir,
            console_output,
            console_level,
            file_logging,
            file_level,
            rotation: LogRotation::Daily,
        }
    }

    /// Create from application configuration.
    pub fn from_config(
        log_dir: Option<String>,
        console_output: bool,
        file_logging: bool,
        level: String,
    ) -> Self {
        let log_dir = log_dir.map(PathBuf::from).unwrap_or_else(default_log_dir);
        let level = level.parse().unwrap_or(Level::INFO);

        Self {
            log_dir,
            console_output,
            console_level: level,
            file_logging,
            file_level: level,
            rotation: LogRotation::Daily,
        }
    }
}

/// Keeps the non-blocking file writers alive.
///
/// Buffered output is flushed when the guard is dropped, so hold it for the
/// lifetime of the process.
pub struct LoggingGuard {
    _file_guards: Vec<WorkerGuard>,
}

/// Initialize console and file logging.
///
/// `RUST_LOG` overrides the configured level for the console and the root
/// file. Component files use per-layer [`Targets`] filters and capture every
/// level from their targets.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, Box<dyn std::error::Error>> {
    if config.file_logging {
        std::fs::create_dir_all(&config.log_dir)?;
    }

    let mut guards: Vec<WorkerGuard> = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.console_output {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.console_level.to_string()));
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_filter(filter);
        layers.push(Box::new(console_layer));
    }

    if config.file_logging {
        let root_appender =
            RollingFileAppender::new(config.rotation.into(), &config.log_dir, ROOT_LOG_FILE);
        let (root_nb, root_guard) = tracing_appender::non_blocking(root_appender);
        guards.push(root_guard);

        let root_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.file_level.to_string()));
        let root_layer = fmt::layer()
            .with_writer(root_nb)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(root_filter);
        layers.push(Box::new(root_layer));

        for component in COMPONENT_LOGS {
            let appender = RollingFileAppender::new(
                config.rotation.into(),
                &config.log_dir,
                component.file_name,
            );
            let (nb, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);

            let mut targets = Targets::new();
            for target in component.targets {
                targets = targets.with_target(*target, LevelFilter::TRACE);
            }

            let layer = fmt::layer()
                .with_writer(nb)
                .with_target(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_filter(targets);
            layers.push(Box::new(layer));
        }
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| format!("Failed to initialize logging: {}", e))?;

    if config.file_logging {
        tracing::info!(
            log_dir = %config.log_dir.display(),
            component_files = COMPONENT_LOGS.len(),
            "File logging initialized: {} (root) + {} component log files",
            ROOT_LOG_FILE,
            COMPONENT_LOGS.len()
        );
        for component in COMPONENT_LOGS {
            tracing::debug!(
                file = component.file_name,
                targets = ?component.targets,
                "Registered component log file"
            );
        }
    }

    Ok(LoggingGuard {
        _file_guards: guards,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert!(config.console_output);
        assert!(!config.file_logging);
        assert_eq!(config.console_level, Level::INFO);
        assert!(config.log_dir.ends_with("flowstore/logs"));
    }

    #[test]
    fn test_logging_config_from_config() {
        let config = LoggingConfig::from_config(
            Some("/tmp/flowstore-logs".to_string()),
            false,
            true,
            "debug".to_string(),
        );
        assert_eq!(config.log_dir, PathBuf::from("/tmp/flowstore-logs"));
        assert!(!config.console_output);
        assert!(config.file_logging);
        assert_eq!(config.console_level, Level::DEBUG);
        assert_eq!(config.file_level, Level::DEBUG);
    }

    #[test]
    fn test_unknown_level_falls_back_to_info() {
        let config = LoggingConfig::from_config(None, true, false, "loud".to_string());
        assert_eq!(config.console_level, Level::INFO);
    }

    #[test]
    fn test_log_rotation_conversion() {
        assert!(matches!(Rotation::from(LogRotation::Daily), Rotation::DAILY));
        assert!(matches!(
            Rotation::from(LogRotation::Hourly),
            Rotation::HOURLY
        ));
        assert!(matches!(Rotation::from(LogRotation::Never), Rotation::NEVER));
    }

    #[test]
    fn test_component_logs_cover_library_crates() {
        let targets: Vec<&str> = COMPONENT_LOGS
            .iter()
            .flat_map(|c| c.targets.iter().copied())
            .collect();
        assert!(targets.contains(&"flowstore_store"));
        assert!(targets.contains(&"flowstore_core"));
        for component in COMPONENT_LOGS {
            assert!(component.file_name.ends_with(".log"));
            assert_ne!(component.file_name, ROOT_LOG_FILE);
        }
    }
}
