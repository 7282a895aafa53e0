//! Logging infrastructure for procflow.
//!
//! The owning process installs one global subscriber with [`init`]. Replicas
//! are forked and inherit it; when a worker is given a log directory, each
//! replica additionally writes to its own `<worker>_<pid>.log` through a
//! scoped dispatcher built by [`replica_dispatch`].
//!
//! # Environment Variables
//!
//! - `PROCFLOW_LOG` - Log filter (overrides RUST_LOG)
//! - `PROCFLOW_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `PROCFLOW_LOG_FORMAT` - Output format: pretty, compact, json
//! - `RUST_LOG` - Standard Rust log filter (fallback)

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{Dispatch, Level};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{ProcflowError, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format (default for development)
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Logging configuration for the owning process.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    /// Log format (default: Pretty)
    pub format: LogFormat,
    /// Main-process log file in addition to stderr
    pub file_path: Option<PathBuf>,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    /// Show target module in logs (default: true)
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            filter: None,
            show_target: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// CLI arguments take precedence: if a filter is already set, the
    /// filter variables are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("PROCFLOW_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level_str) = std::env::var("PROCFLOW_LOG_LEVEL")
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("PROCFLOW_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        if let Some(ref filter) = self.filter {
            EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                EnvFilter::new(format!("{}", self.level).to_lowercase())
            })
        } else {
            EnvFilter::new(format!("{}", self.level).to_lowercase())
        }
    }
}

/// Parse a log level string.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn stderr_layer(format: LogFormat, show_target: bool) -> BoxedLayer {
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(show_target)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(show_target)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(show_target)
            .with_writer(std::io::stderr)
            .boxed(),
    }
}

fn file_layer(format: LogFormat, appender: RollingFileAppender) -> BoxedLayer {
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(appender)
            .boxed(),
        LogFormat::Compact | LogFormat::Pretty => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_writer(appender)
            .boxed(),
    }
}

/// Open `<dir>/<file_name>` for appending, creating the directory if needed.
fn open_appender(dir: &Path, file_name: &str) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(dir).map_err(|e| {
        ProcflowError::Logging(format!("cannot create log directory {}: {}", dir.display(), e))
    })?;
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(dir)
        .map_err(|e| {
            ProcflowError::Logging(format!(
                "cannot open {} in {}: {}",
                file_name,
                dir.display(),
                e
            ))
        })
}

/// Initialize the global tracing subscriber.
///
/// Call once at startup; subsequent calls are silently ignored. A log file
/// that cannot be opened is reported on stderr and skipped.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();

    let file = config.file_path.as_ref().and_then(|path| {
        let dir = path.parent().unwrap_or(Path::new("."));
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("procflow.log");
        match open_appender(dir, name) {
            Ok(appender) => Some(file_layer(config.format, appender)),
            Err(e) => {
                eprintln!("Warning: {}", e);
                None
            }
        }
    });

    let mut layers = vec![stderr_layer(config.format, config.show_target)];
    layers.extend(file);

    let result = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init();

    // Silently ignore if already initialized (idempotent)
    let _ = result;
}

/// Per-replica logging settings carried by a worker spec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerLogging {
    /// Directory for `<worker>_<pid>.log` files. `None` logs through the
    /// inherited global subscriber only.
    pub log_dir: Option<PathBuf>,
    /// Format for the per-replica file.
    pub format: LogFormat,
}

impl WorkerLogging {
    pub fn to_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: Some(dir.into()),
            format: LogFormat::default(),
        }
    }
}

/// Name of the log file a replica writes to.
pub fn replica_log_name(worker: &str, pid: i32) -> String {
    format!("{}_{}.log", worker, pid)
}

/// Build the dispatcher a replica runs its body under.
///
/// Without a log directory this is the inherited global dispatcher. With
/// one, it is a fresh subscriber writing to stderr and to the replica's own
/// file. An error here is a per-process setup failure.
pub fn replica_dispatch(worker: &str, pid: i32, logging: &WorkerLogging) -> Result<Dispatch> {
    let Some(dir) = logging.log_dir.as_deref() else {
        return Ok(tracing::dispatcher::get_default(|current| current.clone()));
    };

    let appender = open_appender(dir, &replica_log_name(worker, pid))?;
    let filter = LogConfig::new().with_env_overrides().build_filter();
    let layers = vec![
        stderr_layer(logging.format, true),
        file_layer(logging.format, appender),
    ];
    let subscriber = tracing_subscriber::registry().with(layers).with(filter);
    Ok(Dispatch::new(subscriber))
}
