mod logging;
mod metrics;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{HistogramSummary, MetricType, MetricsQuery, MetricsRecorder, MetricsSnapshot};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Settings for logging and metrics.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Base log level; a set RUST_LOG always wins.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "tether_sync" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Persist warn and error events to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
    pub metrics_enabled: bool,
    pub metrics_db_path: PathBuf,
    /// Seconds between metric snapshots.
    pub metrics_snapshot_interval_secs: u64,
    /// Days of metric history to keep.
    pub metrics_retention_days: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        let tether_dir = tether_home();
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            log_to_sqlite: true,
            log_db_path: tether_dir.join("database/logs.db"),
            metrics_enabled: true,
            metrics_db_path: tether_dir.join("database/metrics.db"),
            metrics_snapshot_interval_secs: 60,
            metrics_retention_days: 7,
        }
    }
}

/// Handles to the telemetry backends. Keep alive for the process lifetime.
pub struct TelemetryGuard {
    config: TelemetryConfig,
    log_sink: Option<Arc<SqliteLogSink>>,
    metrics_recorder: Option<Arc<MetricsRecorder>>,
}

impl TelemetryGuard {
    /// The configuration this guard was initialized with.
    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Recorder handle, if metrics are enabled.
    pub fn metrics(&self) -> Option<Arc<MetricsRecorder>> {
        self.metrics_recorder.clone()
    }

    /// Persisted-log sink, if enabled.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// RUST_LOG-style directive string from the configured levels.
fn filter_directives(config: &TelemetryConfig) -> String {
    let mut directives = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        directives.push_str(&format!(",{module}={}", level.to_string().to_lowercase()));
    }
    directives
}

fn build_env_filter(config: &TelemetryConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)))
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_span_list(true)
        .with_filter(build_env_filter(&config));

    let log_sink = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => Some(Arc::new(sink)),
            Err(e) => {
                // Subscriber is not up yet, so this goes to stderr directly
                eprintln!(
                    "failed to open log database {}: {e}",
                    config.log_db_path.display()
                );
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(log_sink.clone().map(SqliteLogLayer::new))
        .init();

    let metrics_recorder = if config.metrics_enabled {
        match MetricsRecorder::new(&config.metrics_db_path) {
            Ok(recorder) => Some(Arc::new(recorder)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to open metrics database");
                None
            }
        }
    } else {
        None
    };

    TelemetryGuard {
        config,
        log_sink,
        metrics_recorder,
    }
}

/// ~/.tether, or /tmp/.tether when HOME is unset.
fn tether_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".tether")
}
