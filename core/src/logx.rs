use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize `tracing` once. Respects `RUST_LOG`; falls back to `default_level`.
pub fn init(default_level: &str) {
    init_with(default_level, LogFormat::Text);
}

/// Like [`init`], emitting JSON lines.
pub fn init_json(default_level: &str) {
    init_with(default_level, LogFormat::Json);
}

/// Initialize `tracing` with an explicit format. Later calls are ignored.
pub fn init_with(default_level: &str, format: LogFormat) {
    let builder = fmt().with_env_filter(filter(default_level)).with_target(true);
    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
