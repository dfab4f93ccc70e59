//! Tracing/logging initialization.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    Json,
    /// Human-readable, for local runs.
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset.
    pub default_directive: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            default_directive: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// `SEGFORGE_LOG_FORMAT` = `json` | `pretty`; anything else keeps JSON.
    pub fn from_env() -> Self {
        Self::from_format_var(std::env::var("SEGFORGE_LOG_FORMAT").ok().as_deref())
    }

    fn from_format_var(raw: Option<&str>) -> Self {
        let format = match raw.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        };
        Self {
            format,
            ..Self::default()
        }
    }
}

/// Install the global subscriber. Filtering follows `RUST_LOG`, falling back
/// to `cfg.default_directive`.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_with(cfg: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.default_directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_thread_names(true);

    let _ = match cfg.format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_var_selects_output() {
        assert_eq!(LogConfig::from_format_var(Some("pretty")).format, LogFormat::Pretty);
        assert_eq!(LogConfig::from_format_var(Some(" PRETTY ")).format, LogFormat::Pretty);
        assert_eq!(LogConfig::from_format_var(Some("xml")).format, LogFormat::Json);
        assert_eq!(LogConfig::from_format_var(None), LogConfig::default());
    }

    #[test]
    fn repeated_init_is_a_no_op() {
        init_with(&LogConfig::default());
        init_with(&LogConfig {
            format: LogFormat::Pretty,
            ..LogConfig::default()
        });
    }
}
