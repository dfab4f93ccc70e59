//! Process-wide logging setup shared by every binary and test harness.

/// Initialize tracing with the configuration from the environment.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(&tracing::LogConfig::from_env());
}

pub mod tracing;

pub use tracing::{LogConfig, LogFormat};
