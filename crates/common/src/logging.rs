//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Environment switch that turns on debug output when no level is given
pub const DEBUG_ENV_VAR: &str = "ENABLE_DEBUG";

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` takes precedence over `default_level`.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| crate::Error::Other(format!("Logging already initialized: {}", e)))?;

    Ok(())
}

/// `debug` when `ENABLE_DEBUG` is set to a non-zero integer, otherwise `fallback`.
pub fn level_from_env(fallback: &str) -> String {
    debug_enabled(std::env::var(DEBUG_ENV_VAR).ok().as_deref())
        .then(|| "debug".to_string())
        .unwrap_or_else(|| fallback.to_string())
}

fn debug_enabled(value: Option<&str>) -> bool {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .is_some_and(|v| v != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_enabled() {
        assert!(debug_enabled(Some("1")));
        assert!(debug_enabled(Some(" 2 ")));
        assert!(!debug_enabled(Some("0")));
        assert!(!debug_enabled(Some("yes")));
        assert!(!debug_enabled(None));
    }
}
