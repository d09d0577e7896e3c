use tracing_subscriber::EnvFilter;

use crate::config::VALID_LOG_LEVELS;
use crate::error::WaddleError;

/// Build the filter used by [`init_tracing`]. `RUST_LOG` wins over the
/// configured level.
pub fn env_filter(level: &str) -> Result<EnvFilter, WaddleError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    if !VALID_LOG_LEVELS.contains(&level) {
        return Err(WaddleError::Logging(format!("unknown log level '{level}'")));
    }

    EnvFilter::try_new(level).map_err(|error| WaddleError::Logging(error.to_string()))
}

/// Install the global fmt subscriber. Calling it twice is an error, not a panic.
pub fn init_tracing(level: &str) -> Result<(), WaddleError> {
    let filter = env_filter(level)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| WaddleError::Logging(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_level_without_rust_log() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(matches!(env_filter("loud"), Err(WaddleError::Logging(_))));
    }

    #[test]
    fn second_init_reports_error() {
        let _ = init_tracing("info");
        assert!(init_tracing("info").is_err());
    }
}
