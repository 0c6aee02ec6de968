//! Structured logging setup

use tracing_subscriber::EnvFilter;
use watchsync_core::WatchSyncError;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "watchsync=info";

/// Install a global `tracing` subscriber honouring `RUST_LOG`
pub fn init_logging() -> Result<(), WatchSyncError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    install(filter)
}

/// Install a global subscriber with explicit filter directives
pub fn init_logging_with(directives: &str) -> Result<(), WatchSyncError> {
    let filter = EnvFilter::try_new(directives).map_err(|e| WatchSyncError::Initialization {
        reason: format!("invalid log filter '{}': {}", directives, e),
    })?;
    install(filter)
}

fn install(filter: EnvFilter) -> Result<(), WatchSyncError> {
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| WatchSyncError::Initialization {
            reason: format!("logging already initialized: {}", e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_initialization_fails() {
        let _ = init_logging_with("watchsync=debug");
        let error = init_logging().unwrap_err();
        assert_eq!(error.error_code(), "INITIALIZATION_FAILED");
    }
}
