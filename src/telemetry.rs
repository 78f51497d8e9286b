//! Structured logging setup
//!
//! The library only emits `tracing` events; binaries and demos opt into a
//! subscriber with [`init`]. The filter is read from `MPOST_LOG`, falling back
//! to `RUST_LOG` and then to `info`.

use tracing_subscriber::EnvFilter;

use crate::{Error, Result};

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "MPOST_LOG";

const DEFAULT_DIRECTIVE: &str = "info";

/// Filter built from the environment, without installing anything.
#[must_use]
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install a formatting subscriber as the global default.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] if a global subscriber is already set.
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .try_init()
        .map_err(|e| Error::InvalidConfig(format!("logging already initialised: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        // Another test may have installed a subscriber first; either way the
        // second call in this test must fail.
        let _ = init();
        assert!(matches!(init(), Err(Error::InvalidConfig(_))));
    }
}
