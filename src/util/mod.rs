//! Utility module
//!
//! This module provides common utilities and helper functions used
//! throughout the library.

use std::time::Duration;

/// Installs a formatted tracing subscriber honoring `RUST_LOG`.
///
/// For binaries and tests; calling it twice is harmless.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Converts a duration to a floating-point number of seconds
pub fn duration_to_secs(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

/// Converts a floating-point number of seconds to a duration
pub fn secs_to_duration(secs: f64) -> Duration {
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_conversion() {
        let duration = Duration::from_secs_f64(1.5);
        let secs = duration_to_secs(duration);
        assert_eq!(secs, 1.5);
        let duration2 = secs_to_duration(secs);
        assert_eq!(duration, duration2);
    }

    #[test]
    fn test_init_logging_idempotent() {
        init_logging();
        init_logging();
    }
}
