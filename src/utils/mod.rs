//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `mqbroker` crate.
//!
//! This module centralizes reusable components, such as the error types,
//! logging setup and the wall clock used for retry bookkeeping.

pub mod error;
pub mod logging;

pub use error::{BrokerError, Error, PersistenceError, ProtocolError, Result};

/// Milliseconds since the UNIX epoch.
///
/// All in-flight timestamps and retained-message timestamps use this clock.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
        logging::init("nonsense");
    }

    #[test]
    fn now_millis_is_monotonic_enough() {
        let a = super::now_millis();
        let b = super::now_millis();
        assert!(b >= a);
        assert!(a > 1_500_000_000_000);
    }
}
