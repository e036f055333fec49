//! Data service configuration.

use crate::error::{DataError, DataResult};
use std::time::Duration;

/// Smallest accepted disconnect delay.
const MIN_DISCONNECT_DELAY: Duration = Duration::from_millis(200);

/// Configuration for a [`DataService`](crate::DataService).
///
/// `app_name` is required and identifies the application the service
/// belongs to; everything else has defaults.
#[derive(Debug, Clone)]
pub struct DataConfig {
    /// Name of the application this service serves.
    pub app_name: String,

    /// Operations between consistency checks of the reference cache.
    /// The default effectively disables the check; it is a debugging aid.
    pub debug_check_interval: u32,

    /// Whether to snapshot clean reads and detect unmarked modifications
    /// at prepare time.
    pub detect_modifications: bool,

    /// Deadline given to each transaction attempt.
    pub txn_timeout: Duration,

    /// Wall-clock budget for retrying aborted transactions.
    pub retry_timeout: Duration,

    /// Upper bound on attempts per task regardless of remaining budget.
    pub max_retries: u32,

    /// How long `shutdown` waits for in-flight work to drain.
    pub shutdown_timeout: Duration,

    /// Minimum delay before a disconnected client is reaped. Values below
    /// 200 ms are rejected at validation.
    pub disconnect_delay: Duration,
}

impl DataConfig {
    /// Creates a configuration for `app_name` with default values.
    #[must_use]
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            debug_check_interval: u32::MAX,
            detect_modifications: true,
            txn_timeout: Duration::from_millis(500),
            retry_timeout: Duration::from_secs(5),
            max_retries: 100,
            shutdown_timeout: Duration::from_secs(5),
            disconnect_delay: Duration::from_secs(1),
        }
    }

    /// Sets the debug check interval.
    #[must_use]
    pub const fn debug_check_interval(mut self, value: u32) -> Self {
        self.debug_check_interval = value;
        self
    }

    /// Sets whether unmarked modifications are detected at prepare.
    #[must_use]
    pub const fn detect_modifications(mut self, value: bool) -> Self {
        self.detect_modifications = value;
        self
    }

    /// Sets the per-attempt transaction deadline.
    #[must_use]
    pub const fn txn_timeout(mut self, value: Duration) -> Self {
        self.txn_timeout = value;
        self
    }

    /// Sets the wall-clock retry budget.
    #[must_use]
    pub const fn retry_timeout(mut self, value: Duration) -> Self {
        self.retry_timeout = value;
        self
    }

    /// Sets the attempt cap.
    #[must_use]
    pub const fn max_retries(mut self, value: u32) -> Self {
        self.max_retries = value;
        self
    }

    /// Sets the shutdown drain deadline.
    #[must_use]
    pub const fn shutdown_timeout(mut self, value: Duration) -> Self {
        self.shutdown_timeout = value;
        self
    }

    /// Sets the disconnect delay.
    #[must_use]
    pub const fn disconnect_delay(mut self, value: Duration) -> Self {
        self.disconnect_delay = value;
        self
    }

    /// Validates the configuration.
    pub(crate) fn validate(&self) -> DataResult<()> {
        if self.app_name.is_empty() {
            return Err(DataError::InvalidConfig {
                message: "app_name must not be empty".to_string(),
            });
        }
        if self.txn_timeout.is_zero() {
            return Err(DataError::InvalidConfig {
                message: "txn_timeout must be positive".to_string(),
            });
        }
        if self.max_retries == 0 {
            return Err(DataError::InvalidConfig {
                message: "max_retries must be at least 1".to_string(),
            });
        }
        if self.disconnect_delay < MIN_DISCONNECT_DELAY {
            return Err(DataError::InvalidConfig {
                message: format!(
                    "disconnect_delay must be at least {} ms",
                    MIN_DISCONNECT_DELAY.as_millis()
                ),
            });
        }
        Ok(())
    }
}
