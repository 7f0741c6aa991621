//! Session timing configuration.

use crate::correlator::DEFAULT_QUERY_TIMEOUT;
use crate::transport::DEFAULT_BAUD_RATE;
use std::time::Duration;

/// Baud rate and settling delays used by [`DeviceSession`](super::DeviceSession).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Console baud rate used when re-attaching after a reset.
    pub baud_rate: u32,
    /// Wait between closing the link after reset and reopening it.
    pub reboot_settle: Duration,
    /// Wait after starting the monitor for the application to boot.
    pub boot_settle: Duration,
    /// Wait after stopping the monitor before flashing.
    pub flash_settle: Duration,
    /// Timeout for correlated queries.
    pub query_timeout: Duration,
    /// Read timeout of each monitor poll.
    pub read_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            reboot_settle: Duration::from_millis(1000),
            boot_settle: Duration::from_millis(2000),
            flash_settle: Duration::from_millis(200),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            read_timeout: Duration::from_millis(50),
        }
    }
}

impl SessionConfig {
    /// Set the console baud rate.
    #[must_use]
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the post-reset reattach delay.
    #[must_use]
    pub fn with_reboot_settle(mut self, delay: Duration) -> Self {
        self.reboot_settle = delay;
        self
    }

    /// Set the application boot delay.
    #[must_use]
    pub fn with_boot_settle(mut self, delay: Duration) -> Self {
        self.boot_settle = delay;
        self
    }

    /// Set the pre-flash delay.
    #[must_use]
    pub fn with_flash_settle(mut self, delay: Duration) -> Self {
        self.flash_settle = delay;
        self
    }

    /// Set the correlated query timeout.
    #[must_use]
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Set the monitor read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.reboot_settle, Duration::from_secs(1));
        assert_eq!(config.boot_settle, Duration::from_secs(2));
        assert_eq!(config.flash_settle, Duration::from_millis(200));
        assert_eq!(config.query_timeout, Duration::from_secs(5));
        assert_eq!(config.read_timeout, Duration::from_millis(50));
    }
}
