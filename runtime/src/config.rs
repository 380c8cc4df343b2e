//! Bus configuration.

use std::time::Duration;

/// Configuration for [`Bus`](crate::bus::Bus) instances
///
/// # Example
///
/// ```
/// use scopebus_runtime::BusConfig;
/// use std::time::Duration;
///
/// let config = BusConfig::default()
///     .with_queue_name("orders")
///     .with_drain_timeout(Some(Duration::from_secs(10)))
///     .with_concurrency_limit(Some(16));
///
/// assert_eq!(config.concurrency_limit, Some(16));
/// ```
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Name of the receive queue, used in logs and metric labels
    pub queue_name: String,
    /// Maximum time `stop` waits for in-flight messages (`None` waits forever)
    pub drain_timeout: Option<Duration>,
    /// Maximum number of messages consumed concurrently from the transport
    pub concurrency_limit: Option<usize>,
    /// Capacity of the fault broadcast channel
    pub fault_channel_capacity: usize,
}

impl BusConfig {
    /// Create a new configuration with custom values
    #[must_use]
    pub fn new(
        queue_name: impl Into<String>,
        drain_timeout: Option<Duration>,
        concurrency_limit: Option<usize>,
        fault_channel_capacity: usize,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            drain_timeout,
            concurrency_limit,
            fault_channel_capacity,
        }
    }

    /// Set the receive queue name
    #[must_use]
    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    /// Set the default drain timeout
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the concurrency limit
    #[must_use]
    pub const fn with_concurrency_limit(mut self, limit: Option<usize>) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Set the fault channel capacity
    #[must_use]
    pub const fn with_fault_channel_capacity(mut self, capacity: usize) -> Self {
        self.fault_channel_capacity = capacity;
        self
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_name: "input_queue".to_string(),
            drain_timeout: Some(Duration::from_secs(30)),
            concurrency_limit: None,
            fault_channel_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_config_default() {
        let config = BusConfig::default();
        assert_eq!(config.queue_name, "input_queue");
        assert_eq!(config.drain_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.concurrency_limit, None);
        assert_eq!(config.fault_channel_capacity, 256);
    }

    #[test]
    fn test_bus_config_builder() {
        let config = BusConfig::default()
            .with_drain_timeout(None)
            .with_concurrency_limit(Some(4))
            .with_fault_channel_capacity(8);

        assert_eq!(config.drain_timeout, None);
        assert_eq!(config.concurrency_limit, Some(4));
        assert_eq!(config.fault_channel_capacity, 8);
    }

    #[test]
    fn test_bus_config_new() {
        let config = BusConfig::new("orders", Some(Duration::from_secs(5)), Some(2), 16);
        assert_eq!(config.queue_name, "orders");
        assert_eq!(config.drain_timeout, Some(Duration::from_secs(5)));
    }
}
