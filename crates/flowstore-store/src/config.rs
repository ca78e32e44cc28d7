// Flow rule store configuration

use std::time::Duration;

use flowstore_core::Configuration;

/// Flow rule store configuration
#[derive(Clone, Debug)]
pub struct FlowStoreConfig {
    /// How long a pending batch completion may stay unresolved
    pub completion_timeout: Duration,
    /// How often expired completions are swept
    pub completion_sweep_interval: Duration,
    /// Serve lookups from a backup copy on a non-master node
    pub allow_non_master_reads: bool,
    /// Timeout for forwarded lookups
    pub lookup_timeout: Duration,
    /// Timeout for a forwarded batch, including the remote completion
    pub batch_forward_timeout: Duration,
    /// Per-subscriber event queue capacity
    pub event_queue_size: usize,
    /// Push device tables to backup nodes
    pub backup_enabled: bool,
    /// Capacity of the backup worker queue
    pub backup_queue_size: usize,
}

impl Default for FlowStoreConfig {
    fn default() -> Self {
        Self {
            completion_timeout: Duration::from_secs(300),
            completion_sweep_interval: Duration::from_millis(1000),
            allow_non_master_reads: false,
            lookup_timeout: Duration::from_millis(5000),
            batch_forward_timeout: Duration::from_secs(300),
            event_queue_size: 1024,
            backup_enabled: true,
            backup_queue_size: 1024,
        }
    }
}

impl FlowStoreConfig {
    pub fn from_configuration(configuration: &Configuration) -> Self {
        Self {
            completion_timeout: Duration::from_millis(configuration.completion_timeout_ms()),
            completion_sweep_interval: Duration::from_millis(
                configuration.completion_sweep_interval_ms().max(1),
            ),
            allow_non_master_reads: configuration.allow_non_master_reads(),
            lookup_timeout: Duration::from_millis(configuration.lookup_timeout_ms()),
            batch_forward_timeout: Duration::from_millis(configuration.batch_forward_timeout_ms()),
            event_queue_size: configuration.event_queue_size().max(1),
            backup_enabled: configuration.backup_enabled(),
            backup_queue_size: configuration.backup_queue_size().max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_configuration_defaults() {
        let from_config = FlowStoreConfig::from_configuration(&Configuration::default());
        let default = FlowStoreConfig::default();

        assert_eq!(from_config.completion_timeout, default.completion_timeout);
        assert_eq!(from_config.batch_forward_timeout, default.batch_forward_timeout);
        assert_eq!(from_config.lookup_timeout, default.lookup_timeout);
        assert_eq!(from_config.event_queue_size, default.event_queue_size);
        assert!(!from_config.allow_non_master_reads);
        assert!(from_config.backup_enabled);
    }
}
