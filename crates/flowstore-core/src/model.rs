// Application configuration
// Typed access to configuration values used by flowstore nodes

/// Application configuration wrapper
#[derive(Clone, Debug)]
pub struct Configuration {
    pub config: config::Config,
}

impl Default for Configuration {
    fn default() -> Self {
        Self::from_config(config::Config::default())
    }
}

impl Configuration {
    /// Create a new configuration from a Config instance
    pub fn from_config(config: config::Config) -> Self {
        Self { config }
    }

    /// Non-negative integer at `key`; negative or missing values use `default`
    fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.config
            .get_int(key)
            .ok()
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(default)
    }

    fn get_usize(&self, key: &str, default: usize) -> usize {
        self.config
            .get_int(key)
            .ok()
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(default)
    }

    /// Identifier of the local cluster node
    pub fn node_id(&self) -> String {
        self.config
            .get_string("flowstore.node.id")
            .unwrap_or_else(|_| "node-1".to_string())
    }

    // ===================== Flow Rule Store Configuration =====================

    /// Get how long a pending batch completion is kept in milliseconds (default: 300000ms = 5 minutes)
    pub fn completion_timeout_ms(&self) -> u64 {
        self.get_u64("flowstore.store.completion-timeout", 300000)
    }

    /// Get the expired completion sweep interval in milliseconds (default: 1000ms)
    pub fn completion_sweep_interval_ms(&self) -> u64 {
        self.get_u64("flowstore.store.completion-sweep-interval", 1000)
    }

    /// Check if lookups may be served by a node that is not the device master
    pub fn allow_non_master_reads(&self) -> bool {
        self.config
            .get_bool("flowstore.store.allow-non-master-reads")
            .unwrap_or(false)
    }

    /// Get the forwarded lookup timeout in milliseconds (default: 5000ms)
    pub fn lookup_timeout_ms(&self) -> u64 {
        self.get_u64("flowstore.store.lookup-timeout", 5000)
    }

    /// Get the forwarded batch timeout in milliseconds (default: the completion timeout)
    pub fn batch_forward_timeout_ms(&self) -> u64 {
        self.get_u64(
            "flowstore.store.batch-forward-timeout",
            self.completion_timeout_ms(),
        )
    }

    /// Get the per-subscriber event queue size (default: 1024)
    pub fn event_queue_size(&self) -> usize {
        self.get_usize("flowstore.store.event-queue-size", 1024)
    }

    /// Check if device tables are copied to backup nodes
    pub fn backup_enabled(&self) -> bool {
        self.config
            .get_bool("flowstore.store.backup.enabled")
            .unwrap_or(true)
    }

    /// Get the backup worker queue size (default: 1024)
    pub fn backup_queue_size(&self) -> usize {
        self.get_usize("flowstore.store.backup.queue-size", 1024)
    }

    // ===================== Simulation Configuration =====================

    /// Get the number of simulated nodes (default: 3)
    pub fn simulation_nodes(&self) -> usize {
        self.get_usize("flowstore.simulation.nodes", 3)
    }

    /// Get the number of simulated devices (default: 6)
    pub fn simulation_devices(&self) -> usize {
        self.get_usize("flowstore.simulation.devices", 6)
    }

    /// Get the number of batches to submit (default: 60)
    pub fn simulation_batches(&self) -> usize {
        self.get_usize("flowstore.simulation.batches", 60)
    }

    /// Get the number of rules per submitted batch (default: 8)
    pub fn simulation_rules_per_batch(&self) -> usize {
        self.get_usize("flowstore.simulation.rules-per-batch", 8)
    }

    /// Get the fraction of rules the loopback delegate fails (default: 0.05)
    pub fn simulation_failure_rate(&self) -> f64 {
        self.config
            .get_float("flowstore.simulation.failure-rate")
            .unwrap_or(0.05)
    }

    /// Get the simulated install delay in milliseconds (default: 20ms)
    pub fn simulation_install_delay_ms(&self) -> u64 {
        self.get_u64("flowstore.simulation.install-delay", 20)
    }

    // ===================== Logging Configuration =====================

    /// Get the log directory, if configured
    pub fn log_dir(&self) -> Option<String> {
        self.config.get_string("flowstore.logs.path").ok()
    }

    /// Get the log level (default: info)
    pub fn log_level(&self) -> String {
        self.config
            .get_string("flowstore.logs.level")
            .unwrap_or_else(|_| "info".to_string())
    }

    /// Check if console logging is enabled
    pub fn log_console_enabled(&self) -> bool {
        self.config
            .get_bool("flowstore.logs.console")
            .unwrap_or(true)
    }

    /// Check if file logging is enabled
    pub fn log_file_enabled(&self) -> bool {
        self.config.get_bool("flowstore.logs.file").unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Configuration::default();
        assert_eq!(config.node_id(), "node-1");
        assert_eq!(config.completion_timeout_ms(), 300000);
        assert_eq!(config.batch_forward_timeout_ms(), 300000);
        assert_eq!(config.lookup_timeout_ms(), 5000);
        assert!(!config.allow_non_master_reads());
        assert!(config.backup_enabled());
        assert_eq!(config.event_queue_size(), 1024);
        assert!(!config.log_file_enabled());
        assert_eq!(config.simulation_nodes(), 3);
        assert_eq!(config.simulation_install_delay_ms(), 20);
    }

    #[test]
    fn test_overrides() {
        let config = config::Config::builder()
            .set_default("flowstore.node.id", "10.0.0.2")
            .unwrap()
            .set_default("flowstore.store.completion-timeout", 2000)
            .unwrap()
            .set_default("flowstore.store.allow-non-master-reads", true)
            .unwrap()
            .build()
            .unwrap();
        let config = Configuration::from_config(config);

        assert_eq!(config.node_id(), "10.0.0.2");
        assert_eq!(config.completion_timeout_ms(), 2000);
        // Forward timeout follows the completion timeout unless set
        assert_eq!(config.batch_forward_timeout_ms(), 2000);
        assert!(config.allow_non_master_reads());
    }

    #[test]
    fn test_negative_values_fall_back_to_defaults() {
        let config = config::Config::builder()
            .set_default("flowstore.store.completion-timeout", -5)
            .unwrap()
            .set_default("flowstore.store.event-queue-size", -1)
            .unwrap()
            .set_default("flowstore.store.batch-forward-timeout", -100)
            .unwrap()
            .set_default("flowstore.simulation.nodes", -3)
            .unwrap()
            .build()
            .unwrap();
        let config = Configuration::from_config(config);

        assert_eq!(config.completion_timeout_ms(), 300000);
        assert_eq!(config.batch_forward_timeout_ms(), 300000);
        assert_eq!(config.event_queue_size(), 1024);
        assert_eq!(config.simulation_nodes(), 3);
    }
}
