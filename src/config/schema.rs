use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub data_sources: Vec<DataSourceConfig>,
    #[serde(default)]
    pub data_nodes: Vec<DataNodeConfig>,
}

impl Config {
    /// Look up a data source definition by name
    pub fn data_source(&self, name: &str) -> Option<&DataSourceConfig> {
        self.data_sources.iter().find(|ds| ds.name == name)
    }

    /// Check cross references between nodes and sources
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for ds in &self.data_sources {
            if !seen.insert(ds.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate data source '{}'",
                    ds.name
                )));
            }
        }

        let mut nodes = HashSet::new();
        for node in &self.data_nodes {
            if !nodes.insert(node.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate data node '{}'",
                    node.name
                )));
            }
            if node.data_sources.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "data node '{}' has no data sources",
                    node.name
                )));
            }
            if let Some(missing) = node
                .data_sources
                .iter()
                .find(|name| self.data_source(name).is_none())
            {
                return Err(ConfigError::Invalid(format!(
                    "data node '{}' references unknown data source '{}'",
                    node.name, missing
                )));
            }
            if node.init_index >= node.data_sources.len() {
                return Err(ConfigError::Invalid(format!(
                    "data node '{}' init_index {} out of range",
                    node.name, node.init_index
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// System-wide settings
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    /// Interval between heartbeat ticks (milliseconds)
    #[serde(default = "default_heartbeat_period_ms")]
    pub heartbeat_period_ms: u64,
    /// Interval between idle connection sweeps (milliseconds)
    #[serde(default = "default_idle_check_period_ms")]
    pub idle_check_period_ms: u64,
    /// Statements at least this slow are recorded (milliseconds)
    #[serde(default = "default_slow_sql_threshold_ms")]
    pub slow_sql_threshold_ms: u64,
    /// Slow statement records kept per data source
    #[serde(default = "default_sql_record_capacity")]
    pub sql_record_capacity: usize,
    /// Backend messages a connection may buffer before it is failed
    #[serde(default = "default_backend_queue_capacity")]
    pub backend_queue_capacity: usize,
    /// Largest backend payload accepted
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Address for the Prometheus endpoint; disabled when absent
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

fn default_heartbeat_period_ms() -> u64 {
    10_000
}

fn default_idle_check_period_ms() -> u64 {
    300_000
}

fn default_slow_sql_threshold_ms() -> u64 {
    1_000
}

fn default_sql_record_capacity() -> usize {
    10
}

fn default_backend_queue_capacity() -> usize {
    10_000
}

fn default_max_packet_size() -> usize {
    16 * 1024 * 1024
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            heartbeat_period_ms: default_heartbeat_period_ms(),
            idle_check_period_ms: default_idle_check_period_ms(),
            slow_sql_threshold_ms: default_slow_sql_threshold_ms(),
            sql_record_capacity: default_sql_record_capacity(),
            backend_queue_capacity: default_backend_queue_capacity(),
            max_packet_size: default_max_packet_size(),
            metrics_addr: None,
        }
    }
}

impl SystemConfig {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn idle_check_period(&self) -> Duration {
        Duration::from_millis(self.idle_check_period_ms)
    }

    pub fn slow_sql_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_sql_threshold_ms)
    }
}

// ============================================================================
// Data sources and data nodes
// ============================================================================

/// One physical backend endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct DataSourceConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Schema selected at connect time
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default = "default_charset")]
    pub charset: String,
}

fn default_charset() -> String {
    "utf8".to_string()
}

impl DataSourceConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A shard: an ordered failover group of data sources
#[derive(Debug, Clone, Deserialize)]
pub struct DataNodeConfig {
    pub name: String,
    /// Data source names, in failover order
    pub data_sources: Vec<String>,
    /// Maximum physical connections per data source
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Bound on opening one physical connection (milliseconds)
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    /// Idle connections older than this are closed (milliseconds)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// A probe outstanding longer than this counts as a timeout (milliseconds)
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Consecutive failed probes tolerated before failing over
    #[serde(default = "default_heartbeat_retry")]
    pub heartbeat_retry: u32,
    /// Probe statement; heartbeat is disabled when absent
    #[serde(default)]
    pub heartbeat_sql: Option<String>,
    /// Preferred data source at startup
    #[serde(default)]
    pub init_index: usize,
    /// Connections opened per source as a startup smoke test
    #[serde(default = "default_init_size")]
    pub init_size: usize,
}

fn default_pool_size() -> usize {
    128
}

fn default_wait_timeout_ms() -> u64 {
    10_000
}

fn default_idle_timeout_ms() -> u64 {
    10 * 60 * 1000
}

fn default_heartbeat_timeout_ms() -> u64 {
    30_000
}

fn default_heartbeat_retry() -> u32 {
    10
}

fn default_init_size() -> usize {
    1
}

impl DataNodeConfig {
    /// Config with defaults for the given node name and sources
    pub fn new(name: impl Into<String>, data_sources: Vec<String>) -> Self {
        Self {
            name: name.into(),
            data_sources,
            pool_size: default_pool_size(),
            wait_timeout_ms: default_wait_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            heartbeat_retry: default_heartbeat_retry(),
            heartbeat_sql: None,
            init_index: 0,
            init_size: default_init_size(),
        }
    }

    pub fn need_heartbeat(&self) -> bool {
        self.heartbeat_sql.is_some()
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[system]
heartbeat_period_ms = 2000
slow_sql_threshold_ms = 50

[[data_sources]]
name = "ds_0_master"
host = "10.0.0.1"
port = 3306
user = "app"
password = "secret"
database = "orders_0"

[[data_sources]]
name = "ds_0_backup"
host = "10.0.0.2"
port = 3306
user = "app"
database = "orders_0"
charset = "utf8mb4"

[[data_nodes]]
name = "dn_0"
data_sources = ["ds_0_master", "ds_0_backup"]
pool_size = 16
heartbeat_sql = "select user()"
heartbeat_retry = 3
"#;

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.system.heartbeat_period_ms, 2000);
        assert_eq!(config.system.slow_sql_threshold_ms, 50);
        assert_eq!(config.system.sql_record_capacity, 10);
        assert_eq!(config.data_sources.len(), 2);
        assert_eq!(config.data_sources[0].charset, "utf8");
        assert_eq!(config.data_sources[1].charset, "utf8mb4");
        assert_eq!(config.data_sources[1].password, "");

        let node = &config.data_nodes[0];
        assert_eq!(node.pool_size, 16);
        assert_eq!(node.heartbeat_retry, 3);
        assert_eq!(node.idle_timeout_ms, 600_000);
        assert!(node.need_heartbeat());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_data_node_defaults() {
        let node = DataNodeConfig::new("dn", vec!["a".to_string()]);
        assert_eq!(node.pool_size, 128);
        assert_eq!(node.wait_timeout(), Duration::from_secs(10));
        assert_eq!(node.heartbeat_timeout(), Duration::from_secs(30));
        assert_eq!(node.heartbeat_retry, 10);
        assert_eq!(node.init_size, 1);
        assert!(!node.need_heartbeat());
    }

    #[test]
    fn test_validate_unknown_source() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.data_nodes[0].data_sources.push("ds_missing".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ds_missing"));
    }

    #[test]
    fn test_validate_init_index_and_duplicates() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.data_nodes[0].init_index = 2;
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        let dup = config.data_sources[0].clone();
        config.data_sources.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config = Config::default();
        assert!(config.data_nodes.is_empty());
        assert_eq!(config.system.max_packet_size, 16 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }
}
