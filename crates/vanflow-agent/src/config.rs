//! Agent configuration.

use anyhow::{Context, Result};
use std::time::Duration;
use uuid::Uuid;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// MQTT broker URL
    pub broker: String,

    /// ID of the source this agent publishes
    pub source_id: String,

    /// Type advertised in the agent's beacons
    pub source_type: String,

    /// Name of the site the agent runs in
    pub site_name: Option<String>,

    /// Discover and collect records from other sources
    pub collect: bool,

    /// Heartbeat period
    pub heartbeat_interval: Duration,

    /// Beacon period
    pub beacon_interval: Duration,

    /// Maximum records per flush message (`0`: unbounded)
    pub flush_batch_size: usize,

    /// Inactivity after which a collected source is forgotten
    pub watch_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker: "tcp://localhost:1883".to_string(),
            source_id: Uuid::new_v4().to_string(),
            source_type: "CONTROLLER".to_string(),
            site_name: None,
            collect: false,
            heartbeat_interval: Duration::from_secs(2),
            beacon_interval: Duration::from_secs(10),
            flush_batch_size: 0,
            watch_timeout: Duration::from_secs(30),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `VANFLOW_BROKER`: MQTT broker URL
    /// - `VANFLOW_SOURCE_ID`: ID of the published source
    /// - `VANFLOW_SOURCE_TYPE`: Source type advertised in beacons
    /// - `VANFLOW_SITE_NAME`: Site name recorded in the site record
    /// - `VANFLOW_COLLECT`: `true`/`1` to run the collector
    /// - `VANFLOW_HEARTBEAT_INTERVAL_MS`: Heartbeat period
    /// - `VANFLOW_BEACON_INTERVAL_MS`: Beacon period
    /// - `VANFLOW_FLUSH_BATCH_SIZE`: Records per flush message
    /// - `VANFLOW_WATCH_TIMEOUT_MS`: Collector inactivity timeout
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(broker) = lookup("VANFLOW_BROKER") {
            config.broker = broker;
        }

        if let Some(id) = lookup("VANFLOW_SOURCE_ID") {
            config.source_id = id;
        }

        if let Some(source_type) = lookup("VANFLOW_SOURCE_TYPE") {
            config.source_type = source_type;
        }

        if let Some(name) = lookup("VANFLOW_SITE_NAME") {
            config.site_name = Some(name);
        }

        if let Some(collect) = lookup("VANFLOW_COLLECT") {
            config.collect = parse_flag(&collect).context("Invalid VANFLOW_COLLECT")?;
        }

        if let Some(ms) = lookup("VANFLOW_HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval =
                parse_millis(&ms).context("Invalid VANFLOW_HEARTBEAT_INTERVAL_MS")?;
        }

        if let Some(ms) = lookup("VANFLOW_BEACON_INTERVAL_MS") {
            config.beacon_interval =
                parse_millis(&ms).context("Invalid VANFLOW_BEACON_INTERVAL_MS")?;
        }

        if let Some(size) = lookup("VANFLOW_FLUSH_BATCH_SIZE") {
            config.flush_batch_size = size
                .trim()
                .parse()
                .context("Invalid VANFLOW_FLUSH_BATCH_SIZE")?;
        }

        if let Some(ms) = lookup("VANFLOW_WATCH_TIMEOUT_MS") {
            config.watch_timeout = parse_millis(&ms).context("Invalid VANFLOW_WATCH_TIMEOUT_MS")?;
        }

        Ok(config)
    }

    /// ID of the site record published alongside the controller record.
    #[must_use]
    pub fn site_id(&self) -> String {
        format!("{}-site", self.source_id)
    }
}

fn parse_millis(value: &str) -> Result<Duration> {
    let ms: u64 = value.trim().parse()?;
    anyhow::ensure!(ms > 0, "interval must be positive");
    Ok(Duration::from_millis(ms))
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("expected a boolean, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AgentConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        AgentConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.broker, "tcp://localhost:1883");
        assert_eq!(config.source_type, "CONTROLLER");
        assert!(Uuid::parse_str(&config.source_id).is_ok());
        assert!(!config.collect);
        assert_eq!(config.flush_batch_size, 0);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("VANFLOW_BROKER", "mqtt://broker:1884"),
            ("VANFLOW_SOURCE_ID", "agent-1"),
            ("VANFLOW_SITE_NAME", "east"),
            ("VANFLOW_COLLECT", "true"),
            ("VANFLOW_HEARTBEAT_INTERVAL_MS", "500"),
            ("VANFLOW_FLUSH_BATCH_SIZE", "50"),
            ("VANFLOW_WATCH_TIMEOUT_MS", "1500"),
        ])
        .unwrap();
        assert_eq!(config.broker, "mqtt://broker:1884");
        assert_eq!(config.source_id, "agent-1");
        assert_eq!(config.site_id(), "agent-1-site");
        assert_eq!(config.site_name.as_deref(), Some("east"));
        assert!(config.collect);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(config.flush_batch_size, 50);
        assert_eq!(config.watch_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_invalid_values() {
        assert!(load(&[("VANFLOW_COLLECT", "maybe")]).is_err());
        assert!(load(&[("VANFLOW_BEACON_INTERVAL_MS", "0")]).is_err());
        assert!(load(&[("VANFLOW_FLUSH_BATCH_SIZE", "-1")]).is_err());
    }
}
