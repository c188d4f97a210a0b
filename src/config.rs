//! Configuration management for meshlab
//!
//! Loads configuration from config.toml with environment variable overrides

use crate::logging::LogConfig;
use crate::node::{NodeTimings, TX_POWER_MAX_DBM, TX_POWER_MIN_DBM};
use crate::ntp::NtpConfig;
use crate::ssh::SshConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// Name the leader goes by in the topology map
pub const LEADER: &str = "leader";

/// Complete lab configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub ntp: NtpConfig,
    #[serde(default)]
    pub timing: NodeTimings,
    #[serde(default)]
    pub experiment: ExperimentConfig,
    #[serde(default)]
    pub ping: PingConfig,
    #[serde(default)]
    pub iperf: IperfConfig,
    /// Required by `setup` and `measure`, unused by `telemetry`
    pub nodes: Option<NodesConfig>,
    /// Node name to the names it may hear once allowlists are enabled
    #[serde(default)]
    pub topology: BTreeMap<String, Vec<String>>,
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// What to run once the mesh is up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default = "default_experiment_name")]
    pub name: String,
    /// Network name is `<prefix>-<ddmmyy>`
    #[serde(default = "default_network_prefix")]
    pub network_prefix: String,
    #[serde(default = "default_tx_power")]
    pub tx_power_dbm: i32,
    /// Wait after enabling allowlists for the topology to settle
    #[serde(default = "default_allowlist_settle")]
    pub allowlist_settle_secs: u64,
    /// Pause between consecutive measurement runs
    #[serde(default = "default_pause")]
    pub pause_secs: u64,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    #[serde(default = "default_true")]
    pub ping_tests: bool,
    #[serde(default = "default_true")]
    pub tcp_tests: bool,
    #[serde(default = "default_true")]
    pub udp_tests: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: default_experiment_name(),
            network_prefix: default_network_prefix(),
            tx_power_dbm: default_tx_power(),
            allowlist_settle_secs: default_allowlist_settle(),
            pause_secs: default_pause(),
            results_dir: default_results_dir(),
            ping_tests: true,
            tcp_tests: true,
            udp_tests: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    pub packet_sizes: Vec<u32>,
    pub count: u32,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            packet_sizes: vec![16, 32, 64, 128, 256, 512, 1024],
            count: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IperfConfig {
    pub port: u16,
    pub duration_secs: u32,
    pub packet_sizes: Vec<u32>,
    /// Target bandwidths in bits per second
    pub bandwidths: Vec<u32>,
}

impl Default for IperfConfig {
    fn default() -> Self {
        Self {
            port: 2607,
            duration_secs: 60,
            packet_sizes: vec![32, 160, 288, 416, 544, 672, 800, 928],
            bandwidths: vec![20000, 70000, 100000],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesConfig {
    pub leader: SshConfig,
    #[serde(default)]
    pub routers: BTreeMap<String, SshConfig>,
}

/// MQTT broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_url: String,
    pub client_id: String,
    pub topic_prefix: String,
    pub qos: u8,
    /// Reach an IPv4 broker through the mesh's NAT64 prefix
    #[serde(default)]
    pub nat64: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub interval_secs: u64,
    /// Gap between the battery and RSSI publications of one cycle
    pub publish_gap_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            publish_gap_secs: 5,
            command_timeout_secs: 10,
        }
    }
}

fn default_experiment_name() -> String {
    "mesh".to_string()
}

fn default_network_prefix() -> String {
    "ot".to_string()
}

fn default_tx_power() -> i32 {
    TX_POWER_MAX_DBM
}

fn default_allowlist_settle() -> u64 {
    180
}

fn default_pause() -> u64 {
    5
}

fn default_results_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from file
    ///
    /// Environment variables override config file values:
    /// - MESHLAB_SSH_PASSWORD: password for nodes configured without one
    /// - MESHLAB_LOG_LEVEL: minimum log level
    pub fn load(path: &str) -> Result<Self> {
        // Read config file
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        // Parse TOML
        let mut config: Config = toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        // Override with environment variables
        if let Ok(password) = std::env::var("MESHLAB_SSH_PASSWORD") {
            config.fill_missing_passwords(&password);
        }
        if let Ok(level) = std::env::var("MESHLAB_LOG_LEVEL") {
            config.logging.minimum_level = level;
        }

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    fn fill_missing_passwords(&mut self, password: &str) {
        let Some(nodes) = self.nodes.as_mut() else {
            return;
        };
        let nodes = std::iter::once(&mut nodes.leader).chain(nodes.routers.values_mut());
        for node in nodes.filter(|n| n.password.is_none() && n.identity_file.is_none()) {
            node.password = Some(password.to_string());
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        self.logging.filter()?;

        // Validate node connection settings
        if let Some(nodes) = &self.nodes {
            nodes.leader.validate().context("Invalid leader configuration")?;
            for (name, router) in &nodes.routers {
                if name == LEADER {
                    anyhow::bail!("Router name '{}' is reserved for the leader", LEADER);
                }
                router
                    .validate()
                    .with_context(|| format!("Invalid configuration for router {}", name))?;
            }
        }

        // Validate topology names
        let known = |name: &str| {
            name == LEADER
                || self
                    .nodes
                    .as_ref()
                    .is_some_and(|nodes| nodes.routers.contains_key(name))
        };
        for (node, neighbours) in &self.topology {
            for name in std::iter::once(node).chain(neighbours) {
                if !known(name) {
                    anyhow::bail!("Topology refers to unknown node: {}", name);
                }
            }
            if neighbours.contains(node) {
                anyhow::bail!("Topology lists {} as its own neighbour", node);
            }
        }

        if !(TX_POWER_MIN_DBM..=TX_POWER_MAX_DBM).contains(&self.experiment.tx_power_dbm) {
            anyhow::bail!(
                "Invalid TX power: {} dBm (must be between {} and {})",
                self.experiment.tx_power_dbm,
                TX_POWER_MIN_DBM,
                TX_POWER_MAX_DBM
            );
        }

        if self.timing.poll_interval_secs == 0 {
            anyhow::bail!("timing.poll_interval_secs must be greater than 0");
        }

        if let Some(mqtt) = &self.mqtt {
            // Validate MQTT QoS
            if mqtt.qos > 2 {
                anyhow::bail!("Invalid MQTT QoS level: {} (must be 0, 1, or 2)", mqtt.qos);
            }

            // Validate URLs
            crate::mqtt::parse_broker_url(&mqtt.broker_url).context("Invalid MQTT broker URL")?;
        }

        if self.telemetry.interval_secs == 0 {
            anyhow::bail!("telemetry.interval_secs must be greater than 0");
        }

        Ok(())
    }
}
