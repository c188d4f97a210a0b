//! MQTT Client for publishing node telemetry
//!
//! This module provides an async MQTT client that:
//! - Connects to a broker, optionally through the mesh's NAT64 prefix
//! - Publishes per-node link metrics to a topic hierarchy
//! - Handles connection errors gracefully

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Well-known NAT64 prefix, 64:ff9b::/96
const NAT64_PREFIX: Ipv6Addr = Ipv6Addr::new(0x64, 0xff9b, 0, 0, 0, 0, 0, 0);

/// MQTT Client for publishing telemetry
pub struct MqttClient {
    client: AsyncClient,
    qos: QoS,
    event_loop_handle: JoinHandle<()>,
}

impl MqttClient {
    /// Create a new MQTT client and connect to broker
    ///
    /// # Arguments
    /// * `broker_url` - URL like "mqtt://localhost:1883"
    /// * `client_id` - Unique client identifier
    /// * `qos` - Quality of Service level (0, 1, or 2)
    /// * `nat64` - Reach an IPv4 broker through the NAT64 prefix
    pub async fn new(broker_url: &str, client_id: &str, qos: u8, nat64: bool) -> Result<Self> {
        info!(broker = broker_url, client_id = client_id, "Connecting to MQTT broker");

        // Parse broker URL
        let (host, port) = parse_broker_url(broker_url)?;
        let qos = qos_from_level(qos)?;
        let host = if nat64 {
            let translated = resolve_nat64(&host, port).await?;
            info!(broker = %host, address = %translated, "Using NAT64 address for broker");
            translated.to_string()
        } else {
            host
        };

        // Configure MQTT options
        let mut mqttoptions = MqttOptions::new(client_id, host, port);
        mqttoptions.set_keep_alive(Duration::from_secs(30));

        // Create client
        let (client, mut event_loop) = AsyncClient::new(mqttoptions, 10);

        // Spawn event loop handler task
        let event_loop_handle = tokio::spawn(async move {
            info!("MQTT event loop started");
            loop {
                match event_loop.poll().await {
                    Ok(notification) => {
                        debug!("MQTT notification: {:?}", notification);
                    }
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            qos,
            event_loop_handle,
        })
    }

    /// Publish a message to a topic
    pub async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<()> {
        self.client
            .publish(topic, self.qos, retain, payload.as_bytes())
            .await
            .with_context(|| format!("Failed to publish to topic: {}", topic))?;

        debug!(topic = topic, payload_len = payload.len(), "Published to MQTT");
        Ok(())
    }

    /// Publish one metric of one node
    ///
    /// # Arguments
    /// * `prefix` - Topic prefix (e.g., "pipebots/demo/icair/sc")
    /// * `node` - Node hostname (e.g., "plutopi2")
    /// * `metric` - Metric name (e.g., "rssi", "imag_batt")
    /// * `value` - Metric value as string
    pub async fn publish_metric(&self, prefix: &str, node: &str, metric: &str, value: &str) -> Result<()> {
        let topic = Self::build_topic(prefix, node, metric);
        self.publish(&topic, value, false).await?;
        info!(topic = %topic, payload = value, "Published metric");
        Ok(())
    }

    /// Build topic name for a node metric
    ///
    /// Topic hierarchy:
    /// - <prefix>/<hostname>/rssi
    /// - <prefix>/<hostname>/imag_batt
    pub fn build_topic(prefix: &str, node: &str, metric: &str) -> String {
        format!("{}/{}/{}", prefix, node, metric)
    }

    /// Disconnect from the broker and stop the event loop
    pub async fn disconnect(self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .context("Failed to disconnect from MQTT broker")?;
        // Let the event loop flush the DISCONNECT before stopping it
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.event_loop_handle.abort();
        info!("MQTT client disconnected");
        Ok(())
    }
}

fn qos_from_level(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => anyhow::bail!("Invalid MQTT QoS level: {} (must be 0, 1, or 2)", other),
    }
}

/// Parse MQTT broker URL into host and port
///
/// Only plain `mqtt://` brokers are supported:
/// - mqtt://localhost:1883
/// - mqtt://192.168.1.100:1883
pub(crate) fn parse_broker_url(url: &str) -> Result<(String, u16)> {
    if url.starts_with("mqtts://") {
        anyhow::bail!("TLS brokers are not supported: {}", url);
    }

    // Remove protocol prefix
    let url_without_protocol = url
        .strip_prefix("mqtt://")
        .with_context(|| format!("Invalid MQTT URL: {} (must start with mqtt://)", url))?;

    // Split host and port
    if let Some((host, port_str)) = url_without_protocol.split_once(':') {
        let port = port_str
            .parse::<u16>()
            .context("Invalid port number in MQTT URL")?;
        Ok((host.to_string(), port))
    } else {
        // Default port if not specified
        Ok((url_without_protocol.to_string(), 1883))
    }
}

/// Embed an IPv4 address in the NAT64 prefix
pub fn nat64_address(ipv4: Ipv4Addr) -> Ipv6Addr {
    Ipv6Addr::from(u128::from(NAT64_PREFIX) | u128::from(u32::from(ipv4)))
}

/// Resolve `host` to its first IPv4 address and translate it
async fn resolve_nat64(host: &str, port: u16) -> Result<Ipv6Addr> {
    let ipv4 = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Failed to resolve MQTT broker: {}", host))?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .with_context(|| format!("MQTT broker {} has no IPv4 address", host))?;
    Ok(nat64_address(ipv4))
}
