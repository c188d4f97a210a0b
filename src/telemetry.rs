//! Node link telemetry over MQTT
//!
//! Runs on a node host. Each cycle reads the neighbour table through the
//! local `wpanctl`, then publishes a simulated battery level and the first
//! neighbour's last RSSI under `<prefix>/<hostname>/`.

use crate::config::{MqttConfig, TelemetryConfig};
use crate::mqtt::MqttClient;
use crate::session::{CommandSession, SessionError};
use crate::wpanctl::{self, Property};
use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{info, warn};

const BATTERY_FULL: u8 = 100;

/// Simulated battery that drains one percent per cycle and starts over when empty
#[derive(Debug, Clone)]
pub struct Battery {
    level: u8,
}

impl Default for Battery {
    fn default() -> Self {
        Self { level: BATTERY_FULL }
    }
}

impl Battery {
    /// Current level, then drain
    pub fn next_level(&mut self) -> u8 {
        let level = self.level;
        self.level = match self.level - 1 {
            0 => BATTERY_FULL,
            drained => drained,
        };
        level
    }
}

/// Last RSSI of the first neighbour, `None` while the node has no neighbours
pub async fn read_rssi<S: CommandSession>(session: &S) -> Result<Option<i16>, SessionError> {
    let table = session.send_command(&wpanctl::get(Property::NeighborTable)).await?;
    Ok(wpanctl::first_neighbor_rssi(&table))
}

/// Publish telemetry until Ctrl+C
pub async fn run<S: CommandSession>(session: &S, mqtt: &MqttConfig, config: &TelemetryConfig) -> Result<()> {
    let hostname = session
        .send_command("hostname")
        .await
        .context("Failed to read hostname")?
        .trim()
        .to_string();
    info!(hostname = %hostname, "Hostname");

    let client = MqttClient::new(&mqtt.broker_url, &mqtt.client_id, mqtt.qos, mqtt.nat64)
        .await
        .context("Failed to create MQTT client")?;

    info!("Beginning publishing loop");
    let publishing = publish_loop(session, &client, &mqtt.topic_prefix, &hostname, config);

    tokio::select! {
        result = publishing => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Received Ctrl+C, stopping telemetry");
        }
    }

    client.disconnect().await
}

async fn publish_loop<S: CommandSession>(
    session: &S,
    client: &MqttClient,
    prefix: &str,
    hostname: &str,
    config: &TelemetryConfig,
) -> Result<()> {
    let mut battery = Battery::default();

    loop {
        let rssi = read_rssi(session).await.context("Failed to read neighbour table")?;

        let level = battery.next_level();
        client
            .publish_metric(prefix, hostname, "imag_batt", &level.to_string())
            .await?;

        tokio::time::sleep(Duration::from_secs(config.publish_gap_secs)).await;
        match rssi {
            Some(rssi) => {
                client
                    .publish_metric(prefix, hostname, "rssi", &rssi.to_string())
                    .await?
            }
            None => warn!(hostname = %hostname, "No neighbours, skipping RSSI"),
        }

        tokio::time::sleep(Duration::from_secs(config.interval_secs)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::FakeSession;

    #[test]
    fn test_battery_wraps() {
        let mut battery = Battery::default();
        let levels: Vec<u8> = (0..101).map(|_| battery.next_level()).collect();
        assert_eq!(levels[0], 100);
        assert_eq!(levels[98], 2);
        assert_eq!(levels[99], 1);
        assert_eq!(levels[100], 100);
    }

    #[tokio::test]
    async fn test_read_rssi() {
        let session = FakeSession::new("localhost").reply(
            "sudo wpanctl get Thread:NeighborTable",
            "[\n\t\"E2A7C6A4F3B1B2C3, RLOC16:9c00, LQIn:3, AveRssi:-48, LastRssi:-47, Age:12\"\n]",
        );
        assert_eq!(read_rssi(&session).await.unwrap(), Some(-47));
    }

    #[tokio::test]
    async fn test_read_rssi_without_neighbours() {
        let session = FakeSession::new("localhost").reply("sudo wpanctl get Thread:NeighborTable", "[\n]");
        assert_eq!(read_rssi(&session).await.unwrap(), None);
    }
}
