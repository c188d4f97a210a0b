//! Record reference time from an NTP server
//!
//! Used once at startup so the logs carry the offset between this host's
//! clock and a reference. Purely diagnostic: failures are logged and the
//! run carries on.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{error, info, warn};

const NTP_PORT: u16 = 123;
const PACKET_LEN: usize = 48;
/// Seconds between the NTP epoch (1900) and the Unix epoch (1970)
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;
/// LI = 0, version 3, mode 3 (client)
const CLIENT_HEADER: u8 = 0x1B;
const MODE_SERVER: u8 = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NtpConfig {
    pub server: String,
    pub retries: u32,
    pub retry_delay_secs: u64,
    pub timeout_secs: u64,
}

impl Default for NtpConfig {
    fn default() -> Self {
        Self {
            server: "0.uk.pool.ntp.org".to_string(),
            retries: 3,
            retry_delay_secs: 3,
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Error)]
pub enum NtpError {
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),
}

/// Result of one exchange with the server
#[derive(Debug, Clone, Copy)]
pub struct NtpSample {
    /// Server transmit time
    pub reference: SystemTime,
    /// How far the local clock is behind the reference, in seconds
    pub offset_secs: f64,
    pub round_trip: Duration,
}

/// Query `config.server`, retrying on failure, and log the outcome
pub async fn log_ntp_time(config: &NtpConfig) -> Option<NtpSample> {
    info!(server = %config.server, "Attempting to connect to NTP server");

    for attempt in 1..=config.retries {
        match query(&config.server, Duration::from_secs(config.timeout_secs)).await {
            Ok(sample) => {
                info!("Got response from NTP server");
                let utc: DateTime<Utc> = sample.reference.into();
                let local: DateTime<Local> = sample.reference.into();
                info!("NTP UTC time: {}", utc.format("%Y-%m-%d %H:%M:%S %6f"));
                info!("NTP Local timezone time: {}", local.format("%Y-%m-%d %H:%M:%S %6f"));
                info!(
                    offset_secs = sample.offset_secs,
                    round_trip_ms = sample.round_trip.as_millis() as u64,
                    "Local clock offset from NTP reference"
                );
                return Some(sample);
            }
            Err(e) => {
                warn!(
                    attempt = attempt,
                    error = %e,
                    "No response from NTP server, sleeping for {} sec",
                    config.retry_delay_secs
                );
                tokio::time::sleep(Duration::from_secs(config.retry_delay_secs)).await;
            }
        }
    }

    error!(server = %config.server, "Could not perform NTP sync");
    None
}

/// One SNTP exchange with `server`
pub async fn query(server: &str, limit: Duration) -> Result<NtpSample, NtpError> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.connect((server, NTP_PORT)).await?;

    let mut request = [0u8; PACKET_LEN];
    request[0] = CLIENT_HEADER;

    let sent_at = SystemTime::now();
    socket.send(&request).await?;

    let mut response = [0u8; PACKET_LEN];
    let len = tokio::time::timeout(limit, socket.recv(&mut response))
        .await
        .map_err(|_| NtpError::Timeout(limit))??;
    let received_at = SystemTime::now();

    if len < PACKET_LEN {
        return Err(NtpError::InvalidResponse("short packet"));
    }
    sample_from_response(&response, sent_at, received_at)
}

/// Clock offset and round trip from a server reply, per RFC 4330
fn sample_from_response(
    response: &[u8; PACKET_LEN],
    sent_at: SystemTime,
    received_at: SystemTime,
) -> Result<NtpSample, NtpError> {
    if response[0] & 0x07 != MODE_SERVER {
        return Err(NtpError::InvalidResponse("not a server reply"));
    }

    let server_receive = timestamp_at(response, 32)?;
    let server_transmit = timestamp_at(response, 40)?;
    let t1 = unix_secs(sent_at);
    let t4 = unix_secs(received_at);

    let offset_secs = ((server_receive - t1) + (server_transmit - t4)) / 2.0;
    let round_trip = ((t4 - t1) - (server_transmit - server_receive)).max(0.0);

    Ok(NtpSample {
        reference: UNIX_EPOCH + Duration::from_secs_f64(server_transmit),
        offset_secs,
        round_trip: Duration::from_secs_f64(round_trip),
    })
}

/// Read the 64-bit NTP timestamp at `at` as Unix seconds
fn timestamp_at(packet: &[u8; PACKET_LEN], at: usize) -> Result<f64, NtpError> {
    let seconds = u32::from_be_bytes([packet[at], packet[at + 1], packet[at + 2], packet[at + 3]]) as u64;
    let fraction = u32::from_be_bytes([packet[at + 4], packet[at + 5], packet[at + 6], packet[at + 7]]);
    if seconds < NTP_UNIX_OFFSET {
        return Err(NtpError::InvalidResponse("timestamp before 1970"));
    }
    Ok((seconds - NTP_UNIX_OFFSET) as f64 + fraction as f64 / (1u64 << 32) as f64)
}

fn unix_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}
