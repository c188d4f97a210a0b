//! Remote OpenThread node
//!
//! `RemoteNode` wraps one radio node reachable through a command session
//! and drives `wpanctl` on it. Network identity (name, PAN IDs, channel,
//! frequency, key) is recorded once when the node forms or joins a network;
//! mesh-local and extended addresses are fetched on first use. Both are
//! dropped on reset since the NCP picks new addresses after a reset.

use crate::poll::poll_until;
use crate::session::{CommandSession, SessionError};
use crate::ssh::{SshConfig, SshSession};
use crate::wpanctl::{self, MalformedReply, Property};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

/// Lowest transmit power the NCP accepts, in dBm
pub const TX_POWER_MIN_DBM: i32 = -20;
/// Highest transmit power the NCP accepts, in dBm
pub const TX_POWER_MAX_DBM: i32 = 8;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("could not connect: {0}")]
    Connect(#[source] SessionError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("{host} has not joined a network")]
    NotJoined { host: String },

    #[error("{host} is already part of a network")]
    AlreadyJoined { host: String },

    #[error("anchor {anchor} has not formed or joined a network")]
    AnchorNotJoined { anchor: String },

    #[error("peer {peer} of {host} has not joined a network")]
    PeerNotJoined { host: String, peer: String },

    #[error("{host} could not form network {network}: {reply:?}")]
    FormFailed {
        host: String,
        network: String,
        reply: String,
    },

    #[error("{host} did not associate within {waited:?}")]
    JoinTimeout { host: String, waited: Duration },

    #[error("unexpected reply to {property} from {host}: {reply:?}")]
    Parse {
        host: String,
        property: Property,
        reply: String,
    },
}

/// Delays and bounds used while driving a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTimings {
    /// Wait after `form` before reading the new network's parameters
    #[serde(default = "default_form_settle")]
    pub form_settle_secs: u64,
    /// Wait between the anchor opening its join window and the join request
    #[serde(default = "default_join_window")]
    pub join_window_secs: u64,
    /// Interval between association checks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Give up on association after this long
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,
}

fn default_form_settle() -> u64 {
    5
}

fn default_join_window() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    30
}

fn default_join_timeout() -> u64 {
    600
}

impl Default for NodeTimings {
    fn default() -> Self {
        Self {
            form_settle_secs: default_form_settle(),
            join_window_secs: default_join_window(),
            poll_interval_secs: default_poll_interval(),
            join_timeout_secs: default_join_timeout(),
        }
    }
}

impl NodeTimings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

/// Parameters shared by every node of one mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkIdentity {
    pub name: String,
    pub panid: String,
    pub xpanid: String,
    pub channel: u16,
    /// Channel centre frequency in kHz
    pub frequency: u32,
    pub key: String,
}

#[derive(Default)]
struct Addresses {
    mesh_local: OnceCell<String>,
    extended: OnceCell<String>,
}

pub struct RemoteNode<S> {
    session: S,
    hostname: String,
    timings: NodeTimings,
    identity: Option<NetworkIdentity>,
    addresses: Addresses,
}

impl RemoteNode<SshSession> {
    /// Open an SSH session to the node and reset it
    pub async fn connect(config: &SshConfig, timings: NodeTimings) -> Result<Self, NodeError> {
        let session = SshSession::connect(config.clone()).await.map_err(|e| {
            error!(host = %config.host, error = %e, "Could not connect");
            NodeError::Connect(e)
        })?;
        Ok(Self::new(session, timings).await)
    }
}

impl<S: CommandSession> RemoteNode<S> {
    /// Wrap an established session and reset the node
    pub async fn new(session: S, timings: NodeTimings) -> Self {
        let hostname = short_hostname(session.host()).to_string();
        info!(host = %hostname, "Connected");

        let mut node = Self {
            session,
            hostname,
            timings,
            identity: None,
            addresses: Addresses::default(),
        };
        node.reset().await;
        info!(host = %node.hostname, "Initialised");
        node
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn is_joined(&self) -> bool {
        self.identity.is_some()
    }

    /// Leave any network and factory-reset the NCP
    ///
    /// Best effort: failures are logged, never returned.
    pub async fn reset(&mut self) {
        self.identity = None;
        self.addresses = Addresses::default();

        for command in [wpanctl::START_DAEMON, wpanctl::LEAVE, wpanctl::RESET] {
            if let Err(e) = self.session.send_command(command).await {
                warn!(host = %self.hostname, command = command, error = %e, "Reset step failed");
            }
        }
        if let Err(e) = self.session.clear_buffer().await {
            warn!(host = %self.hostname, error = %e, "Could not clear session buffer");
        }
    }

    /// Form a new network with this node as its leader
    pub async fn form_network(&mut self, network_name: &str) -> Result<(), NodeError> {
        if self.is_joined() {
            return Err(NodeError::AlreadyJoined {
                host: self.hostname.clone(),
            });
        }

        let reply = self.session.send_command(&wpanctl::form(network_name)).await?;
        if !wpanctl::form_succeeded(&reply) {
            error!(
                host = %self.hostname,
                network = network_name,
                reply = %reply,
                critical = true,
                "Could not form network"
            );
            return Err(NodeError::FormFailed {
                host: self.hostname.clone(),
                network: network_name.to_string(),
                reply,
            });
        }

        info!(host = %self.hostname, network = network_name, "Formed network");
        tokio::time::sleep(Duration::from_secs(self.timings.form_settle_secs)).await;

        let identity = NetworkIdentity {
            name: network_name.to_string(),
            panid: self.query(Property::PanId).await?,
            xpanid: self.query(Property::XPanId).await?,
            channel: self.query_int(Property::Channel).await?,
            frequency: self.query_int(Property::Frequency).await?,
            key: self.query(Property::NetworkKey).await?,
        };
        info!(
            host = %self.hostname,
            panid = %identity.panid,
            xpanid = %identity.xpanid,
            channel = identity.channel,
            frequency_khz = identity.frequency,
            "Network parameters"
        );
        self.identity = Some(identity);
        Ok(())
    }

    /// Join the network `anchor` belongs to
    ///
    /// The anchor opens its join window, the node takes over the anchor's
    /// key and issues the join, then association is polled until the join
    /// timeout.
    pub async fn join_network(&mut self, anchor: &RemoteNode<S>) -> Result<(), NodeError> {
        let Some(identity) = anchor.identity.clone() else {
            return Err(NodeError::AnchorNotJoined {
                anchor: anchor.hostname.clone(),
            });
        };
        if self.is_joined() {
            return Err(NodeError::AlreadyJoined {
                host: self.hostname.clone(),
            });
        }

        anchor.session.send_command(wpanctl::PERMIT_JOIN).await?;
        tokio::time::sleep(Duration::from_secs(self.timings.join_window_secs)).await;

        self.session
            .send_command(&wpanctl::set(Property::NetworkKey, &identity.key))
            .await?;
        self.session
            .send_command(&wpanctl::join(
                &identity.name,
                &identity.panid,
                &identity.xpanid,
                identity.channel,
            ))
            .await?;
        info!(host = %self.hostname, anchor = %anchor.hostname, network = %identity.name, "Join requested");

        let node = &*self;
        let associated = poll_until(self.timings.poll_interval(), self.timings.join_timeout(), || async move {
            let state = node.query(Property::State).await?;
            info!(host = %node.hostname, state = %state, "Node state");
            Ok::<_, NodeError>(state.to_lowercase().contains("associated"))
        })
        .await?;

        if !associated {
            error!(host = %self.hostname, network = %identity.name, "Could not join network");
            return Err(NodeError::JoinTimeout {
                host: self.hostname.clone(),
                waited: self.timings.join_timeout(),
            });
        }

        info!(host = %self.hostname, network = %identity.name, "Joined network");
        self.identity = Some(identity);
        Ok(())
    }

    fn identity(&self) -> Result<&NetworkIdentity, NodeError> {
        self.identity.as_ref().ok_or_else(|| NodeError::NotJoined {
            host: self.hostname.clone(),
        })
    }

    pub fn network_name(&self) -> Result<&str, NodeError> {
        Ok(self.identity()?.name.as_str())
    }

    pub fn panid(&self) -> Result<&str, NodeError> {
        Ok(self.identity()?.panid.as_str())
    }

    pub fn xpanid(&self) -> Result<&str, NodeError> {
        Ok(self.identity()?.xpanid.as_str())
    }

    pub fn channel(&self) -> Result<u16, NodeError> {
        Ok(self.identity()?.channel)
    }

    pub fn frequency(&self) -> Result<u32, NodeError> {
        Ok(self.identity()?.frequency)
    }

    pub fn network_key(&self) -> Result<&str, NodeError> {
        Ok(self.identity()?.key.as_str())
    }

    /// Mesh-local IPv6 address, fetched once per join
    pub async fn ipv6_addr(&self) -> Result<&str, NodeError> {
        self.identity()?;
        let addr = self
            .addresses
            .mesh_local
            .get_or_try_init(|| self.query(Property::MeshLocalAddress))
            .await?;
        Ok(addr.as_str())
    }

    /// Extended (hardware) address used by the MAC allowlist, fetched once per join
    pub async fn ext_hw_addr(&self) -> Result<&str, NodeError> {
        self.identity()?;
        let addr = self
            .addresses
            .extended
            .get_or_try_init(|| self.query(Property::ExtendedAddress))
            .await?;
        Ok(addr.as_str())
    }

    pub async fn node_state(&self) -> Result<String, NodeError> {
        self.identity()?;
        self.query(Property::State).await
    }

    pub async fn node_type(&self) -> Result<String, NodeError> {
        self.identity()?;
        self.query(Property::NodeType).await
    }

    /// Current transmit power in dBm
    pub async fn tx_power(&self) -> Result<i32, NodeError> {
        let reply = self.session.send_command(&wpanctl::get(Property::TxPower)).await?;
        let value = wpanctl::parse_value(&reply).map_err(|e| self.parse_error(Property::TxPower, e))?;
        // Some firmware reports fractional dBm
        let dbm = value
            .parse::<i32>()
            .ok()
            .or_else(|| value.parse::<f32>().ok().map(|v| v.round() as i32));
        dbm.ok_or_else(|| NodeError::Parse {
            host: self.hostname.clone(),
            property: Property::TxPower,
            reply: reply.clone(),
        })
    }

    /// Set the transmit power, clamped to what the NCP supports
    ///
    /// Returns the value actually requested from the node.
    pub async fn set_tx_power(&self, dbm: i32) -> Result<i32, NodeError> {
        let clamped = clamp_tx_power(dbm);
        if clamped != dbm {
            warn!(
                host = %self.hostname,
                requested = dbm,
                applied = clamped,
                "TX power outside [{}, {}] dBm, clamping",
                TX_POWER_MIN_DBM,
                TX_POWER_MAX_DBM
            );
        }

        self.session
            .send_command(&wpanctl::set(Property::TxPower, clamped))
            .await?;
        info!(host = %self.hostname, tx_power_dbm = clamped, "Set TX power");
        Ok(clamped)
    }

    /// Allow frames from `peer` once the allowlist is enabled
    pub async fn add_maclist_entry(&self, peer: &RemoteNode<S>) -> Result<(), NodeError> {
        self.identity()?;
        if !peer.is_joined() {
            return Err(NodeError::PeerNotJoined {
                host: self.hostname.clone(),
                peer: peer.hostname.clone(),
            });
        }

        let peer_addr = peer.ext_hw_addr().await?;
        self.session
            .send_command(&wpanctl::add(Property::AllowlistEntries, peer_addr))
            .await?;
        info!(host = %self.hostname, peer = %peer.hostname, address = peer_addr, "Added allowlist entry");
        Ok(())
    }

    pub async fn enable_maclist(&self) -> Result<(), NodeError> {
        self.session
            .send_command(&wpanctl::set(Property::AllowlistEnabled, true))
            .await?;
        info!(host = %self.hostname, "MAC allowlist enabled");
        Ok(())
    }

    pub async fn disable_maclist(&self) -> Result<(), NodeError> {
        self.session
            .send_command(&wpanctl::set(Property::AllowlistEnabled, false))
            .await?;
        info!(host = %self.hostname, "MAC allowlist disabled");
        Ok(())
    }

    /// Extended addresses currently on the node's allowlist
    pub async fn mac_allowlist(&self) -> Result<Vec<String>, NodeError> {
        let reply = self
            .session
            .send_command(&wpanctl::get(Property::AllowlistEntries))
            .await?;
        Ok(wpanctl::parse_list(&reply))
    }

    /// Log the IPv6 and MAC packet counters line by line
    pub async fn log_counters(&self) -> Result<(), NodeError> {
        self.log_report(Property::Ipv6Counters, "IPv6 packet counters").await?;
        self.log_report(Property::MacCounters, "802.15.4 MAC packet counters").await
    }

    /// Log the neighbor table and per-link error rates line by line
    pub async fn log_neighbor_table(&self) -> Result<(), NodeError> {
        self.log_report(Property::NeighborTable, "Neighbour details").await?;
        self.log_report(Property::NeighborErrorRates, "Neighbour link error rates")
            .await
    }

    /// Run an arbitrary command on the node
    pub async fn run(&self, command: &str) -> Result<String, NodeError> {
        Ok(self.session.send_command(command).await?)
    }

    pub async fn disconnect(self) -> Result<(), NodeError> {
        self.session.disconnect().await?;
        info!(host = %self.hostname, "Disconnected");
        Ok(())
    }

    async fn log_report(&self, property: Property, title: &str) -> Result<(), NodeError> {
        let reply = self.session.send_command(&wpanctl::get(property)).await?;
        info!(host = %self.hostname, "{}", title);
        for line in reply.split('\n') {
            info!(host = %self.hostname, "{}", line);
        }
        Ok(())
    }

    async fn query(&self, property: Property) -> Result<String, NodeError> {
        let reply = self.session.send_command(&wpanctl::get(property)).await?;
        wpanctl::parse_value(&reply)
            .map(str::to_string)
            .map_err(|e| self.parse_error(property, e))
    }

    async fn query_int<T: std::str::FromStr>(&self, property: Property) -> Result<T, NodeError> {
        let reply = self.session.send_command(&wpanctl::get(property)).await?;
        wpanctl::parse_int(&reply).map_err(|e| self.parse_error(property, e))
    }

    fn parse_error(&self, property: Property, e: MalformedReply) -> NodeError {
        NodeError::Parse {
            host: self.hostname.clone(),
            property,
            reply: e.reply,
        }
    }
}

/// First DNS label of `host`, or the whole literal for an IP address
fn short_hostname(host: &str) -> &str {
    if host.parse::<IpAddr>().is_ok() {
        return host;
    }
    host.split('.').next().unwrap_or(host)
}

pub fn clamp_tx_power(dbm: i32) -> i32 {
    dbm.clamp(TX_POWER_MIN_DBM, TX_POWER_MAX_DBM)
}
