//! wpanctl command builders and reply parsers
//!
//! The tool's text output is fixed and externally defined. Single-value
//! queries reply with one line, `<Key> = <value>`, where string values are
//! wrapped in double quotes and byte strings in square brackets:
//!
//! ```text
//! IPv6:MeshLocalAddress = "fd00::1"
//! NCP:Channel = 15
//! Network:Key = [00112233445566778899AABBCCDDEEFF]
//! ```

use std::fmt;
use thiserror::Error;

/// Start the management daemon unless it is already running
pub const START_DAEMON: &str =
    "sudo sh -c 'pgrep -x wpantund >/dev/null || (wpantund >/dev/null 2>&1 &)'";
pub const LEAVE: &str = "sudo wpanctl leave";
pub const RESET: &str = "sudo wpanctl reset";
pub const PERMIT_JOIN: &str = "sudo wpanctl permit-join --network-wide";

/// Node type requested when joining; 2 is a router
const JOIN_NODE_TYPE: u8 = 2;

/// Properties queried with `wpanctl get`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    MeshLocalAddress,
    ExtendedAddress,
    PanId,
    XPanId,
    Channel,
    Frequency,
    NetworkKey,
    TxPower,
    State,
    NodeType,
    AllowlistEntries,
    AllowlistEnabled,
    Ipv6Counters,
    MacCounters,
    NeighborTable,
    NeighborErrorRates,
}

impl Property {
    pub fn key(self) -> &'static str {
        match self {
            Property::MeshLocalAddress => "IPv6:MeshLocalAddress",
            Property::ExtendedAddress => "NCP:ExtendedAddress",
            Property::PanId => "Network:PANID",
            Property::XPanId => "Network:XPANID",
            Property::Channel => "NCP:Channel",
            Property::Frequency => "NCP:Frequency",
            Property::NetworkKey => "Network:Key",
            Property::TxPower => "NCP:TXPower",
            Property::State => "NCP:State",
            Property::NodeType => "Network:NodeType",
            Property::AllowlistEntries => "MAC:Allowlist:Entries",
            Property::AllowlistEnabled => "MAC:Allowlist:Enabled",
            Property::Ipv6Counters => "NCP:Counter:AllIPv6",
            Property::MacCounters => "NCP:Counter:AllMac",
            Property::NeighborTable => "Thread:NeighborTable",
            Property::NeighborErrorRates => "Thread:NeighborTable:ErrorRates",
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

pub fn get(property: Property) -> String {
    format!("sudo wpanctl get {}", property.key())
}

pub fn set(property: Property, value: impl fmt::Display) -> String {
    format!("sudo wpanctl set {} {}", property.key(), value)
}

pub fn add(property: Property, value: impl fmt::Display) -> String {
    format!("sudo wpanctl add {} {}", property.key(), value)
}

pub fn form(network_name: &str) -> String {
    format!("sudo wpanctl form {}", network_name)
}

pub fn join(network_name: &str, panid: &str, xpanid: &str, channel: u16) -> String {
    format!(
        "sudo wpanctl join {} -T {} -p {} -x {} -c {}",
        network_name, JOIN_NODE_TYPE, panid, xpanid, channel
    )
}

/// A reply that does not have the `<Key> = <value>` shape
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed reply: {reply:?}")]
pub struct MalformedReply {
    pub reply: String,
}

/// Extract the value from a `<Key> = <value>` reply, unquoted
pub fn parse_value(reply: &str) -> Result<&str, MalformedReply> {
    let line = reply.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 3 || tokens[1] != "=" {
        return Err(MalformedReply {
            reply: reply.to_string(),
        });
    }

    let value = tokens[tokens.len() - 1];
    Ok(unquote(value))
}

/// Parse an integer-valued reply such as `NCP:Channel = 15`
pub fn parse_int<T: std::str::FromStr>(reply: &str) -> Result<T, MalformedReply> {
    parse_value(reply)?.parse().map_err(|_| MalformedReply {
        reply: reply.to_string(),
    })
}

fn unquote(value: &str) -> &str {
    let quoted = value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('[') && value.ends_with(']')));
    if quoted {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// True when a `form` reply reports success
pub fn form_succeeded(reply: &str) -> bool {
    reply.to_lowercase().contains("success")
}

/// Entries of a bracketed multi-line list reply such as the allowlist
///
/// ```text
/// [
/// 	"CAFE000CAFE1111"
/// 	"CAFE000CAFE2222"
/// ]
/// ```
pub fn parse_list(reply: &str) -> Vec<String> {
    reply
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && *l != "[" && *l != "]")
        .filter(|l| !l.contains(" = "))
        .map(|l| unquote(l.trim_end_matches(',')).to_string())
        .collect()
}

/// `LastRssi` of the first entry in a neighbor table reply
///
/// Entries are comma separated `Name:Value` fields following the extended
/// address, the fifth field being `LastRssi`.
pub fn first_neighbor_rssi(table: &str) -> Option<i16> {
    let entry = table.split('\n').nth(1)?.trim();
    let field = entry.split(',').nth(4)?;
    field.split(':').nth(1)?.trim().trim_end_matches('"').parse().ok()
}
