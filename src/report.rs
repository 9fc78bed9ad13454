/// Report Data Model Module
///
/// The structures a probe invocation returns, and their canonical JSON
/// form. Field names are part of the interface: external tooling matches
/// on them, so serialization is pinned with explicit renames and unknown
/// fields are rejected on the way in. Absent optional fields default to
/// empty string / empty list / false.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Outcome of asking one peer for one block over the block exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockProbeResult {
    /// Round-trip time of the probe in milliseconds.
    #[serde(rename = "DurationMs", default)]
    pub duration_ms: u64,
    /// The peer affirmatively claims to hold the block.
    #[serde(rename = "Found", default)]
    pub found: bool,
    /// The peer replied at all, positively or negatively.
    #[serde(rename = "Responded", default)]
    pub responded: bool,
    #[serde(rename = "Error", default)]
    pub error: String,
}

/// One provider probed during a CID check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderReport {
    #[serde(rename = "ID", default)]
    pub id: String,
    /// Public addresses the provider advertised. Non-public ones are
    /// filtered out before the report leaves the engine.
    #[serde(rename = "Addrs", default)]
    pub addrs: Vec<String>,
    /// Empty iff a connection was established.
    #[serde(rename = "ConnectionError", default)]
    pub connection_error: String,
    /// Addresses of the connections actually established; may hold both a
    /// relay path and a direct path after a hole-punch upgrade.
    #[serde(rename = "ConnectionMaddrs", default)]
    pub connection_maddrs: Vec<String>,
    #[serde(rename = "Block", default)]
    pub block: BlockProbeResult,
}

/// Result of a peer check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerReport {
    /// Empty iff a connection was established.
    #[serde(rename = "ConnectionError", default)]
    pub connection_error: String,
    /// Address string → how many DHT servers independently reported it.
    /// Higher counts mean more corroboration.
    #[serde(rename = "PeerFoundInDHT", default)]
    pub peer_found_in_dht: HashMap<String, usize>,
    /// True iff the peer itself appears among the providers of the CID.
    #[serde(rename = "ProviderRecordFromPeerInDHT", default)]
    pub provider_record_from_peer_in_dht: bool,
    #[serde(rename = "ConnectionMaddrs", default)]
    pub connection_maddrs: Vec<String>,
    #[serde(rename = "Block", default)]
    pub block: BlockProbeResult,
}
