// ===================================================================================================
// meshprobe - Diagnostic Probe for Content-Addressed P2P Overlays
// ===================================================================================================
//
// Given a CID, or a CID plus a peer descriptor, meshprobe answers through
// live network observation: is the content advertised in the DHT, is the
// peer discoverable, is it reachable on the addresses it advertises or the
// user supplied, and does it actually serve the requested block over the
// block exchange.
//
// The engine is five cooperating components, leaves first:
//
// 1. Host facade (network.rs + host.rs) - the swarm behind an actor with a
//    cloneable handle; connection gating, DHT client, relay + DCUtR,
//    block-exchange and kad wire codecs.
// 2. Quorum fan-out executor (exec.rs) - bounded-concurrency fan-out with
//    ratio threshold, grace ticker and doubled-success cutoff.
// 3. DHT query layer (dht.rs) - peer-address lookup with per-server
//    corroboration, capped provider enumeration, provider-record presence.
// 4. Block-availability probe (probe.rs) - WANT_HAVE with latency
//    measurement.
// 5. Check orchestrator (check.rs) - CidCheck and PeerCheck composing the
//    above into one report per invocation.
//
// Data flows strictly downward; results aggregate upward into a single
// immutable report. The process keeps no state between invocations.
//
// ===================================================================================================

// ===== DIAGNOSTIC ENGINE =====
pub mod check;      // Check orchestrator: the CidCheck / PeerCheck operations
pub mod dht;        // DHT query layer: address lookup, provider enumeration
pub mod exec;       // Quorum fan-out executor with early-termination heuristic
pub mod probe;      // Block-availability probe over the block exchange

// ===== HOST AND WIRE PROTOCOLS =====
pub mod host;       // Host facade: swarm actor and cloneable handle
pub mod network;    // Swarm construction, behaviour, address classification
pub mod bitswap;    // Bitswap message subset and codec
pub mod kad_wire;   // Kademlia wire subset for direct FIND_NODE queries
pub mod wire;       // Varint-framed protobuf helpers

// ===== SURFACE AND PLUMBING =====
pub mod api_server; // HTTP surface over the engine
pub mod cli;        // Command line argument parsing
pub mod config;     // Flag/environment configuration resolution
pub mod error;      // Error taxonomy and propagation policy
pub mod logging;    // Structured logging setup
pub mod metrics;    // Prometheus registries and encoding
pub mod report;     // Report data model and serialization

pub use check::Checker;
pub use error::{ProbeError, ProbeResult};
pub use host::Host;
pub use network::{HostConfig, PeerDescriptor};
pub use report::{BlockProbeResult, PeerReport, ProviderReport};
