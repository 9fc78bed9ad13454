/// Network Module
///
/// This module builds the libp2p swarm that backs a probe host and holds the
/// small pieces of the data model that everything else shares: the peer
/// descriptor and the public/non-public address classification.
///
/// The swarm combines:
/// - Kademlia in client-only mode (toggled off on ephemeral hosts),
/// - identify, so discovered peers teach us their addresses,
/// - relay client + DCUtR, so relayed connections are upgraded to direct
///   ones where NAT traversal permits,
/// - a bitswap request/response behaviour for the block-availability probe,
/// - an outbound-only request/response behaviour speaking the Kademlia wire
///   protocol, used to address a single DHT server at a time.
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use anyhow::Result;
use libp2p::kad::store::MemoryStore;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{
    dcutr, identify, kad, noise, ping, relay, request_response,
    request_response::ProtocolSupport,
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder,
};

use crate::bitswap::{BitswapCodec, BITSWAP_PROTOCOLS};
use crate::error::ProbeError;
use crate::kad_wire::{FindNodeCodec, KAD_PROTOCOL};

/// Default bootstrap set for the public overlay.
pub const DEFAULT_BOOTSTRAP: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

/// A peer identity together with the transport addresses we know for it.
/// The address set may be empty (identity-only form).
#[derive(Debug, Clone)]
pub struct PeerDescriptor {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerDescriptor {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }

    /// Parse a descriptor from a multiaddress that carries a `/p2p/` peer
    /// identity, e.g. `/ip4/1.2.3.4/tcp/4001/p2p/Qm...` or the
    /// identity-only form `/p2p/Qm...`.
    ///
    /// The last `/p2p/` component names the peer; everything before it is
    /// the transport address. Relay addresses keep their full path.
    pub fn parse(s: &str) -> Result<Self, ProbeError> {
        let maddr: Multiaddr = s
            .parse()
            .map_err(|e| ProbeError::InputParse(format!("invalid multiaddr {:?}: {}", s, e)))?;

        let mut transport = Multiaddr::empty();
        let mut peer_id = None;
        for proto in maddr.iter() {
            match proto {
                Protocol::P2p(id) => {
                    // A peer id that is followed by more protocol components
                    // (e.g. a relay hop) belongs to the transport path.
                    if let Some(prev) = peer_id.replace(id) {
                        transport.push(Protocol::P2p(prev));
                    }
                }
                other => {
                    if let Some(prev) = peer_id.take() {
                        transport.push(Protocol::P2p(prev));
                    }
                    transport.push(other);
                }
            }
        }

        let peer_id = peer_id
            .ok_or_else(|| ProbeError::InputParse(format!("no /p2p/ peer id in {:?}", s)))?;
        let addrs = if transport.is_empty() {
            Vec::new()
        } else {
            vec![transport]
        };
        Ok(Self { peer_id, addrs })
    }

    /// True when the descriptor carries no transport addresses.
    pub fn is_identity_only(&self) -> bool {
        self.addrs.is_empty()
    }

    /// The subset of addresses classified as publicly routable.
    pub fn public_addrs(&self) -> Vec<Multiaddr> {
        filter_public(&self.addrs)
    }
}

// Returns true if the address appears to be globally reachable.
// Taken from the unstable std::net implementation.
pub fn is_global_v4(ip: Ipv4Addr) -> bool {
    !(ip.octets()[0] == 0
        || ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        // addresses reserved for future protocols (`192.0.0.0/24`)
        // .9 and .10 are documented as globally reachable so they're excluded
        || (ip.octets()[0] == 192
            && ip.octets()[1] == 0
            && ip.octets()[2] == 0
            && ip.octets()[3] != 9
            && ip.octets()[3] != 10)
        || ip.is_documentation()
        || ip.is_broadcast())
}

// Returns true if the IPv6 address appears to be globally reachable.
pub fn is_global_v6(ip: Ipv6Addr) -> bool {
    !(ip.is_loopback()
        || ip.is_unspecified()
        // link-local fe80::/10
        || (ip.segments()[0] & 0xffc0) == 0xfe80
        // unique local fc00::/7
        || (ip.segments()[0] & 0xfe00) == 0xfc00
        // documentation 2001:db8::/32
        || (ip.segments()[0] == 0x2001 && ip.segments()[1] == 0xdb8))
}

/// True when the multiaddress points at something globally routable. DNS
/// names are treated as public; whatever they resolve to is dialed through
/// the DNS transport.
pub fn is_multiaddr_public(addr: &Multiaddr) -> bool {
    addr.iter().any(|proto| match proto {
        Protocol::Ip4(ip) => is_global_v4(ip),
        Protocol::Ip6(ip) => is_global_v6(ip),
        Protocol::Dns(_) | Protocol::Dns4(_) | Protocol::Dns6(_) | Protocol::Dnsaddr(_) => true,
        _ => false,
    })
}

/// Keep only the publicly routable addresses.
pub fn filter_public(addrs: &[Multiaddr]) -> Vec<Multiaddr> {
    addrs
        .iter()
        .filter(|a| is_multiaddr_public(a))
        .cloned()
        .collect()
}

/// Configuration for a probe host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Addresses to listen on. Ephemeral hosts pass an empty list.
    pub listen_on: Vec<Multiaddr>,
    /// Bootstrap peers, as multiaddrs carrying a `/p2p/` identity.
    pub bootstrap: Vec<Multiaddr>,
    /// Whether to run the Kademlia client at all. Ephemeral hosts used for
    /// user-supplied-address probes carry no DHT.
    pub enable_dht: bool,
    /// Serve DHT requests instead of running client-only. The probe itself
    /// never serves; harness peers in tests do.
    pub dht_server_mode: bool,
    /// Walk the full bootstrap refresh before reporting ready.
    pub accelerated_dht: bool,
    /// Dial addresses that are private/loopback/link-local. Off in
    /// production so the probe cannot report false positives through the
    /// operator's own LAN; the test harness turns it on.
    pub allow_non_global: bool,
    /// Connections idle longer than this are closed.
    pub idle_timeout: Duration,
    /// agent_version advertised over identify.
    pub agent_version: String,
    /// CIDs (raw bytes) this host claims to have when answering inbound
    /// block-exchange requests. Empty in production.
    pub blockstore: HashSet<Vec<u8>>,
    /// Provider keys to announce on startup. Requires server mode; empty
    /// in production.
    pub provide: Vec<Vec<u8>>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_on: vec![
                "/ip4/0.0.0.0/tcp/0".parse().expect("static multiaddr"),
                "/ip4/0.0.0.0/udp/0/quic-v1".parse().expect("static multiaddr"),
            ],
            bootstrap: DEFAULT_BOOTSTRAP
                .iter()
                .map(|s| s.parse().expect("static multiaddr"))
                .collect(),
            enable_dht: true,
            dht_server_mode: false,
            accelerated_dht: false,
            allow_non_global: false,
            idle_timeout: Duration::from_secs(30),
            agent_version: format!("meshprobe/{}", env!("CARGO_PKG_VERSION")),
            blockstore: HashSet::new(),
            provide: Vec::new(),
        }
    }
}

impl HostConfig {
    /// Configuration for an ephemeral host: same gating policy, no DHT, no
    /// listeners.
    pub fn ephemeral(&self) -> Self {
        Self {
            listen_on: Vec::new(),
            bootstrap: Vec::new(),
            enable_dht: false,
            dht_server_mode: false,
            accelerated_dht: false,
            allow_non_global: self.allow_non_global,
            idle_timeout: self.idle_timeout,
            agent_version: self.agent_version.clone(),
            blockstore: HashSet::new(),
            provide: Vec::new(),
        }
    }
}

/// Split a bootstrap multiaddr into (peer id, transport address).
pub fn split_peer_addr(addr: &Multiaddr) -> Option<(PeerId, Multiaddr)> {
    let desc = PeerDescriptor::parse(&addr.to_string()).ok()?;
    let transport = desc.addrs.into_iter().next()?;
    Some((desc.peer_id, transport))
}

/// Combined network behaviour for a probe host.
#[derive(NetworkBehaviour)]
pub struct ProbeBehaviour {
    pub kad: Toggle<kad::Behaviour<MemoryStore>>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub relay_client: relay::client::Behaviour,
    pub dcutr: dcutr::Behaviour,
    pub bitswap: request_response::Behaviour<BitswapCodec>,
    pub kad_wire: request_response::Behaviour<FindNodeCodec>,
}

/// Build a swarm for the given host configuration.
pub fn build_swarm(cfg: &HostConfig) -> Result<Swarm<ProbeBehaviour>> {
    let bootstrap_pairs: Vec<(PeerId, Multiaddr)> = cfg
        .bootstrap
        .iter()
        .filter_map(split_peer_addr)
        .collect();
    let enable_dht = cfg.enable_dht;
    let server_mode = cfg.dht_server_mode;
    let agent_version = cfg.agent_version.clone();

    let mut swarm = SwarmBuilder::with_new_identity()
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_quic()
        .with_dns()?
        .with_relay_client(noise::Config::new, yamux::Config::default)?
        .with_behaviour(|key, relay_client| {
            let local_peer_id = key.public().to_peer_id();

            let kad = if enable_dht {
                let mut kad_cfg = kad::Config::new(KAD_PROTOCOL);
                kad_cfg.set_query_timeout(Duration::from_secs(60));
                let store = MemoryStore::new(local_peer_id);
                let mut kad = kad::Behaviour::with_config(local_peer_id, store, kad_cfg);
                // Client-only: the probe queries the DHT but never serves
                // it. Harness peers flip to server mode.
                kad.set_mode(Some(if server_mode {
                    kad::Mode::Server
                } else {
                    kad::Mode::Client
                }));
                for (peer, addr) in &bootstrap_pairs {
                    kad.add_address(peer, addr.clone());
                }
                Some(kad)
            } else {
                None
            };

            let identify = identify::Behaviour::new(
                identify::Config::new("ipfs/0.1.0".to_string(), key.public())
                    .with_agent_version(agent_version.clone()),
            );

            let bitswap = request_response::Behaviour::new(
                BITSWAP_PROTOCOLS
                    .iter()
                    .map(|p| (p.clone(), ProtocolSupport::Full)),
                request_response::Config::default()
                    .with_request_timeout(Duration::from_secs(10)),
            );

            // Outbound-only so it never competes with a server-mode
            // Kademlia behaviour for inbound streams on the same protocol.
            let kad_wire = request_response::Behaviour::new(
                [(KAD_PROTOCOL, ProtocolSupport::Outbound)],
                request_response::Config::default()
                    .with_request_timeout(Duration::from_secs(10)),
            );

            ProbeBehaviour {
                kad: Toggle::from(kad),
                identify,
                ping: ping::Behaviour::default(),
                relay_client,
                dcutr: dcutr::Behaviour::new(local_peer_id),
                bitswap,
                kad_wire,
            }
        })?
        .with_swarm_config(|c| c.with_idle_connection_timeout(cfg.idle_timeout))
        .build();

    for addr in &cfg.listen_on {
        swarm.listen_on(addr.clone())?;
    }

    Ok(swarm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn maddr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn classify_public_addresses() {
        assert!(is_multiaddr_public(&maddr("/ip4/104.131.131.82/tcp/4001")));
        assert!(is_multiaddr_public(&maddr("/ip6/2606:4700::6810:85e5/tcp/4001")));
        assert!(is_multiaddr_public(&maddr("/dns4/example.com/tcp/4001")));
        assert!(is_multiaddr_public(&maddr("/dnsaddr/bootstrap.libp2p.io")));
    }

    #[test]
    fn classify_non_public_addresses() {
        assert!(!is_multiaddr_public(&maddr("/ip4/192.168.1.10/tcp/4001")));
        assert!(!is_multiaddr_public(&maddr("/ip4/10.0.0.1/tcp/4001")));
        assert!(!is_multiaddr_public(&maddr("/ip4/127.0.0.1/tcp/4001")));
        assert!(!is_multiaddr_public(&maddr("/ip4/169.254.7.7/tcp/4001")));
        assert!(!is_multiaddr_public(&maddr("/ip4/203.0.113.7/tcp/4001")));
        assert!(!is_multiaddr_public(&maddr("/ip6/::1/tcp/4001")));
        assert!(!is_multiaddr_public(&maddr("/ip6/fe80::1/tcp/4001")));
        assert!(!is_multiaddr_public(&maddr("/ip6/fd00::1/tcp/4001")));
        assert!(!is_multiaddr_public(&Multiaddr::empty()));
    }

    #[test]
    fn filter_keeps_only_public() {
        let addrs = vec![
            maddr("/ip4/192.168.1.10/tcp/4001"),
            maddr("/ip4/104.131.131.82/tcp/4001"),
            maddr("/ip4/127.0.0.1/tcp/4001"),
        ];
        let public = filter_public(&addrs);
        assert_eq!(public, vec![maddr("/ip4/104.131.131.82/tcp/4001")]);
    }

    #[test]
    fn parse_identity_only_descriptor() {
        let desc =
            PeerDescriptor::parse("/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ").unwrap();
        assert!(desc.is_identity_only());
        assert_eq!(
            desc.peer_id.to_string(),
            "QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ"
        );
    }

    #[test]
    fn parse_full_descriptor_preserves_transport() {
        let desc = PeerDescriptor::parse(
            "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
        )
        .unwrap();
        assert!(!desc.is_identity_only());
        assert_eq!(desc.addrs, vec![maddr("/ip4/104.131.131.82/tcp/4001")]);
    }

    #[test]
    fn parse_relay_descriptor_keeps_relay_path() {
        let s = "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ/p2p-circuit/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN";
        let desc = PeerDescriptor::parse(s).unwrap();
        assert_eq!(
            desc.peer_id.to_string(),
            "QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN"
        );
        assert_eq!(desc.addrs.len(), 1);
        assert!(desc.addrs[0].to_string().ends_with("/p2p-circuit"));
    }

    #[test]
    fn parse_rejects_missing_peer_id() {
        assert!(PeerDescriptor::parse("/ip4/1.2.3.4/tcp/4001").is_err());
        assert!(PeerDescriptor::parse("not a multiaddr").is_err());
    }

    #[test]
    fn bootstrap_set_parses() {
        for s in DEFAULT_BOOTSTRAP {
            let addr: Multiaddr = s.parse().unwrap();
            assert!(split_peer_addr(&addr).is_some(), "unsplittable: {}", s);
        }
    }
}
