/// DHT Query Layer Module
///
/// The three DHT questions the orchestrator asks, built on the host facade
/// and the quorum executor:
///
/// - where does the DHT think a peer lives (with per-server corroboration
///   counts),
/// - who provides a CID (a capped stream),
/// - does one specific peer appear among a CID's providers.
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use cid::Cid;
use libp2p::PeerId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ProbeError, ProbeResult};
use crate::exec::exec_on_many;
use crate::host::Host;
use crate::network::PeerDescriptor;

/// Cap on enumerated providers per CID check.
pub const MAX_PROVIDERS_COUNT: usize = 10;

/// Fraction of closest-peer queries to wait for before the grace window.
const ADDR_LOOKUP_WAIT_FRAC: f64 = 0.3;
/// Deadline for each individual closest-peer query.
const ADDR_LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Ask the DHT where `peer_id` lives: find the closest servers to the peer
/// key, then ask each of them individually for its closest peers and count
/// every address the target shows up with. Each server that returned
/// address A contributes +1 to the map entry for A.
///
/// Returns `DhtUnavailable` when not a single server answered.
pub async fn peer_addrs_in_dht(
    host: &Host,
    cancel: &CancellationToken,
    peer_id: PeerId,
) -> ProbeResult<HashMap<String, usize>> {
    let servers = host.closest_peers(peer_id).await?;
    debug!(peer = %peer_id, servers = servers.len(), "querying closest DHT servers");

    let (found_tx, mut found_rx) = mpsc::unbounded_channel::<PeerDescriptor>();
    let num_success = exec_on_many(
        cancel,
        ADDR_LOOKUP_WAIT_FRAC,
        ADDR_LOOKUP_TIMEOUT,
        servers,
        false,
        |server| {
            let host = host.clone();
            let found_tx = found_tx.clone();
            async move {
                match host.find_node(server.peer_id, peer_id).await {
                    Ok(descriptors) => {
                        if let Some(desc) =
                            descriptors.into_iter().find(|d| d.peer_id == peer_id)
                        {
                            let _ = found_tx.send(desc);
                        }
                        true
                    }
                    Err(e) => {
                        debug!(server = %server.peer_id, "closest-peer query failed: {}", e);
                        false
                    }
                }
            }
        },
    )
    .await;
    drop(found_tx);

    if num_success == 0 {
        return Err(ProbeError::DhtUnavailable);
    }

    // The executor ran strict, so every publisher is done; drain without
    // blocking and accumulate corroboration counts.
    let mut addr_map: HashMap<String, usize> = HashMap::new();
    while let Ok(desc) = found_rx.try_recv() {
        let unique: HashSet<String> = desc.addrs.iter().map(|a| a.to_string()).collect();
        for addr in unique {
            *addr_map.entry(addr).or_insert(0) += 1;
        }
    }
    Ok(addr_map)
}

/// Stream the providers of a CID. The consumer enforces the cap by reading
/// at most that many and dropping the receiver, which cancels the
/// underlying query.
pub async fn provider_stream(
    host: &Host,
    cid: &Cid,
    buffer: usize,
) -> ProbeResult<mpsc::Receiver<PeerDescriptor>> {
    host.providers(cid.hash().to_bytes(), buffer).await
}

/// Whether `peer_id` itself appears among the providers of `cid`. Streams
/// without a cap and short-circuits on the first match.
pub async fn provider_record_present(
    host: &Host,
    cancel: &CancellationToken,
    cid: &Cid,
    peer_id: PeerId,
) -> ProbeResult<bool> {
    let mut rx = provider_stream(host, cid, 64).await?;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            next = rx.recv() => match next {
                Some(provider) if provider.peer_id == peer_id => return Ok(true),
                Some(_) => {}
                None => return Ok(false),
            },
        }
    }
}
