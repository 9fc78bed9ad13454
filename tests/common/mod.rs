#![allow(dead_code)]
//! Shared harness helpers for the integration tests: in-process hosts
//! talking over loopback TCP with the address gate disabled.

use std::time::Duration;

use cid::Cid;
use libp2p::Multiaddr;
use meshprobe::{Host, HostConfig};

/// A host with no listeners, no DHT and the gate open for loopback dials.
pub fn offline_config() -> HostConfig {
    HostConfig {
        listen_on: Vec::new(),
        bootstrap: Vec::new(),
        enable_dht: false,
        allow_non_global: true,
        ..HostConfig::default()
    }
}

/// Like [`offline_config`] but listening on an ephemeral loopback port.
pub fn listening_config() -> HostConfig {
    HostConfig {
        listen_on: vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()],
        ..offline_config()
    }
}

/// Wait for the host's first listener to come up.
pub async fn wait_listen_addr(host: &Host) -> Multiaddr {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(addrs) = host.listen_addrs().await {
                if let Some(addr) = addrs.into_iter().next() {
                    return addr;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("harness listener did not come up")
}

/// The harness's full multiaddr including its peer identity.
pub async fn p2p_addr(host: &Host) -> Multiaddr {
    let addr = wait_listen_addr(host).await;
    format!("{}/p2p/{}", addr, host.local_peer_id())
        .parse()
        .unwrap()
}

pub const TEST_CID: &str = "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi";

pub fn test_cid() -> Cid {
    Cid::try_from(TEST_CID).unwrap()
}
