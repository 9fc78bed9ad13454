//! Orchestrator integration tests: CID checks and peer checks against
//! in-process harness peers.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use meshprobe::metrics::Metrics;
use meshprobe::{Checker, Host, HostConfig, ProbeError};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use common::{listening_config, offline_config, test_cid, TEST_CID};

const TEST_TIMEOUT: Duration = Duration::from_secs(60);

fn checker_for(cfg: HostConfig) -> Checker {
    let host = Host::new(cfg.clone()).unwrap();
    Checker::new(host, cfg, Arc::new(Metrics::new().unwrap()))
}

/// A DHT server that provides and serves the test CID.
async fn providing_harness() -> (Host, libp2p::Multiaddr) {
    let cid = test_cid();
    let mut cfg = listening_config();
    cfg.enable_dht = true;
    cfg.dht_server_mode = true;
    cfg.blockstore = HashSet::from([cid.to_bytes()]);
    cfg.provide = vec![cid.hash().to_bytes()];
    let harness = Host::new(cfg).unwrap();
    let maddr = common::p2p_addr(&harness).await;
    (harness, maddr)
}

#[tokio::test]
async fn check_cid_rejects_malformed_input() {
    let checker = checker_for(offline_config());
    let err = checker
        .check_cid(&CancellationToken::new(), "not a cid")
        .await
        .unwrap_err();
    assert!(matches!(err, ProbeError::InputParse(_)));
}

#[tokio::test]
async fn check_cid_without_providers_returns_empty() {
    let checker = checker_for(offline_config());
    let reports = timeout(
        TEST_TIMEOUT,
        checker.check_cid(&CancellationToken::new(), TEST_CID),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(reports.is_empty());
}

#[tokio::test]
async fn check_cid_probes_a_providing_peer() {
    let cid = test_cid();
    let (harness, harness_maddr) = providing_harness().await;

    let mut probe_cfg = offline_config();
    probe_cfg.enable_dht = true;
    probe_cfg.bootstrap = vec![harness_maddr];
    let checker = checker_for(probe_cfg);

    let reports = timeout(
        TEST_TIMEOUT,
        checker.check_cid(&CancellationToken::new(), &cid.to_string()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.id, harness.local_peer_id().to_string());
    assert!(report.connection_error.is_empty(), "{}", report.connection_error);
    assert!(!report.connection_maddrs.is_empty());
    assert!(report.block.responded);
    assert!(report.block.found);
    // Loopback harness addresses are never advertised as public.
    assert!(report.addrs.is_empty());
}

#[tokio::test]
async fn check_peer_identity_only_without_dht_reports_the_lookup_error() {
    let checker = checker_for(offline_config());
    let peer = PeerId::random();

    let report = timeout(
        TEST_TIMEOUT,
        checker.check_peer(
            &CancellationToken::new(),
            &format!("/p2p/{}", peer),
            TEST_CID,
        ),
    )
    .await
    .unwrap()
    .unwrap();

    // No DHT answer means no dial attempt: the lookup failure is the
    // connection error and the probe never ran.
    assert!(!report.connection_error.is_empty());
    assert!(report.peer_found_in_dht.is_empty());
    assert!(!report.provider_record_from_peer_in_dht);
    assert!(!report.block.responded);
    assert!(report.connection_maddrs.is_empty());
}

#[tokio::test]
async fn check_peer_identity_only_against_a_providing_peer() {
    let cid = test_cid();
    let (harness, harness_maddr) = providing_harness().await;

    let mut probe_cfg = offline_config();
    probe_cfg.enable_dht = true;
    probe_cfg.bootstrap = vec![harness_maddr];
    let checker = checker_for(probe_cfg);

    let report = timeout(
        TEST_TIMEOUT,
        checker.check_peer(
            &CancellationToken::new(),
            &format!("/p2p/{}", harness.local_peer_id()),
            &cid.to_string(),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(report.provider_record_from_peer_in_dht);
    assert!(report.connection_error.is_empty(), "{}", report.connection_error);
    assert!(report.block.responded);
    assert!(report.block.found);
    assert!(!report.connection_maddrs.is_empty());
}

#[tokio::test]
async fn check_peer_user_address_dial_failure_is_reported() {
    let checker = checker_for(offline_config());
    let maddr = format!("/ip4/127.0.0.1/tcp/9/p2p/{}", PeerId::random());

    let report = timeout(
        TEST_TIMEOUT,
        checker.check_peer(&CancellationToken::new(), &maddr, TEST_CID),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(!report.connection_error.is_empty());
    // The block probe is never attempted after a failed dial.
    assert!(!report.block.responded);
    assert!(report.block.error.is_empty());
    assert!(report.connection_maddrs.is_empty());
}

#[tokio::test]
async fn check_peer_rejects_malformed_multiaddr() {
    let checker = checker_for(offline_config());
    let err = checker
        .check_peer(&CancellationToken::new(), "nonsense", TEST_CID)
        .await
        .unwrap_err();
    assert!(matches!(err, ProbeError::InputParse(_)));
}
