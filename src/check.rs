/// Check Orchestrator Module
///
/// The two top-level probe operations. `check_cid` fans out over every
/// provider the DHT reports for a CID; `check_peer` inspects one peer from
/// every angle the engine knows: DHT discoverability, provider record
/// presence, reachability, and block availability.
///
/// Only input parsing and bootstrap failures surface as `Err`; everything a
/// remote peer can cause lands in the report, one dimension at a time, so a
/// single misbehaving provider never hides the others.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cid::Cid;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dht;
use crate::error::{ProbeError, ProbeResult};
use crate::host::Host;
use crate::metrics::Metrics;
use crate::network::{HostConfig, PeerDescriptor};
use crate::probe;
use crate::report::{PeerReport, ProviderReport};

/// Dial deadline for each provider probed during a CID check.
const PROVIDER_DIAL_TIMEOUT: Duration = Duration::from_secs(15);
/// Dial deadline for the single target of a peer check.
const PEER_DIAL_TIMEOUT: Duration = Duration::from_secs(120);

/// The diagnostic engine's entry point, bound to the shared host.
#[derive(Clone)]
pub struct Checker {
    host: Host,
    base_cfg: HostConfig,
    metrics: Arc<Metrics>,
}

impl Checker {
    pub fn new(host: Host, base_cfg: HostConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            host,
            base_cfg,
            metrics,
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Enumerate providers for `cid_str` (capped) and probe each one as it
    /// arrives. Report order is non-deterministic.
    pub async fn check_cid(
        &self,
        cancel: &CancellationToken,
        cid_str: &str,
    ) -> ProbeResult<Vec<ProviderReport>> {
        let cid = parse_cid(cid_str)?;
        self.metrics.checks_total.with_label_values(&["cid"]).inc();
        info!(%cid, "checking CID");

        let mut providers =
            dht::provider_stream(&self.host, &cid, dht::MAX_PROVIDERS_COUNT).await?;
        let reports = Arc::new(Mutex::new(Vec::new()));
        let mut workers = JoinSet::new();
        let mut accepted = 0usize;

        while accepted < dht::MAX_PROVIDERS_COUNT {
            let provider = tokio::select! {
                _ = cancel.cancelled() => break,
                next = providers.recv() => match next {
                    Some(provider) => provider,
                    None => break,
                },
            };
            accepted += 1;
            debug!(provider = %provider.peer_id, "provider discovered");
            workers.spawn(probe_provider(
                self.host.clone(),
                self.metrics.clone(),
                cancel.child_token(),
                cid,
                provider,
                reports.clone(),
            ));
        }
        // Dropping the stream cancels the provider query once the cap is
        // reached or the caller gave up.
        drop(providers);

        while workers.join_next().await.is_some() {}

        let collected = std::mem::take(&mut *reports.lock().unwrap());
        Ok(collected)
    }

    /// Probe one peer: DHT discoverability and provider-record presence are
    /// always populated from the shared host; reachability and block
    /// availability run against the shared host for identity-only
    /// descriptors and against a fresh ephemeral host when the caller
    /// supplied the address to test.
    pub async fn check_peer(
        &self,
        cancel: &CancellationToken,
        multiaddr_str: &str,
        cid_str: &str,
    ) -> ProbeResult<PeerReport> {
        let target = PeerDescriptor::parse(multiaddr_str)?;
        let cid = parse_cid(cid_str)?;
        self.metrics.checks_total.with_label_values(&["peer"]).inc();
        info!(peer = %target.peer_id, %cid, "checking peer");

        let mut report = PeerReport::default();

        let (record_present, addr_lookup) = tokio::join!(
            dht::provider_record_present(&self.host, cancel, &cid, target.peer_id),
            dht::peer_addrs_in_dht(&self.host, cancel, target.peer_id),
        );
        report.provider_record_from_peer_in_dht = record_present?;

        let identity_only = target.is_identity_only();
        let mut dial_target = target.clone();
        match addr_lookup {
            Ok(addr_map) => {
                if identity_only {
                    // Adopt whatever the DHT knows; the gate decides later
                    // which of these are dialable.
                    dial_target.addrs = addr_map
                        .keys()
                        .filter_map(|addr| addr.parse().ok())
                        .collect();
                }
                report.peer_found_in_dht = addr_map;
            }
            Err(e) => {
                if identity_only {
                    // Nothing to dial: the DHT failure is the connection
                    // error.
                    report.connection_error = e.to_string();
                    return Ok(report);
                }
                debug!(peer = %target.peer_id, "DHT address lookup failed: {}", e);
            }
        }

        // User-supplied addresses are probed on an isolated host so a
        // connection the shared host picked up during DHT traversal cannot
        // masquerade as reachability of the supplied address.
        let host = if identity_only {
            self.host.clone()
        } else {
            Host::ephemeral(&self.base_cfg)?
        };

        let connected = tokio::select! {
            _ = cancel.cancelled() => Err(ProbeError::Unreachable("probe cancelled".into())),
            res = tokio::time::timeout(PEER_DIAL_TIMEOUT, host.connect(&dial_target)) => {
                res.unwrap_or_else(|_| {
                    Err(ProbeError::Unreachable(format!(
                        "dial timed out after {}s",
                        PEER_DIAL_TIMEOUT.as_secs()
                    )))
                })
            }
        };
        self.metrics.record_dial(connected.is_ok());
        if let Err(e) = connected {
            report.connection_error = e.to_string();
            return Ok(report);
        }

        if let Err(e) = host.open_stream(target.peer_id).await {
            report.connection_error = e.to_string();
            return Ok(report);
        }

        report.block = probe::check_block(&host, &cid, target.peer_id).await;
        self.metrics.record_block_probe(&report.block);
        report.connection_maddrs = host
            .connections_to(target.peer_id)
            .await?
            .iter()
            .map(ToString::to_string)
            .collect();
        Ok(report)
    }
}

/// One CID-check worker: dial, trigger the stream upgrade, probe the
/// block, list the connections, then append the report.
async fn probe_provider(
    host: Host,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    cid: Cid,
    provider: PeerDescriptor,
    reports: Arc<Mutex<Vec<ProviderReport>>>,
) {
    let mut report = ProviderReport {
        id: provider.peer_id.to_string(),
        addrs: provider
            .public_addrs()
            .iter()
            .map(ToString::to_string)
            .collect(),
        ..Default::default()
    };

    let connected = tokio::select! {
        _ = cancel.cancelled() => Err(ProbeError::Unreachable("probe cancelled".into())),
        res = tokio::time::timeout(PROVIDER_DIAL_TIMEOUT, host.connect(&provider)) => {
            res.unwrap_or_else(|_| {
                Err(ProbeError::Unreachable(format!(
                    "dial timed out after {}s",
                    PROVIDER_DIAL_TIMEOUT.as_secs()
                )))
            })
        }
    };
    metrics.record_dial(connected.is_ok());

    match connected {
        Err(e) => {
            report.connection_error = e.to_string();
        }
        Ok(()) => {
            // The stream open doubles as the upgrade trigger for relayed
            // connections; its failure is a connection-level finding.
            match host.open_stream(provider.peer_id).await {
                Err(e) => {
                    report.connection_error = e.to_string();
                }
                Ok(protocol) => {
                    debug!(provider = %provider.peer_id, %protocol, "stream negotiated");
                    report.block = probe::check_block(&host, &cid, provider.peer_id).await;
                    metrics.record_block_probe(&report.block);
                    report.connection_maddrs = host
                        .connections_to(provider.peer_id)
                        .await
                        .unwrap_or_default()
                        .iter()
                        .map(ToString::to_string)
                        .collect();
                }
            }
        }
    }

    reports.lock().unwrap().push(report);
}

fn parse_cid(cid_str: &str) -> ProbeResult<Cid> {
    Cid::try_from(cid_str)
        .map_err(|e| ProbeError::InputParse(format!("invalid cid {:?}: {}", cid_str, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_parse_round_trips() {
        let s = "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi";
        let cid = parse_cid(s).unwrap();
        assert_eq!(cid.to_string(), s);
    }

    #[test]
    fn cid_parse_rejects_garbage() {
        let err = parse_cid("not-a-cid").unwrap_err();
        assert!(matches!(err, ProbeError::InputParse(_)));
        assert!(err.is_fatal());
    }
}
