/// Metrics Module
///
/// Two Prometheus registries, matching the two scrape endpoints: one for
/// the probe's network activity, one for the HTTP surface.
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    pub net_registry: Registry,
    pub http_registry: Registry,

    /// Checks started, by kind (`cid` / `peer`).
    pub checks_total: IntCounterVec,
    /// Probe dials, by outcome (`ok` / `error`).
    pub dials_total: IntCounterVec,
    /// Block probes, by outcome (`found` / `not_found` / `error`).
    pub block_probes_total: IntCounterVec,

    /// HTTP requests, by endpoint and status code.
    pub http_requests_total: IntCounterVec,
    /// HTTP request latency, by endpoint.
    pub http_request_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let net_registry = Registry::new();
        let http_registry = Registry::new();

        let checks_total = IntCounterVec::new(
            Opts::new("meshprobe_checks_total", "Probe checks started"),
            &["kind"],
        )?;
        let dials_total = IntCounterVec::new(
            Opts::new("meshprobe_dials_total", "Probe dials by outcome"),
            &["outcome"],
        )?;
        let block_probes_total = IntCounterVec::new(
            Opts::new(
                "meshprobe_block_probes_total",
                "Block exchange probes by outcome",
            ),
            &["outcome"],
        )?;
        net_registry.register(Box::new(checks_total.clone()))?;
        net_registry.register(Box::new(dials_total.clone()))?;
        net_registry.register(Box::new(block_probes_total.clone()))?;

        let http_requests_total = IntCounterVec::new(
            Opts::new("meshprobe_http_requests_total", "HTTP requests served"),
            &["endpoint", "status"],
        )?;
        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "meshprobe_http_request_duration_seconds",
                "HTTP request latency",
            ),
            &["endpoint"],
        )?;
        http_registry.register(Box::new(http_requests_total.clone()))?;
        http_registry.register(Box::new(http_request_duration.clone()))?;

        Ok(Self {
            net_registry,
            http_registry,
            checks_total,
            dials_total,
            block_probes_total,
            http_requests_total,
            http_request_duration,
        })
    }

    pub fn record_dial(&self, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        self.dials_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_block_probe(&self, result: &crate::report::BlockProbeResult) {
        let outcome = if !result.error.is_empty() {
            "error"
        } else if result.found {
            "found"
        } else {
            "not_found"
        };
        self.block_probes_total.with_label_values(&[outcome]).inc();
    }

    /// Encode a registry into the Prometheus text exposition format.
    pub fn encode(registry: &Registry) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&registry.gather(), &mut buf) {
            tracing::warn!("metrics encoding failed: {}", e);
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
