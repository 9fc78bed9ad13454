// ===================================================================================================
// meshprobe - Diagnostic Probe Daemon
// ===================================================================================================
//
// Wires the pieces together: configuration from flags and environment, the
// shared probe host with its DHT client, the metrics registries, and the
// HTTP surface that accepts check requests.
//
// ===================================================================================================
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use meshprobe::api_server::{self, AppState};
use meshprobe::check::Checker;
use meshprobe::cli::Cli;
use meshprobe::config::Config;
use meshprobe::host::Host;
use meshprobe::logging;
use meshprobe::metrics::Metrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging_safe();

    let cli = Cli::parse();
    let config = Config::from_cli(&cli)?;
    let metrics = Arc::new(Metrics::new()?);

    let host_cfg = config.host_config();
    let host = Host::new(host_cfg.clone())?;
    info!("probe host peer id: {}", host.local_peer_id());
    if config.accelerated_dht {
        info!("accelerated DHT client configured; /ready reports warm-up completion");
    }

    let checker = Checker::new(host, host_cfg, metrics.clone());
    let state = Arc::new(AppState {
        checker,
        metrics,
        metrics_auth: config.metrics_auth.clone(),
    });
    api_server::run(state, config.listen).await
}
