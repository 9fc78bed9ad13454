/// Command Line Interface Module
///
/// Flag parsing for the probe daemon using Clap. Every flag has an
/// environment variable twin; the merge (flag wins over environment wins
/// over default) lives in `config.rs`.
use clap::Parser;
use libp2p::Multiaddr;

/// Main CLI structure for the meshprobe daemon
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "meshprobe")]
#[command(about = "Diagnostic probe for content-addressed p2p overlays")]
pub struct Cli {
    /// Address for the HTTP surface to listen on (env: MESHPROBE_LISTEN)
    #[arg(long)]
    pub listen: Option<String>,
    /// Warm the full DHT routing table before reporting ready
    /// (env: MESHPROBE_ACCELERATED_DHT)
    #[arg(long)]
    pub accelerated_dht: bool,
    /// Username protecting the metrics endpoints
    /// (env: MESHPROBE_METRICS_AUTH_USERNAME)
    #[arg(long)]
    pub metrics_auth_username: Option<String>,
    /// Password protecting the metrics endpoints
    /// (env: MESHPROBE_METRICS_AUTH_PASSWORD)
    #[arg(long)]
    pub metrics_auth_password: Option<String>,
    /// Bootstrap peer multiaddr overriding the default set (repeatable)
    #[arg(long = "bootstrap-peer")]
    pub bootstrap_peers: Vec<Multiaddr>,
}
