/// Configuration Module
///
/// Resolves the daemon configuration from flags and environment variables.
/// Flags win over the environment, the environment wins over defaults. The
/// process keeps no state on disk; this is all of it.
use std::env;
use std::net::SocketAddr;

use crate::cli::Cli;
use crate::error::ProbeError;
use crate::network::HostConfig;

const DEFAULT_LISTEN: &str = "127.0.0.1:3333";

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP surface listen address.
    pub listen: SocketAddr,
    /// Warm the routing table fully before reporting ready.
    pub accelerated_dht: bool,
    /// Basic-auth credentials for the metrics endpoints, if configured.
    pub metrics_auth: Option<(String, String)>,
    /// Bootstrap override; empty means the default set.
    pub bootstrap: Vec<libp2p::Multiaddr>,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self, ProbeError> {
        let listen = cli
            .listen
            .clone()
            .or_else(|| env_var("MESHPROBE_LISTEN"))
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen: SocketAddr = listen
            .parse()
            .map_err(|e| ProbeError::InputParse(format!("invalid listen address {:?}: {}", listen, e)))?;

        let accelerated_dht = cli.accelerated_dht
            || env_var("MESHPROBE_ACCELERATED_DHT")
                .map(|v| parse_bool(&v))
                .unwrap_or(false);

        let username = cli
            .metrics_auth_username
            .clone()
            .or_else(|| env_var("MESHPROBE_METRICS_AUTH_USERNAME"));
        let password = cli
            .metrics_auth_password
            .clone()
            .or_else(|| env_var("MESHPROBE_METRICS_AUTH_PASSWORD"));
        let metrics_auth = match (username, password) {
            (Some(user), Some(pass)) => Some((user, pass)),
            (None, None) => None,
            _ => {
                return Err(ProbeError::InputParse(
                    "metrics auth requires both a username and a password".into(),
                ))
            }
        };

        Ok(Self {
            listen,
            accelerated_dht,
            metrics_auth,
            bootstrap: cli.bootstrap_peers.clone(),
        })
    }

    /// The shared host configuration this daemon configuration implies.
    pub fn host_config(&self) -> HostConfig {
        let mut cfg = HostConfig {
            accelerated_dht: self.accelerated_dht,
            ..HostConfig::default()
        };
        if !self.bootstrap.is_empty() {
            cfg.bootstrap = self.bootstrap.clone();
        }
        cfg
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_flags() {
        let config = Config::from_cli(&Cli::default()).unwrap();
        assert_eq!(config.listen, DEFAULT_LISTEN.parse().unwrap());
        assert!(!config.accelerated_dht);
        assert!(config.metrics_auth.is_none());
        assert!(config.bootstrap.is_empty());
    }

    #[test]
    fn flags_are_applied() {
        let cli = Cli {
            listen: Some("0.0.0.0:8080".into()),
            accelerated_dht: true,
            metrics_auth_username: Some("ops".into()),
            metrics_auth_password: Some("secret".into()),
            ..Cli::default()
        };
        let config = Config::from_cli(&cli).unwrap();
        assert_eq!(config.listen, "0.0.0.0:8080".parse().unwrap());
        assert!(config.accelerated_dht);
        assert_eq!(config.metrics_auth, Some(("ops".into(), "secret".into())));
    }

    #[test]
    fn half_configured_auth_is_rejected() {
        let cli = Cli {
            metrics_auth_username: Some("ops".into()),
            ..Cli::default()
        };
        assert!(Config::from_cli(&cli).is_err());
    }

    #[test]
    fn invalid_listen_address_is_rejected() {
        let cli = Cli {
            listen: Some("not an address".into()),
            ..Cli::default()
        };
        assert!(matches!(
            Config::from_cli(&cli),
            Err(ProbeError::InputParse(_))
        ));
    }

    #[test]
    fn bool_parsing() {
        for yes in ["1", "true", "TRUE", "yes", "on"] {
            assert!(parse_bool(yes), "{}", yes);
        }
        for no in ["0", "false", "off", ""] {
            assert!(!parse_bool(no), "{}", no);
        }
    }

    #[test]
    fn bootstrap_override_reaches_host_config() {
        let addr: libp2p::Multiaddr =
            "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ"
                .parse()
                .unwrap();
        let cli = Cli {
            bootstrap_peers: vec![addr.clone()],
            ..Cli::default()
        };
        let config = Config::from_cli(&cli).unwrap();
        assert_eq!(config.host_config().bootstrap, vec![addr]);
    }
}
