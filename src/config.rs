use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::transport::tcp::DEFAULT_MAX_FRAME;
use crate::types::PeerSpec;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub node_name: String,
    /// Address other brokers use to reach this node.
    pub location: String,
    pub listen: SocketAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
    pub peers: Vec<PeerSpec>,
    pub health_interval_secs: u64,
    pub backoff_unit_millis: u64,
    pub cluster_secret: String,
    /// Largest TCP frame accepted or sent, in bytes.
    pub max_frame_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into()),
            location: "127.0.0.1:2773".into(),
            listen: SocketAddr::from(([0, 0, 0, 0], 2773)),
            bind_ip: None,
            peers: Vec::new(),
            health_interval_secs: 5,
            backoff_unit_millis: 1000,
            cluster_secret: "default_insecure_secret".into(),
            max_frame_bytes: DEFAULT_MAX_FRAME,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("glued.toml"))
                .merge(Json::file("glued.json"))
                .merge(Env::prefixed("GLUED_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("GLUED_CLUSTER_SECRET_FILE") {
            config.cluster_secret = std::fs::read_to_string(secret_file)?
                .trim()
                .to_string();
        }

        // If bind_ip is set, override the IP part of listen
        if let Some(ref ip) = config.bind_ip {
            let port = config.listen.port();
            config.listen = format!("{}:{}", ip, port)
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid bind_ip: {}", e))?;
        }

        Ok(config)
    }

    pub fn local(&self) -> PeerSpec {
        PeerSpec::new(self.node_name.clone(), self.location.clone())
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_millis.max(1))
    }

    /// Configured peers other than this node itself.
    pub fn remote_peers(&self) -> impl Iterator<Item = &PeerSpec> {
        self.peers.iter().filter(move |p| {
            !p.name.is_empty() && p.name != self.node_name && p.location != self.location
        })
    }

    /// Peer problems worth reporting.  None of them stop the node: a bad
    /// peer simply never gets past its first probe.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut problems = Vec::new();
        let mut seen = HashSet::new();
        for (index, peer) in self.peers.iter().enumerate() {
            if peer.name.is_empty() {
                problems.push(ConfigError::EmptyPeerName { index });
                continue;
            }
            if peer.location.is_empty() {
                problems.push(ConfigError::EmptyPeerLocation {
                    name: peer.name.clone(),
                });
            }
            if !seen.insert(peer.name.as_str()) {
                problems.push(ConfigError::DuplicatePeer {
                    name: peer.name.clone(),
                });
            }
            if peer.name == self.node_name || peer.location == self.location {
                problems.push(ConfigError::SelfAsPeer {
                    name: peer.name.clone(),
                    location: peer.location.clone(),
                });
            }
        }
        problems
    }
}
