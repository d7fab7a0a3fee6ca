//! Node configuration.
//!
//! Values come from the CLI at startup; defaults mirror the flag defaults
//! documented there.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Session timing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TssConfig {
    /// Maximum time a keygen session may run, party formation included.
    pub keygen_timeout: Duration,
    /// Maximum time a keysign session may run, party formation included.
    pub keysign_timeout: Duration,
    /// Reserved for pre-parameter generation paths; consumed by the CLI but
    /// not consulted by the EdDSA engine.
    pub preparam_timeout: Duration,
}

impl Default for TssConfig {
    fn default() -> Self {
        Self {
            keygen_timeout: Duration::from_secs(30),
            keysign_timeout: Duration::from_secs(30),
            preparam_timeout: Duration::from_secs(300),
        }
    }
}

/// P2P transport parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    /// Rendezvous string advertised on the DHT; all nodes sharing it form
    /// one cohort.
    pub rendezvous: String,
    /// TCP listen port for the libp2p host.
    pub port: u16,
    /// NAT-announced external IP, if any.
    pub external_ip: Option<String>,
    /// Bootstrap peer multiaddrs (with `/p2p/<peer-id>` suffix).
    pub bootstrap_peers: Vec<String>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            rendezvous: "Asgard".to_string(),
            port: 6668,
            external_ip: None,
            bootstrap_peers: Vec::new(),
        }
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// HTTP admin bind address.
    pub http_addr: String,
    /// Directory for state files.
    pub home: String,
    pub tss: TssConfig,
    pub p2p: P2pConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8080".to_string(),
            home: String::new(),
            tss: TssConfig::default(),
            p2p: P2pConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cli_documentation() {
        let conf = NodeConfig::default();
        assert_eq!(conf.http_addr, "127.0.0.1:8080");
        assert_eq!(conf.p2p.port, 6668);
        assert_eq!(conf.p2p.rendezvous, "Asgard");
        assert_eq!(conf.tss.keygen_timeout, Duration::from_secs(30));
        assert_eq!(conf.tss.preparam_timeout, Duration::from_secs(300));
    }
}
