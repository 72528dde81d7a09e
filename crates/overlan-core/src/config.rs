//! Configuration
//!
//! Read from and written back to a TOML file. The overlay host treats this
//! as read-only input, except for the identity section which is filled in
//! after the first start.

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use overlan_p2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Overlay host configuration
    pub p2p: P2pConfig,
    /// TUN interface configuration
    pub vpn: VpnConfig,
    /// Peers allowed into the overlay
    #[serde(default)]
    pub peers: Vec<KnownPeer>,
}

/// Overlay host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    /// Listen multiaddresses
    pub listen_addresses: Vec<String>,
    /// Bootstrap peers as full multiaddresses (with /p2p/ peer id)
    pub bootstrap_peers: Vec<String>,
    /// How often to retry connections to known peers (seconds)
    pub reconnection_interval_secs: u64,
    /// User agent announced over identify
    pub user_agent: String,
    /// Host identity, written back after the first start
    #[serde(default)]
    pub identity: IdentityConfig,
}

/// Persisted host identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Base64-encoded Ed25519 secret key
    pub private_key: Option<String>,
    /// Derived peer id, informational
    pub peer_id: Option<String>,
}

/// TUN interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnConfig {
    /// Requested interface name
    pub interface_name: String,
    /// Local overlay IPv4 address
    pub local_address: Ipv4Addr,
    /// Overlay subnet mask
    pub netmask: Ipv4Addr,
}

/// A peer of the overlay with its overlay address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownPeer {
    /// libp2p peer id
    pub peer_id: String,
    /// Human-readable name
    #[serde(default)]
    pub alias: String,
    /// The peer's address inside the overlay
    pub overlay_address: Ipv4Addr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            p2p: P2pConfig {
                listen_addresses: vec![
                    "/ip4/0.0.0.0/tcp/4361".to_string(),
                    "/ip4/0.0.0.0/udp/4361/quic-v1".to_string(),
                ],
                bootstrap_peers: Vec::new(),
                reconnection_interval_secs: 10,
                user_agent: format!("overlan/{}", env!("CARGO_PKG_VERSION")),
                identity: IdentityConfig::default(),
            },
            vpn: VpnConfig {
                interface_name: "overlan0".to_string(),
                local_address: Ipv4Addr::new(10, 66, 0, 1),
                netmask: Ipv4Addr::new(255, 255, 0, 0),
            },
            peers: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .context("failed to read config file")?;
        toml::from_str(&contents).context("failed to parse config file")
    }

    /// Load an existing configuration or create the default one
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path).await
        } else {
            let config = Self::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.p2p.reconnection_interval_secs == 0 {
            anyhow::bail!("reconnection_interval_secs must be at least 1");
        }
        if self.vpn.local_address.is_unspecified() {
            anyhow::bail!("vpn.local_address must be set");
        }
        for addr in &self.p2p.listen_addresses {
            addr.parse::<Multiaddr>()
                .with_context(|| format!("invalid listen address {addr}"))?;
        }
        for peer in &self.peers {
            peer.peer_id
                .parse::<PeerId>()
                .with_context(|| format!("invalid peer id {}", peer.peer_id))?;
        }
        Ok(())
    }

    /// The configured Ed25519 secret, decoded
    pub fn private_key_bytes(&self) -> Result<Option<Vec<u8>>> {
        match &self.p2p.identity.private_key {
            None => Ok(None),
            Some(encoded) => {
                let bytes = BASE64
                    .decode(encoded)
                    .context("invalid base64 in identity.private_key")?;
                Ok(Some(bytes))
            }
        }
    }

    /// Record the host identity after initialization
    pub fn set_identity(&mut self, secret: &[u8], peer_id: &PeerId) {
        self.p2p.identity.private_key = Some(BASE64.encode(secret));
        self.p2p.identity.peer_id = Some(peer_id.to_string());
    }

    /// Parsed listen multiaddresses
    pub fn listen_multiaddrs(&self) -> Result<Vec<Multiaddr>> {
        self.p2p
            .listen_addresses
            .iter()
            .map(|addr| {
                addr.parse::<Multiaddr>()
                    .with_context(|| format!("invalid listen address {addr}"))
            })
            .collect()
    }

    /// Parsed bootstrap multiaddresses; unparseable entries are logged and
    /// skipped.
    pub fn bootstrap_multiaddrs(&self) -> Vec<Multiaddr> {
        self.p2p
            .bootstrap_peers
            .iter()
            .filter_map(|addr| match addr.parse::<Multiaddr>() {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    warn!("skipping invalid bootstrap peer addr {}: {}", addr, e);
                    None
                }
            })
            .collect()
    }

    /// Known peers with their parsed peer ids; invalid entries are logged
    /// and skipped.
    pub fn known_peers(&self) -> Vec<(PeerId, Ipv4Addr)> {
        self.peers
            .iter()
            .filter_map(|peer| match peer.peer_id.parse::<PeerId>() {
                Ok(peer_id) => Some((peer_id, peer.overlay_address)),
                Err(e) => {
                    warn!("skipping known peer with invalid id {}: {}", peer.peer_id, e);
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn identity_round_trip() {
        let mut config = Config::default();
        assert!(config.private_key_bytes().unwrap().is_none());

        let secret = vec![7u8; 32];
        let peer_id = PeerId::random();
        config.set_identity(&secret, &peer_id);

        assert_eq!(config.private_key_bytes().unwrap(), Some(secret));
        assert_eq!(config.p2p.identity.peer_id, Some(peer_id.to_string()));
    }

    #[test]
    fn toml_round_trip() {
        let mut config = Config::default();
        config.peers.push(KnownPeer {
            peer_id: PeerId::random().to_string(),
            alias: "laptop".to_string(),
            overlay_address: Ipv4Addr::new(10, 66, 0, 2),
        });
        config.p2p.bootstrap_peers =
            vec!["/ip4/203.0.113.5/tcp/4361/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nXTN"
                .to_string()];

        let encoded = toml::to_string_pretty(&config).unwrap();
        let decoded: Config = toml::from_str(&encoded).unwrap();

        assert_eq!(decoded.peers.len(), 1);
        assert_eq!(decoded.peers[0].alias, "laptop");
        assert_eq!(decoded.p2p.bootstrap_peers, config.p2p.bootstrap_peers);
        assert_eq!(decoded.vpn.local_address, config.vpn.local_address);
        decoded.validate().unwrap();
    }

    #[test]
    fn invalid_entries_are_skipped() {
        let mut config = Config::default();
        config.p2p.bootstrap_peers = vec![
            "not-a-multiaddr".to_string(),
            "/ip4/203.0.113.5/tcp/4361".to_string(),
        ];
        config.peers.push(KnownPeer {
            peer_id: "garbage".to_string(),
            alias: String::new(),
            overlay_address: Ipv4Addr::new(10, 66, 0, 3),
        });

        assert_eq!(config.bootstrap_multiaddrs().len(), 1);
        assert!(config.known_peers().is_empty());
    }

    #[tokio::test]
    async fn load_or_create_writes_default() {
        let dir = std::env::temp_dir().join(format!("overlan-config-{}", std::process::id()));
        let path = dir.join("config.toml");
        let _ = tokio::fs::remove_file(&path).await;

        let created = Config::load_or_create(&path).await.unwrap();
        assert!(path.exists());

        let loaded = Config::load_or_create(&path).await.unwrap();
        assert_eq!(created.vpn.interface_name, loaded.vpn.interface_name);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
