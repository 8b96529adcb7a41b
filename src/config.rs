//! PEX Node Configuration
//!
//! Configurable parameters for the peer exchange node.
//! Loaded from a TOML file, then overridden by CLI flags / environment.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::monitor::StalenessThresholds;
use crate::peer::{PeerPublic, RawPeer, ValidationError};
use crate::registry::SampleLimit;

/// Address-validation strictness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Private and loopback addresses are accepted
    Development,

    /// Only publicly routable addresses are accepted
    Production,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Development => "development",
            OperatingMode::Production => "production",
        }
    }
}

/// Bootstrap peers, keyed by deployment environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapPeers {
    pub development: Vec<RawPeer>,
    pub production: Vec<RawPeer>,
}

impl BootstrapPeers {
    pub fn for_mode(&self, mode: OperatingMode) -> &[RawPeer] {
        match mode {
            OperatingMode::Development => &self.development,
            OperatingMode::Production => &self.production,
        }
    }
}

/// Main configuration for the PEX node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    // === Identity ===

    /// Address other peers use to reach this node
    pub public_address: String,

    /// Port advertised to other peers (defaults to `api_port`)
    pub advertised_port: Option<u16>,

    /// Human-readable node name
    pub display_name: Option<String>,

    /// Address-validation strictness
    pub mode: OperatingMode,

    // === Network ===

    /// Interface the HTTP API binds to
    pub bind_address: String,

    /// Port for the HTTP API (register, peer_list, health_check, metrics)
    pub api_port: u16,

    // === Propagation ===

    /// Registry size at which gossip registration stops propagating
    pub max_depth: usize,

    /// Peers shared per response: 0 = none, -1 = all, n = random sample of n
    pub share_peers: i64,

    /// Only share allow-listed peers
    pub share_allow_listed_only: bool,

    // === Timing ===

    /// Interval between membership monitor runs (seconds)
    pub monitor_interval_secs: u64,

    /// A peer not seen for this long is stale and gets probed (seconds)
    pub stale_after_secs: u64,

    /// A peer not seen for this long is presumed dead (seconds)
    pub dead_after_secs: u64,

    /// Timeout for outbound handshakes and liveness probes (seconds)
    pub request_timeout_secs: u64,

    /// An activated peer re-registering within this window is told it is
    /// already registered (seconds)
    pub reregister_cooldown_secs: u64,

    // === Limits ===

    /// Maximum request history entries kept per peer
    pub max_request_history: usize,

    // === Security ===

    /// Maximum inbound requests per caller IP per minute
    pub rate_limit_per_minute: u32,

    /// Violations before a caller IP is banned
    pub max_violations_before_ban: u32,

    /// Ban duration for misbehaving callers (seconds)
    pub ban_duration_secs: u64,

    /// Addresses exempt from rate limiting
    pub allow_list: Vec<String>,

    /// Addresses refused inbound and never dialled
    pub deny_list: Vec<String>,

    // === Bootstrap ===

    pub bootstrap: BootstrapPeers,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            // Identity
            public_address: "127.0.0.1".to_string(),
            advertised_port: None,
            display_name: None,
            mode: OperatingMode::Development,

            // Network
            bind_address: "0.0.0.0".to_string(),
            api_port: 8000,

            // Propagation
            max_depth: 100,
            share_peers: 50,
            share_allow_listed_only: false,

            // Timing - 10s monitor, 5m stale, 10m dead
            monitor_interval_secs: 10,
            stale_after_secs: 300,
            dead_after_secs: 600,
            request_timeout_secs: 10,
            reregister_cooldown_secs: 60,

            // Limits
            max_request_history: 100,

            // Security
            rate_limit_per_minute: 60,
            max_violations_before_ban: 5,
            ban_duration_secs: 600,
            allow_list: vec![],
            deny_list: vec![],

            bootstrap: BootstrapPeers::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    // Builder-style methods for CLI overrides; `None` keeps the file value

    pub fn with_mode(mut self, mode: Option<OperatingMode>) -> Self {
        if let Some(mode) = mode {
            self.mode = mode;
        }
        self
    }

    pub fn with_api_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.api_port = port;
        }
        self
    }

    pub fn with_public_address(mut self, address: Option<String>) -> Self {
        if let Some(address) = address {
            self.public_address = address;
        }
        self
    }

    pub fn with_display_name(mut self, name: Option<String>) -> Self {
        if name.is_some() {
            self.display_name = name;
        }
        self
    }

    pub fn with_max_depth(mut self, max_depth: Option<usize>) -> Self {
        if let Some(max_depth) = max_depth {
            self.max_depth = max_depth;
        }
        self
    }

    pub fn with_share_peers(mut self, share_peers: Option<i64>) -> Self {
        if let Some(share_peers) = share_peers {
            self.share_peers = share_peers;
        }
        self
    }

    /// This node's own public record
    pub fn self_peer(&self) -> Result<PeerPublic, ValidationError> {
        let raw = RawPeer {
            address: self.public_address.clone(),
            port: Some(i64::from(self.advertised_port.unwrap_or(self.api_port))),
            display_name: self.display_name.clone(),
        };
        PeerPublic::validate(raw, self.mode)
    }

    /// Bootstrap peers for the configured environment
    pub fn bootstrap_peers(&self) -> Result<Vec<PeerPublic>, ValidationError> {
        self.bootstrap
            .for_mode(self.mode)
            .iter()
            .cloned()
            .map(|raw| PeerPublic::validate(raw, self.mode))
            .collect()
    }

    pub fn share_limit(&self) -> SampleLimit {
        // validate() guarantees share_peers >= -1
        SampleLimit::from_i64(self.share_peers).unwrap_or(SampleLimit::All)
    }

    pub fn thresholds(&self) -> StalenessThresholds {
        StalenessThresholds {
            stale_after: chrono::Duration::seconds(self.stale_after_secs as i64),
            dead_after: chrono::Duration::seconds(self.dead_after_secs as i64),
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reregister_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reregister_cooldown_secs as i64)
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dead_after_secs <= self.stale_after_secs {
            anyhow::bail!(
                "dead_after_secs ({}) must be greater than stale_after_secs ({})",
                self.dead_after_secs,
                self.stale_after_secs
            );
        }

        if SampleLimit::from_i64(self.share_peers).is_none() {
            anyhow::bail!(
                "share_peers ({}) must be -1 (all), 0 (none) or a positive count",
                self.share_peers
            );
        }

        if self.max_depth == 0 {
            anyhow::bail!("max_depth must be at least 1");
        }

        if self.monitor_interval_secs == 0 || self.request_timeout_secs == 0 {
            anyhow::bail!("monitor_interval_secs and request_timeout_secs must be non-zero");
        }

        if self.max_request_history == 0 {
            anyhow::bail!("max_request_history must be at least 1");
        }

        self.self_peer()
            .map_err(|e| anyhow::anyhow!("invalid node identity: {}", e))?;

        self.bootstrap_peers()
            .map_err(|e| anyhow::anyhow!("invalid {} bootstrap peer: {}", self.mode.as_str(), e))?;

        for address in self.allow_list.iter().chain(self.deny_list.iter()) {
            crate::peer::normalize_address(address, OperatingMode::Development)
                .map_err(|e| anyhow::anyhow!("invalid allow/deny list entry {:?}: {}", address, e))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.max_depth, 100);
        assert_eq!(config.share_peers, 50);
        assert_eq!(config.mode, OperatingMode::Development);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = NodeConfig::default();

        // Invalid: dead <= stale
        config.dead_after_secs = 300;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.share_peers = -2;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.max_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_production_rejects_private_identity() {
        let config = NodeConfig::default().with_mode(Some(OperatingMode::Production));
        assert!(config.validate().is_err());

        let config = config.with_public_address(Some("8.8.4.4".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = NodeConfig::default()
            .with_api_port(Some(9000))
            .with_max_depth(Some(7))
            .with_share_peers(Some(-1))
            .with_display_name(None);

        assert_eq!(config.api_port, 9000);
        assert_eq!(config.max_depth, 7);
        assert_eq!(config.share_limit(), SampleLimit::All);
        assert_eq!(config.self_peer().unwrap().port(), Some(9000));
    }

    #[test]
    fn test_bootstrap_keyed_by_mode() {
        let toml = r#"
            public_address = "127.0.0.1"

            [[bootstrap.development]]
            address = "172.20.0.2"
            port = 8000
            display_name = "peer0"

            [[bootstrap.production]]
            ip = "8.8.8.8"
            port = 8000
        "#;
        let config: NodeConfig = toml::from_str(toml).unwrap();

        let dev = config.bootstrap_peers().unwrap();
        assert_eq!(dev.len(), 1);
        assert_eq!(dev[0].address(), "172.20.0.2");

        let config = config.with_mode(Some(OperatingMode::Production));
        let prod = config.bootstrap_peers().unwrap();
        assert_eq!(prod[0].address(), "8.8.8.8");
    }
}
