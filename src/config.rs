//! Configuration recognized by the framework (§6, §10).
//!
//! Shape follows the donor `config.rs`: one struct per concern, loaded from
//! TOML via `serde`, with a `validate()` method and file load/save helpers.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub dap_client: ClientSettings,
    #[serde(default)]
    pub stream_udp: StreamUdpSettings,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream: StreamSettings::default(),
            dap_client: ClientSettings::default(),
            stream_udp: StreamUdpSettings::default(),
        }
    }
}

/// `stream.*` configuration keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// `stream.preferred_encryption` — selects the default session cipher.
    #[serde(default = "default_preferred_encryption")]
    pub preferred_encryption: String,
    /// `stream.debug_dump_stream_headers` — logs every packet header.
    #[serde(default)]
    pub debug_dump_stream_headers: bool,
    /// `stream.debug_more` — adds verbose diagnostics.
    #[serde(default)]
    pub debug_more: bool,
}

fn default_preferred_encryption() -> String {
    "noise-x25519-chachapoly".to_string()
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            preferred_encryption: default_preferred_encryption(),
            debug_dump_stream_headers: false,
            debug_more: false,
        }
    }
}

/// `dap_client.*` configuration keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// `dap_client.default_transport` — default carrier for new clients.
    #[serde(default = "default_transport_name")]
    pub default_transport: String,
    /// Ordered fallback list the stage machine walks on transport failure
    /// (§4.3, §8 scenario 6). Not itself a named key in §6, but required to
    /// drive the fallback behavior §4.3 specifies.
    #[serde(default = "default_fallback_transports")]
    pub fallback_transports: Vec<String>,
}

fn default_transport_name() -> String {
    "http".to_string()
}

fn default_fallback_transports() -> Vec<String> {
    vec!["http".to_string(), "websocket".to_string(), "udp".to_string()]
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            default_transport: default_transport_name(),
            fallback_transports: default_fallback_transports(),
        }
    }
}

/// `stream_udp.*` configuration keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamUdpSettings {
    /// `stream_udp.debug_more` — UDP adapter verbose logging.
    #[serde(default)]
    pub debug_more: bool,
    /// Listen address for the UDP transport's single demultiplexing
    /// socket.
    #[serde(default = "default_udp_bind")]
    pub bind_addr: String,
    #[serde(with = "humantime_serde", default = "default_keepalive")]
    pub keepalive_interval: std::time::Duration,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u16,
}

fn default_udp_bind() -> String {
    "0.0.0.0:18103".to_string()
}

fn default_keepalive() -> std::time::Duration {
    std::time::Duration::from_secs(30)
}

fn default_max_packet_size() -> u16 {
    1400
}

impl Default for StreamUdpSettings {
    fn default() -> Self {
        Self {
            debug_more: false,
            bind_addr: default_udp_bind(),
            keepalive_interval: default_keepalive(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

impl StreamConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(contents)?;
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validates configuration, returning a descriptive error on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.dap_client.fallback_transports.is_empty() {
            return Err("dap_client.fallback_transports must not be empty".to_string());
        }
        if self.stream_udp.max_packet_size < 18 {
            return Err("stream_udp.max_packet_size must be at least the 18-byte header".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = StreamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dap_client.default_transport, "http");
    }

    #[test]
    fn test_round_trip_toml() {
        let config = StreamConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: StreamConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.stream.preferred_encryption, config.stream.preferred_encryption);
    }
}
