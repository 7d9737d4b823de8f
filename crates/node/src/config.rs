//! Node configuration.

use dv_types::{DomainType, NetworkConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Console,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPreset {
    Mainnet,
    Holesky,
}

/// Recognized node options. Loaded from a JSON config file and overridable
/// from the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub log_format: LogFormat,
    pub network: NetworkPreset,
    /// Override the network preset's registry address.
    pub registry_contract_addr: Option<String>,
    /// Hex-encoded 4-byte override of the consensus domain (testnets).
    pub domain_type_override: Option<String>,
    /// Extra bootnodes appended to the preset's list.
    pub bootnodes: Vec<String>,
    pub db_path: PathBuf,
    pub ws_api_port: u16,
    /// Beacon HTTP request timeout in seconds.
    pub beacon_timeout_secs: u64,
    /// Fee recipient for validator registrations, hex-encoded.
    pub fee_recipient: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: "info".into(),
            log_format: LogFormat::Console,
            network: NetworkPreset::Mainnet,
            registry_contract_addr: None,
            domain_type_override: None,
            bootnodes: Vec::new(),
            db_path: PathBuf::from("./db"),
            ws_api_port: 15_000,
            beacon_timeout_secs: 5,
            fee_recipient: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid domain override: {0}")]
    InvalidDomainOverride(String),
    #[error("invalid fee recipient: {0}")]
    InvalidFeeRecipient(String),
}

impl Config {
    /// Resolve the network configuration with overrides applied.
    pub fn network_config(&self) -> Result<NetworkConfig, ConfigError> {
        let mut network = match self.network {
            NetworkPreset::Mainnet => NetworkConfig::mainnet(),
            NetworkPreset::Holesky => NetworkConfig::holesky(),
        };
        if let Some(addr) = &self.registry_contract_addr {
            network.registry_contract_addr = addr.clone();
        }
        if let Some(hex_domain) = &self.domain_type_override {
            network.domain_type = parse_domain(hex_domain)?;
        }
        network.bootnodes.extend(self.bootnodes.iter().cloned());
        Ok(network)
    }

    pub fn beacon_timeout(&self) -> Duration {
        Duration::from_secs(self.beacon_timeout_secs)
    }

    /// Fee recipient as raw bytes; zero address when unset.
    pub fn fee_recipient_bytes(&self) -> Result<[u8; 20], ConfigError> {
        let Some(raw) = &self.fee_recipient else {
            return Ok([0u8; 20]);
        };
        let raw = raw.strip_prefix("0x").unwrap_or(raw);
        let bytes =
            hex::decode(raw).map_err(|e| ConfigError::InvalidFeeRecipient(e.to_string()))?;
        bytes
            .try_into()
            .map_err(|_| ConfigError::InvalidFeeRecipient("expected 20 bytes".into()))
    }
}

fn parse_domain(raw: &str) -> Result<DomainType, ConfigError> {
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(raw).map_err(|e| ConfigError::InvalidDomainOverride(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| ConfigError::InvalidDomainOverride("expected 4 bytes".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_to_mainnet() {
        let config = Config::default();
        let network = config.network_config().unwrap();
        assert_eq!(network.name, "mainnet");
        assert_eq!(config.beacon_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn domain_override_applies() {
        let config = Config {
            domain_type_override: Some("0x00003011".into()),
            ..Config::default()
        };
        let network = config.network_config().unwrap();
        assert_eq!(network.domain_type, [0x00, 0x00, 0x30, 0x11]);
    }

    #[test]
    fn bad_overrides_are_rejected() {
        let config = Config {
            domain_type_override: Some("0xzz".into()),
            ..Config::default()
        };
        assert!(config.network_config().is_err());

        let config = Config {
            fee_recipient: Some("0x1234".into()),
            ..Config::default()
        };
        assert!(config.fee_recipient_bytes().is_err());
    }

    #[test]
    fn config_json_round_trip() {
        let config = Config {
            log_format: LogFormat::Json,
            network: NetworkPreset::Holesky,
            ws_api_port: 16_000,
            ..Config::default()
        };
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: Config = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.ws_api_port, 16_000);
        assert_eq!(decoded.network, NetworkPreset::Holesky);
        assert_eq!(decoded.log_format, LogFormat::Json);
    }
}
