use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

use eyre::WrapErr;
use network::NetworkConfig;
use serde::{Deserialize, Serialize};

/// What a connection does with events that arrive before the matching
/// delegate has been registered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EarlyEventPolicy {
    /// Discard them
    Drop,
    /// Keep them and deliver them, in order, once the delegate is registered
    ///
    /// The buffer is not bounded: an engine that holds a connection without
    /// ever registering a data delegate keeps everything the peer sends.
    /// A broken notification is held until the buffered data is delivered.
    #[default]
    Buffer,
}

impl FromStr for EarlyEventPolicy {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop" => Ok(Self::Drop),
            "buffer" => Ok(Self::Buffer),
            other => eyre::bail!("unknown early event policy '{other}', expected 'drop' or 'buffer'"),
        }
    }
}

impl fmt::Display for EarlyEventPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drop => f.write_str("drop"),
            Self::Buffer => f.write_str("buffer"),
        }
    }
}

/// Settings for [`crate::HttpServerNetworkTransport`]
///
/// Every field has a default, so a configuration file only needs to name
/// the values it changes:
///
/// ```toml
/// bind_address = "127.0.0.1"
/// early_events = "drop"
///
/// [network]
/// read_buffer_size = 4096
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Local interface to listen on; unspecified means all interfaces
    pub bind_address: Ipv4Addr,
    pub early_events: EarlyEventPolicy,
    pub network: NetworkConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_address: Ipv4Addr::UNSPECIFIED,
            early_events: EarlyEventPolicy::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn from_toml_str(contents: &str) -> eyre::Result<Self> {
        let config: Self = toml::from_str(contents).wrap_err("parsing transport configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading configuration file {}", path.display()))?;
        Self::from_toml_str(&contents)
            .wrap_err_with(|| format!("loading configuration file {}", path.display()))
    }

    pub fn validate(&self) -> eyre::Result<()> {
        self.network
            .validate()
            .wrap_err("invalid network configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = TransportConfig::from_toml_str("").unwrap();
        assert_eq!(config, TransportConfig::default());
        assert_eq!(config.early_events, EarlyEventPolicy::Buffer);
        assert_eq!(config.bind_address, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_partial_file() {
        let config = TransportConfig::from_toml_str(
            r#"
            bind_address = "127.0.0.1"
            early_events = "drop"

            [network]
            read_buffer_size = 4096
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_address, Ipv4Addr::LOCALHOST);
        assert_eq!(config.early_events, EarlyEventPolicy::Drop);
        assert_eq!(config.network.read_buffer_size, 4096);
        assert_eq!(
            config.network.accept_poll_interval_ms,
            NetworkConfig::DEFAULT_ACCEPT_POLL_INTERVAL_MS
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = TransportConfig::from_toml_str("[network]\nread_buffer_size = 0\n").unwrap_err();
        assert!(
            err.chain()
                .any(|cause| cause.to_string().contains("read_buffer_size")),
            "unexpected error: {err:?}"
        );

        assert!(TransportConfig::from_toml_str("early_events = \"queue\"").is_err());
        assert!(TransportConfig::from_toml_str("bind_address = \"::1\"").is_err());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("drop".parse::<EarlyEventPolicy>().unwrap(), EarlyEventPolicy::Drop);
        assert_eq!("buffer".parse::<EarlyEventPolicy>().unwrap(), EarlyEventPolicy::Buffer);
        assert!("Buffer".parse::<EarlyEventPolicy>().is_err());
        assert_eq!(EarlyEventPolicy::Drop.to_string(), "drop");
    }
}
