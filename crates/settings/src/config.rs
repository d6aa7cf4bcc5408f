//! Configuration types

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use relaycraft_client::CircuitConfig;
use relaycraft_core::NetAddress;
use relaycraft_relay::RelayAgentConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{default_settings_path, Result, SettingsError};

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Relay agent settings (for serving as a relay)
    #[serde(default)]
    pub agent: AgentSettings,

    /// Circuit settings (for building circuits through relays)
    #[serde(default)]
    pub circuit: CircuitSettings,

    /// Custom settings file path (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Settings {
    /// Load settings from the default path, or create defaults
    pub fn load_or_default() -> Result<Self> {
        Self::load_from(&default_settings_path())
    }

    /// Load settings from a specific path, or create defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
            let settings: Settings =
                serde_json::from_str(&content).map_err(SettingsError::ParseError)?;
            info!("Loaded settings from {:?}", path);
            settings
        } else {
            Self::default()
        };
        settings.config_path = Some(path.to_path_buf());
        Ok(settings)
    }

    /// Save settings to the configured path
    pub fn save(&self) -> Result<()> {
        let path = self
            .config_path
            .clone()
            .unwrap_or_else(default_settings_path);
        self.save_to(&path)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }

    /// Runtime relay agent configuration
    pub fn agent_config(&self) -> Result<RelayAgentConfig> {
        self.agent.to_config()
    }

    /// Runtime circuit configuration
    pub fn circuit_config(&self) -> CircuitConfig {
        self.circuit.to_config()
    }
}

/// Relay agent settings. Missing fields take the agent defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_exchanges: usize,
    pub default_relay_point: i64,
    pub max_relay_point: i64,
    pub relay_retention_mics: i64,
    pub restricted_interval_mics: i64,
    pub endpoint_retention_mics: i64,
    pub endpoint_cache_capacity: usize,
    pub clean_interval_ms: u64,
    pub send_queue_capacity: usize,
    /// Advertised relay address ("ip:port"), if different from the socket's
    pub relay_address: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        let config = RelayAgentConfig::default();
        Self {
            max_exchanges: config.max_exchanges,
            default_relay_point: config.default_relay_point,
            max_relay_point: config.max_relay_point,
            relay_retention_mics: config.relay_retention_mics,
            restricted_interval_mics: config.restricted_interval_mics,
            endpoint_retention_mics: config.endpoint_retention_mics,
            endpoint_cache_capacity: config.endpoint_cache_capacity,
            clean_interval_ms: config.clean_interval.as_millis() as u64,
            send_queue_capacity: config.send_queue_capacity,
            relay_address: None,
        }
    }
}

impl AgentSettings {
    pub fn to_config(&self) -> Result<RelayAgentConfig> {
        let relay_address = self
            .relay_address
            .as_deref()
            .map(|address| {
                address
                    .parse::<SocketAddr>()
                    .map(|addr| NetAddress::new(0, addr))
                    .map_err(|e| SettingsError::InvalidValue {
                        name: "agent.relay_address",
                        reason: e.to_string(),
                    })
            })
            .transpose()?;

        let config = RelayAgentConfig {
            max_exchanges: self.max_exchanges,
            default_relay_point: self.default_relay_point,
            max_relay_point: self.max_relay_point,
            relay_retention_mics: self.relay_retention_mics,
            restricted_interval_mics: self.restricted_interval_mics,
            endpoint_retention_mics: self.endpoint_retention_mics,
            endpoint_cache_capacity: self.endpoint_cache_capacity,
            clean_interval: Duration::from_millis(self.clean_interval_ms),
            send_queue_capacity: self.send_queue_capacity,
            relay_address,
        };
        config.validate().map_err(|e| SettingsError::InvalidValue {
            name: "agent",
            reason: e.to_string(),
        })?;
        Ok(config)
    }
}

/// Circuit settings. Missing fields take the circuit defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    /// Hop cap for outgoing circuits
    pub max_serial_relays: usize,
    pub close_delay_ms: u64,
    pub maintain_interval_ms: u64,
    pub allow_open_sesami: bool,
    pub allow_unknown_incoming: bool,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        let config = CircuitConfig::default();
        Self {
            max_serial_relays: config.max_serial_relays,
            close_delay_ms: config.close_delay.as_millis() as u64,
            maintain_interval_ms: config.maintain_interval.as_millis() as u64,
            allow_open_sesami: config.allow_open_sesami,
            allow_unknown_incoming: config.allow_unknown_incoming,
        }
    }
}

impl CircuitSettings {
    pub fn to_config(&self) -> CircuitConfig {
        CircuitConfig {
            max_serial_relays: self.max_serial_relays,
            close_delay: Duration::from_millis(self.close_delay_ms),
            maintain_interval: Duration::from_millis(self.maintain_interval_ms),
            allow_open_sesami: self.allow_open_sesami,
            allow_unknown_incoming: self.allow_unknown_incoming,
        }
    }
}
