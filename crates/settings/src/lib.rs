//! RelayCraft Settings
//!
//! JSON settings file for relay nodes and circuit clients.
//!
//! ## Usage
//!
//! ```no_run
//! use relaycraft_settings::Settings;
//!
//! let mut settings = Settings::load_or_default()?;
//! settings.circuit.max_serial_relays = 3;
//! settings.save()?;
//!
//! let agent_config = settings.agent_config()?;
//! let circuit_config = settings.circuit_config();
//! # Ok::<(), relaycraft_settings::SettingsError>(())
//! ```

mod config;

pub use config::{AgentSettings, CircuitSettings, Settings};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),

    #[error("Invalid setting {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Get the default settings file path
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("relaycraft")
        .join("settings.json")
}
