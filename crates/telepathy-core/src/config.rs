//! Session configuration, loadable from a TOML file.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::daq::DaqOptions;
use crate::symbols::modelmap::DEFAULT_ROOT_SYMBOL;
use crate::transport::DEFAULT_PORT;

/// Which transport binding to open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Stream socket, usually to the serial-to-TCP proxy on the machine
    /// the target is attached to.
    Tcp {
        host: String,
        #[serde(default = "default_port")]
        port: u16,
    },
    /// Direct serial link.
    Serial {
        port: String,
        #[serde(default = "default_baud")]
        baud: u32,
    },
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_baud() -> u32 {
    115_200
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Tcp {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// Configuration for a [`Session`](crate::session::Session).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SessionConfig {
    pub transport: TransportConfig,
    /// Path to the linked image with DWARF debug info. When set, symbols
    /// are loaded as part of connecting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    /// Name of the model mapping root structure in the image.
    pub model_map_symbol: String,
    /// Compare the image's `.version_info` section against the running
    /// target before trusting any symbol from it.
    pub verify_image_version: bool,
    /// Per-command reply timeout.
    pub command_timeout_ms: u64,
    pub daq: DaqOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            image_path: None,
            model_map_symbol: DEFAULT_ROOT_SYMBOL.to_string(),
            verify_image_version: true,
            command_timeout_ms: 1000,
            daq: DaqOptions::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
