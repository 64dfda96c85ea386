//! On-disk node configuration (TOML), loaded with a fallback to defaults.

use std::path::PathBuf;

use energynet_wire::SessionParameters;
use serde::{Deserialize, Serialize};

/// Complete on-disk node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_identity")]
    pub identity: String,
    #[serde(default)]
    pub r#type: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            identity: default_identity(),
            r#type: None,
            version: None,
            name: None,
            tenant: None,
            provider: None,
        }
    }
}

impl IdentityConfig {
    pub fn to_session_parameters(&self) -> SessionParameters {
        SessionParameters {
            identity: self.identity.clone(),
            r#type: self.r#type.clone(),
            version: self.version.clone(),
            name: self.name.clone(),
            tenant: self.tenant.clone(),
            provider: self.provider.clone(),
            session: None,
        }
    }
}

/// Network configuration. `listen_port = 0` disables the inbound acceptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
        }
    }
}

/// `tracing-subscriber` filter directive, e.g. `"energynet=info"` or
/// `"debug"`. Overridden at runtime by `RUST_LOG` if set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_directive")]
    pub directive: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directive: default_log_directive(),
        }
    }
}

fn default_log_directive() -> String {
    "energynet=info".to_string()
}

fn default_identity() -> String {
    "energynet-node".to_string()
}

fn default_listen_port() -> u16 {
    energynet_transport::DEFAULT_PORT
}

impl FileConfig {
    /// Load from the default config file location, falling back to
    /// defaults if the file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path();
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    fn config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("ENERGYNET_DATA_DIR") {
            return PathBuf::from(dir).join("config.toml");
        }
        Self::default_data_dir().join("config.toml")
    }

    fn default_data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("ENERGYNET_DATA_DIR") {
            return PathBuf::from(dir);
        }
        #[cfg(target_os = "linux")]
        {
            dirs_fallback(".energynet")
        }
        #[cfg(target_os = "macos")]
        {
            dirs_fallback("Library/Application Support/energynet")
        }
        #[cfg(target_os = "windows")]
        {
            dirs_fallback("energynet")
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            dirs_fallback(".energynet")
        }
    }
}

fn dirs_fallback(subpath: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(subpath))
        .unwrap_or_else(|_| PathBuf::from("/tmp/energynet"))
}
