//! Offload configuration
//!
//! Loaded from TOML; every key is optional.
//!
//! ```toml
//! fallback_on_cpu = true
//! debug = false
//! dump_ir = false
//! offload_diagnostics = false
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OffloadConfig {
    /// Fall back to sequential lowering when the device path fails
    #[serde(default = "default_true")]
    pub fallback_on_cpu: bool,

    /// Log full failure causes and drop the hint from fallback warnings
    #[serde(default)]
    pub debug: bool,

    /// Dump outlined kernel IR
    #[serde(default)]
    pub dump_ir: bool,

    /// Record an offload report
    #[serde(default)]
    pub offload_diagnostics: bool,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            fallback_on_cpu: true,
            debug: false,
            dump_ir: false,
            offload_diagnostics: false,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read configuration: {}", e),
            ConfigError::Parse(e) => write!(f, "Invalid configuration: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
        }
    }
}

impl OffloadConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(ConfigError::Parse)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml_str(&text)
    }
}
