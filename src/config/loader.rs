//! Configuration loading from disk.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::schema::Settings;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Validation(_) => None,
        }
    }
}

/// Where the active settings came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Parsed from this file.
    File(PathBuf),
    /// The file was absent; built-in defaults are in use.
    Defaults,
}

impl ConfigSource {
    pub fn is_default(&self) -> bool {
        matches!(self, ConfigSource::Defaults)
    }
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Settings, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    let settings: Settings = toml::from_str(&content).map_err(ConfigError::Parse)?;

    validate_config(&settings).map_err(ConfigError::Validation)?;

    Ok(settings)
}

/// Load configuration, falling back to defaults when the file does not exist.
///
/// A file that exists but cannot be read, parsed or validated is still an error.
pub fn load_or_default(path: &Path) -> Result<(Settings, ConfigSource), ConfigError> {
    match load_config(path) {
        Ok(settings) => Ok((settings, ConfigSource::File(path.to_path_buf()))),
        Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok((Settings::default(), ConfigSource::Defaults))
        }
        Err(e) => Err(e),
    }
}
