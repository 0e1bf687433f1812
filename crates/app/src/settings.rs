//! Configuration file
//!
//! Optional TOML with `[client]` and `[server]` tables whose keys match
//! [`ClientConfig`] and [`ServerConfig`]. Missing keys take their defaults.

use std::path::Path;

use commander_net::{ClientConfig, ServerConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub client: ClientConfig,
    pub server: ServerConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    ParseError(#[from] toml::de::Error),
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(content)?)
    }

    /// Load `path` if given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, SettingsError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_both_tables() {
        let toml = r#"
            [client]
            address = "127.0.0.1"
            port = 30000
            client_id = "abc"

            [client.reconnect]
            max_attempts = 3

            [server]
            interface = "*"
            port = 30000
        "#;

        let settings = Settings::from_toml(toml).unwrap();
        assert_eq!(settings.client.address.as_deref(), Some("127.0.0.1"));
        assert_eq!(settings.client.client_id.as_deref(), Some("abc"));
        assert!(settings.client.is_complete());
        assert_eq!(settings.client.reconnect.max_attempts, 3);
        // Unspecified policy fields keep their defaults
        assert!(settings.client.reconnect.enabled);
        assert_eq!(settings.client.reconnect.initial_delay_ms, 100);

        assert_eq!(settings.server.interface.as_deref(), Some("*"));
        assert_eq!(settings.server.port, Some(30000));
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(Settings::from_toml("").unwrap(), Settings::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\ninterface = \"127.0.0.1\"\nport = 4000").unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.server.port, Some(4000));
        assert!(settings.client.address.is_none());
    }

    #[test]
    fn test_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            Settings::load(&missing),
            Err(SettingsError::IoError(_))
        ));

        assert!(matches!(
            Settings::from_toml("[server]\nport = \"high\""),
            Err(SettingsError::ParseError(_))
        ));
    }
}
