//! Relay configuration
//!
//! Read from `relay.toml` in the platform config directory unless a path
//! is given. Every key is optional.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;

use duet_core::models::{
    token_space, TokenGenerator, DEFAULT_ALPHABET, DEFAULT_TOKEN_LEN, MIN_TOKEN_SPACE,
};
use duet_net::DEFAULT_PORT;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid config {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Room and identity token settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IdsConfig {
    pub alphabet: String,
    pub length: usize,
}

impl Default for IdsConfig {
    fn default() -> Self {
        Self {
            alphabet: DEFAULT_ALPHABET.to_string(),
            length: DEFAULT_TOKEN_LEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub port: u16,
    pub bind: IpAddr,
    /// Filter used when `RUST_LOG` is unset
    pub log_level: String,
    pub ids: IdsConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            log_level: "info".to_string(),
            ids: IdsConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Platform location of `relay.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "duet", "duet").map(|dirs| dirs.config_dir().join("relay.toml"))
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        // Token settings must leave room for many rooms
        let space = token_space(&config.ids.alphabet, config.ids.length);
        if space < MIN_TOKEN_SPACE {
            return Err(ConfigError::Invalid {
                path: path.to_path_buf(),
                reason: format!(
                    "ids allow only {} distinct tokens, need at least {}",
                    space, MIN_TOKEN_SPACE
                ),
            });
        }
        Ok(config)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn token_generator(&self) -> TokenGenerator {
        TokenGenerator::new(&self.ids.alphabet, self.ids.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::load(&dir.path().join("relay.toml")).unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.socket_addr().port(), 8080);
        assert_eq!(config.ids.length, 8);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(
            &path,
            "port = 9000\nbind = \"127.0.0.1\"\n\n[ids]\nlength = 6\n",
        )
        .unwrap();

        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.socket_addr(), "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.log_level, "info");
        assert_eq!(config.ids.length, 6);
        assert_eq!(config.ids.alphabet, DEFAULT_ALPHABET);
        assert_eq!(config.token_generator().length(), 6);
    }

    #[test]
    fn test_small_token_space_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "[ids]\nalphabet = \"AAB\"\nlength = 4\n").unwrap();
        match RelayConfig::load(&path) {
            Err(ConfigError::Invalid { reason, .. }) => assert!(reason.contains("16")),
            other => panic!("unexpected {:?}", other),
        }

        std::fs::write(&path, "[ids]\nalphabet = \"AB\"\nlength = 32\n").unwrap();
        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.token_generator().length(), 32);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(matches!(
            RelayConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
