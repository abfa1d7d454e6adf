//! Configuration module
//!
//! Handles loading and saving playnet server configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{DEFAULT_MAX_FRAME_LEN, DEFAULT_PORT};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid public address: {0}")]
    InvalidPublicAddress(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// What the server tells clients about itself
    #[serde(default)]
    pub server: ServerConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Player policies
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Request dispatch settings
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

/// Server identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Name shown in server listings
    #[serde(default = "default_name")]
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Maximum number of connected players
    #[serde(default = "default_max_players")]
    pub max_players: usize,
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "playnet".to_string())
}

fn default_max_players() -> usize {
    20
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            description: String::new(),
            max_players: default_max_players(),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Externally reachable address, if the port is forwarded
    pub public_address: Option<String>,
    /// Maximum frame size in bytes
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    /// Consecutive malformed frames before disconnecting (0 = never)
    #[serde(default = "default_max_decode_errors")]
    pub max_decode_errors: usize,
    /// Outgoing frames buffered per session
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
    /// Time to flush queued frames on disconnect (ms)
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
    /// Time sessions get to finish on shutdown (ms)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

fn default_max_decode_errors() -> usize {
    8
}

fn default_send_queue() -> usize {
    256
}

fn default_drain_timeout() -> u64 {
    1000
}

fn default_shutdown_grace() -> u64 {
    3000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            public_address: None,
            max_frame_len: default_max_frame_len(),
            max_decode_errors: default_max_decode_errors(),
            send_queue: default_send_queue(),
            drain_timeout_ms: default_drain_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

/// Player policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Kick players silent for this long (0 = never)
    #[serde(default)]
    pub afk_kick_after_secs: u64,
    /// How often to look for idle players
    #[serde(default = "default_afk_check_interval")]
    pub afk_check_interval_secs: u64,
}

fn default_afk_check_interval() -> u64 {
    30
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            afk_kick_after_secs: 0,
            afk_check_interval_secs: default_afk_check_interval(),
        }
    }
}

impl PolicyConfig {
    /// Idle limit, if AFK kicking is enabled
    pub fn afk_limit(&self) -> Option<Duration> {
        (self.afk_kick_after_secs > 0).then(|| Duration::from_secs(self.afk_kick_after_secs))
    }

    pub fn afk_check_interval(&self) -> Duration {
        Duration::from_secs(self.afk_check_interval_secs.max(1))
    }
}

/// Dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Requests slower than this are logged (ms)
    #[serde(default = "default_slow_request_threshold")]
    pub slow_request_threshold_ms: u64,
    /// Packets a player may have waiting for its handlers before it is disconnected
    #[serde(default = "default_pending_packets")]
    pub pending_packets: usize,
}

fn default_slow_request_threshold() -> u64 {
    500
}

fn default_pending_packets() -> usize {
    256
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            slow_request_threshold_ms: default_slow_request_threshold(),
            pending_packets: default_pending_packets(),
        }
    }
}

impl DispatchConfig {
    pub fn slow_request_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_request_threshold_ms)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("playnet/config.toml")),
            Some(PathBuf::from("./playnet.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Parsed public address, if one is configured
    pub fn public_address(&self) -> ConfigResult<Option<SocketAddr>> {
        self.network
            .public_address
            .as_deref()
            .map(|addr| {
                addr.parse()
                    .map_err(|_| ConfigError::InvalidPublicAddress(addr.to_string()))
            })
            .transpose()
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        server: ServerConfig {
            name: "My Game Server".to_string(),
            description: "Friendly co-op world".to_string(),
            max_players: 16,
        },
        network: NetworkConfig {
            public_address: Some("203.0.113.10:7777".to_string()),
            ..Default::default()
        },
        policy: PolicyConfig {
            afk_kick_after_secs: 600,
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.server.max_players, 20);
        assert_eq!(config.dispatch.slow_request_threshold(), Duration::from_millis(500));
        assert_eq!(config.dispatch.pending_packets, 256);
        assert!(config.policy.afk_limit().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.server.name = "Saved".to_string();
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.server.name, "Saved");
        assert_eq!(loaded.network.port, config.network.port);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[network]\nport = 9100\n\n[policy]\nafk_kick_after_secs = 120").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.network.port, 9100);
        assert_eq!(config.network.send_queue, 256);
        assert_eq!(config.policy.afk_limit(), Some(Duration::from_secs(120)));
        assert_eq!(config.server.max_players, 20);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load(Path::new("/nonexistent/playnet.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_public_address_parsing() {
        let mut config = Config::default();
        assert_eq!(config.public_address().unwrap(), None);

        config.network.public_address = Some("198.51.100.4:7777".to_string());
        assert_eq!(
            config.public_address().unwrap(),
            Some("198.51.100.4:7777".parse().unwrap())
        );

        config.network.public_address = Some("not an address".to_string());
        assert!(matches!(
            config.public_address(),
            Err(ConfigError::InvalidPublicAddress(_))
        ));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.server.name, "My Game Server");
        assert_eq!(parsed.policy.afk_kick_after_secs, 600);
    }
}
