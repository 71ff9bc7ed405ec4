//! Configuration loading and persistence.
//!
//! Handles reading and writing the companion-link configuration file and
//! turning it into [`ServerConfig`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

use crate::constants::{DEFAULT_BIND_ADDRESS, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_PORT};
use crate::server::ServerConfig;
use crate::transport::{ReliabilityConfig, TransportConfig};

/// File name inside the configuration directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// A host-side device and the client it prefers.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Device name, unique per host.
    pub name: String,
    /// Client type tag this device consumes.
    pub client_type: String,
    /// Name of the client to pair with automatically when it connects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_client: Option<String>,
}

/// Configuration for the companion-link server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// IP address to listen on.
    pub bind_address: String,
    /// UDP port to listen on.
    pub port: u16,
    /// Milliseconds a new remote has to identify itself.
    pub handshake_timeout_ms: u64,
    /// Milliseconds of silence before a remote is dropped.
    pub liveness_timeout_ms: u64,
    /// Milliseconds without sending before a heartbeat goes out.
    pub heartbeat_interval_ms: u64,
    /// Base retransmission timeout in milliseconds.
    pub retransmit_timeout_ms: u64,
    /// Backed-off retransmission timeout cap in milliseconds.
    pub max_retransmit_timeout_ms: u64,
    /// Transmissions of a reliable message before the remote is dropped.
    pub max_retransmit_attempts: u32,
    /// Devices to create on `serve`.
    pub devices: Vec<DeviceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            handshake_timeout_ms: millis(DEFAULT_HANDSHAKE_TIMEOUT),
            liveness_timeout_ms: millis(transport.liveness_timeout),
            heartbeat_interval_ms: millis(transport.heartbeat_interval),
            retransmit_timeout_ms: millis(transport.reliability.retransmit_timeout),
            max_retransmit_timeout_ms: millis(transport.reliability.max_retransmit_timeout),
            max_retransmit_attempts: transport.reliability.max_attempts,
            devices: Vec::new(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `COMPANION_CONFIG_DIR` env var: explicit override
    /// 2. Default: platform config dir (Linux: ~/.config/companion-link)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("COMPANION_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("companion-link")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Path of the configuration file.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from `path` without environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        serde_json::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `COMPANION_*` overrides looked up through `lookup`.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind_address) = lookup("COMPANION_BIND_ADDRESS") {
            self.bind_address = bind_address;
        }
        override_number(&lookup, "COMPANION_PORT", &mut self.port);
        override_number(
            &lookup,
            "COMPANION_HANDSHAKE_TIMEOUT_MS",
            &mut self.handshake_timeout_ms,
        );
        override_number(
            &lookup,
            "COMPANION_LIVENESS_TIMEOUT_MS",
            &mut self.liveness_timeout_ms,
        );
    }

    /// Persists the current configuration to the default location.
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Persists the current configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Endpoint tuning from this configuration.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            liveness_timeout: Duration::from_millis(self.liveness_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            reliability: ReliabilityConfig {
                retransmit_timeout: Duration::from_millis(self.retransmit_timeout_ms),
                max_retransmit_timeout: Duration::from_millis(self.max_retransmit_timeout_ms),
                max_attempts: self.max_retransmit_attempts.max(1),
            },
            ..TransportConfig::default()
        }
    }

    /// Server settings from this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `bind_address` is not an IP address.
    pub fn server_config(&self) -> Result<ServerConfig> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .with_context(|| format!("Invalid bind address {:?}", self.bind_address))?;
        Ok(ServerConfig {
            bind_address: SocketAddr::new(ip, self.port),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            transport: self.transport_config(),
        })
    }

    /// The configured device named `name`.
    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }
}

fn override_number<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(value) = lookup(key) else {
        return;
    };
    match value.trim().parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => log::warn!("[Config] Ignoring {}={:?}: not a number", key, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.handshake_timeout_ms, 5000);
        assert_eq!(config.liveness_timeout_ms, 10_000);
        assert_eq!(config.retransmit_timeout_ms, 200);
        assert_eq!(config.max_retransmit_attempts, 10);
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"{"port": 9100, "devices": [{"name": "Actor1", "client_type": "ARKit Face Capture"}]}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.device("Actor1").unwrap().preferred_client, None);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "{ not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut config = Config::default();
        config.devices.push(DeviceConfig {
            name: "Actor1".to_string(),
            client_type: "ARKit Face Capture".to_string(),
            preferred_client: Some("PhoneA".to_string()),
        });
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);

        #[cfg(unix)]
        {
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("COMPANION_BIND_ADDRESS", "127.0.0.1"),
            ("COMPANION_PORT", "9200"),
            ("COMPANION_HANDSHAKE_TIMEOUT_MS", "250"),
            ("COMPANION_LIVENESS_TIMEOUT_MS", "oops"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(ToString::to_string));

        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.port, 9200);
        assert_eq!(config.handshake_timeout_ms, 250);
        assert_eq!(config.liveness_timeout_ms, 10_000, "bad value ignored");

        let server = config.server_config().unwrap();
        assert_eq!(server.bind_address, "127.0.0.1:9200".parse().unwrap());
        assert_eq!(server.handshake_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_bind_address() {
        let config = Config {
            bind_address: "not-an-ip".to_string(),
            ..Config::default()
        };
        assert!(config.server_config().is_err());
    }
}
