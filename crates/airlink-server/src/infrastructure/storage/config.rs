//! TOML-based configuration persistence for the host server.
//!
//! Reads and writes `AppConfig` to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\Airlink\config.toml`
//! - Linux:    `~/.config/airlink/config.toml`
//! - macOS:    `~/Library/Application Support/Airlink/config.toml`
//!
//! Example:
//!
//! ```toml
//! [server]
//! transport = "relay"
//! log_level = "debug"
//!
//! [relay]
//! url = "wss://relay.example.com/"
//! installation_id = "5f0c..."
//! user_id = "u-123"
//!
//! [security]
//! password = "correct horse"
//! ```
//!
//! # Serde default values
//!
//! Every field carries `#[serde(default = "some_fn")]`, so a missing file, a
//! missing section or a missing key all fall back to the built-in defaults.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::session_manager::SessionConfig;
use crate::application::upload::{UploadConfig, DEFAULT_MAX_FILE_SIZE};
use crate::infrastructure::network::direct::{DirectConfig, DEFAULT_PORT};
use crate::infrastructure::network::relay::{RelayConfig, RelayCredential};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value parsed but cannot be used.
    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Which transport the server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Direct,
    Relay,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Direct => f.write_str("direct"),
            TransportKind::Relay => f.write_str("relay"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(TransportKind::Direct),
            "relay" => Ok(TransportKind::Relay),
            other => Err(format!("unknown transport {other:?}; expected \"direct\" or \"relay\"")),
        }
    }
}

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub direct: DirectSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub uploads: UploadSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectSection {
    /// IP address to listen on.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelaySection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<String>,
    /// Account token for a first registration.  Takes precedence over `user_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default = "default_relay_handshake_secs")]
    pub handshake_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SecuritySection {
    /// Shared secret clients must present.  Absent means no authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutSection {
    #[serde(default = "default_handshake_secs")]
    pub handshake_secs: u64,
    #[serde(default = "default_ping_secs")]
    pub ping_secs: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadSection {
    /// Staging directory.  Defaults to `airlink/uploads` under the system
    /// temp directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_fragment_timeout_secs")]
    pub fragment_timeout_secs: u64,
    /// Largest accepted file, in bytes, after inflation.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_transport() -> TransportKind {
    TransportKind::Direct
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_relay_handshake_secs() -> u64 {
    8
}
fn default_handshake_secs() -> u64 {
    10
}
fn default_ping_secs() -> u64 {
    30
}
fn default_keepalive_secs() -> u64 {
    30 * 60
}
fn default_fragment_timeout_secs() -> u64 {
    10
}
fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            log_level: default_log_level(),
        }
    }
}

impl Default for DirectSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            url: None,
            installation_id: None,
            id_token: None,
            user_id: None,
            handshake_timeout_secs: default_relay_handshake_secs(),
        }
    }
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            handshake_secs: default_handshake_secs(),
            ping_secs: default_ping_secs(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            directory: None,
            fragment_timeout_secs: default_fragment_timeout_secs(),
            max_file_size: default_max_file_size(),
        }
    }
}

// ── Conversion into runtime settings ──────────────────────────────────────────

impl AppConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            password: self.security.password.clone().filter(|p| !p.is_empty()),
            handshake_timeout: Duration::from_secs(self.timeouts.handshake_secs),
            ping_timeout: Duration::from_secs(self.timeouts.ping_secs),
            keepalive_interval: Duration::from_secs(self.timeouts.keepalive_secs),
            ..SessionConfig::default()
        }
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `bind_address` is not an IP address.
    pub fn direct_config(&self) -> Result<DirectConfig, ConfigError> {
        let bind_address: IpAddr =
            self.direct
                .bind_address
                .parse()
                .map_err(|e| ConfigError::Invalid {
                    key: "direct.bind_address",
                    reason: format!("{e}"),
                })?;
        Ok(DirectConfig {
            bind_address,
            port: self.direct.port,
        })
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the relay URL, installation id or
    /// account credential is missing.
    pub fn relay_config(&self) -> Result<RelayConfig, ConfigError> {
        let relay = &self.relay;
        let url = relay.url.clone().ok_or(ConfigError::Invalid {
            key: "relay.url",
            reason: "required for the relay transport".to_string(),
        })?;
        let installation_id = relay.installation_id.clone().ok_or(ConfigError::Invalid {
            key: "relay.installation_id",
            reason: "required for the relay transport".to_string(),
        })?;
        let credential = match (&relay.id_token, &relay.user_id) {
            (Some(token), _) => RelayCredential::IdToken(token.clone()),
            (None, Some(user)) => RelayCredential::UserId(user.clone()),
            (None, None) => {
                return Err(ConfigError::Invalid {
                    key: "relay.id_token",
                    reason: "either id_token or user_id is required".to_string(),
                })
            }
        };
        Ok(RelayConfig {
            url,
            installation_id,
            credential,
            handshake_timeout: Duration::from_secs(relay.handshake_timeout_secs),
        })
    }

    pub fn upload_config(&self) -> UploadConfig {
        let directory = self
            .uploads
            .directory
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("airlink").join("uploads"));
        UploadConfig {
            directory,
            fragment_timeout: Duration::from_secs(self.uploads.fragment_timeout_secs),
            max_file_size: self.uploads.max_file_size,
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads `AppConfig` from the platform config file, returning
/// `AppConfig::default()` if the file does not yet exist.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the
/// file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let cfg: AppConfig = toml::from_str(&content)?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Persists `config` to the platform config file.
///
/// # Errors
///
/// See [`save_config_to`].
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    save_config_to(config, &config_file_path()?)
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Resolves the platform config base directory including the `Airlink` subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("Airlink"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("airlink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join("Library").join("Application Support").join("Airlink"))
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
