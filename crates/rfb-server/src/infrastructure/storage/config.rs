//! TOML-based server configuration.
//!
//! The file lives in the platform configuration directory:
//! - Linux:    `~/.config/rfb-session/server.toml`
//! - macOS:    `~/Library/Application Support/rfb-session/server.toml`
//! - Windows:  `%APPDATA%\rfb-session\server.toml`
//!
//! # Example (for beginners)
//!
//! ```toml
//! [server]
//! desktop_name = "office"
//! frame_rate = 30
//! compare_fb = "auto"
//!
//! [sharing]
//! disconnect_clients = false
//!
//! [timeouts]
//! idle_timeout = 3600
//! ```
//!
//! Every field has a `#[serde(default = "...")]` helper, so a file only
//! needs the settings it changes and a missing file means "all defaults".
//! Timeouts are whole seconds; `0` disables the timer.
//!
//! The file is converted once into a [`SessionPolicy`] with
//! [`ServerConfig::session_policy`]; nothing else reads it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rfb_core::{KeyRemapper, RemapError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::frame_clock::MIN_FRAME_RATE;
use crate::application::policy::{CompareMode, SessionPolicy};

const APP_DIR_NAME: &str = "rfb-session";
const CONFIG_FILE_NAME: &str = "server.toml";

/// Errors from reading or writing the server configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Neither the platform variable nor `HOME` is set.
    #[error("no configuration directory for this platform")]
    NoPlatformConfigDir,

    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed server configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot encode server configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: GeneralConfig,
    #[serde(default)]
    pub sharing: SharingConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    #[serde(default = "default_desktop_name")]
    pub desktop_name: String,
    /// Frames per second; drives the frame clock period.
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    #[serde(default)]
    pub compare_fb: CompareMode,
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SharingConfig {
    /// Close other clients when one connects non-shared.
    #[serde(default = "default_true")]
    pub disconnect_clients: bool,
    #[serde(default)]
    pub never_shared: bool,
    #[serde(default)]
    pub always_shared: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputConfig {
    #[serde(default = "default_true")]
    pub accept_key_events: bool,
    #[serde(default = "default_true")]
    pub accept_pointer_events: bool,
    #[serde(default = "default_true")]
    pub accept_cut_text: bool,
    #[serde(default = "default_true")]
    pub send_cut_text: bool,
    #[serde(default = "default_true")]
    pub accept_set_desktop_size: bool,
    /// Key remapping list, e.g. `"0x22->0x40,0x24<>0x25"`.
    #[serde(default)]
    pub remap_keys: String,
}

/// Timer lengths in seconds.  `0` disables a timer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TimeoutConfig {
    #[serde(default)]
    pub max_idle_time: u64,
    #[serde(default)]
    pub max_disconnection_time: u64,
    #[serde(default)]
    pub max_connection_time: u64,
    /// Per-client inactivity limit.
    #[serde(default)]
    pub idle_timeout: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_desktop_name() -> String {
    "rfb-session".to_string()
}
fn default_frame_rate() -> u32 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            desktop_name: default_desktop_name(),
            frame_rate: default_frame_rate(),
            compare_fb: CompareMode::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            disconnect_clients: default_true(),
            never_shared: false,
            always_shared: false,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            accept_key_events: default_true(),
            accept_pointer_events: default_true(),
            accept_cut_text: default_true(),
            send_cut_text: default_true(),
            accept_set_desktop_size: default_true(),
            remap_keys: String::new(),
        }
    }
}

fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

impl ServerConfig {
    /// Builds the policy handed to every session.
    ///
    /// # Errors
    ///
    /// Returns [`RemapError`] if `input.remap_keys` is malformed.
    pub fn session_policy(&self) -> Result<SessionPolicy, RemapError> {
        Ok(SessionPolicy {
            desktop_name: self.server.desktop_name.clone(),
            frame_rate: self.server.frame_rate.max(MIN_FRAME_RATE),
            compare_mode: self.server.compare_fb,
            disconnect_clients: self.sharing.disconnect_clients,
            never_shared: self.sharing.never_shared,
            always_shared: self.sharing.always_shared,
            accept_key_events: self.input.accept_key_events,
            accept_pointer_events: self.input.accept_pointer_events,
            accept_cut_text: self.input.accept_cut_text,
            send_cut_text: self.input.send_cut_text,
            accept_set_desktop_size: self.input.accept_set_desktop_size,
            key_remapper: KeyRemapper::parse(&self.input.remap_keys)?,
            max_idle_time: seconds(self.timeouts.max_idle_time),
            max_disconnection_time: seconds(self.timeouts.max_disconnection_time),
            max_connection_time: seconds(self.timeouts.max_connection_time),
            idle_timeout: seconds(self.timeouts.idle_timeout),
        })
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the full path to the config file in the platform directory.
///
/// # Errors
///
/// [`ConfigError::NoPlatformConfigDir`] when no base directory is known.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the configuration from `path`, returning the defaults if the file
/// does not exist.
///
/// # Errors
///
/// [`ConfigError::Io`] when the file exists but cannot be read,
/// [`ConfigError::Parse`] when it is not valid configuration TOML.
pub fn load_config_from(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Loads the configuration from the platform config file.
///
/// # Errors
///
/// See [`config_file_path`] and [`load_config_from`].
pub fn load_config() -> Result<ServerConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// [`ConfigError::Io`] or [`ConfigError::Serialize`].
pub fn save_config_to(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    let encoded = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    std::fs::write(path, encoded).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// `%APPDATA%` on Windows, `~/Library/Application Support` on macOS and
/// `$XDG_CONFIG_HOME` (or `~/.config`) elsewhere.
fn platform_config_dir() -> Option<PathBuf> {
    let home = || std::env::var_os("HOME").map(PathBuf::from);
    let base = if cfg!(target_os = "windows") {
        std::env::var_os("APPDATA").map(PathBuf::from)
    } else if cfg!(target_os = "macos") {
        home().map(|h| h.join("Library/Application Support"))
    } else {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| home().map(|h| h.join(".config")))
    };
    base.map(|dir| dir.join(APP_DIR_NAME))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_server_config_default_matches_session_policy_default() {
        // Arrange
        let cfg = ServerConfig::default();

        // Act
        let policy = cfg.session_policy().expect("defaults are valid");

        // Assert
        let expected = SessionPolicy::default();
        assert_eq!(policy.desktop_name, expected.desktop_name);
        assert_eq!(policy.frame_rate, expected.frame_rate);
        assert_eq!(policy.compare_mode, CompareMode::Auto);
        assert!(policy.disconnect_clients);
        assert!(policy.key_remapper.is_identity());
        assert_eq!(policy.idle_timeout, None);
    }

    #[test]
    fn test_deserialize_empty_toml_uses_defaults() {
        let cfg: ServerConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn test_deserialize_partial_sections_override_defaults() {
        // Arrange
        let toml_str = r#"
[server]
frame_rate = 25
compare_fb = "never"

[sharing]
never_shared = true

[timeouts]
idle_timeout = 90
"#;

        // Act
        let cfg: ServerConfig = toml::from_str(toml_str).expect("deserialize partial");
        let policy = cfg.session_policy().expect("valid");

        // Assert
        assert_eq!(policy.frame_rate, 25);
        assert_eq!(policy.compare_mode, CompareMode::Never);
        assert!(policy.never_shared);
        assert!(policy.disconnect_clients, "unspecified fields keep defaults");
        assert_eq!(policy.idle_timeout, Some(Duration::from_secs(90)));
        assert_eq!(policy.max_idle_time, None);
    }

    #[test]
    fn test_unknown_compare_mode_fails_to_parse() {
        let result: Result<ServerConfig, _> = toml::from_str("[server]\ncompare_fb = \"sometimes\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_frame_rate_is_clamped() {
        let mut cfg = ServerConfig::default();
        cfg.server.frame_rate = 0;

        let policy = cfg.session_policy().expect("valid");

        assert_eq!(policy.frame_rate, MIN_FRAME_RATE);
    }

    #[test]
    fn test_malformed_remap_keys_is_rejected() {
        let mut cfg = ServerConfig::default();
        cfg.input.remap_keys = "0x22=0x40".to_string();

        assert!(cfg.session_policy().is_err());
    }

    #[test]
    fn test_remap_keys_reach_the_policy() {
        let mut cfg = ServerConfig::default();
        cfg.input.remap_keys = "0x22->0x40".to_string();

        let policy = cfg.session_policy().expect("valid");

        assert_eq!(policy.key_remapper.remap(0x22), 0x40);
    }

    #[test]
    fn test_load_config_from_missing_file_returns_default() {
        let path = PathBuf::from("/nonexistent/path/that/cannot/exist/server.toml");

        let cfg = load_config_from(&path).expect("missing file is not an error");

        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn test_load_config_from_malformed_file_returns_parse_error() {
        let dir = std::env::temp_dir().join(format!("rfb_test_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[[[ not valid toml").unwrap();

        let result = load_config_from(&path);

        assert!(matches!(result, Err(ConfigError::Parse(_))));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_save_and_load_config_round_trip_via_temp_dir() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("rfb_test_{}", Uuid::new_v4()));
        let path = dir.join("nested").join(CONFIG_FILE_NAME);
        let mut cfg = ServerConfig::default();
        cfg.server.desktop_name = "office".to_string();
        cfg.timeouts.max_connection_time = 600;

        // Act
        save_config_to(&path, &cfg).expect("save");
        let loaded = load_config_from(&path).expect("load");

        // Assert
        assert_eq!(loaded, cfg);

        // Cleanup
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_config_file_path_ends_with_server_toml() {
        if let Ok(path) = config_file_path() {
            assert!(path.ends_with(CONFIG_FILE_NAME), "unexpected path {path:?}");
        }
        // NoPlatformConfigDir is acceptable in a stripped environment.
    }
}
