//! Session policy: the configuration every desktop session is built with.
//!
//! The TOML file in `infrastructure::storage::config` is converted into a
//! [`SessionPolicy`] once at start-up and handed to each session explicitly.

use std::time::Duration;

use rfb_core::KeyRemapper;
use serde::{Deserialize, Serialize};

/// When the comparison pass of the change tracker runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareMode {
    /// Compare on every frame.
    Always,
    /// Never compare.
    Never,
    /// Compare only while some joined client asks for it.
    #[default]
    Auto,
}

/// Settings shared by every session of one server.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub desktop_name: String,
    pub frame_rate: u32,
    pub compare_mode: CompareMode,
    /// Close other clients when one asks for non-shared access.
    pub disconnect_clients: bool,
    pub never_shared: bool,
    pub always_shared: bool,
    pub accept_key_events: bool,
    pub accept_pointer_events: bool,
    pub accept_cut_text: bool,
    pub send_cut_text: bool,
    pub accept_set_desktop_size: bool,
    pub key_remapper: KeyRemapper,
    /// Terminate after this long without user input.
    pub max_idle_time: Option<Duration>,
    /// Terminate after this long without any connection.
    pub max_disconnection_time: Option<Duration>,
    /// Terminate this long after the first connection.
    pub max_connection_time: Option<Duration>,
    /// Close a single client after this long without input from it.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            desktop_name: "rfb-session".to_string(),
            frame_rate: 60,
            compare_mode: CompareMode::Auto,
            disconnect_clients: true,
            never_shared: false,
            always_shared: false,
            accept_key_events: true,
            accept_pointer_events: true,
            accept_cut_text: true,
            send_cut_text: true,
            accept_set_desktop_size: true,
            key_remapper: KeyRemapper::new(),
            max_idle_time: None,
            max_disconnection_time: None,
            max_connection_time: None,
            idle_timeout: None,
        }
    }
}
