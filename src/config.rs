//! Engine configuration.
//!
//! Everything the protocol layer deliberately does not hard-code lives
//! here: timeouts, the flow-control pause window, baseline subscriptions,
//! and the styling applied to sessions the engine creates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// A value the control channel should push change notifications for
/// (`refresh-client -B`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    /// Subscription name, echoed back in `%subscription-changed`.
    pub name: String,
    /// Optional target (pane/window/session id); empty means the current
    /// session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// tmux format string whose expansion is watched for changes.
    pub format: String,
}

impl SubscriptionSpec {
    /// Render the `name:target:format` argument for `refresh-client -B`.
    pub fn to_argument(&self) -> String {
        match &self.target {
            Some(target) => format!("{}:{}:{}", self.name, target, self.format),
            None => format!("{}::{}", self.name, self.format),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Explicit tmux binary path. When unset, `MUXLINK_TMUX_BIN` and a list
    /// of well-known install locations are consulted before falling back
    /// to `tmux` on PATH.
    pub tmux_bin: Option<PathBuf>,
    /// Optional `tmux -L` socket name, isolating the engine's server from
    /// the user's default one.
    pub socket_name: Option<String>,
    /// Restrict the engine to macOS, where the integration is supported.
    pub macos_only: bool,
    /// Deadline for a control command's response block.
    pub command_timeout_ms: u64,
    /// Deadline for the control client to become responsive after spawn.
    pub startup_timeout_ms: u64,
    /// Flow control: ask the server to pause a pane once it is this many
    /// seconds behind. `None` disables pause-after.
    pub pause_after_seconds: Option<u32>,
    /// Subscriptions registered at channel setup. None by default;
    /// integrators opt in.
    pub subscriptions: Vec<SubscriptionSpec>,
    /// Scrollback history for sessions the engine creates.
    pub history_limit: u32,
    pub pane_border_style: String,
    pub pane_active_border_style: String,
    /// Consecutive failed recovery cycles tolerated before the engine
    /// reports itself degraded and stops auto-retrying.
    pub max_recovery_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tmux_bin: None,
            socket_name: None,
            macos_only: true,
            command_timeout_ms: 2500,
            startup_timeout_ms: 10_000,
            pause_after_seconds: Some(5),
            subscriptions: Vec::new(),
            history_limit: 200_000,
            pane_border_style: "fg=#586e75,bg=default".to_string(),
            pane_active_border_style: "fg=#268bd2,bg=default".to_string(),
            max_recovery_attempts: 3,
        }
    }
}

impl EngineConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Load configuration from a TOML file. A missing file yields the
    /// defaults so first runs need no setup.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config from {}", path.display()))
    }
}
