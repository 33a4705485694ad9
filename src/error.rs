use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the terminal engine.
///
/// The taxonomy is deliberately closed: callers match on it to decide
/// between retrying, falling back to a one-shot tmux invocation, or
/// disabling the feature entirely.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The tmux binary is missing, too old, or the platform is unsupported.
    /// Fatal for the workspace: surfaced once, the feature stays disabled
    /// until the user retries explicitly.
    #[error("failed to start tmux control client: {reason}")]
    Spawn { reason: String },

    /// The control channel is not attached (never started, or the process
    /// exited). Transient: the command router falls back to a direct tmux
    /// invocation.
    #[error("control channel closed")]
    ChannelClosed,

    /// A command's response block never completed within its deadline.
    /// The channel framing is no longer trustworthy; a recovery cycle is
    /// forced.
    #[error("control command timed out after {timeout:?}: {command}")]
    CommandTimeout { command: String, timeout: Duration },

    /// The command was in flight when the channel disconnected. Safe to
    /// retry once the channel is attached again.
    #[error("control command aborted by channel loss")]
    Aborted,

    /// tmux rejected the command as unusable inside a control client.
    /// Expected for a handful of commands; triggers the CLI fallback and
    /// is not logged as an error.
    #[error("command not supported in control mode: {command}")]
    UnsupportedInControlMode { command: String },

    /// tmux reported a command failure (`%error` block). The diagnostic is
    /// the block body.
    #[error("tmux command failed: {message}")]
    CommandFailed { message: String },

    /// A one-shot tmux invocation failed (non-zero exit or spawn error).
    #[error("tmux invocation failed: {message}")]
    Invocation { message: String },
}

impl EngineError {
    /// Whether a control-channel failure should be retried through the
    /// direct one-shot tmux path.
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            Self::ChannelClosed
                | Self::CommandTimeout { .. }
                | Self::Aborted
                | Self::UnsupportedInControlMode { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Classify tmux stderr text that means "the server is not running at all".
///
/// Listing and teardown operations treat this as an empty result rather
/// than an error.
pub fn is_server_missing(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("no server running")
        || lower.contains("failed to connect to server")
        || lower.contains("no sessions")
}

/// Classify tmux stderr text that means "this session does not exist".
pub fn is_session_missing(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("can't find session") || lower.contains("no such session")
}

/// Classify an `%error` block body that means the command cannot run in a
/// control client.
pub fn is_unsupported_in_control_mode(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("not allowed in control mode") || lower.contains("can't be used in control mode")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_errors() {
        assert!(EngineError::ChannelClosed.triggers_fallback());
        assert!(EngineError::Aborted.triggers_fallback());
        assert!(EngineError::CommandTimeout {
            command: "list-panes".into(),
            timeout: Duration::from_millis(2500),
        }
        .triggers_fallback());
        assert!(EngineError::UnsupportedInControlMode {
            command: "attach-session".into(),
        }
        .triggers_fallback());
    }

    #[test]
    fn non_fallback_errors() {
        assert!(!EngineError::Spawn {
            reason: "tmux not found".into()
        }
        .triggers_fallback());
        assert!(!EngineError::CommandFailed {
            message: "no such pane".into()
        }
        .triggers_fallback());
    }

    #[test]
    fn server_missing_classification() {
        assert!(is_server_missing("no server running on /tmp/tmux-501/default"));
        assert!(is_server_missing("error connecting: Failed to connect to server"));
        assert!(!is_server_missing("can't find session: proj1"));
    }

    #[test]
    fn session_missing_classification() {
        assert!(is_session_missing("can't find session: proj1"));
        assert!(is_session_missing("no such session"));
        assert!(!is_session_missing("no server running"));
    }

    #[test]
    fn unsupported_classification() {
        assert!(is_unsupported_in_control_mode(
            "attach-session: not allowed in control mode"
        ));
        assert!(!is_unsupported_in_control_mode("no such window"));
    }
}
