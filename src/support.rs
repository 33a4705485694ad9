//! Host support: platform gating, tmux binary resolution, environment
//! normalization, and one-shot tmux invocations.
//!
//! GUI processes on macOS inherit a minimal environment, so every tmux
//! invocation, one-shot or control mode, runs with a normalized PATH
//! that includes the common Homebrew/MacPorts install locations, plus
//! sane SHELL/LANG/TERM values.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::EngineError;

const TMUX_BIN: &str = "tmux";
const TMUX_BIN_ENV: &str = "MUXLINK_TMUX_BIN";
const TMUX_BIN_CANDIDATES: [&str; 4] = [
    "/opt/homebrew/bin/tmux",
    "/usr/local/bin/tmux",
    "/opt/local/bin/tmux",
    "/usr/bin/tmux",
];
const DEFAULT_PATH: &str =
    "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin:/opt/homebrew/bin:/opt/local/bin";

/// Whether the engine can run here, with a reason when it cannot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportStatus {
    pub supported: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Normalized environment applied to every tmux process.
#[derive(Debug, Clone)]
pub struct TmuxEnv {
    pub path: String,
    pub shell: String,
    pub home: Option<String>,
    pub lang: String,
    pub lc_all: String,
    pub term: String,
}

impl TmuxEnv {
    pub fn build() -> Self {
        let current_path = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
        let path = if current_path.contains("/opt/homebrew/bin")
            && current_path.contains("/usr/local/bin")
        {
            current_path
        } else {
            format!("{DEFAULT_PATH}:{current_path}")
        };
        let lang = non_empty_env("LANG").unwrap_or_else(|| "en_US.UTF-8".to_string());
        let lc_all = non_empty_env("LC_ALL").unwrap_or_else(|| lang.clone());
        let term = non_empty_env("TERM").unwrap_or_else(|| "xterm-256color".to_string());

        Self {
            path,
            shell: user_shell(),
            home: non_empty_env("HOME"),
            lang,
            lc_all,
            term,
        }
    }

    pub fn apply_to(&self, cmd: &mut Command) {
        cmd.env("PATH", &self.path);
        cmd.env("SHELL", &self.shell);
        cmd.env("LANG", &self.lang);
        cmd.env("LC_ALL", &self.lc_all);
        cmd.env("TERM", &self.term);
        if let Some(home) = &self.home {
            cmd.env("HOME", home);
        }
    }

    pub fn apply_to_async(&self, cmd: &mut tokio::process::Command) {
        cmd.env("PATH", &self.path);
        cmd.env("SHELL", &self.shell);
        cmd.env("LANG", &self.lang);
        cmd.env("LC_ALL", &self.lc_all);
        cmd.env("TERM", &self.term);
        if let Some(home) = &self.home {
            cmd.env("HOME", home);
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

/// The user's login shell, with fallbacks for stripped environments.
pub fn user_shell() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() && Path::new(&shell).exists() {
            return shell;
        }
    }
    if Path::new("/bin/zsh").exists() {
        "/bin/zsh".to_string()
    } else if Path::new("/bin/bash").exists() {
        "/bin/bash".to_string()
    } else {
        "/bin/sh".to_string()
    }
}

/// Resolve the tmux binary: explicit config, `MUXLINK_TMUX_BIN`, known
/// install locations, then plain `tmux` on PATH.
pub fn resolve_tmux_bin(config: &EngineConfig) -> PathBuf {
    if let Some(bin) = &config.tmux_bin {
        return bin.clone();
    }
    if let Some(path) = std::env::var_os(TMUX_BIN_ENV) {
        if Path::new(&path).is_file() {
            return PathBuf::from(path);
        }
    }
    for candidate in TMUX_BIN_CANDIDATES {
        if Path::new(candidate).is_file() {
            return PathBuf::from(candidate);
        }
    }
    PathBuf::from(TMUX_BIN)
}

/// Report whether the engine can run at all. Surfaced once to the UI;
/// operations also gate on this so the feature degrades instead of
/// erroring repeatedly.
pub fn support_status(config: &EngineConfig) -> SupportStatus {
    if config.macos_only && !cfg!(target_os = "macos") {
        return SupportStatus {
            supported: false,
            reason: Some("the tmux workspace integration is only supported on macOS".to_string()),
        };
    }
    if !tmux_available(config) {
        return SupportStatus {
            supported: false,
            reason: Some("tmux was not found; install tmux to enable terminal workspaces".to_string()),
        };
    }
    SupportStatus {
        supported: true,
        reason: None,
    }
}

pub fn ensure_supported(config: &EngineConfig) -> Result<(), EngineError> {
    let status = support_status(config);
    if status.supported {
        Ok(())
    } else {
        Err(EngineError::Spawn {
            reason: status.reason.unwrap_or_else(|| "unsupported".to_string()),
        })
    }
}

fn tmux_available(config: &EngineConfig) -> bool {
    base_command(config)
        .arg("-V")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// A tmux `Command` with normalized environment and the configured socket.
fn base_command(config: &EngineConfig) -> Command {
    let mut cmd = Command::new(resolve_tmux_bin(config));
    TmuxEnv::build().apply_to(&mut cmd);
    if let Some(socket) = &config.socket_name {
        cmd.arg("-L").arg(socket);
    }
    cmd
}

/// Run a one-shot tmux command, returning captured stdout.
///
/// This is the fallback path when the control channel is unavailable, and
/// the bootstrap path before it exists.
pub fn run_tmux(config: &EngineConfig, args: &[String]) -> Result<String, EngineError> {
    let output = base_command(config)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|err| EngineError::Invocation {
            message: format!("failed to run tmux: {err}"),
        })?;

    if !output.status.success() {
        return Err(EngineError::Invocation {
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Run a one-shot tmux command for its side effect only.
pub fn run_tmux_status(config: &EngineConfig, args: &[String]) -> Result<(), EngineError> {
    run_tmux(config, args).map(|_| ())
}

/// Whether the target session exists on the server.
pub fn session_exists(config: &EngineConfig, session: &str) -> Result<bool, EngineError> {
    match run_tmux_status(
        config,
        &["has-session".to_string(), "-t".to_string(), session.to_string()],
    ) {
        Ok(()) => Ok(true),
        // has-session exits non-zero when the server or the session is
        // missing.
        Err(EngineError::Invocation { .. }) => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_has_multiplexer_paths() {
        let env = TmuxEnv::build();
        assert!(env.path.contains("/usr/local/bin"));
        assert!(env.path.contains("/opt/homebrew/bin"));
        assert!(!env.lang.is_empty());
        assert!(!env.term.is_empty());
    }

    #[test]
    fn user_shell_exists() {
        let shell = user_shell();
        assert!(Path::new(&shell).exists());
    }

    #[test]
    fn resolve_prefers_config_override() {
        let config = EngineConfig {
            tmux_bin: Some(PathBuf::from("/nonexistent/tmux")),
            ..EngineConfig::default()
        };
        assert_eq!(resolve_tmux_bin(&config), PathBuf::from("/nonexistent/tmux"));
    }

    #[test]
    fn run_tmux_reports_spawn_failure() {
        let config = EngineConfig {
            tmux_bin: Some(PathBuf::from("/nonexistent/tmux")),
            macos_only: false,
            ..EngineConfig::default()
        };
        let err = run_tmux(&config, &["-V".to_string()]).unwrap_err();
        assert!(matches!(err, EngineError::Invocation { .. }));
    }

    #[test]
    fn run_tmux_captures_stdout_of_stand_in_binary() {
        // Any executable that echoes its arguments exercises the capture
        // path without a tmux install.
        let config = EngineConfig {
            tmux_bin: Some(PathBuf::from("/bin/echo")),
            macos_only: false,
            ..EngineConfig::default()
        };
        let out = run_tmux(&config, &["list-sessions".to_string()]).unwrap();
        assert_eq!(out.trim(), "list-sessions");
    }

    #[test]
    fn socket_name_is_passed_through() {
        let config = EngineConfig {
            tmux_bin: Some(PathBuf::from("/bin/echo")),
            socket_name: Some("muxlink-test".to_string()),
            macos_only: false,
            ..EngineConfig::default()
        };
        let out = run_tmux(&config, &["has-session".to_string()]).unwrap();
        assert_eq!(out.trim(), "-L muxlink-test has-session");
    }

    #[test]
    fn unsupported_platform_reports_reason() {
        let config = EngineConfig {
            macos_only: true,
            ..EngineConfig::default()
        };
        let status = support_status(&config);
        if cfg!(target_os = "macos") {
            // On macOS the answer depends on a tmux install; only assert shape.
            assert_eq!(status.reason.is_none(), status.supported);
        } else {
            assert!(!status.supported);
            assert!(status.reason.unwrap().contains("macOS"));
        }
    }
}
