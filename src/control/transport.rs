//! Control-channel transport: the tmux child process and line framing.
//!
//! The transport is the single owner of the child process handle and its
//! byte streams; no other component holds one. Outward it exposes only a
//! boxed reader/writer pair and process supervision.
//!
//! `tmux -CC` demands a real TTY (it fails with `tcgetattr: Inappropriate
//! ioctl` over pipes), so the child runs plain `-C` control mode with
//! piped stdio. The wire protocol is identical.

use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::support::{resolve_tmux_bin, TmuxEnv};

/// Boxed byte streams of the control client.
pub type TransportReader = Box<dyn AsyncRead + Send + Unpin>;
pub type TransportWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A spawned control client plus its streams. Tests substitute in-memory
/// duplex streams via [`ControlTransport::from_streams`].
pub struct ControlTransport {
    pub reader: TransportReader,
    pub writer: TransportWriter,
    pub child: Option<Child>,
}

impl ControlTransport {
    /// Spawn `tmux -C attach-session -t <session>` with piped stdio.
    pub fn spawn(config: &EngineConfig, session: &str) -> Result<Self, EngineError> {
        let bin = resolve_tmux_bin(config);
        let mut cmd = Command::new(&bin);
        TmuxEnv::build().apply_to_async(&mut cmd);
        if let Some(socket) = &config.socket_name {
            cmd.arg("-L").arg(socket);
        }
        cmd.arg("-C")
            .arg("attach-session")
            .arg("-t")
            .arg(session)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        debug!(bin = %bin.display(), session, "spawning tmux control client");
        let mut child = cmd.spawn().map_err(|err| EngineError::Spawn {
            reason: format!("failed to start tmux control client: {err}"),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| EngineError::Spawn {
            reason: "control client stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| EngineError::Spawn {
            reason: "control client stdout unavailable".to_string(),
        })?;

        Ok(Self {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }

    /// Wrap externally provided streams (the test seam).
    pub fn from_streams(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        }
    }
}

/// Splits a byte stream into complete `\n`-terminated lines.
///
/// Bytes after the last newline (including a UTF-8 sequence split across
/// two reads) are retained and prefixed onto the next feed, never emitted
/// as a short line. Conversion to text happens per complete line, so the
/// frame sequence is invariant under arbitrary chunking of the input.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = memchr(&self.pending[start..], b'\n') {
            let end = start + offset;
            let mut line = &self.pending[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            // The wire is ASCII except for octal-escaped payloads, but raw
            // bytes can appear; U+FFFD for invalid sequences is safe.
            lines.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
        }
        if start > 0 {
            self.pending.drain(..start);
        }
        lines
    }

    /// Bytes buffered past the last complete line.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn memchr(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}
