//! tmux control-mode line protocol.
//!
//! Control mode (`tmux -C`) is line oriented: every complete line from the
//! server is exactly one of
//!
//! - pane output (`%output` / `%extended-output`) carrying octal-escaped
//!   bytes for one pane,
//! - an out-of-band state notification (`%layout-change`,
//!   `%window-add`, ...),
//! - a response-block delimiter (`%begin` / `%end` / `%error`) correlating
//!   a previously written command with its captured output, or
//! - `%exit`, announcing that the server is detaching this client.
//!
//! Classification is total: no input line makes [`parse_line`] fail.
//! Anything unrecognized or malformed degrades to
//! [`StateFrame::Unknown`] so callers can log it without the reader loop
//! ever crashing.

pub mod layout;

use bytes::Bytes;
use serde::Serialize;

use crate::model::{PaneId, SessionId, WindowId};

/// Header carried by `%begin`, `%end` and `%error` lines: the server's
/// timestamp, its command counter, and block flags.
///
/// Completion is matched on the whole triple; a block delimiter with a
/// different header than the open block is body text, not a terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub timestamp: String,
    pub number: String,
    pub flags: String,
}

/// One classified line from the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    /// Decoded pane output bytes.
    Output { pane_id: PaneId, data: Bytes },
    /// An out-of-band state notification.
    State(StateFrame),
    /// A command response block opened.
    Begin(BlockHeader),
    /// A command response block closed successfully.
    End(BlockHeader),
    /// A command response block closed with an error.
    Error(BlockHeader),
    /// The server is detaching this control client.
    Exit { reason: Option<String> },
}

/// State-change notifications the engine understands, plus a catch-all.
///
/// A closed tagged variant rather than a property bag: the projector's
/// match over this enum is checked at compile time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StateFrame {
    LayoutChange {
        window_id: WindowId,
        layout: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        visible_layout: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        window_flags: Option<String>,
    },
    WindowAdd {
        window_id: WindowId,
    },
    WindowClose {
        window_id: WindowId,
    },
    WindowRenamed {
        window_id: WindowId,
        name: String,
    },
    WindowPaneChanged {
        window_id: WindowId,
        pane_id: PaneId,
    },
    UnlinkedWindowAdd {
        window_id: WindowId,
    },
    UnlinkedWindowClose {
        window_id: WindowId,
    },
    UnlinkedWindowRenamed {
        window_id: WindowId,
        name: String,
    },
    SessionChanged {
        session_id: SessionId,
        name: String,
    },
    ClientSessionChanged {
        client: String,
        session_id: SessionId,
        name: String,
    },
    SessionRenamed {
        name: String,
    },
    SessionWindowChanged {
        session_id: SessionId,
        window_id: WindowId,
    },
    SessionsChanged,
    ClientDetached {
        client: String,
    },
    PaneModeChanged {
        pane_id: PaneId,
    },
    Pause {
        pane_id: PaneId,
    },
    Continue {
        pane_id: PaneId,
    },
    PasteBufferChanged {
        name: String,
    },
    PasteBufferDeleted {
        name: String,
    },
    Message {
        text: String,
    },
    ConfigError {
        text: String,
    },
    SubscriptionChanged {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        window_id: Option<WindowId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        window_index: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pane_id: Option<PaneId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    /// The control client exited; emitted by the channel, not parsed
    /// directly from a notification line.
    ClientExit {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Anything the parser does not understand, kept verbatim for logging.
    Unknown {
        line: String,
    },
}

impl StateFrame {
    /// Short notification name, mostly for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LayoutChange { .. } => "layout-change",
            Self::WindowAdd { .. } => "window-add",
            Self::WindowClose { .. } => "window-close",
            Self::WindowRenamed { .. } => "window-renamed",
            Self::WindowPaneChanged { .. } => "window-pane-changed",
            Self::UnlinkedWindowAdd { .. } => "unlinked-window-add",
            Self::UnlinkedWindowClose { .. } => "unlinked-window-close",
            Self::UnlinkedWindowRenamed { .. } => "unlinked-window-renamed",
            Self::SessionChanged { .. } => "session-changed",
            Self::ClientSessionChanged { .. } => "client-session-changed",
            Self::SessionRenamed { .. } => "session-renamed",
            Self::SessionWindowChanged { .. } => "session-window-changed",
            Self::SessionsChanged => "sessions-changed",
            Self::ClientDetached { .. } => "client-detached",
            Self::PaneModeChanged { .. } => "pane-mode-changed",
            Self::Pause { .. } => "pause",
            Self::Continue { .. } => "continue",
            Self::PasteBufferChanged { .. } => "paste-buffer-changed",
            Self::PasteBufferDeleted { .. } => "paste-buffer-deleted",
            Self::Message { .. } => "message",
            Self::ConfigError { .. } => "config-error",
            Self::SubscriptionChanged { .. } => "subscription-changed",
            Self::ClientExit { .. } => "client-exit",
            Self::Unknown { .. } => "unknown",
        }
    }
}

/// Classify one complete line (without its trailing newline).
pub fn parse_line(line: &str) -> ControlFrame {
    if let Some(rest) = line.strip_prefix("%output ") {
        // Format: %output %<pane_id> <octal-escaped data>
        let mut parts = rest.splitn(2, ' ');
        let pane_id = parts.next().unwrap_or("").trim();
        if pane_id.is_empty() {
            return unknown(line);
        }
        let data = decode_octal(parts.next().unwrap_or(""));
        return ControlFrame::Output {
            pane_id: PaneId::from(pane_id),
            data,
        };
    }

    if let Some(rest) = line.strip_prefix("%extended-output ") {
        // Format: %extended-output %<pane_id> <age> ... : <octal-escaped data>
        let (meta, raw) = split_meta_and_value(rest);
        let pane_id = meta.split_whitespace().next().unwrap_or("");
        if pane_id.is_empty() {
            return unknown(line);
        }
        return ControlFrame::Output {
            pane_id: PaneId::from(pane_id),
            data: decode_octal(raw),
        };
    }

    if let Some(rest) = line.strip_prefix("%layout-change ") {
        let mut parts = rest.split_whitespace();
        let Some(window_id) = parts.next() else {
            return unknown(line);
        };
        let Some(layout) = parts.next() else {
            return unknown(line);
        };
        return ControlFrame::State(StateFrame::LayoutChange {
            window_id: WindowId::from(window_id),
            layout: layout.to_string(),
            visible_layout: parts.next().map(str::to_string),
            window_flags: parts.next().map(str::to_string),
        });
    }

    if let Some(rest) = line.strip_prefix("%window-pane-changed ") {
        let mut parts = rest.split_whitespace();
        if let (Some(window_id), Some(pane_id)) = (parts.next(), parts.next()) {
            return ControlFrame::State(StateFrame::WindowPaneChanged {
                window_id: WindowId::from(window_id),
                pane_id: PaneId::from(pane_id),
            });
        }
        return unknown(line);
    }

    if let Some(rest) = line.strip_prefix("%window-add ") {
        return single_window(rest, line, |window_id| StateFrame::WindowAdd { window_id });
    }
    if let Some(rest) = line.strip_prefix("%window-close ") {
        return single_window(rest, line, |window_id| StateFrame::WindowClose { window_id });
    }
    if let Some(rest) = line.strip_prefix("%unlinked-window-add ") {
        return single_window(rest, line, |window_id| StateFrame::UnlinkedWindowAdd {
            window_id,
        });
    }
    if let Some(rest) = line.strip_prefix("%unlinked-window-close ") {
        return single_window(rest, line, |window_id| StateFrame::UnlinkedWindowClose {
            window_id,
        });
    }

    if let Some(rest) = line.strip_prefix("%window-renamed ") {
        return renamed_window(rest, line, |window_id, name| StateFrame::WindowRenamed {
            window_id,
            name,
        });
    }
    if let Some(rest) = line.strip_prefix("%unlinked-window-renamed ") {
        return renamed_window(rest, line, |window_id, name| {
            StateFrame::UnlinkedWindowRenamed { window_id, name }
        });
    }

    if let Some(rest) = line.strip_prefix("%session-changed ") {
        let mut parts = rest.splitn(2, ' ');
        if let (Some(session_id), Some(name)) = (parts.next(), parts.next()) {
            return ControlFrame::State(StateFrame::SessionChanged {
                session_id: SessionId::from(session_id),
                name: name.to_string(),
            });
        }
        return unknown(line);
    }

    if let Some(rest) = line.strip_prefix("%client-session-changed ") {
        let mut parts = rest.splitn(3, ' ');
        if let (Some(client), Some(session_id), Some(name)) =
            (parts.next(), parts.next(), parts.next())
        {
            return ControlFrame::State(StateFrame::ClientSessionChanged {
                client: client.to_string(),
                session_id: SessionId::from(session_id),
                name: name.to_string(),
            });
        }
        return unknown(line);
    }

    if let Some(rest) = line.strip_prefix("%session-renamed ") {
        let name = rest.trim();
        if name.is_empty() {
            return unknown(line);
        }
        return ControlFrame::State(StateFrame::SessionRenamed {
            name: name.to_string(),
        });
    }

    if let Some(rest) = line.strip_prefix("%session-window-changed ") {
        let mut parts = rest.split_whitespace();
        if let (Some(session_id), Some(window_id)) = (parts.next(), parts.next()) {
            return ControlFrame::State(StateFrame::SessionWindowChanged {
                session_id: SessionId::from(session_id),
                window_id: WindowId::from(window_id),
            });
        }
        return unknown(line);
    }

    if line.starts_with("%sessions-changed") {
        return ControlFrame::State(StateFrame::SessionsChanged);
    }

    if let Some(rest) = line.strip_prefix("%client-detached ") {
        if let Some(client) = rest.split_whitespace().next() {
            return ControlFrame::State(StateFrame::ClientDetached {
                client: client.to_string(),
            });
        }
        return unknown(line);
    }

    if let Some(rest) = line.strip_prefix("%pane-mode-changed ") {
        return single_pane(rest, line, |pane_id| StateFrame::PaneModeChanged { pane_id });
    }
    if let Some(rest) = line.strip_prefix("%pause ") {
        return single_pane(rest, line, |pane_id| StateFrame::Pause { pane_id });
    }
    if let Some(rest) = line.strip_prefix("%continue ") {
        return single_pane(rest, line, |pane_id| StateFrame::Continue { pane_id });
    }

    if let Some(rest) = line.strip_prefix("%paste-buffer-changed ") {
        let name = rest.trim();
        if name.is_empty() {
            return unknown(line);
        }
        return ControlFrame::State(StateFrame::PasteBufferChanged {
            name: name.to_string(),
        });
    }
    if let Some(rest) = line.strip_prefix("%paste-buffer-deleted ") {
        let name = rest.trim();
        if name.is_empty() {
            return unknown(line);
        }
        return ControlFrame::State(StateFrame::PasteBufferDeleted {
            name: name.to_string(),
        });
    }

    if let Some(rest) = line.strip_prefix("%message ") {
        return ControlFrame::State(StateFrame::Message {
            text: rest.trim().to_string(),
        });
    }
    if let Some(rest) = line.strip_prefix("%config-error ") {
        return ControlFrame::State(StateFrame::ConfigError {
            text: rest.trim().to_string(),
        });
    }

    if let Some(rest) = line.strip_prefix("%subscription-changed ") {
        // Format: %subscription-changed name $sid @wid widx %pid ... : value
        let (meta, value) = split_meta_and_value(rest);
        let mut parts = meta.split_whitespace();
        let Some(name) = parts.next() else {
            return unknown(line);
        };
        return ControlFrame::State(StateFrame::SubscriptionChanged {
            name: name.to_string(),
            session_id: parts.next().map(SessionId::from),
            window_id: parts.next().map(WindowId::from),
            window_index: parts.next().map(str::to_string),
            pane_id: parts.next().map(PaneId::from),
            value: if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            },
        });
    }

    if line.starts_with("%begin ") {
        if let Some(header) = parse_block_header(line) {
            return ControlFrame::Begin(header);
        }
    }
    if line.starts_with("%end ") {
        if let Some(header) = parse_block_header(line) {
            return ControlFrame::End(header);
        }
    }
    if line.starts_with("%error ") {
        if let Some(header) = parse_block_header(line) {
            return ControlFrame::Error(header);
        }
    }

    if line.starts_with("%exit") {
        let reason = line
            .strip_prefix("%exit")
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        return ControlFrame::Exit { reason };
    }

    unknown(line)
}

fn unknown(line: &str) -> ControlFrame {
    ControlFrame::State(StateFrame::Unknown {
        line: line.to_string(),
    })
}

fn single_window(
    rest: &str,
    line: &str,
    build: impl FnOnce(WindowId) -> StateFrame,
) -> ControlFrame {
    match rest.split_whitespace().next() {
        Some(id) => ControlFrame::State(build(WindowId::from(id))),
        None => unknown(line),
    }
}

fn single_pane(rest: &str, line: &str, build: impl FnOnce(PaneId) -> StateFrame) -> ControlFrame {
    match rest.split_whitespace().next() {
        Some(id) => ControlFrame::State(build(PaneId::from(id))),
        None => unknown(line),
    }
}

fn renamed_window(
    rest: &str,
    line: &str,
    build: impl FnOnce(WindowId, String) -> StateFrame,
) -> ControlFrame {
    let mut parts = rest.splitn(2, ' ');
    match (parts.next(), parts.next()) {
        (Some(id), Some(name)) => ControlFrame::State(build(WindowId::from(id), name.to_string())),
        _ => unknown(line),
    }
}

/// Parse a `%begin`/`%end`/`%error` line into its header triple.
fn parse_block_header(line: &str) -> Option<BlockHeader> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }
    Some(BlockHeader {
        timestamp: parts[1].to_string(),
        number: parts[2].to_string(),
        flags: parts[3].to_string(),
    })
}

/// Split notification text of the form `<meta> : <value>` used by
/// `%extended-output` and `%subscription-changed`.
fn split_meta_and_value(input: &str) -> (&str, &str) {
    if let Some(index) = input.find(" : ") {
        return (&input[..index], &input[index + 3..]);
    }
    if let Some(index) = input.find(" :") {
        return (&input[..index], input[index + 2..].trim_start());
    }
    (input, "")
}

/// Decode tmux octal escapes (`\ooo`) in pane output back to raw bytes.
///
/// tmux escapes each byte individually, so multi-byte UTF-8 codepoints
/// arrive as consecutive escapes. A backslash not followed by exactly
/// three octal digits passes through unchanged.
pub fn decode_octal(input: &str) -> Bytes {
    let bytes = input.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let d0 = bytes[i + 1];
            let d1 = bytes[i + 2];
            let d2 = bytes[i + 3];
            if is_octal(d0) && is_octal(d1) && is_octal(d2) {
                let value =
                    (d0 - b'0') as u16 * 64 + (d1 - b'0') as u16 * 8 + (d2 - b'0') as u16;
                out.push(value as u8);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    Bytes::from(out)
}

fn is_octal(byte: u8) -> bool {
    (b'0'..=b'7').contains(&byte)
}

/// Quote one argument for inclusion in a control-mode command line.
///
/// tmux tokenizes command lines shell-style; anything outside the safe set
/// is wrapped in double quotes with backslash escaping.
pub fn quote_arg(value: &str) -> String {
    if value.is_empty() {
        return "\"\"".to_string();
    }
    let is_safe = value.chars().all(|ch| {
        ch.is_ascii_alphanumeric()
            || matches!(
                ch,
                '-' | '_' | '.' | '/' | ':' | '@' | '%' | '#' | '{' | '}' | '=' | '+' | ','
            )
    });
    if is_safe {
        value.to_string()
    } else {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{}\"", escaped)
    }
}

/// Join quoted arguments into a single control-mode command line.
pub fn command_string(args: &[&str]) -> String {
    args.iter()
        .map(|arg| quote_arg(arg))
        .collect::<Vec<_>>()
        .join(" ")
}
