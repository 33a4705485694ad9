//! Typed identifiers and projection records for the tmux entity hierarchy.
//!
//! Sessions, windows and panes are projections of the server's state, not
//! sources of truth: they are rebuilt or patched from notifications and
//! listing queries and must never drift from the real state for longer
//! than one notification cycle.

use std::fmt;

use serde::{Deserialize, Serialize};

/// tmux session id in wire form (`$0`, `$12`, ...) or a plain session name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

/// tmux window id in wire form (`@3`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(pub String);

/// tmux pane id in wire form (`%7`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaneId(pub String);

macro_rules! id_impls {
    ($ty:ident) => {
        impl $ty {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }
    };
}

id_impls!(SessionId);
id_impls!(WindowId);
id_impls!(PaneId);

/// Absolute pane geometry inside its window, in cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneRect {
    pub left: u16,
    pub top: u16,
    pub width: u16,
    pub height: u16,
}

impl PaneRect {
    pub fn right(&self) -> u16 {
        self.left + self.width
    }

    pub fn bottom(&self) -> u16 {
        self.top + self.height
    }
}

/// Cursor position inside a pane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneCursor {
    pub col: u16,
    pub row: u16,
}

/// One terminal surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneInfo {
    pub id: PaneId,
    pub rect: PaneRect,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<PaneCursor>,
}

/// A window: a named, indexed group of panes tiled into a layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub id: WindowId,
    pub index: i32,
    pub name: String,
    pub is_active: bool,
    pub width: u16,
    pub height: u16,
}

/// A session as reported by `list-sessions`, with the workspace metadata
/// muxlink tags onto sessions it creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    /// Creation time in milliseconds since the epoch (0 when unknown).
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
}

/// Direction for pane splits, in UI terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitDirection {
    /// New pane below (tmux `-v`).
    Vertical,
    /// New pane to the right (tmux `-h`).
    Horizontal,
}

impl SplitDirection {
    pub fn flag(self) -> &'static str {
        match self {
            Self::Vertical => "-v",
            Self::Horizontal => "-h",
        }
    }
}

/// Direction for relative pane selection and directional resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    Left,
    Right,
    Up,
    Down,
}

impl MoveDirection {
    pub fn flag(self) -> &'static str {
        match self {
            Self::Left => "-L",
            Self::Right => "-R",
            Self::Up => "-U",
            Self::Down => "-D",
        }
    }
}

/// Sanitize a workspace name into a usable tmux session name.
///
/// tmux rejects `.` and `:` in session names; everything outside a safe
/// set is flattened to `_` so shell-side targeting stays unambiguous.
pub fn session_name_for_workspace(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || ch == '-' || ch == '_' || ch == ' ' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = sanitized.trim();
    if trimmed.is_empty() {
        "muxlink".to_string()
    } else {
        trimmed.to_string()
    }
}
