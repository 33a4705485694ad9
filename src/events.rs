//! Events handed to engine subscribers.
//!
//! Events are immutable, fire-once records: they are constructed by the
//! reader loop or the engine, broadcast, and never mutated afterwards.

use bytes::Bytes;
use serde::Serialize;

use crate::model::{PaneId, SessionId, WindowId};
use crate::protocol::StateFrame;

/// Decoded output bytes for one pane.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputEvent {
    pub session: SessionId,
    pub pane_id: PaneId,
    pub data: Bytes,
}

/// An out-of-band state change, tagged with the session whose control
/// channel reported it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateEvent {
    pub session: SessionId,
    #[serde(flatten)]
    pub frame: StateFrame,
}

/// Entities added, removed or changed by one projection patch.
///
/// Subscribers use this to re-render only what changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectionDiff {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub added_windows: Vec<WindowId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed_windows: Vec<WindowId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changed_windows: Vec<WindowId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub added_panes: Vec<PaneId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed_panes: Vec<PaneId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changed_panes: Vec<PaneId>,
}

impl ProjectionDiff {
    pub fn is_empty(&self) -> bool {
        self.added_windows.is_empty()
            && self.removed_windows.is_empty()
            && self.changed_windows.is_empty()
            && self.added_panes.is_empty()
            && self.removed_panes.is_empty()
            && self.changed_panes.is_empty()
    }

    /// Fold another diff into this one.
    pub fn merge(&mut self, other: ProjectionDiff) {
        self.added_windows.extend(other.added_windows);
        self.removed_windows.extend(other.removed_windows);
        self.changed_windows.extend(other.changed_windows);
        self.added_panes.extend(other.added_panes);
        self.removed_panes.extend(other.removed_panes);
        self.changed_panes.extend(other.changed_panes);
    }
}

/// Everything the engine can hand to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Output(OutputEvent),
    State(StateEvent),
    /// The projection changed; carries what moved.
    Projection {
        session: SessionId,
        diff: ProjectionDiff,
    },
    /// Recovery failed repeatedly; the engine stopped auto-retrying.
    /// Emitted at most once per attach.
    Degraded {
        session: SessionId,
        reason: String,
    },
}
