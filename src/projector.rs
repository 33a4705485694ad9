//! The session/window/pane projection.
//!
//! One projector mirrors one attached session. State frames are applied
//! as incremental patches; anything the frame does not carry enough
//! information for (a new window's name, a layout that failed to parse)
//! is reported back as a refresh request so the engine re-queries the
//! authoritative listing instead of guessing.
//!
//! Geometry always comes from the layout description or a listing query,
//! never from heuristic diffing, so sibling panes keep tiling their
//! window exactly.

use std::collections::HashMap;

use tracing::debug;

use crate::events::ProjectionDiff;
use crate::model::{PaneCursor, PaneId, PaneInfo, WindowId, WindowInfo};
use crate::protocol::layout::parse_layout;
use crate::protocol::StateFrame;

/// What the engine should re-query after a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshScope {
    /// Re-list the session's windows (and panes of unknown windows).
    Windows,
    /// Re-list the panes of one window.
    Panes(WindowId),
}

/// Outcome of applying one state frame.
#[derive(Debug, Default)]
pub struct ApplyResult {
    pub diff: ProjectionDiff,
    pub refresh: Option<RefreshScope>,
}

#[derive(Debug, Default)]
pub struct StateProjector {
    windows: HashMap<WindowId, WindowInfo>,
    panes: HashMap<WindowId, Vec<PaneInfo>>,
    active_window: Option<WindowId>,
}

impl StateProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Windows ordered by index. Synchronous read, no I/O.
    pub fn windows(&self) -> Vec<WindowInfo> {
        let mut windows: Vec<WindowInfo> = self.windows.values().cloned().collect();
        windows.sort_by_key(|window| window.index);
        windows
    }

    pub fn window(&self, id: &WindowId) -> Option<&WindowInfo> {
        self.windows.get(id)
    }

    /// Panes of a window in layout order. Synchronous read, no I/O.
    pub fn panes(&self, window: &WindowId) -> Vec<PaneInfo> {
        self.panes.get(window).cloned().unwrap_or_default()
    }

    pub fn active_window(&self) -> Option<&WindowId> {
        self.active_window.as_ref()
    }

    pub fn window_of_pane(&self, pane: &PaneId) -> Option<WindowId> {
        self.panes.iter().find_map(|(window, panes)| {
            panes
                .iter()
                .any(|info| &info.id == pane)
                .then(|| window.clone())
        })
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty() && self.panes.is_empty()
    }

    /// Apply one state frame as an incremental patch.
    pub fn apply(&mut self, frame: &StateFrame) -> ApplyResult {
        match frame {
            StateFrame::LayoutChange {
                window_id, layout, ..
            } => self.apply_layout(window_id, layout),
            StateFrame::WindowAdd { window_id } | StateFrame::UnlinkedWindowAdd { window_id } => {
                if self.windows.contains_key(window_id) {
                    ApplyResult::default()
                } else {
                    ApplyResult {
                        diff: ProjectionDiff::default(),
                        refresh: Some(RefreshScope::Windows),
                    }
                }
            }
            StateFrame::WindowClose { window_id }
            | StateFrame::UnlinkedWindowClose { window_id } => self.remove_window(window_id),
            StateFrame::WindowRenamed { window_id, name }
            | StateFrame::UnlinkedWindowRenamed { window_id, name } => {
                self.rename_window(window_id, name)
            }
            StateFrame::WindowPaneChanged { window_id, pane_id } => {
                self.set_active_pane(window_id, pane_id)
            }
            StateFrame::SessionWindowChanged { window_id, .. } => self.set_active_window(window_id),
            // Session-scoped notifications carry no window/pane detail;
            // they are surfaced as events and answered by on-demand
            // listing queries.
            _ => ApplyResult::default(),
        }
    }

    fn apply_layout(&mut self, window_id: &WindowId, layout: &str) -> ApplyResult {
        let node = match parse_layout(layout) {
            Ok(node) => node,
            Err(err) => {
                debug!(window = %window_id, %err, "unusable layout description, re-querying panes");
                return ApplyResult {
                    diff: ProjectionDiff::default(),
                    refresh: Some(RefreshScope::Panes(window_id.clone())),
                };
            }
        };

        // Carry active flags and cursors over for panes that survive the
        // layout change; geometry is replaced wholesale.
        let previous: HashMap<PaneId, PaneInfo> = self
            .panes
            .remove(window_id)
            .unwrap_or_default()
            .into_iter()
            .map(|pane| (pane.id.clone(), pane))
            .collect();

        let next: Vec<PaneInfo> = node
            .panes()
            .into_iter()
            .map(|(id, rect)| {
                let old = previous.get(&id);
                PaneInfo {
                    rect,
                    is_active: old.map(|pane| pane.is_active).unwrap_or(false),
                    cursor: old.and_then(|pane| pane.cursor),
                    id,
                }
            })
            .collect();

        let mut diff = diff_panes(&previous, &next);

        let root = node.rect();
        let mut refresh = None;
        match self.windows.get_mut(window_id) {
            Some(window) => {
                if window.width != root.width || window.height != root.height {
                    window.width = root.width;
                    window.height = root.height;
                    diff.changed_windows.push(window_id.clone());
                }
            }
            // Layout for a window we have never listed: keep the panes,
            // ask for the window metadata.
            None => refresh = Some(RefreshScope::Windows),
        }

        self.panes.insert(window_id.clone(), next);
        ApplyResult { diff, refresh }
    }

    fn remove_window(&mut self, window_id: &WindowId) -> ApplyResult {
        let mut diff = ProjectionDiff::default();
        if self.windows.remove(window_id).is_some() {
            diff.removed_windows.push(window_id.clone());
        }
        if let Some(panes) = self.panes.remove(window_id) {
            diff.removed_panes
                .extend(panes.into_iter().map(|pane| pane.id));
        }
        if self.active_window.as_ref() == Some(window_id) {
            self.active_window = None;
        }
        ApplyResult {
            diff,
            refresh: None,
        }
    }

    fn rename_window(&mut self, window_id: &WindowId, name: &str) -> ApplyResult {
        match self.windows.get_mut(window_id) {
            Some(window) => {
                if window.name != name {
                    window.name = name.to_string();
                    return ApplyResult {
                        diff: ProjectionDiff {
                            changed_windows: vec![window_id.clone()],
                            ..ProjectionDiff::default()
                        },
                        refresh: None,
                    };
                }
                ApplyResult::default()
            }
            None => ApplyResult {
                diff: ProjectionDiff::default(),
                refresh: Some(RefreshScope::Windows),
            },
        }
    }

    fn set_active_pane(&mut self, window_id: &WindowId, pane_id: &PaneId) -> ApplyResult {
        let mut diff = ProjectionDiff::default();
        let Some(panes) = self.panes.get_mut(window_id) else {
            return ApplyResult {
                diff,
                refresh: Some(RefreshScope::Panes(window_id.clone())),
            };
        };
        for pane in panes.iter_mut() {
            let should_be_active = &pane.id == pane_id;
            if pane.is_active != should_be_active {
                pane.is_active = should_be_active;
                diff.changed_panes.push(pane.id.clone());
            }
        }
        ApplyResult {
            diff,
            refresh: None,
        }
    }

    fn set_active_window(&mut self, window_id: &WindowId) -> ApplyResult {
        let mut diff = ProjectionDiff::default();
        if !self.windows.contains_key(window_id) {
            return ApplyResult {
                diff,
                refresh: Some(RefreshScope::Windows),
            };
        }
        for (id, window) in self.windows.iter_mut() {
            let should_be_active = id == window_id;
            if window.is_active != should_be_active {
                window.is_active = should_be_active;
                diff.changed_windows.push(id.clone());
            }
        }
        self.active_window = Some(window_id.clone());
        ApplyResult {
            diff,
            refresh: None,
        }
    }

    /// Replace the window set wholesale from an authoritative listing.
    pub fn replace_windows(&mut self, listing: Vec<WindowInfo>) -> ProjectionDiff {
        let mut diff = ProjectionDiff::default();
        let mut next: HashMap<WindowId, WindowInfo> = HashMap::new();

        for window in listing {
            if window.is_active {
                self.active_window = Some(window.id.clone());
            }
            match self.windows.remove(&window.id) {
                Some(old) if old == window => {}
                Some(_) => diff.changed_windows.push(window.id.clone()),
                None => diff.added_windows.push(window.id.clone()),
            }
            next.insert(window.id.clone(), window);
        }

        // Whatever was not re-listed is gone, along with its panes.
        for (id, _) in self.windows.drain() {
            if let Some(panes) = self.panes.remove(&id) {
                diff.removed_panes
                    .extend(panes.into_iter().map(|pane| pane.id));
            }
            if self.active_window.as_ref() == Some(&id) {
                self.active_window = None;
            }
            diff.removed_windows.push(id);
        }

        self.windows = next;
        diff
    }

    /// Replace one window's panes wholesale from an authoritative listing.
    pub fn replace_panes(&mut self, window_id: &WindowId, listing: Vec<PaneInfo>) -> ProjectionDiff {
        let previous: HashMap<PaneId, PaneInfo> = self
            .panes
            .remove(window_id)
            .unwrap_or_default()
            .into_iter()
            .map(|pane| (pane.id.clone(), pane))
            .collect();
        let diff = diff_panes(&previous, &listing);
        self.panes.insert(window_id.clone(), listing);
        diff
    }

    /// Patch a pane's cursor after a cursor query. Returns false when the
    /// pane is not in the projection.
    pub fn set_pane_cursor(&mut self, pane_id: &PaneId, cursor: PaneCursor) -> bool {
        for panes in self.panes.values_mut() {
            if let Some(pane) = panes.iter_mut().find(|pane| &pane.id == pane_id) {
                pane.cursor = Some(cursor);
                return true;
            }
        }
        false
    }

    /// Drop everything, e.g. before a wholesale resync.
    pub fn clear(&mut self) -> ProjectionDiff {
        let mut diff = ProjectionDiff::default();
        diff.removed_windows.extend(self.windows.drain().map(|(id, _)| id));
        for (_, panes) in self.panes.drain() {
            diff.removed_panes
                .extend(panes.into_iter().map(|pane| pane.id));
        }
        self.active_window = None;
        diff
    }
}

fn diff_panes(previous: &HashMap<PaneId, PaneInfo>, next: &[PaneInfo]) -> ProjectionDiff {
    let mut diff = ProjectionDiff::default();
    for pane in next {
        match previous.get(&pane.id) {
            Some(old) if old == pane => {}
            Some(_) => diff.changed_panes.push(pane.id.clone()),
            None => diff.added_panes.push(pane.id.clone()),
        }
    }
    for id in previous.keys() {
        if !next.iter().any(|pane| &pane.id == id) {
            diff.removed_panes.push(id.clone());
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PaneRect;
    use crate::protocol::layout::checksum;

    fn layout_frame(window: &str, description: &str) -> StateFrame {
        StateFrame::LayoutChange {
            window_id: WindowId::from(window),
            layout: format!("{:04x},{description}", checksum(description)),
            visible_layout: None,
            window_flags: None,
        }
    }

    fn window(id: &str, index: i32, name: &str, active: bool, width: u16, height: u16) -> WindowInfo {
        WindowInfo {
            id: WindowId::from(id),
            index,
            name: name.to_string(),
            is_active: active,
            width,
            height,
        }
    }

    fn pane(id: &str, left: u16, top: u16, width: u16, height: u16, active: bool) -> PaneInfo {
        PaneInfo {
            id: PaneId::from(id),
            rect: PaneRect {
                left,
                top,
                width,
                height,
            },
            is_active: active,
            cursor: None,
        }
    }

    fn seeded() -> StateProjector {
        let mut projector = StateProjector::new();
        projector.replace_windows(vec![window("@0", 0, "shell", true, 160, 40)]);
        projector.replace_panes(
            &WindowId::from("@0"),
            vec![pane("%0", 0, 0, 160, 40, true)],
        );
        projector
    }

    #[test]
    fn split_scenario_produces_tiled_pair() {
        let mut projector = seeded();

        // Side-by-side split of the single 160x40 pane.
        let result = projector.apply(&layout_frame(
            "@0",
            "160x40,0,0{80x40,0,0,0,79x40,81,0,1}",
        ));
        assert_eq!(result.refresh, None);
        assert_eq!(result.diff.added_panes, vec![PaneId::from("%1")]);
        assert_eq!(result.diff.changed_panes, vec![PaneId::from("%0")]);

        let panes = projector.panes(&WindowId::from("@0"));
        assert_eq!(panes.len(), 2);
        // Widths plus the separator column cover the full window width.
        let total: u16 = panes.iter().map(|p| p.rect.width).sum();
        assert_eq!(total + 1, 160);
        assert!(panes.iter().all(|p| p.rect.height == 40));
        // Exactly one pane is active; the survivor kept its flag.
        assert_eq!(panes.iter().filter(|p| p.is_active).count(), 1);
        assert!(panes.iter().find(|p| p.id == PaneId::from("%0")).unwrap().is_active);
    }

    #[test]
    fn kill_scenario_returns_to_full_bounds() {
        let mut projector = seeded();
        projector.apply(&layout_frame(
            "@0",
            "160x40,0,0{80x40,0,0,0,79x40,81,0,1}",
        ));

        // The non-active pane went away; the survivor reclaims the window.
        let result = projector.apply(&layout_frame("@0", "160x40,0,0,0"));
        assert_eq!(result.diff.removed_panes, vec![PaneId::from("%1")]);

        let panes = projector.panes(&WindowId::from("@0"));
        assert_eq!(panes.len(), 1);
        assert_eq!(
            panes[0].rect,
            PaneRect {
                left: 0,
                top: 0,
                width: 160,
                height: 40
            }
        );
        assert!(panes[0].is_active);
    }

    #[test]
    fn broken_layout_requests_pane_requery() {
        let mut projector = seeded();
        let result = projector.apply(&StateFrame::LayoutChange {
            window_id: WindowId::from("@0"),
            layout: "0000,not a layout".to_string(),
            visible_layout: None,
            window_flags: None,
        });
        assert_eq!(result.refresh, Some(RefreshScope::Panes(WindowId::from("@0"))));
        assert!(result.diff.is_empty());
        // Existing panes were not disturbed.
        assert_eq!(projector.panes(&WindowId::from("@0")).len(), 1);
    }

    #[test]
    fn layout_for_unknown_window_requests_window_listing() {
        let mut projector = StateProjector::new();
        let result = projector.apply(&layout_frame("@7", "80x24,0,0,3"));
        assert_eq!(result.refresh, Some(RefreshScope::Windows));
        // Panes are usable immediately even before the window metadata
        // arrives.
        assert_eq!(projector.panes(&WindowId::from("@7")).len(), 1);
    }

    #[test]
    fn layout_updates_window_size() {
        let mut projector = seeded();
        let result = projector.apply(&layout_frame("@0", "120x30,0,0,0"));
        assert_eq!(result.diff.changed_windows, vec![WindowId::from("@0")]);
        let window = projector.window(&WindowId::from("@0")).unwrap();
        assert_eq!((window.width, window.height), (120, 30));
    }

    #[test]
    fn window_add_for_unknown_requests_refresh() {
        let mut projector = seeded();
        let result = projector.apply(&StateFrame::WindowAdd {
            window_id: WindowId::from("@9"),
        });
        assert_eq!(result.refresh, Some(RefreshScope::Windows));

        // Known windows need no refresh.
        let result = projector.apply(&StateFrame::WindowAdd {
            window_id: WindowId::from("@0"),
        });
        assert_eq!(result.refresh, None);
    }

    #[test]
    fn window_close_cascades_to_panes() {
        let mut projector = seeded();
        let result = projector.apply(&StateFrame::WindowClose {
            window_id: WindowId::from("@0"),
        });
        assert_eq!(result.diff.removed_windows, vec![WindowId::from("@0")]);
        assert_eq!(result.diff.removed_panes, vec![PaneId::from("%0")]);
        assert!(projector.is_empty());
        assert_eq!(projector.active_window(), None);
    }

    #[test]
    fn rename_patches_one_field() {
        let mut projector = seeded();
        let result = projector.apply(&StateFrame::WindowRenamed {
            window_id: WindowId::from("@0"),
            name: "editor".to_string(),
        });
        assert_eq!(result.diff.changed_windows, vec![WindowId::from("@0")]);
        assert_eq!(projector.window(&WindowId::from("@0")).unwrap().name, "editor");

        // Renaming to the same name is a no-op.
        let result = projector.apply(&StateFrame::WindowRenamed {
            window_id: WindowId::from("@0"),
            name: "editor".to_string(),
        });
        assert!(result.diff.is_empty());
    }

    #[test]
    fn active_pane_toggles_flags() {
        let mut projector = seeded();
        projector.apply(&layout_frame(
            "@0",
            "160x40,0,0{80x40,0,0,0,79x40,81,0,1}",
        ));

        let result = projector.apply(&StateFrame::WindowPaneChanged {
            window_id: WindowId::from("@0"),
            pane_id: PaneId::from("%1"),
        });
        let mut changed = result.diff.changed_panes.clone();
        changed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(changed, vec![PaneId::from("%0"), PaneId::from("%1")]);

        let panes = projector.panes(&WindowId::from("@0"));
        let active: Vec<&PaneInfo> = panes.iter().filter(|p| p.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, PaneId::from("%1"));
    }

    #[test]
    fn active_window_follows_session_window_changed() {
        let mut projector = StateProjector::new();
        projector.replace_windows(vec![
            window("@0", 0, "a", true, 80, 24),
            window("@1", 1, "b", false, 80, 24),
        ]);

        let result = projector.apply(&StateFrame::SessionWindowChanged {
            session_id: crate::model::SessionId::from("$0"),
            window_id: WindowId::from("@1"),
        });
        assert_eq!(result.diff.changed_windows.len(), 2);
        assert_eq!(projector.active_window(), Some(&WindowId::from("@1")));
        assert!(projector.window(&WindowId::from("@1")).unwrap().is_active);
        assert!(!projector.window(&WindowId::from("@0")).unwrap().is_active);
    }

    #[test]
    fn replace_windows_diffs_and_prunes() {
        let mut projector = seeded();
        let diff = projector.replace_windows(vec![
            window("@0", 0, "shell", false, 160, 40),
            window("@2", 1, "logs", true, 160, 40),
        ]);
        assert_eq!(diff.added_windows, vec![WindowId::from("@2")]);
        assert_eq!(diff.changed_windows, vec![WindowId::from("@0")]);
        assert!(diff.removed_windows.is_empty());
        assert_eq!(projector.active_window(), Some(&WindowId::from("@2")));

        // A later listing without @2 removes it again.
        let diff = projector.replace_windows(vec![window("@0", 0, "shell", true, 160, 40)]);
        assert_eq!(diff.removed_windows, vec![WindowId::from("@2")]);
    }

    #[test]
    fn window_of_pane_lookup() {
        let projector = seeded();
        assert_eq!(
            projector.window_of_pane(&PaneId::from("%0")),
            Some(WindowId::from("@0"))
        );
        assert_eq!(projector.window_of_pane(&PaneId::from("%9")), None);
    }

    #[test]
    fn cursor_patch() {
        let mut projector = seeded();
        assert!(projector.set_pane_cursor(
            &PaneId::from("%0"),
            PaneCursor { col: 12, row: 3 }
        ));
        assert!(!projector.set_pane_cursor(
            &PaneId::from("%9"),
            PaneCursor { col: 0, row: 0 }
        ));
        let panes = projector.panes(&WindowId::from("@0"));
        assert_eq!(panes[0].cursor, Some(PaneCursor { col: 12, row: 3 }));
    }

    #[test]
    fn clear_reports_everything_removed() {
        let mut projector = seeded();
        let diff = projector.clear();
        assert_eq!(diff.removed_windows, vec![WindowId::from("@0")]);
        assert_eq!(diff.removed_panes, vec![PaneId::from("%0")]);
        assert!(projector.is_empty());
    }
}
