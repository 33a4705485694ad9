//! The engine facade: the command API a UI layer drives.
//!
//! One [`TmuxEngine`] serves one terminal workspace. It owns a control
//! channel and a projection per attached session; nothing outside the
//! engine mutates them. Every intent is tried on the control channel
//! first and re-executed as a one-shot tmux invocation when the channel
//! is unusable; the caller sees the same contract either way.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::config::{EngineConfig, SubscriptionSpec};
use crate::control::flow::{PausePolicy, ResumeImmediately};
use crate::control::{ChannelNotice, ChannelState, ControlChannel, NoticeSender};
use crate::error::{is_server_missing, is_session_missing, EngineError};
use crate::events::{EngineEvent, ProjectionDiff};
use crate::model::{
    session_name_for_workspace, MoveDirection, PaneCursor, PaneId, PaneInfo, SessionId,
    SessionInfo, SplitDirection, WindowId, WindowInfo,
};
use crate::projector::{RefreshScope, StateProjector};
use crate::protocol::command_string;
use crate::support::{self, SupportStatus};

const WORKSPACE_ID_OPTION: &str = "@muxlink_workspace_id";
const WORKSPACE_PATH_OPTION: &str = "@muxlink_workspace_path";

const WINDOW_FORMAT: &str =
    "#{window_id}\t#{window_index}\t#{window_name}\t#{window_active}\t#{window_width}\t#{window_height}";
const PANE_FORMAT: &str =
    "#{pane_id}\t#{pane_left}\t#{pane_top}\t#{pane_width}\t#{pane_height}\t#{pane_active}";
const SESSION_FORMAT: &str = "#{session_name}\t#{session_created}";
const CURSOR_FORMAT: &str = "#{cursor_x}\t#{cursor_y}";

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or_default()
}

/// One attached session: its channel, projection and recovery bookkeeping.
struct Workspace {
    channel: Arc<ControlChannel>,
    projector: Arc<Mutex<StateProjector>>,
    recovery_failures: AtomicU32,
    degraded: AtomicBool,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("recovery_failures", &self.recovery_failures)
            .field("degraded", &self.degraded)
            .finish_non_exhaustive()
    }
}

pub struct TmuxEngine {
    config: EngineConfig,
    policy: Arc<dyn PausePolicy>,
    workspaces: Mutex<HashMap<SessionId, Arc<Workspace>>>,
    active: Mutex<Option<SessionId>>,
    events_tx: broadcast::Sender<EngineEvent>,
    notice_tx: NoticeSender,
}

impl TmuxEngine {
    /// Build an engine with the default resume-immediately pause policy.
    /// Must be called from within a tokio runtime.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Self::with_policy(config, Arc::new(ResumeImmediately))
    }

    pub fn with_policy(config: EngineConfig, policy: Arc<dyn PausePolicy>) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(4096);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            config,
            policy,
            workspaces: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            events_tx,
            notice_tx,
        });
        tokio::spawn(Self::supervisor(Arc::downgrade(&engine), notice_rx));
        engine
    }

    /// Subscribe to the engine's output/state/projection event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    pub fn support_status(&self) -> SupportStatus {
        support::support_status(&self.config)
    }

    pub fn channel_state(&self, session: &SessionId) -> ChannelState {
        self.workspace(Some(session))
            .map(|ws| ws.channel.state())
            .unwrap_or(ChannelState::Disconnected)
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Create the session if missing, attach a control client, and make
    /// it the active session. An explicit call clears a degraded state
    /// left behind by failed recoveries.
    pub async fn create_or_attach_session(
        &self,
        workspace_name: &str,
        working_dir: &Path,
    ) -> Result<SessionInfo, EngineError> {
        support::ensure_supported(&self.config)?;
        let name = session_name_for_workspace(workspace_name);
        let session = SessionId::new(name.clone());

        if !self.session_exists(&name).await? {
            let shell = support::user_shell();
            self.run_cli(vec![
                "new-session".to_string(),
                "-d".to_string(),
                "-s".to_string(),
                name.clone(),
                "-c".to_string(),
                working_dir.to_string_lossy().into_owned(),
                shell,
            ])
            .await?;
        }

        self.ensure_channel(&session, true).await?;
        self.apply_session_style(&name).await?;
        if let Err(err) = self
            .set_session_metadata(&name, workspace_name, working_dir)
            .await
        {
            warn!(session = %name, %err, "failed to tag session metadata");
        }

        if let Ok(mut active) = self.active.lock() {
            *active = Some(session.clone());
        }

        Ok(SessionInfo {
            id: session,
            name,
            created_at: now_millis(),
            workspace_id: Some(workspace_name.to_string()),
            workspace_path: Some(working_dir.to_string_lossy().into_owned()),
        })
    }

    /// Re-target the engine at another session, attaching a control
    /// client if needed.
    pub async fn switch_session(&self, session: &SessionId) -> Result<(), EngineError> {
        support::ensure_supported(&self.config)?;
        self.ensure_channel(session, true).await?;
        if let Ok(mut active) = self.active.lock() {
            *active = Some(session.clone());
        }
        self.apply_session_style(session.as_str()).await
    }

    /// Tear down the control client and kill the tmux session. A session
    /// that is already gone is not an error.
    pub async fn close_session(&self, session: &SessionId) -> Result<(), EngineError> {
        let removed = self
            .workspaces
            .lock()
            .ok()
            .and_then(|mut map| map.remove(session));
        if let Some(ws) = removed {
            ws.channel.close().await;
        }
        if let Ok(mut active) = self.active.lock() {
            if active.as_ref() == Some(session) {
                *active = None;
            }
        }

        match self
            .run_cli(vec![
                "kill-session".to_string(),
                "-t".to_string(),
                session.to_string(),
            ])
            .await
        {
            Ok(_) => Ok(()),
            Err(EngineError::Invocation { message })
                if is_server_missing(&message) || is_session_missing(&message) =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// All sessions on the server, with workspace metadata where present.
    /// A missing server is an empty list, not an error.
    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, EngineError> {
        support::ensure_supported(&self.config)?;
        let output = match self
            .run_cli(vec![
                "list-sessions".to_string(),
                "-F".to_string(),
                SESSION_FORMAT.to_string(),
            ])
            .await
        {
            Ok(output) => output,
            Err(EngineError::Invocation { message }) if is_server_missing(&message) => {
                return Ok(Vec::new())
            }
            Err(err) => return Err(err),
        };

        let mut sessions = Vec::new();
        for line in output.lines() {
            let Some(mut info) = parse_session_line(line) else {
                continue;
            };
            info.workspace_id = self.read_session_option(&info.name, WORKSPACE_ID_OPTION).await;
            info.workspace_path = self
                .read_session_option(&info.name, WORKSPACE_PATH_OPTION)
                .await;
            sessions.push(info);
        }
        Ok(sessions)
    }

    // ------------------------------------------------------------------
    // Projection reads (synchronous, no I/O)
    // ------------------------------------------------------------------

    pub fn windows(&self, session: &SessionId) -> Vec<WindowInfo> {
        self.workspace(Some(session))
            .and_then(|ws| ws.projector.lock().ok().map(|p| p.windows()))
            .unwrap_or_default()
    }

    pub fn panes(&self, window: &WindowId) -> Vec<PaneInfo> {
        let workspaces: Vec<Arc<Workspace>> = match self.workspaces.lock() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => return Vec::new(),
        };
        for ws in workspaces {
            if let Ok(projector) = ws.projector.lock() {
                if projector.window(window).is_some() || !projector.panes(window).is_empty() {
                    return projector.panes(window);
                }
            }
        }
        Vec::new()
    }

    // ------------------------------------------------------------------
    // Listing queries (refresh the projection from authoritative state)
    // ------------------------------------------------------------------

    pub async fn list_windows(
        &self,
        session: &SessionId,
    ) -> Result<Vec<WindowInfo>, EngineError> {
        support::ensure_supported(&self.config)?;
        let listing = self.query_windows(session).await?;
        if let Some(ws) = self.workspace(Some(session)) {
            let diff = ws
                .projector
                .lock()
                .map(|mut p| p.replace_windows(listing.clone()))
                .unwrap_or_default();
            self.emit_diff(session, diff);
        }
        Ok(listing)
    }

    pub async fn list_panes(&self, window: &WindowId) -> Result<Vec<PaneInfo>, EngineError> {
        support::ensure_supported(&self.config)?;
        let listing = self.query_panes(window).await?;
        if let Some((session, ws)) = self.workspace_of_window(window) {
            let diff = ws
                .projector
                .lock()
                .map(|mut p| p.replace_panes(window, listing.clone()))
                .unwrap_or_default();
            self.emit_diff(&session, diff);
        }
        Ok(listing)
    }

    // ------------------------------------------------------------------
    // Pane and window operations
    // ------------------------------------------------------------------

    /// Send raw bytes to a pane, hex-encoded through `send-keys -H` so no
    /// byte is interpreted on the way in.
    pub async fn send_input(&self, pane: &PaneId, bytes: &[u8]) -> Result<(), EngineError> {
        support::ensure_supported(&self.config)?;
        if bytes.is_empty() {
            return Ok(());
        }
        let (line, args) = send_keys_command(pane, bytes);
        self.control_or_fallback(None, line, args).await.map(|_| ())
    }

    pub async fn split_pane(
        &self,
        pane: &PaneId,
        direction: SplitDirection,
    ) -> Result<(), EngineError> {
        support::ensure_supported(&self.config)?;
        let args = vec![
            "split-window".to_string(),
            direction.flag().to_string(),
            "-t".to_string(),
            pane.to_string(),
            "-c".to_string(),
            "#{pane_current_path}".to_string(),
        ];
        let line = command_string(&[
            "split-window",
            direction.flag(),
            "-t",
            pane.as_str(),
            "-c",
            "#{pane_current_path}",
        ]);
        self.control_or_fallback(None, line, args).await?;
        self.refresh_pane_window(pane).await;
        Ok(())
    }

    pub async fn select_pane(&self, pane: &PaneId) -> Result<(), EngineError> {
        support::ensure_supported(&self.config)?;
        let args = vec![
            "select-pane".to_string(),
            "-t".to_string(),
            pane.to_string(),
        ];
        let line = command_string(&["select-pane", "-t", pane.as_str()]);
        self.control_or_fallback(None, line, args).await.map(|_| ())
    }

    pub async fn select_pane_direction(
        &self,
        pane: &PaneId,
        direction: MoveDirection,
    ) -> Result<(), EngineError> {
        support::ensure_supported(&self.config)?;
        let args = vec![
            "select-pane".to_string(),
            direction.flag().to_string(),
            "-t".to_string(),
            pane.to_string(),
        ];
        let line = command_string(&["select-pane", direction.flag(), "-t", pane.as_str()]);
        self.control_or_fallback(None, line, args).await.map(|_| ())
    }

    pub async fn resize_pane(
        &self,
        pane: &PaneId,
        direction: MoveDirection,
        count: u16,
    ) -> Result<(), EngineError> {
        support::ensure_supported(&self.config)?;
        if count == 0 {
            return Ok(());
        }
        let amount = count.to_string();
        let args = vec![
            "resize-pane".to_string(),
            direction.flag().to_string(),
            "-t".to_string(),
            pane.to_string(),
            amount.clone(),
        ];
        let line = command_string(&["resize-pane", direction.flag(), "-t", pane.as_str(), &amount]);
        self.control_or_fallback(None, line, args).await.map(|_| ())
    }

    pub async fn kill_pane(&self, pane: &PaneId) -> Result<(), EngineError> {
        support::ensure_supported(&self.config)?;
        // Resolve the owning window before the pane disappears.
        let owner = self.workspace_of_pane(pane);
        let args = vec!["kill-pane".to_string(), "-t".to_string(), pane.to_string()];
        let line = command_string(&["kill-pane", "-t", pane.as_str()]);
        self.control_or_fallback(None, line, args).await?;
        match owner {
            Some((session, _, window)) => {
                if let Err(err) = self.refresh_panes_of(&session, &window).await {
                    debug!(%err, "post-kill pane refresh failed");
                }
            }
            None => self.refresh_pane_window(pane).await,
        }
        Ok(())
    }

    pub async fn kill_window(&self, window: &WindowId) -> Result<(), EngineError> {
        support::ensure_supported(&self.config)?;
        let owner = self.workspace_of_window(window);
        let args = vec![
            "kill-window".to_string(),
            "-t".to_string(),
            window.to_string(),
        ];
        let line = command_string(&["kill-window", "-t", window.as_str()]);
        self.control_or_fallback(None, line, args).await?;
        if let Some((session, _)) = owner {
            if let Err(err) = self.resync(&session).await {
                debug!(%err, "post-kill window resync failed");
            }
        }
        Ok(())
    }

    pub async fn new_window(
        &self,
        session: &SessionId,
        working_dir: &Path,
    ) -> Result<(), EngineError> {
        support::ensure_supported(&self.config)?;
        let dir = working_dir.to_string_lossy().into_owned();
        let args = vec![
            "new-window".to_string(),
            "-t".to_string(),
            session.to_string(),
            "-c".to_string(),
            dir.clone(),
        ];
        let line = command_string(&["new-window", "-t", session.as_str(), "-c", &dir]);
        self.control_or_fallback(Some(session), line, args).await?;
        if let Err(err) = self.resync(session).await {
            debug!(%err, "post-new-window resync failed");
        }
        Ok(())
    }

    pub async fn select_window(&self, window: &WindowId) -> Result<(), EngineError> {
        support::ensure_supported(&self.config)?;
        let args = vec![
            "select-window".to_string(),
            "-t".to_string(),
            window.to_string(),
        ];
        let line = command_string(&["select-window", "-t", window.as_str()]);
        self.control_or_fallback(None, line, args).await.map(|_| ())
    }

    pub async fn select_window_index(
        &self,
        session: &SessionId,
        index: i32,
    ) -> Result<(), EngineError> {
        support::ensure_supported(&self.config)?;
        let target = format!("{session}:{index}");
        let args = vec!["select-window".to_string(), "-t".to_string(), target.clone()];
        let line = command_string(&["select-window", "-t", &target]);
        self.control_or_fallback(Some(session), line, args)
            .await
            .map(|_| ())
    }

    pub async fn next_window(&self) -> Result<(), EngineError> {
        support::ensure_supported(&self.config)?;
        self.control_or_fallback(
            None,
            command_string(&["select-window", "-n"]),
            vec!["select-window".to_string(), "-n".to_string()],
        )
        .await
        .map(|_| ())
    }

    pub async fn previous_window(&self) -> Result<(), EngineError> {
        support::ensure_supported(&self.config)?;
        self.control_or_fallback(
            None,
            command_string(&["select-window", "-p"]),
            vec!["select-window".to_string(), "-p".to_string()],
        )
        .await
        .map(|_| ())
    }

    /// Resize the controlling client, which bounds every window's size.
    pub async fn resize_client(
        &self,
        session: &SessionId,
        cols: u16,
        rows: u16,
    ) -> Result<(), EngineError> {
        support::ensure_supported(&self.config)?;
        self.ensure_channel(session, false).await.ok();
        let size = format!("{cols}x{rows}");
        let args = vec![
            "refresh-client".to_string(),
            "-C".to_string(),
            size.clone(),
        ];
        let line = command_string(&["refresh-client", "-C", &size]);
        self.control_or_fallback(Some(session), line, args)
            .await
            .map(|_| ())
    }

    /// Capture a pane's full history including escape sequences, used to
    /// seed a UI buffer after attach or resync.
    pub async fn capture_pane_history(&self, pane: &PaneId) -> Result<String, EngineError> {
        support::ensure_supported(&self.config)?;
        let args = vec![
            "capture-pane".to_string(),
            "-p".to_string(),
            "-e".to_string(),
            "-S".to_string(),
            "-".to_string(),
            "-t".to_string(),
            pane.to_string(),
        ];
        let line = command_string(&["capture-pane", "-p", "-e", "-S", "-", "-t", pane.as_str()]);
        self.control_or_fallback(None, line, args).await
    }

    /// Query a pane's cursor position and patch it into the projection.
    pub async fn pane_cursor(&self, pane: &PaneId) -> Result<PaneCursor, EngineError> {
        support::ensure_supported(&self.config)?;
        let args = vec![
            "display-message".to_string(),
            "-p".to_string(),
            "-t".to_string(),
            pane.to_string(),
            CURSOR_FORMAT.to_string(),
        ];
        let line = command_string(&["display-message", "-p", "-t", pane.as_str(), CURSOR_FORMAT]);
        let output = self.control_or_fallback(None, line, args).await?;

        let mut parts = output.trim().split('\t');
        let cursor = PaneCursor {
            col: parts.next().and_then(|v| v.parse().ok()).unwrap_or(0),
            row: parts.next().and_then(|v| v.parse().ok()).unwrap_or(0),
        };
        if let Some((_, ws, _)) = self.workspace_of_pane(pane) {
            if let Ok(mut projector) = ws.projector.lock() {
                projector.set_pane_cursor(pane, cursor);
            }
        }
        Ok(cursor)
    }

    // ------------------------------------------------------------------
    // Flow control and subscriptions
    // ------------------------------------------------------------------

    pub async fn add_subscription(
        &self,
        session: &SessionId,
        spec: SubscriptionSpec,
    ) -> Result<(), EngineError> {
        let ws = self
            .workspace(Some(session))
            .ok_or(EngineError::ChannelClosed)?;
        ws.channel.subscribe(spec).await
    }

    pub async fn remove_subscription(
        &self,
        session: &SessionId,
        name: &str,
    ) -> Result<(), EngineError> {
        let ws = self
            .workspace(Some(session))
            .ok_or(EngineError::ChannelClosed)?;
        ws.channel.unsubscribe(name).await
    }

    /// Resume a paused pane; used by consumers with a deferring pause
    /// policy once their buffers drained.
    pub fn continue_pane(&self, pane: &PaneId) -> Result<(), EngineError> {
        let ws = self
            .workspace_of_pane(pane)
            .map(|(_, ws, _)| ws)
            .or_else(|| self.workspace(None))
            .ok_or(EngineError::ChannelClosed)?;
        ws.channel.continue_pane(pane)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn workspace(&self, session: Option<&SessionId>) -> Option<Arc<Workspace>> {
        let map = self.workspaces.lock().ok()?;
        if let Some(session) = session {
            return map.get(session).cloned();
        }
        if let Ok(active) = self.active.lock() {
            if let Some(active) = active.as_ref() {
                if let Some(ws) = map.get(active) {
                    return Some(Arc::clone(ws));
                }
            }
        }
        map.values().next().cloned()
    }

    fn workspace_of_pane(&self, pane: &PaneId) -> Option<(SessionId, Arc<Workspace>, WindowId)> {
        let map = self.workspaces.lock().ok()?;
        for (session, ws) in map.iter() {
            if let Ok(projector) = ws.projector.lock() {
                if let Some(window) = projector.window_of_pane(pane) {
                    return Some((session.clone(), Arc::clone(ws), window));
                }
            }
        }
        None
    }

    fn workspace_of_window(&self, window: &WindowId) -> Option<(SessionId, Arc<Workspace>)> {
        let map = self.workspaces.lock().ok()?;
        for (session, ws) in map.iter() {
            if let Ok(projector) = ws.projector.lock() {
                if projector.window(window).is_some() {
                    return Some((session.clone(), Arc::clone(ws)));
                }
            }
        }
        None
    }

    /// Attach a control channel for the session if none is alive.
    /// `explicit` marks a user-initiated attach, which clears the
    /// degraded latch; automatic paths respect it and stay on the
    /// fallback instead of storming reconnects.
    async fn ensure_channel(
        &self,
        session: &SessionId,
        explicit: bool,
    ) -> Result<Arc<Workspace>, EngineError> {
        let projector = {
            let map = self
                .workspaces
                .lock()
                .map_err(|_| EngineError::ChannelClosed)?;
            if let Some(ws) = map.get(session) {
                if ws.channel.is_alive() {
                    if explicit {
                        ws.degraded.store(false, Ordering::SeqCst);
                        ws.recovery_failures.store(0, Ordering::SeqCst);
                    }
                    return Ok(Arc::clone(ws));
                }
                if !explicit && ws.degraded.load(Ordering::SeqCst) {
                    return Err(EngineError::ChannelClosed);
                }
                // Keep the projection across reconnects; the resync below
                // replaces its contents wholesale.
                Arc::clone(&ws.projector)
            } else {
                Arc::new(Mutex::new(StateProjector::new()))
            }
        };

        let channel = ControlChannel::attach(
            session.clone(),
            &self.config,
            Arc::clone(&self.policy),
            Arc::clone(&projector),
            self.events_tx.clone(),
            self.notice_tx.clone(),
        )
        .await?;

        let ws = Arc::new(Workspace {
            channel: Arc::new(channel),
            projector,
            recovery_failures: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
        });

        {
            let mut map = self
                .workspaces
                .lock()
                .map_err(|_| EngineError::ChannelClosed)?;
            if let Some(existing) = map.get(session) {
                // Lost a race with a concurrent attach; keep the winner.
                if existing.channel.is_alive() {
                    return Ok(Arc::clone(existing));
                }
            }
            map.insert(session.clone(), Arc::clone(&ws));
        }

        if let Err(err) = self.resync(session).await {
            warn!(session = %session, %err, "initial resync failed");
        }
        Ok(ws)
    }

    async fn send_control(
        &self,
        session: Option<&SessionId>,
        line: &str,
    ) -> Result<String, EngineError> {
        let ws = self.workspace(session).ok_or(EngineError::ChannelClosed)?;
        if !ws.channel.is_alive() {
            return Err(EngineError::ChannelClosed);
        }
        ws.channel.send(line.to_string()).await
    }

    /// The graceful-degradation core: control channel first, one-shot
    /// tmux invocation when the channel path is unusable. Same return
    /// contract either way.
    async fn control_or_fallback(
        &self,
        session: Option<&SessionId>,
        line: String,
        fallback_args: Vec<String>,
    ) -> Result<String, EngineError> {
        match self.send_control(session, &line).await {
            Ok(output) => Ok(output),
            Err(err) if err.triggers_fallback() => {
                debug!(command = %line, %err, "control path unavailable, using one-shot tmux");
                self.run_cli(fallback_args).await
            }
            Err(err) => Err(err),
        }
    }

    async fn run_cli(&self, args: Vec<String>) -> Result<String, EngineError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || support::run_tmux(&config, &args))
            .await
            .map_err(|err| EngineError::Invocation {
                message: format!("tmux invocation task failed: {err}"),
            })?
    }

    async fn session_exists(&self, session: &str) -> Result<bool, EngineError> {
        let config = self.config.clone();
        let session = session.to_string();
        tokio::task::spawn_blocking(move || support::session_exists(&config, &session))
            .await
            .map_err(|err| EngineError::Invocation {
                message: format!("tmux invocation task failed: {err}"),
            })?
    }

    async fn apply_session_style(&self, session: &str) -> Result<(), EngineError> {
        let options = [
            ("history-limit", self.config.history_limit.to_string()),
            ("pane-border-style", self.config.pane_border_style.clone()),
            (
                "pane-active-border-style",
                self.config.pane_active_border_style.clone(),
            ),
        ];
        for (key, value) in options {
            self.run_cli(vec![
                "set-option".to_string(),
                "-t".to_string(),
                session.to_string(),
                key.to_string(),
                value,
            ])
            .await?;
        }
        Ok(())
    }

    async fn set_session_metadata(
        &self,
        session: &str,
        workspace_id: &str,
        workspace_path: &Path,
    ) -> Result<(), EngineError> {
        for (option, value) in [
            (WORKSPACE_ID_OPTION, workspace_id.to_string()),
            (
                WORKSPACE_PATH_OPTION,
                workspace_path.to_string_lossy().into_owned(),
            ),
        ] {
            let value = value.trim().to_string();
            if value.is_empty() {
                continue;
            }
            self.run_cli(vec![
                "set-option".to_string(),
                "-t".to_string(),
                session.to_string(),
                option.to_string(),
                value,
            ])
            .await?;
        }
        Ok(())
    }

    async fn read_session_option(&self, session: &str, option: &str) -> Option<String> {
        let output = self
            .run_cli(vec![
                "show-options".to_string(),
                "-q".to_string(),
                "-v".to_string(),
                "-t".to_string(),
                session.to_string(),
                option.to_string(),
            ])
            .await
            .ok()?;
        let trimmed = output.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    async fn query_windows(&self, session: &SessionId) -> Result<Vec<WindowInfo>, EngineError> {
        let args = vec![
            "list-windows".to_string(),
            "-t".to_string(),
            session.to_string(),
            "-F".to_string(),
            WINDOW_FORMAT.to_string(),
        ];
        let line = command_string(&["list-windows", "-t", session.as_str(), "-F", WINDOW_FORMAT]);
        let output = self.control_or_fallback(Some(session), line, args).await?;
        Ok(parse_windows_listing(&output))
    }

    async fn query_panes(&self, window: &WindowId) -> Result<Vec<PaneInfo>, EngineError> {
        let args = vec![
            "list-panes".to_string(),
            "-t".to_string(),
            window.to_string(),
            "-F".to_string(),
            PANE_FORMAT.to_string(),
        ];
        let line = command_string(&["list-panes", "-t", window.as_str(), "-F", PANE_FORMAT]);
        let output = self.control_or_fallback(None, line, args).await?;
        Ok(parse_panes_listing(&output))
    }

    /// Re-list windows and panes and replace the projection wholesale.
    async fn resync(&self, session: &SessionId) -> Result<(), EngineError> {
        let ws = self
            .workspace(Some(session))
            .ok_or(EngineError::ChannelClosed)?;
        let listing = self.query_windows(session).await?;
        let mut diff = ws
            .projector
            .lock()
            .map(|mut p| p.replace_windows(listing.clone()))
            .unwrap_or_default();
        for window in &listing {
            let panes = self.query_panes(&window.id).await?;
            diff.merge(
                ws.projector
                    .lock()
                    .map(|mut p| p.replace_panes(&window.id, panes))
                    .unwrap_or_default(),
            );
        }
        self.emit_diff(session, diff);
        Ok(())
    }

    async fn refresh_panes_of(
        &self,
        session: &SessionId,
        window: &WindowId,
    ) -> Result<(), EngineError> {
        let ws = self
            .workspace(Some(session))
            .ok_or(EngineError::ChannelClosed)?;
        let panes = self.query_panes(window).await?;
        let diff = ws
            .projector
            .lock()
            .map(|mut p| p.replace_panes(window, panes))
            .unwrap_or_default();
        self.emit_diff(session, diff);
        Ok(())
    }

    /// Refresh whatever contains the pane; when the pane is unknown to
    /// the projection (e.g. it was just created via the fallback path),
    /// resync the most plausible workspace instead.
    async fn refresh_pane_window(&self, pane: &PaneId) {
        match self.workspace_of_pane(pane) {
            Some((session, _, window)) => {
                if let Err(err) = self.refresh_panes_of(&session, &window).await {
                    debug!(%err, "pane refresh failed");
                }
            }
            None => {
                if let Some(session) = self.active_or_any_session() {
                    if let Err(err) = self.resync(&session).await {
                        debug!(%err, "workspace resync failed");
                    }
                }
            }
        }
    }

    fn active_or_any_session(&self) -> Option<SessionId> {
        if let Ok(active) = self.active.lock() {
            if let Some(session) = active.as_ref() {
                return Some(session.clone());
            }
        }
        self.workspaces
            .lock()
            .ok()
            .and_then(|map| map.keys().next().cloned())
    }

    fn emit_diff(&self, session: &SessionId, diff: ProjectionDiff) {
        if !diff.is_empty() {
            let _ = self.events_tx.send(EngineEvent::Projection {
                session: session.clone(),
                diff,
            });
        }
    }

    // ------------------------------------------------------------------
    // Supervision
    // ------------------------------------------------------------------

    async fn supervisor(
        engine: Weak<TmuxEngine>,
        mut notice_rx: mpsc::UnboundedReceiver<(SessionId, ChannelNotice)>,
    ) {
        while let Some((session, notice)) = notice_rx.recv().await {
            let Some(engine) = engine.upgrade() else {
                break;
            };
            match notice {
                ChannelNotice::RecoveryNeeded => engine.handle_recovery(&session).await,
                ChannelNotice::RefreshNeeded(scope) => {
                    engine.handle_refresh(&session, scope).await
                }
                ChannelNotice::Closed { reason } => engine.handle_closed(&session, reason),
            }
        }
        debug!("engine supervisor exiting");
    }

    async fn handle_recovery(&self, session: &SessionId) {
        let Some(ws) = self.workspace(Some(session)) else {
            return;
        };
        match self.resync(session).await {
            Ok(()) => {
                ws.recovery_failures.store(0, Ordering::SeqCst);
                debug!(session = %session, "recovered after resync");
            }
            Err(err) => {
                let failures = ws.recovery_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(session = %session, %err, failures, "recovery resync failed");
                if failures >= self.config.max_recovery_attempts
                    && !ws.degraded.swap(true, Ordering::SeqCst)
                {
                    // Report unavailability once and stop retrying; an
                    // explicit re-attach clears the latch.
                    let _ = self.events_tx.send(EngineEvent::Degraded {
                        session: session.clone(),
                        reason: "terminal engine unavailable after repeated recovery failures"
                            .to_string(),
                    });
                    ws.channel.close().await;
                }
            }
        }
    }

    async fn handle_refresh(&self, session: &SessionId, scope: RefreshScope) {
        let result = match scope {
            RefreshScope::Windows => self.resync(session).await,
            RefreshScope::Panes(window) => self.refresh_panes_of(session, &window).await,
        };
        if let Err(err) = result {
            debug!(session = %session, %err, "notification-driven refresh failed");
        }
    }

    fn handle_closed(&self, session: &SessionId, reason: Option<String>) {
        debug!(session = %session, ?reason, "control channel closed");
        // Drop the dead channel; the next explicit attach recreates it.
        // A plain close is transient: operations keep working through
        // the fallback path in the meantime.
        if let Ok(mut map) = self.workspaces.lock() {
            let dead = map
                .get(session)
                .map(|ws| !ws.channel.is_alive())
                .unwrap_or(false);
            if dead {
                map.remove(session);
            }
        }
    }

    #[cfg(test)]
    fn insert_stub_workspace(
        &self,
        session: SessionId,
        channel: ControlChannel,
        projector: Arc<Mutex<StateProjector>>,
    ) {
        let ws = Arc::new(Workspace {
            channel: Arc::new(channel),
            projector,
            recovery_failures: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
        });
        self.workspaces.lock().unwrap().insert(session.clone(), ws);
        *self.active.lock().unwrap() = Some(session);
    }
}

// ----------------------------------------------------------------------
// Listing parsers (formats defined by the query constants above)
// ----------------------------------------------------------------------

fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes")
}

fn parse_windows_listing(output: &str) -> Vec<WindowInfo> {
    let mut windows = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 6 {
            continue;
        }
        windows.push(WindowInfo {
            id: WindowId::from(parts[0]),
            index: parts[1].parse().unwrap_or(0),
            name: parts[2].to_string(),
            is_active: parse_flag(parts[3]),
            width: parts[4].parse().unwrap_or(0),
            height: parts[5].parse().unwrap_or(0),
        });
    }
    windows
}

fn parse_panes_listing(output: &str) -> Vec<PaneInfo> {
    let mut panes = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 6 {
            continue;
        }
        panes.push(PaneInfo {
            id: PaneId::from(parts[0]),
            rect: crate::model::PaneRect {
                left: parts[1].parse().unwrap_or(0),
                top: parts[2].parse().unwrap_or(0),
                width: parts[3].parse().unwrap_or(0),
                height: parts[4].parse().unwrap_or(0),
            },
            is_active: parse_flag(parts[5]),
            cursor: None,
        });
    }
    panes
}

fn parse_session_line(line: &str) -> Option<SessionInfo> {
    let mut parts = line.split('\t');
    let name = parts.next()?.trim();
    if name.is_empty() {
        return None;
    }
    let created = parts
        .next()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .unwrap_or(0);
    Some(SessionInfo {
        id: SessionId::from(name),
        name: name.to_string(),
        created_at: if created > 0 { created * 1000 } else { 0 },
        workspace_id: None,
        workspace_path: None,
    })
}

/// Build both forms of a hex `send-keys` command: the control-channel
/// line and the argv for the one-shot fallback.
fn send_keys_command(pane: &PaneId, bytes: &[u8]) -> (String, Vec<String>) {
    use std::fmt::Write;

    let mut line = String::with_capacity(20 + pane.as_str().len() + bytes.len() * 3);
    let _ = write!(line, "send-keys -t {pane} -H");
    let mut args = vec![
        "send-keys".to_string(),
        "-t".to_string(),
        pane.to_string(),
        "-H".to_string(),
    ];
    for &byte in bytes {
        let _ = write!(line, " {byte:02x}");
        args.push(format!("{byte:02x}"));
    }
    (line, args)
}
