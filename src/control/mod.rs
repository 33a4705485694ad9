//! The live control-mode connection for one session.
//!
//! A [`ControlChannel`] owns the tmux control client and two tasks:
//!
//! - the **reader task**, the single point that drives the engine: it
//!   frames stdout into lines, runs them through the [`Correlator`],
//!   patches the projection and broadcasts events. Nothing else mutates
//!   the correlator or projection outside its short lock windows.
//! - the **command worker**, which serializes command dispatch: it arms
//!   the correlator, writes one command, and does not write the next
//!   until the current response block resolved or timed out. Responses
//!   therefore resolve in send order and blocks are never pipelined.
//!
//! Callers submit commands from any task; completion is delivered through
//! a oneshot, so submission never blocks on the protocol.

pub mod correlator;
pub mod flow;
pub mod transport;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, SubscriptionSpec};
use crate::error::{is_unsupported_in_control_mode, EngineError};
use crate::events::{EngineEvent, OutputEvent, StateEvent};
use crate::model::{PaneId, SessionId};
use crate::projector::{RefreshScope, StateProjector};
use crate::protocol::StateFrame;

use correlator::{BlockResult, Correlator, LineEffect, PendingBlock};
use flow::{FlowController, PausePolicy};
use transport::{ControlTransport, LineFramer, TransportWriter};

/// Lifecycle of the control channel.
///
/// `Recovering` is entered when the block framing stops being
/// trustworthy (timeout, reconnect) and left once commands complete
/// cleanly again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Attached,
    Recovering,
    Exiting,
}

/// Out-of-band conditions the engine supervisor reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelNotice {
    /// The channel desynchronized; re-query authoritative state.
    RecoveryNeeded,
    /// A patch could not be applied from notification data alone.
    RefreshNeeded(RefreshScope),
    /// The channel is gone (server exit, EOF, write failure).
    Closed { reason: Option<String> },
}

pub type NoticeSender = mpsc::UnboundedSender<(SessionId, ChannelNotice)>;

struct ControlCommand {
    request_id: Uuid,
    line: String,
    /// `None` for fire-and-forget commands (their response block is still
    /// consumed by the correlator, keeping the queue discipline intact).
    reply: Option<oneshot::Sender<Result<String, EngineError>>>,
}

struct Shared {
    session: SessionId,
    correlator: Mutex<Correlator>,
    flow: Mutex<FlowController>,
    projector: Arc<Mutex<StateProjector>>,
    state: Mutex<ChannelState>,
    alive: AtomicBool,
    /// Dispatch counter; commands are numbered as they are written.
    seq: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: ChannelState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }
}

pub struct ControlChannel {
    shared: Arc<Shared>,
    command_tx: mpsc::UnboundedSender<ControlCommand>,
    reader_handle: JoinHandle<()>,
    worker_handle: JoinHandle<()>,
}

impl ControlChannel {
    /// Spawn a control client for `session` and complete the startup
    /// handshake. Failures here are reported as [`EngineError::Spawn`] so
    /// the caller can disable the feature instead of retrying blindly.
    pub async fn attach(
        session: SessionId,
        config: &EngineConfig,
        policy: Arc<dyn PausePolicy>,
        projector: Arc<Mutex<StateProjector>>,
        events_tx: broadcast::Sender<EngineEvent>,
        notice_tx: NoticeSender,
    ) -> Result<Self, EngineError> {
        let transport = ControlTransport::spawn(config, session.as_str())?;
        let channel = Self::from_transport(
            session, config, policy, projector, events_tx, notice_tx, transport,
        );
        channel.handshake(config).await?;
        Ok(channel)
    }

    /// Assemble a channel around an existing transport. Used by
    /// [`ControlChannel::attach`] and directly by tests with in-memory
    /// duplex streams.
    pub fn from_transport(
        session: SessionId,
        config: &EngineConfig,
        policy: Arc<dyn PausePolicy>,
        projector: Arc<Mutex<StateProjector>>,
        events_tx: broadcast::Sender<EngineEvent>,
        notice_tx: NoticeSender,
        transport: ControlTransport,
    ) -> Self {
        let shared = Arc::new(Shared {
            session,
            correlator: Mutex::new(Correlator::new()),
            flow: Mutex::new(FlowController::new(policy)),
            projector,
            state: Mutex::new(ChannelState::Connecting),
            alive: AtomicBool::new(true),
            seq: AtomicU64::new(0),
        });

        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let reader_handle = tokio::spawn(Self::reader_loop(
            transport.reader,
            transport.child,
            Arc::clone(&shared),
            events_tx.clone(),
            notice_tx.clone(),
            command_tx.clone(),
        ));
        let worker_handle = tokio::spawn(Self::command_worker(
            transport.writer,
            command_rx,
            Arc::clone(&shared),
            notice_tx,
            config.command_timeout(),
        ));

        Self {
            shared,
            command_tx,
            reader_handle,
            worker_handle,
        }
    }

    /// Startup handshake: the first waited command synchronizes with the
    /// unsolicited response block tmux emits on attach (its completion may
    /// resolve against that block; either way the stream is drained and
    /// ordered afterwards), then flow control and baseline subscriptions
    /// are enabled.
    async fn handshake(&self, config: &EngineConfig) -> Result<(), EngineError> {
        let ready = tokio::time::timeout(config.startup_timeout(), self.send("refresh-client"));
        match ready.await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                return Err(EngineError::Spawn {
                    reason: format!("control client failed during startup: {err}"),
                })
            }
            Err(_) => {
                return Err(EngineError::Spawn {
                    reason: "control client unresponsive during startup".to_string(),
                })
            }
        }

        let setup = match self.shared.flow.lock() {
            Ok(mut flow) => flow.setup_commands(config),
            Err(_) => Vec::new(),
        };
        for command in setup {
            // Flow-control setup is best effort: older servers reject
            // pause-after but the channel is still usable.
            if let Err(err) = self.send(command.clone()).await {
                warn!(%command, %err, "flow-control setup command failed");
            }
        }

        self.shared.set_state(ChannelState::Attached);
        Ok(())
    }

    pub fn session(&self) -> &SessionId {
        &self.shared.session
    }

    pub fn state(&self) -> ChannelState {
        self.shared
            .state
            .lock()
            .map(|state| *state)
            .unwrap_or(ChannelState::Disconnected)
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Queue a command and return a handle resolving with its response.
    pub fn submit(
        &self,
        line: impl Into<String>,
    ) -> Result<oneshot::Receiver<Result<String, EngineError>>, EngineError> {
        if !self.is_alive() {
            return Err(EngineError::ChannelClosed);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = ControlCommand {
            request_id: Uuid::new_v4(),
            line: line.into(),
            reply: Some(reply_tx),
        };
        self.command_tx
            .send(command)
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx)
    }

    /// Queue a command and await its response block.
    pub async fn send(&self, line: impl Into<String>) -> Result<String, EngineError> {
        let reply = self.submit(line)?;
        reply.await.map_err(|_| EngineError::Aborted)?
    }

    /// Queue a command whose response nobody waits for. The block is
    /// still correlated and consumed in order.
    pub fn enqueue(&self, line: impl Into<String>) -> Result<(), EngineError> {
        if !self.is_alive() {
            return Err(EngineError::ChannelClosed);
        }
        let command = ControlCommand {
            request_id: Uuid::new_v4(),
            line: line.into(),
            reply: None,
        };
        self.command_tx
            .send(command)
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Register a push subscription on this channel.
    pub async fn subscribe(&self, spec: SubscriptionSpec) -> Result<(), EngineError> {
        let command = match self.shared.flow.lock() {
            Ok(mut flow) => flow.subscribe(spec),
            Err(_) => return Err(EngineError::ChannelClosed),
        };
        self.send(command).await.map(|_| ())
    }

    /// Remove a push subscription. Unknown names are a no-op.
    pub async fn unsubscribe(&self, name: &str) -> Result<(), EngineError> {
        let command = match self.shared.flow.lock() {
            Ok(mut flow) => flow.unsubscribe(name),
            Err(_) => return Err(EngineError::ChannelClosed),
        };
        match command {
            Some(command) => self.send(command).await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Resume a pane a deferring pause policy left paused.
    pub fn continue_pane(&self, pane: &PaneId) -> Result<(), EngineError> {
        self.enqueue(flow::continue_command(pane))
    }

    pub fn is_paused(&self, pane: &PaneId) -> bool {
        self.shared
            .flow
            .lock()
            .map(|flow| flow.is_paused(pane))
            .unwrap_or(false)
    }

    /// Detach cleanly: ask the server to drop this client and stop the
    /// tasks. The child process is reaped by kill-on-drop.
    pub async fn close(&self) {
        let _ = self.enqueue("detach-client");
        // Give the detach a moment to flush before tearing down.
        tokio::task::yield_now().await;
        self.shared.alive.store(false, Ordering::SeqCst);
        self.shared.set_state(ChannelState::Disconnected);
        self.reader_handle.abort();
        self.worker_handle.abort();
    }

    async fn reader_loop(
        mut reader: transport::TransportReader,
        child: Option<tokio::process::Child>,
        shared: Arc<Shared>,
        events_tx: broadcast::Sender<EngineEvent>,
        notice_tx: NoticeSender,
        command_tx: mpsc::UnboundedSender<ControlCommand>,
    ) {
        use tokio::io::AsyncReadExt;

        // Held here so the child is reaped when the reader stops.
        let _child = child;
        let mut framer = LineFramer::new();
        let mut buf = [0u8; 8192];

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in framer.feed(&buf[..n]) {
                        trace!(target: "muxlink::wire", session = %shared.session, "RX {line}");
                        Self::handle_line(&shared, &events_tx, &notice_tx, &command_tx, &line);
                    }
                }
                Err(err) => {
                    debug!(session = %shared.session, %err, "control reader error");
                    break;
                }
            }
        }

        debug!(session = %shared.session, "control reader exiting");
        shared.alive.store(false, Ordering::SeqCst);
        let was_exiting = matches!(
            shared.state.lock().map(|state| *state),
            Ok(ChannelState::Exiting)
        );
        shared.set_state(ChannelState::Disconnected);
        // Fail whatever was in flight; dropping the completion resolves
        // the waiter as aborted.
        if let Ok(mut correlator) = shared.correlator.lock() {
            drop(correlator.take_pending());
        }
        if let Ok(mut flow) = shared.flow.lock() {
            flow.reset();
        }
        if !was_exiting {
            let _ = notice_tx.send((shared.session.clone(), ChannelNotice::Closed { reason: None }));
        }
    }

    fn handle_line(
        shared: &Arc<Shared>,
        events_tx: &broadcast::Sender<EngineEvent>,
        notice_tx: &NoticeSender,
        command_tx: &mpsc::UnboundedSender<ControlCommand>,
        line: &str,
    ) {
        let effect = match shared.correlator.lock() {
            Ok(mut correlator) => correlator.on_line(line),
            Err(_) => return,
        };

        match effect {
            LineEffect::None => {}
            LineEffect::Discarded { line } => {
                debug!(session = %shared.session, %line, "discarded stray line during recovery");
            }
            LineEffect::Output { pane_id, data } => {
                let _ = events_tx.send(EngineEvent::Output(OutputEvent {
                    session: shared.session.clone(),
                    pane_id,
                    data,
                }));
            }
            LineEffect::State(frame) => {
                Self::handle_state_frame(shared, events_tx, notice_tx, command_tx, frame);
            }
            LineEffect::Exited { reason } => {
                shared.set_state(ChannelState::Exiting);
                let _ = events_tx.send(EngineEvent::State(StateEvent {
                    session: shared.session.clone(),
                    frame: StateFrame::ClientExit {
                        reason: reason.clone(),
                    },
                }));
                let _ = notice_tx.send((shared.session.clone(), ChannelNotice::Closed { reason }));
            }
        }
    }

    fn handle_state_frame(
        shared: &Arc<Shared>,
        events_tx: &broadcast::Sender<EngineEvent>,
        notice_tx: &NoticeSender,
        command_tx: &mpsc::UnboundedSender<ControlCommand>,
        frame: StateFrame,
    ) {
        match &frame {
            StateFrame::Pause { pane_id } => {
                let resume = shared
                    .flow
                    .lock()
                    .ok()
                    .and_then(|mut flow| flow.on_pause(pane_id));
                if let Some(command) = resume {
                    // Routed through the worker so the continue command's
                    // response block stays correlated; queueing from the
                    // reader cannot deadlock because it never waits.
                    let _ = command_tx.send(ControlCommand {
                        request_id: Uuid::new_v4(),
                        line: command,
                        reply: None,
                    });
                }
            }
            StateFrame::Continue { pane_id } => {
                if let Ok(mut flow) = shared.flow.lock() {
                    flow.on_continue(pane_id);
                }
            }
            StateFrame::Unknown { line } => {
                debug!(session = %shared.session, %line, "unrecognized notification");
            }
            _ => {}
        }

        // Patch the projection and surface both the raw frame and the
        // resulting diff.
        let apply = shared
            .projector
            .lock()
            .map(|mut projector| projector.apply(&frame))
            .unwrap_or_default();
        if !apply.diff.is_empty() {
            let _ = events_tx.send(EngineEvent::Projection {
                session: shared.session.clone(),
                diff: apply.diff,
            });
        }
        if let Some(scope) = apply.refresh {
            let _ = notice_tx.send((shared.session.clone(), ChannelNotice::RefreshNeeded(scope)));
        }

        let _ = events_tx.send(EngineEvent::State(StateEvent {
            session: shared.session.clone(),
            frame,
        }));
    }

    async fn command_worker(
        mut writer: TransportWriter,
        mut command_rx: mpsc::UnboundedReceiver<ControlCommand>,
        shared: Arc<Shared>,
        notice_tx: NoticeSender,
        timeout: std::time::Duration,
    ) {
        while let Some(command) = command_rx.recv().await {
            if !shared.alive.load(Ordering::SeqCst) {
                reply(command.reply, Err(EngineError::ChannelClosed));
                continue;
            }

            let seq = shared.seq.fetch_add(1, Ordering::SeqCst) + 1;
            let (done_tx, done_rx) = oneshot::channel();
            let displaced = match shared.correlator.lock() {
                Ok(mut correlator) => correlator.arm(PendingBlock {
                    seq,
                    request_id: command.request_id,
                    command: command.line.clone(),
                    done: done_tx,
                }),
                Err(_) => {
                    reply(command.reply, Err(EngineError::ChannelClosed));
                    continue;
                }
            };
            // Serialization means nothing should ever be displaced;
            // dropping it aborts the stale waiter.
            drop(displaced);

            trace!(target: "muxlink::wire", session = %shared.session, seq, "TX {}", command.line);
            if let Err(err) = write_line(&mut writer, &command.line).await {
                debug!(session = %shared.session, %err, "control write failed");
                if let Ok(mut correlator) = shared.correlator.lock() {
                    let _ = correlator.begin_recovery();
                }
                shared.alive.store(false, Ordering::SeqCst);
                shared.set_state(ChannelState::Disconnected);
                reply(command.reply, Err(EngineError::ChannelClosed));
                let _ = notice_tx.send((shared.session.clone(), ChannelNotice::Closed { reason: None }));
                continue;
            }

            match tokio::time::timeout(timeout, done_rx).await {
                Ok(Ok(result)) => {
                    if matches!(result, BlockResult::Ok { .. }) {
                        shared.set_state(ChannelState::Attached);
                    }
                    reply(command.reply, interpret(&command.line, result));
                }
                Ok(Err(_)) => {
                    // Completion dropped: the reader failed it during a
                    // disconnect.
                    reply(command.reply, Err(EngineError::Aborted));
                }
                Err(_) => {
                    // A stuck block means the framing is untrustworthy:
                    // fail the command and force a recovery cycle.
                    let partial = match shared.correlator.lock() {
                        Ok(mut correlator) => {
                            let (_pending, partial) = correlator.begin_recovery();
                            partial
                        }
                        Err(_) => String::new(),
                    };
                    if !partial.is_empty() {
                        debug!(
                            session = %shared.session,
                            bytes = partial.len(),
                            "discarding partial response after timeout"
                        );
                    }
                    shared.set_state(ChannelState::Recovering);
                    reply(
                        command.reply,
                        Err(EngineError::CommandTimeout {
                            command: command.line.clone(),
                            timeout,
                        }),
                    );
                    let _ = notice_tx
                        .send((shared.session.clone(), ChannelNotice::RecoveryNeeded));
                }
            }
        }
        debug!(session = %shared.session, "command worker exiting");
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.worker_handle.abort();
    }
}

fn reply(
    reply: Option<oneshot::Sender<Result<String, EngineError>>>,
    result: Result<String, EngineError>,
) {
    if let Some(tx) = reply {
        let _ = tx.send(result);
    }
}

/// Map a resolved block onto the engine error taxonomy.
fn interpret(command: &str, result: BlockResult) -> Result<String, EngineError> {
    match result {
        BlockResult::Ok { output } => Ok(output),
        BlockResult::Failed { output } => {
            if is_unsupported_in_control_mode(&output) {
                Err(EngineError::UnsupportedInControlMode {
                    command: command.to_string(),
                })
            } else {
                let message = if output.is_empty() {
                    format!("command failed: {command}")
                } else {
                    output
                };
                Err(EngineError::CommandFailed { message })
            }
        }
        BlockResult::Exited { .. } => Err(EngineError::Aborted),
    }
}

async fn write_line(writer: &mut TransportWriter, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow::ResumeImmediately;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    struct Harness {
        channel: ControlChannel,
        /// The fake tmux side: read commands, write frames.
        remote_rx: BufReader<ReadHalf<DuplexStream>>,
        remote_tx: WriteHalf<DuplexStream>,
        events: broadcast::Receiver<EngineEvent>,
        notices: mpsc::UnboundedReceiver<(SessionId, ChannelNotice)>,
        projector: Arc<Mutex<StateProjector>>,
    }

    fn harness(config: EngineConfig) -> Harness {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (local_read, local_write) = tokio::io::split(local);
        let (remote_read, remote_tx) = tokio::io::split(remote);

        let (events_tx, events) = broadcast::channel(1024);
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let projector = Arc::new(Mutex::new(StateProjector::new()));

        let channel = ControlChannel::from_transport(
            SessionId::from("proj1"),
            &config,
            Arc::new(ResumeImmediately),
            Arc::clone(&projector),
            events_tx,
            notice_tx,
            ControlTransport::from_streams(local_read, local_write),
        );

        Harness {
            channel,
            remote_rx: BufReader::new(remote_read),
            remote_tx,
            events,
            notices,
            projector,
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            command_timeout_ms: 200,
            startup_timeout_ms: 500,
            ..EngineConfig::default()
        }
    }

    impl Harness {
        async fn expect_command(&mut self) -> String {
            let mut line = String::new();
            self.remote_rx.read_line(&mut line).await.unwrap();
            line.trim_end().to_string()
        }

        async fn feed(&mut self, text: &str) {
            self.remote_tx.write_all(text.as_bytes()).await.unwrap();
            self.remote_tx.flush().await.unwrap();
        }

        /// Satisfy the initial recovery discard with a benign block.
        async fn open_stream(&mut self) {
            self.feed("%begin 1 0 1\n%end 1 0 1\n").await;
        }
    }

    #[tokio::test]
    async fn responses_resolve_in_send_order_despite_interleaved_output() {
        let mut h = harness(fast_config());
        h.open_stream().await;

        let r1 = h.channel.submit("list-windows").unwrap();
        let r2 = h.channel.submit("list-panes -t @0").unwrap();
        let r3 = h.channel.submit("display-message").unwrap();

        // The worker writes strictly one at a time.
        assert_eq!(h.expect_command().await, "list-windows");
        h.feed("%output %5 unrelated\n%begin 10 1 1\nwin-a\n%end 10 1 1\n")
            .await;
        assert_eq!(h.expect_command().await, "list-panes -t @0");
        h.feed("%begin 11 2 1\npane-a\n%end 11 2 1\n%output %5 more\n")
            .await;
        assert_eq!(h.expect_command().await, "display-message");
        h.feed("%begin 12 3 1\nmsg\n%end 12 3 1\n").await;

        assert_eq!(r1.await.unwrap().unwrap(), "win-a");
        assert_eq!(r2.await.unwrap().unwrap(), "pane-a");
        assert_eq!(r3.await.unwrap().unwrap(), "msg");
    }

    #[tokio::test]
    async fn error_blocks_map_to_command_failed() {
        let mut h = harness(fast_config());
        h.open_stream().await;

        let r = h.channel.submit("kill-pane -t %9").unwrap();
        assert_eq!(h.expect_command().await, "kill-pane -t %9");
        h.feed("%begin 10 1 1\ncan't find pane: %9\n%error 10 1 1\n")
            .await;

        match r.await.unwrap() {
            Err(EngineError::CommandFailed { message }) => {
                assert_eq!(message, "can't find pane: %9");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsupported_command_classified_for_fallback() {
        let mut h = harness(fast_config());
        h.open_stream().await;

        let r = h.channel.submit("attach-session -t other").unwrap();
        h.expect_command().await;
        h.feed("%begin 10 1 1\nattach-session: not allowed in control mode\n%error 10 1 1\n")
            .await;

        let err = r.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedInControlMode { .. }));
        assert!(err.triggers_fallback());
    }

    #[tokio::test]
    async fn timeout_fails_command_and_enters_recovery() {
        let mut h = harness(fast_config());
        h.open_stream().await;

        let r = h.channel.submit("list-panes").unwrap();
        assert_eq!(h.expect_command().await, "list-panes");
        // No %end ever arrives.
        let err = r.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::CommandTimeout { .. }));
        assert_eq!(h.channel.state(), ChannelState::Recovering);

        let (session, notice) = h.notices.recv().await.unwrap();
        assert_eq!(session, SessionId::from("proj1"));
        assert_eq!(notice, ChannelNotice::RecoveryNeeded);

        // After recovery the discard rule is armed: a stray line is
        // dropped, the next block completes the next command normally.
        let r = h.channel.submit("list-windows").unwrap();
        assert_eq!(h.expect_command().await, "list-windows");
        h.feed("stray partial tail\n%begin 20 2 1\nok\n%end 20 2 1\n")
            .await;
        assert_eq!(r.await.unwrap().unwrap(), "ok");
        assert_eq!(h.channel.state(), ChannelState::Attached);
    }

    #[tokio::test]
    async fn reconnect_discard_rule_processes_second_line() {
        let mut h = harness(fast_config());
        // Fresh channel: correlator starts in recovery. First line is a
        // torn output frame and must be discarded, second line is a real
        // block boundary.
        let r = h.channel.submit("refresh-client").unwrap();
        h.expect_command().await;
        h.feed("lo world]0;torn\n%begin 5 1 1\n%end 5 1 1\n").await;
        assert_eq!(r.await.unwrap().unwrap(), "");
    }

    #[tokio::test]
    async fn output_frames_are_broadcast_with_session() {
        let mut h = harness(fast_config());
        h.open_stream().await;
        h.feed("%output %3 hi\\040there\n").await;

        loop {
            match h.events.recv().await.unwrap() {
                EngineEvent::Output(event) => {
                    assert_eq!(event.session, SessionId::from("proj1"));
                    assert_eq!(event.pane_id, PaneId::from("%3"));
                    assert_eq!(event.data.as_ref(), b"hi there");
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn layout_change_patches_projection_and_emits_diff() {
        let mut h = harness(fast_config());
        h.open_stream().await;

        // Window metadata is already known.
        h.projector.lock().unwrap().replace_windows(vec![crate::model::WindowInfo {
            id: crate::model::WindowId::from("@0"),
            index: 0,
            name: "shell".into(),
            is_active: true,
            width: 160,
            height: 40,
        }]);

        let description = "160x40,0,0{80x40,0,0,0,79x40,81,0,1}";
        let line = format!(
            "%layout-change @0 {:04x},{description} {:04x},{description} *\n",
            crate::protocol::layout::checksum(description),
            crate::protocol::layout::checksum(description),
        );
        h.feed(&line).await;

        let mut saw_projection = false;
        let mut saw_state = false;
        for _ in 0..4 {
            match h.events.recv().await.unwrap() {
                EngineEvent::Projection { diff, .. } => {
                    assert_eq!(diff.added_panes.len(), 2);
                    saw_projection = true;
                }
                EngineEvent::State(event) => {
                    assert_eq!(event.frame.kind(), "layout-change");
                    saw_state = true;
                }
                _ => {}
            }
            if saw_projection && saw_state {
                break;
            }
        }
        assert!(saw_projection && saw_state);

        let panes = h
            .projector
            .lock()
            .unwrap()
            .panes(&crate::model::WindowId::from("@0"));
        assert_eq!(panes.len(), 2);
    }

    #[tokio::test]
    async fn pause_notification_auto_continues() {
        let mut h = harness(fast_config());
        h.open_stream().await;

        h.feed("%pause %7\n").await;
        // The default policy resumes immediately via the command worker.
        assert_eq!(h.expect_command().await, "refresh-client -A %7:continue");
        assert!(h.channel.is_paused(&PaneId::from("%7")));

        // Consume its response block, then the server confirms.
        h.feed("%begin 30 4 1\n%end 30 4 1\n%continue %7\n").await;
        // Wait for the %continue to be observed via the event stream.
        loop {
            if let EngineEvent::State(event) = h.events.recv().await.unwrap() {
                if event.frame.kind() == "continue" {
                    break;
                }
            }
        }
        assert!(!h.channel.is_paused(&PaneId::from("%7")));
    }

    #[tokio::test]
    async fn exit_fails_pending_and_notifies_closed() {
        let mut h = harness(fast_config());
        h.open_stream().await;

        let r = h.channel.submit("list-windows").unwrap();
        h.expect_command().await;
        h.feed("%begin 40 5 1\nhalf\n%exit server exited\n").await;

        let err = r.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Aborted));

        let (_, notice) = h.notices.recv().await.unwrap();
        assert_eq!(
            notice,
            ChannelNotice::Closed {
                reason: Some("server exited".to_string())
            }
        );
        assert_eq!(h.channel.state(), ChannelState::Exiting);
    }

    #[tokio::test]
    async fn eof_aborts_in_flight_command() {
        let mut h = harness(fast_config());
        h.open_stream().await;

        let r = h.channel.submit("list-windows").unwrap();
        h.expect_command().await;

        // Close the fake server side entirely (both halves) so the
        // channel's reader observes EOF.
        let Harness {
            channel,
            remote_rx,
            remote_tx,
            mut notices,
            ..
        } = h;
        drop(remote_rx);
        drop(remote_tx);

        let err = r.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Aborted));

        let (_, notice) = notices.recv().await.unwrap();
        assert_eq!(notice, ChannelNotice::Closed { reason: None });

        // New submissions are rejected without touching the wire.
        loop {
            match channel.submit("anything") {
                Err(EngineError::ChannelClosed) => break,
                Ok(_) => tokio::task::yield_now().await,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }
}
