//! Response-block correlation.
//!
//! Control mode is strictly sequential across response blocks: at most one
//! command is "in response" at a time, and blocks complete in the order
//! commands were written. The [`Correlator`] tracks the open block, the
//! armed pending command, and the recovery discard rule; the command
//! worker in `control` enforces the no-pipelining discipline by not
//! writing the next command until the previous block resolved.
//!
//! This type is synchronous and does no I/O so the whole protocol state
//! machine is testable by feeding it lines.

use bytes::Bytes;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::model::PaneId;
use crate::protocol::{parse_line, BlockHeader, ControlFrame, StateFrame};

/// Wire-level parse mode, distinct from the public channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Just (re)connected or desynchronized; the next line is suspect.
    Recovery,
    /// Between blocks.
    Idle,
    /// Inside a `%begin` block, capturing body lines.
    InResponse,
    /// `%exit` observed; only EOF is expected now.
    Exiting,
}

/// How a response block resolved.
#[derive(Debug, PartialEq, Eq)]
pub enum BlockResult {
    Ok { output: String },
    Failed { output: String },
    /// The server exited mid-block.
    Exited { output: String },
}

/// A command awaiting its response block.
#[derive(Debug)]
pub struct PendingBlock {
    /// Monotonic dispatch number, assigned when the command is written.
    pub seq: u64,
    pub request_id: Uuid,
    pub command: String,
    pub done: oneshot::Sender<BlockResult>,
}

/// What a consumed line means for the rest of the engine. Block
/// completions are delivered through the pending command's channel and do
/// not appear here.
#[derive(Debug, PartialEq)]
pub enum LineEffect {
    None,
    /// Dropped by the recovery rule; kept for logging.
    Discarded { line: String },
    Output { pane_id: PaneId, data: Bytes },
    State(StateFrame),
    /// `%exit` observed.
    Exited { reason: Option<String> },
}

#[derive(Debug)]
pub struct Correlator {
    mode: ParseMode,
    recovery_pending: bool,
    current_block: Option<BlockHeader>,
    body: Vec<String>,
    pending: Option<PendingBlock>,
}

impl Correlator {
    /// A fresh correlator starts in recovery: the first line after a
    /// connect is discarded unless it is itself a `%begin` or `%exit`
    /// boundary, so a stray partial line can never be misread as a frame.
    pub fn new() -> Self {
        Self {
            mode: ParseMode::Recovery,
            recovery_pending: true,
            current_block: None,
            body: Vec::new(),
            pending: None,
        }
    }

    pub fn mode(&self) -> ParseMode {
        self.mode
    }

    /// Arm the completion for the next block. Returns a previously armed
    /// command if one was still outstanding (it must be failed by the
    /// caller; with the worker's serialization this does not happen in
    /// normal operation).
    pub fn arm(&mut self, pending: PendingBlock) -> Option<PendingBlock> {
        let displaced = self.pending.take();
        self.pending = Some(pending);
        self.current_block = None;
        self.body.clear();
        self.mode = ParseMode::InResponse;
        displaced
    }

    /// Take the armed command without resolving it, e.g. to fail it as
    /// aborted when the channel dies.
    pub fn take_pending(&mut self) -> Option<PendingBlock> {
        self.pending.take()
    }

    /// Enter recovery after a timeout or write failure: the block framing
    /// is no longer trustworthy. Returns the armed command (to be failed
    /// as timed out) and any partially captured body for diagnostics.
    pub fn begin_recovery(&mut self) -> (Option<PendingBlock>, String) {
        let pending = self.pending.take();
        let partial = self.take_body();
        self.current_block = None;
        self.mode = ParseMode::Recovery;
        self.recovery_pending = true;
        (pending, partial)
    }

    /// Consume one complete line.
    pub fn on_line(&mut self, line: &str) -> LineEffect {
        if self.recovery_pending {
            self.recovery_pending = false;
            self.mode = ParseMode::Idle;
            if !line.starts_with("%begin ") && !line.starts_with("%exit") {
                return LineEffect::Discarded {
                    line: line.to_string(),
                };
            }
        }

        if self.current_block.is_some() {
            return self.on_block_line(line);
        }

        if line.is_empty() {
            return LineEffect::None;
        }

        match parse_line(line) {
            ControlFrame::Output { pane_id, data } => LineEffect::Output { pane_id, data },
            ControlFrame::State(frame) => LineEffect::State(frame),
            ControlFrame::Begin(header) => {
                self.current_block = Some(header);
                self.body.clear();
                self.mode = ParseMode::InResponse;
                LineEffect::None
            }
            // A block terminator with no open block still resolves the
            // armed command: its `%begin` may have been consumed by the
            // recovery discard rule.
            ControlFrame::End(_) => {
                let output = self.take_body();
                self.complete(BlockResult::Ok { output });
                self.mode = ParseMode::Idle;
                LineEffect::None
            }
            ControlFrame::Error(_) => {
                let output = self.take_body();
                self.complete(BlockResult::Failed { output });
                self.mode = ParseMode::Idle;
                LineEffect::None
            }
            ControlFrame::Exit { reason } => self.on_exit(reason),
        }
    }

    /// Handle a line while a block is open. Only a matching terminator or
    /// `%exit` closes it; everything else is body text.
    fn on_block_line(&mut self, line: &str) -> LineEffect {
        if line.starts_with("%exit") {
            let reason = line
                .strip_prefix("%exit")
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string);
            return self.on_exit(reason);
        }

        let is_end = line.starts_with("%end ");
        let is_error = line.starts_with("%error ");
        if is_end || is_error {
            if let Some(header) = block_header(line) {
                let matches = self
                    .current_block
                    .as_ref()
                    .map(|current| *current == header)
                    .unwrap_or(true);
                if matches {
                    let output = self.take_body();
                    self.current_block = None;
                    self.mode = ParseMode::Idle;
                    let result = if is_error {
                        BlockResult::Failed { output }
                    } else {
                        BlockResult::Ok { output }
                    };
                    self.complete(result);
                    return LineEffect::None;
                }
            }
        }

        self.body.push(line.to_string());
        LineEffect::None
    }

    fn on_exit(&mut self, reason: Option<String>) -> LineEffect {
        let output = self.take_body();
        self.current_block = None;
        self.mode = ParseMode::Exiting;
        self.complete(BlockResult::Exited { output });
        LineEffect::Exited { reason }
    }

    fn complete(&mut self, result: BlockResult) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.done.send(result);
        }
    }

    fn take_body(&mut self) -> String {
        if self.body.is_empty() {
            return String::new();
        }
        let output = self.body.join("\n");
        self.body.clear();
        output
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

fn block_header(line: &str) -> Option<BlockHeader> {
    match parse_line(line) {
        ControlFrame::End(header) | ControlFrame::Error(header) => Some(header),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(command: &str) -> (PendingBlock, oneshot::Receiver<BlockResult>) {
        let (done, rx) = oneshot::channel();
        (
            PendingBlock {
                seq: 1,
                request_id: Uuid::new_v4(),
                command: command.to_string(),
                done,
            },
            rx,
        )
    }

    /// A correlator with the initial recovery already satisfied.
    fn attached() -> Correlator {
        let mut correlator = Correlator::new();
        assert_eq!(correlator.on_line("%begin 100 0 1"), LineEffect::None);
        assert_eq!(correlator.on_line("%end 100 0 1"), LineEffect::None);
        correlator
    }

    #[test]
    fn first_stray_line_discarded() {
        let mut correlator = Correlator::new();
        let effect = correlator.on_line("lo world (torn output tail)");
        assert_eq!(
            effect,
            LineEffect::Discarded {
                line: "lo world (torn output tail)".to_string()
            }
        );
        // The next line is processed normally.
        assert_eq!(correlator.on_line("%begin 1 5 1"), LineEffect::None);
        assert_eq!(correlator.mode(), ParseMode::InResponse);
    }

    #[test]
    fn first_begin_line_not_discarded() {
        let mut correlator = Correlator::new();
        assert_eq!(correlator.on_line("%begin 1 5 1"), LineEffect::None);
        assert_eq!(correlator.mode(), ParseMode::InResponse);
    }

    #[test]
    fn first_exit_line_not_discarded() {
        let mut correlator = Correlator::new();
        assert!(matches!(
            correlator.on_line("%exit"),
            LineEffect::Exited { reason: None }
        ));
        assert_eq!(correlator.mode(), ParseMode::Exiting);
    }

    #[test]
    fn block_captures_body_and_completes() {
        let mut correlator = attached();
        let (block, mut rx) = pending("list-panes");
        assert!(correlator.arm(block).is_none());

        correlator.on_line("%begin 200 1 1");
        correlator.on_line("%0: [80x24] active");
        correlator.on_line("%1: [80x23]");
        correlator.on_line("%end 200 1 1");

        assert_eq!(
            rx.try_recv().unwrap(),
            BlockResult::Ok {
                output: "%0: [80x24] active\n%1: [80x23]".to_string()
            }
        );
        assert_eq!(correlator.mode(), ParseMode::Idle);
    }

    #[test]
    fn error_block_reports_failure() {
        let mut correlator = attached();
        let (block, mut rx) = pending("kill-pane -t %9");
        correlator.arm(block);

        correlator.on_line("%begin 200 1 1");
        correlator.on_line("can't find pane: %9");
        correlator.on_line("%error 200 1 1");

        assert_eq!(
            rx.try_recv().unwrap(),
            BlockResult::Failed {
                output: "can't find pane: %9".to_string()
            }
        );
    }

    #[test]
    fn output_frames_pass_through_between_blocks() {
        let mut correlator = attached();
        let effect = correlator.on_line("%output %3 ok\\015\\012");
        assert_eq!(
            effect,
            LineEffect::Output {
                pane_id: PaneId::from("%3"),
                data: Bytes::from_static(b"ok\r\n"),
            }
        );
    }

    #[test]
    fn mismatched_end_is_body_text() {
        let mut correlator = attached();
        let (block, mut rx) = pending("show-buffer");
        correlator.arm(block);

        correlator.on_line("%begin 300 2 1");
        // A different header: this is content, not our terminator.
        correlator.on_line("%end 999 9 1");
        correlator.on_line("%end 300 2 1");

        assert_eq!(
            rx.try_recv().unwrap(),
            BlockResult::Ok {
                output: "%end 999 9 1".to_string()
            }
        );
    }

    #[test]
    fn state_lines_inside_block_are_body() {
        let mut correlator = attached();
        let (block, mut rx) = pending("list-windows");
        correlator.arm(block);

        correlator.on_line("%begin 300 2 1");
        correlator.on_line("%window-add @9");
        correlator.on_line("%end 300 2 1");

        assert_eq!(
            rx.try_recv().unwrap(),
            BlockResult::Ok {
                output: "%window-add @9".to_string()
            }
        );
    }

    #[test]
    fn exit_inside_block_fails_pending() {
        let mut correlator = attached();
        let (block, mut rx) = pending("list-windows");
        correlator.arm(block);

        correlator.on_line("%begin 300 2 1");
        correlator.on_line("partial");
        let effect = correlator.on_line("%exit detached");

        assert_eq!(
            effect,
            LineEffect::Exited {
                reason: Some("detached".to_string())
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            BlockResult::Exited {
                output: "partial".to_string()
            }
        );
        assert_eq!(correlator.mode(), ParseMode::Exiting);
    }

    #[test]
    fn recovery_takes_pending_and_arms_discard() {
        let mut correlator = attached();
        let (block, mut rx) = pending("stuck-command");
        correlator.arm(block);
        correlator.on_line("%begin 400 3 1");
        correlator.on_line("half a response");

        let (taken, partial) = correlator.begin_recovery();
        assert!(taken.is_some());
        assert_eq!(partial, "half a response");
        assert_eq!(correlator.mode(), ParseMode::Recovery);
        // Dropping the taken pending closes the completion channel.
        drop(taken);
        assert!(rx.try_recv().is_err());

        // The discard rule is armed again.
        assert!(matches!(
            correlator.on_line("stale tail"),
            LineEffect::Discarded { .. }
        ));
        assert_eq!(correlator.on_line("%begin 500 4 1"), LineEffect::None);
    }

    #[test]
    fn terminator_without_begin_still_resolves_pending() {
        // The %begin fell into the recovery discard window; its %end must
        // not strand the armed command.
        let mut correlator = Correlator::new();
        let (block, mut rx) = pending("refresh-client");
        correlator.arm(block);

        // First line after reconnect is a torn %begin remnant → discarded.
        assert!(matches!(
            correlator.on_line("gin 600 5 1"),
            LineEffect::Discarded { .. }
        ));
        correlator.on_line("%end 600 5 1");
        assert_eq!(
            rx.try_recv().unwrap(),
            BlockResult::Ok {
                output: String::new()
            }
        );
    }

    #[test]
    fn arm_displaces_previous_pending() {
        let mut correlator = attached();
        let (first, _rx1) = pending("first");
        assert!(correlator.arm(first).is_none());
        let (second, _rx2) = pending("second");
        let displaced = correlator.arm(second).unwrap();
        assert_eq!(displaced.command, "first");
    }

    #[test]
    fn empty_lines_ignored_outside_blocks_kept_inside() {
        let mut correlator = attached();
        assert_eq!(correlator.on_line(""), LineEffect::None);

        let (block, mut rx) = pending("show-something");
        correlator.arm(block);
        correlator.on_line("%begin 700 6 1");
        correlator.on_line("a");
        correlator.on_line("");
        correlator.on_line("b");
        correlator.on_line("%end 700 6 1");
        assert_eq!(
            rx.try_recv().unwrap(),
            BlockResult::Ok {
                output: "a\n\nb".to_string()
            }
        );
    }
}
