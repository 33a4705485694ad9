//! Output flow control and notification subscriptions.
//!
//! tmux pauses a pane's output (`%pause`) once the client falls further
//! behind than the configured `pause-after` window. When to resume is a
//! rendering-buffer concern that lives outside the protocol engine, so
//! the decision is an injected [`PausePolicy`]; the default resumes
//! immediately, which keeps the channel drained even with no policy
//! wired up.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::{EngineConfig, SubscriptionSpec};
use crate::model::PaneId;
use crate::protocol::quote_arg;

/// Decision taken when a pane's output is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseAction {
    /// Issue the continue action right away.
    Resume,
    /// Leave the pane paused; the consumer resumes it explicitly once it
    /// has drained enough buffered output.
    Defer,
}

/// Strategy hook supplied by the UI layer.
pub trait PausePolicy: Send + Sync {
    fn on_pause(&self, pane: &PaneId) -> PauseAction;
}

/// Default policy: always resume immediately.
pub struct ResumeImmediately;

impl PausePolicy for ResumeImmediately {
    fn on_pause(&self, _pane: &PaneId) -> PauseAction {
        PauseAction::Resume
    }
}

/// Tracks paused panes and registered subscriptions for one channel.
pub struct FlowController {
    policy: Arc<dyn PausePolicy>,
    paused: HashSet<PaneId>,
    subscriptions: HashMap<String, SubscriptionSpec>,
}

impl FlowController {
    pub fn new(policy: Arc<dyn PausePolicy>) -> Self {
        Self {
            policy,
            paused: HashSet::new(),
            subscriptions: HashMap::new(),
        }
    }

    /// Commands to issue at channel setup: enable pause-after flow control
    /// and register the baseline subscriptions.
    pub fn setup_commands(&mut self, config: &EngineConfig) -> Vec<String> {
        let mut commands = Vec::new();
        if let Some(seconds) = config.pause_after_seconds {
            commands.push(format!("refresh-client -f pause-after={seconds}"));
        }
        for spec in &config.subscriptions {
            self.subscriptions.insert(spec.name.clone(), spec.clone());
            commands.push(subscribe_command(spec));
        }
        commands
    }

    /// Record a `%pause` notification. Returns the continue command when
    /// the policy resumes immediately.
    pub fn on_pause(&mut self, pane: &PaneId) -> Option<String> {
        self.paused.insert(pane.clone());
        match self.policy.on_pause(pane) {
            PauseAction::Resume => Some(continue_command(pane)),
            PauseAction::Defer => None,
        }
    }

    /// Record a `%continue` notification.
    pub fn on_continue(&mut self, pane: &PaneId) {
        self.paused.remove(pane);
    }

    pub fn is_paused(&self, pane: &PaneId) -> bool {
        self.paused.contains(pane)
    }

    /// Register a subscription; returns the command to send.
    pub fn subscribe(&mut self, spec: SubscriptionSpec) -> String {
        let command = subscribe_command(&spec);
        self.subscriptions.insert(spec.name.clone(), spec);
        command
    }

    /// Remove a subscription; returns the command to send if it existed.
    pub fn unsubscribe(&mut self, name: &str) -> Option<String> {
        self.subscriptions
            .remove(name)
            .map(|_| format!("refresh-client -B {}", quote_arg(name)))
    }

    pub fn subscription_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subscriptions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Forget paused panes and subscriptions when the channel resets;
    /// subscriptions do not survive a reconnect.
    pub fn reset(&mut self) {
        self.paused.clear();
        self.subscriptions.clear();
    }
}

/// The continue action for a paused pane.
pub fn continue_command(pane: &PaneId) -> String {
    format!("refresh-client -A {}", quote_arg(&format!("{pane}:continue")))
}

fn subscribe_command(spec: &SubscriptionSpec) -> String {
    format!("refresh-client -B {}", quote_arg(&spec.to_argument()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DeferAll;
    impl PausePolicy for DeferAll {
        fn on_pause(&self, _pane: &PaneId) -> PauseAction {
            PauseAction::Defer
        }
    }

    #[test]
    fn default_policy_resumes() {
        let mut flow = FlowController::new(Arc::new(ResumeImmediately));
        let pane = PaneId::from("%3");
        let cmd = flow.on_pause(&pane);
        assert_eq!(cmd.as_deref(), Some("refresh-client -A %3:continue"));
        assert!(flow.is_paused(&pane));
        flow.on_continue(&pane);
        assert!(!flow.is_paused(&pane));
    }

    #[test]
    fn defer_policy_leaves_pane_paused() {
        let mut flow = FlowController::new(Arc::new(DeferAll));
        let pane = PaneId::from("%3");
        assert_eq!(flow.on_pause(&pane), None);
        assert!(flow.is_paused(&pane));
    }

    #[test]
    fn setup_enables_pause_after_and_subscriptions() {
        let mut flow = FlowController::new(Arc::new(ResumeImmediately));
        let config = EngineConfig {
            pause_after_seconds: Some(5),
            subscriptions: vec![SubscriptionSpec {
                name: "title".into(),
                target: None,
                format: "#{pane_title}".into(),
            }],
            ..EngineConfig::default()
        };
        let commands = flow.setup_commands(&config);
        assert_eq!(
            commands,
            vec![
                "refresh-client -f pause-after=5".to_string(),
                "refresh-client -B title::#{pane_title}".to_string(),
            ]
        );
        assert_eq!(flow.subscription_names(), vec!["title".to_string()]);
    }

    #[test]
    fn setup_without_pause_after() {
        let mut flow = FlowController::new(Arc::new(ResumeImmediately));
        let config = EngineConfig {
            pause_after_seconds: None,
            ..EngineConfig::default()
        };
        assert!(flow.setup_commands(&config).is_empty());
    }

    #[test]
    fn subscribe_unsubscribe_roundtrip() {
        let mut flow = FlowController::new(Arc::new(ResumeImmediately));
        let cmd = flow.subscribe(SubscriptionSpec {
            name: "cwd".into(),
            target: Some("%1".into()),
            format: "#{pane_current_path}".into(),
        });
        assert_eq!(cmd, "refresh-client -B cwd:%1:#{pane_current_path}");
        assert_eq!(
            flow.unsubscribe("cwd").as_deref(),
            Some("refresh-client -B cwd")
        );
        assert_eq!(flow.unsubscribe("cwd"), None);
    }

    #[test]
    fn reset_clears_everything() {
        let mut flow = FlowController::new(Arc::new(DeferAll));
        flow.on_pause(&PaneId::from("%1"));
        flow.subscribe(SubscriptionSpec {
            name: "x".into(),
            target: None,
            format: "#{pane_id}".into(),
        });
        flow.reset();
        assert!(!flow.is_paused(&PaneId::from("%1")));
        assert!(flow.subscription_names().is_empty());
    }
}
