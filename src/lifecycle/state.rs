//! Supervisor lifecycle state.
//!
//! `Created → Running → ShuttingDownGraceful | ShuttingDownForced → Stopped`.
//! Transitions only move forward; a graceful shutdown may escalate to
//! forced, never the other way round.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Created,
    Running,
    ShuttingDownGraceful,
    ShuttingDownForced,
    Stopped,
}

impl LifecycleState {
    pub fn is_shutting_down(self) -> bool {
        matches!(
            self,
            LifecycleState::ShuttingDownGraceful | LifecycleState::ShuttingDownForced
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Graceful,
    Forced,
}

/// Shared, observable lifecycle cell.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: Arc<watch::Sender<LifecycleState>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LifecycleState::Created);
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// `Created → Running`. Returns the state seen before the call.
    pub fn start(&self) -> LifecycleState {
        let mut previous = LifecycleState::Created;
        self.state.send_if_modified(|state| {
            previous = *state;
            if *state == LifecycleState::Created {
                *state = LifecycleState::Running;
                true
            } else {
                false
            }
        });
        previous
    }

    /// Enter shutdown in `mode`. Returns the state seen before the call.
    pub fn begin_shutdown(&self, mode: ShutdownMode) -> LifecycleState {
        let target = match mode {
            ShutdownMode::Graceful => LifecycleState::ShuttingDownGraceful,
            ShutdownMode::Forced => LifecycleState::ShuttingDownForced,
        };
        let mut previous = LifecycleState::Created;
        self.state.send_if_modified(|state| {
            previous = *state;
            if *state < target {
                *state = target;
                true
            } else {
                false
            }
        });
        previous
    }

    pub fn finish(&self) {
        self.state.send_replace(LifecycleState::Stopped);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().is_shutting_down()
    }

    /// Resolves once the state is `Stopped`.
    pub async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|state| *state == LifecycleState::Stopped).await;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
