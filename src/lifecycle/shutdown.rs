//! Process-wide shutdown coordination.

use tokio_util::sync::CancellationToken;

/// Coordinator for process shutdown.
///
/// The first trigger asks for a graceful stop; a second one asks to force it.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    graceful: CancellationToken,
    forced: CancellationToken,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled on the first trigger. Hand this to `Supervisor::run`.
    pub fn token(&self) -> CancellationToken {
        self.graceful.clone()
    }

    /// Trigger the shutdown signal. A repeated trigger escalates to forced.
    pub fn trigger(&self) {
        if self.graceful.is_cancelled() {
            self.forced.cancel();
        } else {
            self.graceful.cancel();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.graceful.is_cancelled()
    }

    /// Resolves once shutdown was triggered a second time.
    pub async fn forced(&self) {
        self.forced.cancelled().await
    }
}
