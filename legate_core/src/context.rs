use crate::spindown::{SpindownRegistry, SpindownTimeout, SpindownToken};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The runtime context of a single agent instance.
///
/// The context starts in the “alive” state and can be
/// [terminated](AgentContext::terminate) at any time, exactly once; repeated
/// termination produces no additional effect. Any number of background workers
/// may hold a clone of the context and [wait](AgentContext::terminated) for
/// termination in their `select!` loops.
///
/// The context also carries the spindown registry. A worker that owns a
/// resource needing clean-up [registers](AgentContext::register) itself and
/// holds on to the returned [`SpindownToken`]; the host awaits all registered
/// workers via [`spun_down`](AgentContext::spun_down) after terminating.
///
/// The context is an explicit value, not a process-wide singleton: it is
/// created by the host, and every component that needs it receives a clone.
#[derive(Clone)]
pub struct AgentContext {
    token: CancellationToken,
    spindown: Arc<SpindownRegistry>,
}

impl AgentContext {
    /// Creates a fresh, alive context.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            spindown: Arc::new(SpindownRegistry::new()),
        }
    }

    /// Terminates this context, unblocking every task that
    /// [waits](AgentContext::terminated) on it. Idempotent.
    pub fn terminate(&self) {
        if !self.token.is_cancelled() {
            info!("Terminating agent context");
        }

        self.token.cancel();
    }

    /// Reports whether this context has been terminated.
    pub fn is_terminated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Blocks until this context is terminated. Completes immediately when the
    /// context is already terminated.
    pub async fn terminated(&self) {
        self.token.cancelled().await;
    }

    /// Registers a named background worker with the spindown registry. The
    /// worker must keep the returned token for as long as it runs: dropping
    /// the token (or calling [`SpindownToken::complete`]) marks the worker as
    /// gracefully completed.
    pub fn register(&self, name: impl AsRef<str>) -> SpindownToken {
        self.spindown.register(name.as_ref())
    }

    /// Waits, within the given timeout, for every
    /// [registered](AgentContext::register) worker to signal completion.
    ///
    /// Returns the number of workers that completed, or a [`SpindownTimeout`]
    /// naming how many did not make it. Does **not** terminate the context;
    /// that is the caller's job before invoking this.
    pub async fn spun_down(&self, timeout: Duration) -> Result<usize, SpindownTimeout> {
        self.spindown.spun_down(timeout).await
    }
}

impl Default for AgentContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::task;

    #[tokio::test]
    async fn terminate_unblocks_waiters() {
        // Given
        let context = AgentContext::new();
        let observer = context.clone();

        // When
        let waiter = task::spawn(async move {
            observer.terminated().await;
        });
        context.terminate();

        // Then
        assert!(waiter.await.is_ok());
        assert!(context.is_terminated());
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        // Given
        let context = AgentContext::new();

        // When
        context.terminate();
        context.terminate();

        // Then
        assert!(context.is_terminated());
    }

    #[tokio::test]
    async fn spindown_awaits_registered_workers() {
        // Given
        let context = AgentContext::new();
        let worker_context = context.clone();
        let token = context.register("worker");

        // When
        let worker = task::spawn(async move {
            worker_context.terminated().await;
            token.complete();
        });
        context.terminate();
        let count = context.spun_down(Duration::from_secs(1)).await.unwrap();

        // Then
        assert_eq!(count, 1);
        assert!(worker.await.is_ok());
    }

    #[tokio::test]
    async fn clones_share_termination() {
        // Given
        let context = AgentContext::new();
        let clone = context.clone();

        // When
        clone.terminate();

        // Then
        assert!(context.is_terminated());
    }
}
