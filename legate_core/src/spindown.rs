use parking_lot::Mutex;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Keeps track of named background workers that must be awaited during agent
/// shutdown.
///
/// Workers register themselves and receive a [`SpindownToken`]. The token is
/// punched (explicitly or by being dropped) when the worker finishes its
/// clean-up. Shutdown then [awaits](SpindownRegistry::spun_down) all tokens
/// within a shared timeout.
pub(crate) struct SpindownRegistry {
    workers: Mutex<Vec<SpindownWorker>>,
}

/// A single registered worker: a human-readable name plus the completion
/// signal.
struct SpindownWorker {
    name: Arc<str>,
    done: CancellationToken,
}

/// Held by a background worker for as long as it runs.
///
/// Completion is signaled either explicitly via
/// [`complete`](SpindownToken::complete) or implicitly when the token is
/// dropped; a worker that simply lets the token fall out of scope at the end
/// of its task is therefore always accounted for.
pub struct SpindownToken {
    done: CancellationToken,
}

/// Indicates that not all registered workers completed within the spindown
/// timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpindownTimeout {
    /// The number of workers that did complete.
    pub completed: usize,
    /// The number of workers that did not complete in time.
    pub timed_out: usize,
}

impl SpindownRegistry {
    pub(crate) fn new() -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a worker under the given name (names need not be unique) and
    /// returns its token.
    pub(crate) fn register(&self, name: &str) -> SpindownToken {
        let worker = SpindownWorker {
            name: Arc::from(name),
            done: CancellationToken::new(),
        };
        let token = SpindownToken {
            done: worker.done.clone(),
        };

        self.workers.lock().push(worker);

        token
    }

    /// Waits for all registered workers within a single shared timeout.
    ///
    /// Workers registered *while* the spindown is in progress are picked up in
    /// a follow-up cycle, so late registrations are not lost. Returns the
    /// total count of completed workers, or a [`SpindownTimeout`] as soon as
    /// the deadline passes with workers still pending.
    pub(crate) async fn spun_down(&self, timeout: Duration) -> Result<usize, SpindownTimeout> {
        let deadline = Instant::now() + timeout;
        let mut completed = 0usize;

        loop {
            // Take the current batch, leaving an empty vector for late arrivals
            let batch = std::mem::take(&mut *self.workers.lock());

            if batch.is_empty() {
                info!(completed, "Spindown completed");
                return Ok(completed);
            }

            info!("Waiting for {} background worker(s)", batch.len());

            let total = batch.len();
            for (index, worker) in batch.into_iter().enumerate() {
                let result = tokio::time::timeout_at(deadline, worker.done.cancelled()).await;

                match result {
                    Ok(()) => {
                        completed += 1;
                        info!(worker = worker.name.as_ref(), "Completed gracefully");
                    }
                    Err(_) => {
                        let timed_out = total - index;
                        error!(
                            alert = true,
                            worker = worker.name.as_ref(),
                            timed_out,
                            "Ran out of time during spindown",
                        );
                        return Err(SpindownTimeout {
                            completed,
                            timed_out,
                        });
                    }
                }
            }
        }
    }
}

impl SpindownToken {
    /// Signals that the owning worker has gracefully completed. Consumes the
    /// token; calling this is equivalent to dropping it, but reads better at
    /// the end of a worker's serve loop.
    pub fn complete(self) {
        // Drop does the signaling
    }
}

impl Drop for SpindownToken {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

impl Display for SpindownTimeout {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "spindown timed out: {} worker(s) completed, {} did not",
            self.completed, self.timed_out,
        )
    }
}

impl Error for SpindownTimeout {}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn empty_registry_returns_immediately() {
        // Given
        let registry = SpindownRegistry::new();
        let start = Instant::now();

        // When
        let count = registry.spun_down(Duration::from_secs(5)).await.unwrap();

        // Then
        assert_eq!(count, 0);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn completed_tokens_are_counted() {
        // Given
        let registry = SpindownRegistry::new();
        let token_a = registry.register("a");
        let token_b = registry.register("b");

        // When
        token_a.complete();
        drop(token_b);
        let count = registry.spun_down(Duration::from_secs(5)).await.unwrap();

        // Then
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn stuck_worker_times_out() {
        // Given
        let registry = SpindownRegistry::new();
        let _held = registry.register("stuck");

        // When
        let error = registry
            .spun_down(Duration::from_millis(50))
            .await
            .unwrap_err();

        // Then
        assert_eq!(
            error,
            SpindownTimeout {
                completed: 0,
                timed_out: 1,
            },
        );
    }

    #[tokio::test]
    async fn late_registration_is_awaited() {
        // Given
        let registry = SpindownRegistry::new();
        let token_a = registry.register("early");
        token_a.complete();

        // When: register (and immediately complete) another worker while the
        // first batch has already been drained
        let token_b = registry.register("late");
        token_b.complete();
        let count = registry.spun_down(Duration::from_secs(5)).await.unwrap();

        // Then
        assert_eq!(count, 2);
    }
}
