use async_trait::async_trait;
use legate_core::AgentContext;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::time::Instant;
use tracing::{debug, info};

/// How often the runner checks whether any action is due.
const TICK: Duration = Duration::from_secs(10);

/// One recurring unit of agent-side work.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Runs the action once.
    async fn run(&self);
}

/// Wraps an async closure into an [`ActionHandler`].
pub fn action_fn<F, Fut>(function: F) -> Arc<dyn ActionHandler>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    type BoxedAction = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

    struct FnAction(BoxedAction);

    #[async_trait]
    impl ActionHandler for FnAction {
        async fn run(&self) {
            (self.0)().await;
        }
    }

    Arc::new(FnAction(Box::new(move || Box::pin(function()))))
}

/// A named action with the interval at which it recurs.
///
/// Registration (which actions exist, and how often) belongs to the plugin
/// loader; the agent merely runs the list it is given.
#[derive(Clone)]
pub struct RecurringAction {
    name: Arc<str>,
    interval: Duration,
    handler: Arc<dyn ActionHandler>,
}

impl RecurringAction {
    /// Creates an action with the given name, recurrence interval, and
    /// handler.
    pub fn new(
        name: impl AsRef<str>,
        interval: Duration,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            interval,
            handler,
        }
    }

    /// Reports the name of this action.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reports the recurrence interval of this action.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Runs the agent's recurring actions on a fixed tick.
///
/// Every ten seconds, each action whose interval has elapsed since its last
/// run is fired, one after another. An action fires for the first time on
/// the first tick after start.
pub(crate) struct ActionRunner;

impl ActionRunner {
    /// Spawns the runner. It stops when the context terminates.
    pub(crate) fn start(actions: Vec<RecurringAction>, context: &AgentContext) {
        if actions.is_empty() {
            return;
        }

        let worker_context = context.clone();
        let token = context.register("agent:actions");

        tokio::spawn(async move {
            Self::serve(actions, worker_context).await;
            token.complete();
        });
    }

    async fn serve(actions: Vec<RecurringAction>, context: AgentContext) {
        info!(actions = actions.len(), "Action runner started");

        let mut last_run: Vec<Option<Instant>> = vec![None; actions.len()];

        loop {
            select! {
                biased;
                _ = context.terminated() => break,
                _ = tokio::time::sleep(TICK) => {}
            }

            let now = Instant::now();

            for (action, last) in actions.iter().zip(last_run.iter_mut()) {
                let due = match last {
                    Some(last_instant) => now.duration_since(*last_instant) >= action.interval(),
                    None => true,
                };

                if due {
                    debug!(action = action.name(), "Running a recurring action");
                    action.handler.run().await;
                    *last = Some(now);
                }
            }
        }

        info!("Action runner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn due_actions_fire_on_the_tick() {
        // Given
        let context = AgentContext::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&counter);

        let action = RecurringAction::new(
            "count",
            Duration::from_secs(60),
            action_fn(move || {
                let counter = Arc::clone(&observed);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }),
        );

        ActionRunner::start(vec![action], &context);

        // When: the first tick passes
        tokio::time::sleep(Duration::from_secs(11)).await;

        // Then: fired once, and not again before the interval elapses
        assert_eq!(counter.load(Ordering::Relaxed), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(counter.load(Ordering::Relaxed), 1);

        // When: the interval elapses
        tokio::time::sleep(Duration::from_secs(40)).await;

        // Then: fired again
        assert_eq!(counter.load(Ordering::Relaxed), 2);

        // Finally
        context.terminate();
    }
}
