use crate::Watchdog;
use async_trait::async_trait;
use legate_amqp::{Connector, Envelope, Reader};
use legate_core::AgentContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tracing::{info, warn};

/// How long a single fetch on the shared reply queue blocks before the loop
/// re-checks the context.
const FETCH_TIMEOUT: Duration = Duration::from_secs(1);

/// A recipient of the replies arriving on a shared (`ctag`-named) reply
/// queue.
#[async_trait]
pub trait ReplyListener: Send + Sync {
    /// Receives one reply envelope: either a STARTED status update or a
    /// final result (which may be a watchdog-synthesized timeout).
    async fn on_reply(&self, envelope: Envelope);
}

/// The single consumer of a shared reply queue.
///
/// Exactly one monitor may consume a given `ctag` queue; serial-number
/// correlation by scanning is only defined for a single consumer. The
/// monitor forwards every reply to its [`ReplyListener`] and keeps the
/// [`Watchdog`] honest: an observed STARTED advances the tracked entry, an
/// observed FINAL ends its tracking.
pub struct ReplyMonitor {
    ctag: Arc<str>,
}

impl ReplyMonitor {
    /// Starts a monitor on the reply queue named by `ctag`. The worker stops
    /// when the context terminates.
    pub fn start(
        connector: Arc<Connector>,
        ctag: impl AsRef<str>,
        listener: Arc<dyn ReplyListener>,
        watchdog: Option<Watchdog>,
        context: &AgentContext,
    ) -> Self {
        let ctag: Arc<str> = Arc::from(ctag.as_ref());
        let reader = Reader::new(connector, ctag.as_ref());
        let worker_context = context.clone();
        let token = context.register(&format!("rmi:monitor:{}", ctag));

        let monitor = Self {
            ctag: Arc::clone(&ctag),
        };

        tokio::spawn(async move {
            Self::serve(ctag, reader, listener, watchdog, worker_context).await;
            token.complete();
        });

        monitor
    }

    /// Reports the correlation tag this monitor consumes for.
    pub fn ctag(&self) -> &str {
        &self.ctag
    }

    /// The consuming loop.
    async fn serve(
        ctag: Arc<str>,
        reader: Reader,
        listener: Arc<dyn ReplyListener>,
        watchdog: Option<Watchdog>,
        context: AgentContext,
    ) {
        info!(ctag = ctag.as_ref(), "Reply monitor started");

        loop {
            let step = select! {
                biased;
                _ = context.terminated() => break,
                step = reader.next(FETCH_TIMEOUT) => step,
            };

            let (envelope, ack) = match step {
                Ok(Some(found)) => found,
                Ok(None) => continue,
                Err(error) => {
                    // Rejected messages are already acknowledged by the reader
                    warn!(
                        ctag = ctag.as_ref(),
                        ?error,
                        error_message = %error,
                        "Dropped an unreadable reply",
                    );
                    continue;
                }
            };

            // Keep the watchdog in step with what actually arrived
            if let Some(watchdog) = &watchdog {
                if envelope.has_result() {
                    watchdog.completed(&envelope.sn);
                } else if envelope.status.is_some() {
                    watchdog.started(&envelope.sn);
                }
            }

            listener.on_reply(envelope).await;
            ack.ack().await;
        }

        reader.close().await;

        info!(ctag = ctag.as_ref(), "Reply monitor stopped");
    }
}
