use crate::{Dispatcher, PendingError, PendingStore};
use legate_amqp::{
    unix_now, Ack, Authenticator, Connector, Destination, Eligibility, Envelope, Producer,
    ReadError, Reader, Return, Window, WIRE_VERSION,
};
use legate_core::AgentContext;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// How long a single fetch on the inbound queue blocks before the loop
/// re-checks the context.
const FETCH_TIMEOUT: Duration = Duration::from_secs(1);

/// The default dispatch parallelism.
const DEFAULT_THREADS: usize = 3;

/// The server side of the RPC engine: consumes requests addressed to this
/// agent, dispatches them, and produces replies.
///
/// Each inbound envelope runs this state machine:
///
/// - an unknown protocol version is logged and acknowledged, without
///   dispatch;
/// - a past window is answered with a `WindowMissed` failure and
///   acknowledged;
/// - a future window parks the envelope in the [`PendingStore`] and
///   acknowledges it; the drain worker hands it back when the window opens;
/// - a present window dispatches: STARTED is sent (when a reply is asked
///   for), the handler runs, the final reply is sent (ditto), and only then
///   is the inbound message acknowledged — handler failures travel in the
///   reply, never through redelivery.
///
/// Reply delivery is best-effort: a failed reply send is logged, not
/// retried; the remote caller re-issues the request if it cares.
/// Dispatches run concurrently, bounded by the configured thread count; the
/// consuming loop itself is torn down only by context termination.
pub struct RequestConsumer {
    name: Arc<str>,
    context: AgentContext,
    reader: Reader,
    producer: Arc<Producer>,
    dispatcher: Dispatcher,
    pending: Arc<PendingStore>,
    permits: Arc<Semaphore>,
}

impl RequestConsumer {
    /// Creates a consumer of the given (durable) inbound queue. Replies are
    /// produced through the same connector, per the broker URL of the
    /// inbound side.
    pub fn new(
        connector: Arc<Connector>,
        queue: impl AsRef<str>,
        dispatcher: Dispatcher,
        pending: Arc<PendingStore>,
        context: AgentContext,
    ) -> Self {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        let queue = queue.as_ref();
        let name = Arc::from(format!(
            "rmi:consumer:{}:{}",
            queue,
            COUNTER.fetch_add(1, Ordering::Relaxed),
        ));

        let reader = Reader::new(Arc::clone(&connector), queue);
        let producer = Arc::new(Producer::new(connector));

        Self {
            name,
            context,
            reader,
            producer,
            dispatcher,
            pending,
            permits: Arc::new(Semaphore::new(DEFAULT_THREADS)),
        }
    }

    /// Sets the dispatch parallelism.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(threads.max(1)));
        self
    }

    /// Attaches a message-signing hook to the inbound side.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.reader = self.reader.with_authenticator(authenticator);
        self
    }

    /// Reports the name of this consumer.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the consuming loop and returns its join handle.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.serve())
    }

    /// The consuming loop: inbound envelopes on one side, released pending
    /// envelopes on the other, until the context terminates.
    async fn serve(self) {
        let token = self.context.register(self.name.as_ref());

        info!(
            consumer = self.name.as_ref(),
            queue = self.reader.queue(),
            "Request consumer started",
        );

        self.forward_released();

        loop {
            select! {
                biased;
                _ = self.context.terminated() => break,
                step = self.reader.next(FETCH_TIMEOUT) => self.receive(step),
            }
        }

        self.reader.close().await;
        self.producer.close().await;

        info!(consumer = self.name.as_ref(), "Request consumer stopped");

        token.complete();
    }

    /// Routes one fetch outcome through the state machine.
    fn receive(&self, step: Result<Option<(Envelope, Ack)>, ReadError>) {
        let (envelope, ack) = match step {
            Ok(Some(found)) => found,
            Ok(None) => return,
            Err(error) => {
                // Rejected messages are already acknowledged by the reader
                warn!(
                    consumer = self.name.as_ref(),
                    ?error,
                    error_message = %error,
                    "Dropped an unreadable request",
                );
                return;
            }
        };

        // An envelope from a different protocol version is dropped whole
        if envelope.version != WIRE_VERSION {
            warn!(
                consumer = self.name.as_ref(),
                sn = envelope.sn.as_str(),
                version = envelope.version.as_str(),
                "Dropped an envelope with a mismatched protocol version",
            );
            self.spawn_ack(ack);
            return;
        }

        match Window::eligibility_of(envelope.window.as_ref(), unix_now()) {
            // Not yet: park it; the drain worker will bring it back
            Eligibility::Future => self.park(envelope, ack),

            // Open or missed: both are decided on the dispatch path
            Eligibility::Present | Eligibility::Past => {
                self.spawn_dispatch(envelope, Some(ack), false)
            }
        }
    }

    /// Parks a future-windowed envelope in the pending store.
    fn park(&self, envelope: Envelope, ack: Ack) {
        // The store consumes the envelope; retain what a refusal would need
        let sn = envelope.sn.clone();
        let replyto = envelope.replyto.clone();
        let any = envelope.any.clone();

        match self.pending.add(envelope) {
            Ok(()) => self.spawn_ack(ack),

            // At capacity: refuse, and tell the caller so (when asked to)
            Err(PendingError::Full { .. }) => {
                warn!(
                    consumer = self.name.as_ref(),
                    sn = sn.as_str(),
                    "Pending store is full; refusing a future-windowed request",
                );

                let producer = Arc::clone(&self.producer);
                let name = Arc::clone(&self.name);
                tokio::spawn(async move {
                    if let Some(replyto) = &replyto {
                        let reply =
                            Envelope::for_reply(&sn, any, Return::pending_full(&sn));
                        Self::deliver(&producer, &name, replyto, &sn, reply).await;
                    }
                    ack.ack().await;
                });
            }

            // The journal failed: leave the message unacknowledged so the
            // broker redelivers it
            Err(error) => {
                warn!(
                    consumer = self.name.as_ref(),
                    ?error,
                    error_message = %error,
                    "Failed to park a future-windowed request; leaving it for redelivery",
                );
                drop(ack);
            }
        }
    }

    /// Acknowledges in the background, keeping the loop responsive.
    fn spawn_ack(&self, ack: Ack) {
        tokio::spawn(async move {
            ack.ack().await;
        });
    }

    /// Starts the forwarder that turns released pending entries into
    /// dispatch tasks, on its own task so releases never interrupt an
    /// in-flight fetch.
    fn forward_released(&self) {
        let mut released = self.pending.start_drain(&self.context);
        let context = self.context.clone();
        let name = Arc::clone(&self.name);
        let permits = Arc::clone(&self.permits);
        let producer = Arc::clone(&self.producer);
        let dispatcher = self.dispatcher.clone();
        let pending = Arc::clone(&self.pending);

        tokio::spawn(async move {
            loop {
                let step = select! {
                    biased;
                    _ = context.terminated() => break,
                    step = released.recv() => step,
                };

                match step {
                    Some(envelope) => Self::spawn_dispatch_with(
                        Arc::clone(&name),
                        Arc::clone(&permits),
                        Arc::clone(&producer),
                        dispatcher.clone(),
                        Arc::clone(&pending),
                        envelope,
                        None,
                        true,
                    ),
                    // The drain worker is gone; so is the work
                    None => break,
                }
            }
        });
    }

    /// Spawns one bounded dispatch task for the given envelope.
    fn spawn_dispatch(&self, envelope: Envelope, ack: Option<Ack>, from_pending: bool) {
        Self::spawn_dispatch_with(
            Arc::clone(&self.name),
            Arc::clone(&self.permits),
            Arc::clone(&self.producer),
            self.dispatcher.clone(),
            Arc::clone(&self.pending),
            envelope,
            ack,
            from_pending,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_dispatch_with(
        name: Arc<str>,
        permits: Arc<Semaphore>,
        producer: Arc<Producer>,
        dispatcher: Dispatcher,
        pending: Arc<PendingStore>,
        envelope: Envelope,
        ack: Option<Ack>,
        from_pending: bool,
    ) {
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                return;
            };

            Self::process(&name, &producer, &dispatcher, &envelope).await;

            if from_pending {
                pending.dispatched(&envelope.sn);
            }

            // Acknowledge after the dispatch attempt, whatever its outcome
            if let Some(ack) = ack {
                ack.ack().await;
            }
        });
    }

    /// Runs one envelope through window re-evaluation, STARTED, dispatch,
    /// and the final reply.
    async fn process(name: &str, producer: &Producer, dispatcher: &Dispatcher, envelope: &Envelope) {
        // Re-evaluate the window: a released pending entry may have
        // overslept its whole window (e.g. across a long downtime)
        if let Eligibility::Past = Window::eligibility_of(envelope.window.as_ref(), unix_now()) {
            debug!(consumer = name, sn = envelope.sn.as_str(), "Window missed");
            Self::send_reply(producer, name, envelope, Return::window_missed(&envelope.sn)).await;
            return;
        }

        Self::send_started(producer, name, envelope).await;

        let outcome = match &envelope.request {
            Some(request) => dispatcher.dispatch(request).await,
            None => Return::not_found("<no request payload>"),
        };

        Self::send_reply(producer, name, envelope, outcome).await;
    }

    /// Sends the STARTED status update, when a reply is asked for.
    async fn send_started(producer: &Producer, name: &str, envelope: &Envelope) {
        let Some(replyto) = &envelope.replyto else {
            return;
        };

        let status = Envelope::for_status(&envelope.sn, envelope.any.clone(), "started");

        Self::deliver(producer, name, replyto, &envelope.sn, status).await;
    }

    /// Sends the final reply, when a reply is asked for.
    async fn send_reply(producer: &Producer, name: &str, envelope: &Envelope, outcome: Return) {
        let Some(replyto) = &envelope.replyto else {
            debug!(
                consumer = name,
                sn = envelope.sn.as_str(),
                "No reply address; treating the call as fire-and-forget",
            );
            return;
        };

        let reply = Envelope::for_reply(&envelope.sn, envelope.any.clone(), outcome);

        Self::deliver(producer, name, replyto, &envelope.sn, reply).await;
    }

    /// Parses the reply address and sends. Failures are logged, never
    /// retried at this layer: the caller re-issues the request if it cares.
    async fn deliver(producer: &Producer, name: &str, replyto: &str, sn: &str, reply: Envelope) {
        let destination = match replyto.parse::<Destination>() {
            Ok(destination) => destination,
            Err(error) => {
                warn!(
                    consumer = name,
                    sn,
                    replyto,
                    ?error,
                    "Cannot reply to a malformed reply address",
                );
                return;
            }
        };

        if let Err(error) = producer.send(&destination, reply).await {
            warn!(
                consumer = name,
                sn,
                ?error,
                error_message = %error,
                "Failed to send a reply",
            );
        }
    }
}
