use crate::{
    Authenticator, CodecError, ConnectError, Connector, Endpoint, Envelope, ValidationFailed,
};
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::Consumer as LapinConsumer;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long to back off after an unexpected transport error before reporting
/// an empty fetch to the caller.
const TRANSPORT_BACKOFF: Duration = Duration::from_secs(10);

/// Fetches messages from a single queue, one at a time, with explicit
/// acknowledgement.
///
/// The receiver is opened lazily and idempotently: concurrent callers
/// coalesce on one consumer behind a mutex. Three fetching granularities are
/// offered: [`get`](Reader::get) yields the raw delivery,
/// [`next`](Reader::next) decodes and validates an [`Envelope`] and pairs it
/// with its [`Ack`], and [`search`](Reader::search) scans for the envelope
/// with a particular serial number, acknowledging and discarding everything
/// else along the way.
///
/// A search-consumed queue must have a single consumer at a time, or
/// correlation is not defined; reply queues are therefore either per-call
/// (synchronous callers) or consumed by exactly one monitor (asynchronous
/// callers).
pub struct Reader {
    endpoint: Endpoint,
    queue: String,
    durable: bool,
    consumer: AsyncMutex<Option<LapinConsumer>>,
}

/// The pending acknowledgement of one fetched envelope. The consumer calls
/// [`ack`](Ack::ack) after it is done processing, successfully or not.
pub struct Ack {
    reader: Arc<str>,
    delivery: Delivery,
}

/// Represents a failure to read an envelope.
#[derive(Error, Debug)]
pub enum ReadError {
    /// No broker session could be produced.
    #[error(transparent)]
    Connect(#[from] ConnectError),
    /// A declaration or subscription failed on the wire.
    #[error("failed to open a reader: {0}")]
    Transport(#[from] lapin::Error),
    /// The message failed authentication; it has been acknowledged and
    /// dropped.
    #[error(transparent)]
    Validation(#[from] ValidationFailed),
    /// The message did not decode as an envelope; it has been acknowledged
    /// and dropped.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The message decoded, but is not a usable envelope; it has been
    /// acknowledged and dropped.
    #[error("invalid envelope: {reason}")]
    Invalid {
        /// Why the envelope was rejected.
        reason: String,
    },
}

impl Reader {
    /// Creates a reader on the given queue. The queue is declared durable;
    /// use [`volatile`](Reader::volatile) for auto-deleted reply queues.
    pub fn new(connector: Arc<Connector>, queue: impl AsRef<str>) -> Self {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        let queue = queue.as_ref().to_string();
        let id = format!(
            "amqp:reader:{}:{}",
            queue,
            COUNTER.fetch_add(1, Ordering::Relaxed),
        );

        Self {
            endpoint: Endpoint::new(connector, id),
            queue,
            durable: true,
            consumer: AsyncMutex::new(None),
        }
    }

    /// Declares the queue non-durable and auto-deleted, as befits a private
    /// reply queue.
    pub fn volatile(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Attaches a message-signing hook.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.endpoint = self.endpoint.with_authenticator(authenticator);
        self
    }

    /// Reports the identity of this reader's endpoint.
    pub fn id(&self) -> &str {
        self.endpoint.id()
    }

    /// Reports the queue this reader consumes.
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

impl Reader {
    /// Declares the queue and opens the receiver. Idempotent: concurrent
    /// calls coalesce on the first opened consumer.
    pub async fn open(&self) -> Result<(), ReadError> {
        let mut consumer_guard = self.consumer.lock().await;

        if consumer_guard.is_none() {
            *consumer_guard = Some(self.subscribe().await?);
        }

        Ok(())
    }

    /// Performs a single blocking fetch with the given timeout.
    ///
    /// An empty outcome returns `None` without error. A message that fails
    /// authentication is acknowledged and the failure is raised. Unexpected
    /// transport errors are logged, backed off for ten seconds, and reported
    /// as an empty fetch so the caller's loop keeps going.
    pub async fn get(&self, timeout: Duration) -> Result<Option<Delivery>, ReadError> {
        // Take the consumer out of its slot for the duration of the fetch
        let mut consumer_guard = self.consumer.lock().await;
        let mut consumer = match consumer_guard.take() {
            Some(consumer) => consumer,
            None => self.subscribe().await?,
        };

        let fetched = tokio::time::timeout(timeout, consumer.next()).await;

        let delivery = match fetched {
            // Timed out: empty fetch; the consumer is still healthy
            Err(_elapsed) => {
                *consumer_guard = Some(consumer);
                return Ok(None);
            }

            // The consumer stream ended; drop it so the next call re-opens
            Ok(None) => {
                debug!(reader = self.endpoint.id(), "Receiver ran out of messages");
                return Ok(None);
            }

            // Transport error: log, back off, report empty
            Ok(Some(Err(error))) => {
                warn!(
                    reader = self.endpoint.id(),
                    ?error,
                    error_message = %error,
                    "Transport error while fetching; backing off",
                );
                self.endpoint.reset().await;
                tokio::time::sleep(TRANSPORT_BACKOFF).await;
                return Ok(None);
            }

            Ok(Some(Ok(delivery))) => {
                *consumer_guard = Some(consumer);
                delivery
            }
        };

        // Authenticate before handing the message over
        if let Some(authenticator) = self.endpoint.authenticator() {
            if let Err(failure) = authenticator.validate(&delivery.data) {
                self.ack_rejected(&delivery).await;
                return Err(ReadError::Validation(failure));
            }
        }

        Ok(Some(delivery))
    }

    /// Fetches, decodes, and validates the next [`Envelope`], pairing it with
    /// the [`Ack`] the consumer must call after processing.
    ///
    /// The broker-level `subject` and `ttl` properties are carried across
    /// onto the envelope.
    pub async fn next(&self, timeout: Duration) -> Result<Option<(Envelope, Ack)>, ReadError> {
        let delivery = match self.get(timeout).await? {
            Some(delivery) => delivery,
            None => return Ok(None),
        };

        let mut envelope = match Envelope::decode(&delivery.data) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.ack_rejected(&delivery).await;
                return Err(ReadError::Codec(error));
            }
        };

        if envelope.sn.is_empty() {
            self.ack_rejected(&delivery).await;
            return Err(ReadError::Invalid {
                reason: "envelope carries no serial number".to_string(),
            });
        }

        // Carry broker properties across
        if let Some(subject) = delivery.properties.kind() {
            envelope.subject = Some(subject.to_string());
        }
        if let Some(expiration) = delivery.properties.expiration() {
            if let Ok(millis) = expiration.as_str().parse::<u64>() {
                envelope.ttl = Some(millis / 1000);
            }
        }

        debug!(
            reader = self.endpoint.id(),
            sn = envelope.sn.as_str(),
            "Read an envelope",
        );

        let ack = Ack {
            reader: Arc::from(self.endpoint.id()),
            delivery,
        };

        Ok(Some((envelope, ack)))
    }

    /// Scans the queue for the envelope with the given serial number, within
    /// the given overall timeout.
    ///
    /// Envelopes with any other serial number are acknowledged and discarded.
    /// The matching envelope, when found, is likewise acknowledged before
    /// being returned (every caller of this method processes the match
    /// in-memory and never re-queues it).
    pub async fn search(
        &self,
        sn: &str,
        timeout: Duration,
    ) -> Result<Option<Envelope>, ReadError> {
        debug!(reader = self.endpoint.id(), sn, "Searching for a reply");

        let deadline = Instant::now() + timeout;
        let mut first_pass = true;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() && !first_pass {
                return Ok(None);
            }
            first_pass = false;

            let (envelope, ack) = match self.next(remaining).await? {
                Some(found) => found,
                None => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    continue;
                }
            };

            if envelope.sn == sn {
                ack.ack().await;
                return Ok(Some(envelope));
            }

            debug!(
                reader = self.endpoint.id(),
                expected = sn,
                discarded = envelope.sn.as_str(),
                "Discarded a non-matching envelope",
            );
            ack.ack().await;
        }
    }

    /// Closes this reader and deletes its queue, best-effort. Meant for
    /// private per-call reply queues on their way out.
    pub async fn discard(&self) {
        self.close().await;

        if let Ok(channel) = self.endpoint.connector().session().await {
            let result = channel
                .queue_delete(&self.queue, QueueDeleteOptions::default())
                .await;

            if let Err(error) = result {
                warn!(
                    reader = self.endpoint.id(),
                    queue = self.queue.as_str(),
                    ?error,
                    error_message = %error,
                    "Failed to delete a reply queue",
                );
            }
        }
    }

    /// Cancels the receiver and closes the endpoint. Idempotent; transport
    /// errors are logged and swallowed.
    pub async fn close(&self) {
        let optional_consumer = self.consumer.lock().await.take();

        if let Some(consumer) = optional_consumer {
            if let Ok(channel) = self.endpoint.session().await {
                let result = channel
                    .basic_cancel(consumer.tag().as_str(), BasicCancelOptions::default())
                    .await;

                if let Err(error) = result {
                    warn!(
                        reader = self.endpoint.id(),
                        ?error,
                        error_message = %error,
                        "Failed to cancel a receiver",
                    );
                }
            }
        }

        self.endpoint.close().await;
    }

    /// Declares the queue and starts consuming it.
    async fn subscribe(&self) -> Result<LapinConsumer, ReadError> {
        let channel = self.endpoint.session().await?;

        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    passive: false,
                    durable: self.durable,
                    exclusive: false,
                    auto_delete: !self.durable,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;

        let consumer = channel
            .basic_consume(
                &self.queue,
                self.endpoint.id(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(consumer)
    }

    /// Acknowledges a message that is being dropped before processing
    /// (failed authentication or failed decoding), so it is not redelivered.
    async fn ack_rejected(&self, delivery: &Delivery) {
        if let Err(error) = self.endpoint.ack(delivery).await {
            warn!(
                reader = self.endpoint.id(),
                ?error,
                error_message = %error,
                "Failed to acknowledge a rejected message",
            );
        }
    }
}

impl Ack {
    /// Acknowledges the underlying message. Failures are logged, not raised:
    /// at-least-once delivery means an unacknowledged message is simply
    /// redelivered later.
    pub async fn ack(self) {
        let result = self.delivery.acker.ack(BasicAckOptions::default()).await;

        if let Err(error) = result {
            warn!(
                reader = self.reader.as_ref(),
                ?error,
                error_message = %error,
                "Failed to acknowledge a message",
            );
        }
    }
}
