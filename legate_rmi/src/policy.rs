use crate::Watchdog;
use legate_amqp::{
    Connector, Destination, Envelope, Producer, ReadError, Reader, Request, Return, SendError,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// A request timeout, as either a scalar (applied to both phases) or a pair
/// `(T_started, T_final)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutSpec {
    /// One bound for both the STARTED and the FINAL phase.
    Scalar(u64),
    /// Separate bounds for the STARTED and the FINAL phase.
    Pair(u64, u64),
}

impl TimeoutSpec {
    /// Normalizes this spec into the `(T_started, T_final)` pair.
    pub fn normalized(self) -> (u64, u64) {
        match self {
            Self::Scalar(timeout) => (timeout, timeout),
            Self::Pair(started, finished) => (started, finished),
        }
    }
}

/// Represents a failed remote call, as seen by the caller.
#[derive(Error, Debug)]
pub enum CallError {
    /// No reply arrived within the phase bound. Phase `0` is STARTED, phase
    /// `1` is FINAL.
    #[error("request {sn} timed out (phase {index})")]
    RequestTimeout {
        /// The request serial number.
        sn: String,
        /// The phase that timed out.
        index: u8,
    },
    /// The remote handler failed; this is the local materialization of the
    /// failed [`Return`].
    #[error(transparent)]
    Remote(#[from] RemoteException),
    /// The request could not be sent.
    #[error(transparent)]
    Send(#[from] SendError),
    /// The reply queue could not be read.
    #[error(transparent)]
    Read(#[from] ReadError),
    /// A single-shot [`Trigger`] was fired a second time.
    #[error("trigger for request {sn} has already been fired")]
    TriggerAlreadyFired {
        /// The request serial number.
        sn: String,
    },
}

/// The client-side materialization of a failed [`Return`]: the remote kind,
/// message, and trace text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct RemoteException {
    /// The remote failure kind.
    pub kind: String,
    /// The remote failure message.
    pub message: String,
    /// The remote trace text, when carried.
    pub trace: Option<String>,
    /// The remote module path, when carried.
    pub module: String,
}

impl RemoteException {
    fn from_return(outcome: &Return) -> Self {
        match outcome {
            Return::Succeeded { .. } => Self {
                kind: String::new(),
                message: "remote call succeeded".to_string(),
                trace: None,
                module: String::new(),
            },
            Return::Failed {
                exval,
                xmodule,
                xclass,
                xstate,
                ..
            } => Self {
                kind: xclass.clone(),
                message: exval.clone(),
                trace: xstate
                    .get("trace")
                    .and_then(|trace| trace.as_str())
                    .map(str::to_string),
                module: xmodule.clone(),
            },
        }
    }
}

/// Unpacks a final [`Return`] into the caller's result.
fn unpack(outcome: &Return) -> Result<Value, CallError> {
    match outcome.retval() {
        Some(retval) => Ok(retval.clone()),
        None => Err(CallError::Remote(RemoteException::from_return(outcome))),
    }
}

/// The synchronous delivery policy: send the request, then block until the
/// reply arrives on a private, per-call reply queue.
///
/// The conversation has two phases, each with its own bound: first the
/// STARTED acknowledgement (bounded by `T_started`, which also serves as the
/// request's TTL), then the FINAL result (bounded by `T_final`). A FINAL
/// reply arriving in the STARTED phase completes the call early; a server is
/// never required to emit STARTED at all. Either phase expiring raises
/// [`CallError::RequestTimeout`] with the phase index.
///
/// The private reply queue is named by a fresh UUID, declared non-durable,
/// and deleted on the way out in every path.
pub struct Synchronous {
    connector: Arc<Connector>,
    producer: Producer,
    timeout: (u64, u64),
}

impl Synchronous {
    /// The default `(T_started, T_final)` bounds, in seconds.
    pub const TIMEOUT: (u64, u64) = (10, 90);

    /// Creates a synchronous policy on the given connector with the default
    /// timeouts.
    pub fn new(connector: Arc<Connector>) -> Self {
        let producer = Producer::new(Arc::clone(&connector));

        Self {
            connector,
            producer,
            timeout: Self::TIMEOUT,
        }
    }

    /// Sets the timeouts.
    pub fn with_timeout(mut self, timeout: TimeoutSpec) -> Self {
        self.timeout = timeout.normalized();
        self
    }

    /// Sends the given request to the given destination and blocks until the
    /// final result arrives (or a phase times out). Returns the remote return
    /// value, or raises the remote failure as a [`RemoteException`].
    pub async fn send(
        &self,
        destination: &Destination,
        request: Request,
        any: Value,
    ) -> Result<Value, CallError> {
        // A fresh private reply queue for this one call
        let reply_queue = Uuid::new_v4().to_string();
        let reader = Reader::new(Arc::clone(&self.connector), &reply_queue).volatile();

        // Declare the reply queue before sending, so no reply can be lost
        if let Err(error) = reader.open().await {
            reader.discard().await;
            return Err(error.into());
        }

        let draft = Envelope::for_request(request)
            .with_any(any)
            .with_replyto(&reply_queue)
            .with_ttl(self.timeout.0);

        let sn = match self.producer.send(destination, draft).await {
            Ok(sn) => sn,
            Err(error) => {
                reader.discard().await;
                return Err(error.into());
            }
        };

        debug!(
            destination = %destination,
            sn = sn.as_str(),
            "Sent a synchronous request",
        );

        let outcome = self.converse(&reader, &sn).await;

        // Clean up the private queue in every path
        reader.discard().await;

        outcome
    }

    /// Runs the two-phase reply conversation.
    async fn converse(&self, reader: &Reader, sn: &str) -> Result<Value, CallError> {
        // Phase 0: await STARTED (or an early FINAL)
        let envelope = reader
            .search(sn, Duration::from_secs(self.timeout.0))
            .await?;

        let envelope = match envelope {
            Some(envelope) => envelope,
            None => {
                return Err(CallError::RequestTimeout {
                    sn: sn.to_string(),
                    index: 0,
                });
            }
        };

        if let Some(result) = &envelope.result {
            // The reply skipped STARTED and went straight to the result
            return unpack(result);
        }

        debug!(sn, "Request started");

        // Phase 1: await FINAL. A stray duplicate STARTED is acknowledged
        // and ignored; only a result-bearing envelope concludes the call.
        let deadline = Instant::now() + Duration::from_secs(self.timeout.1);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());

            let envelope = match reader.search(sn, remaining).await? {
                Some(envelope) => envelope,
                None => {
                    return Err(CallError::RequestTimeout {
                        sn: sn.to_string(),
                        index: 1,
                    });
                }
            };

            if let Some(result) = &envelope.result {
                return unpack(result);
            }

            if remaining.is_zero() {
                return Err(CallError::RequestTimeout {
                    sn: sn.to_string(),
                    index: 1,
                });
            }
        }
    }
}

/// The asynchronous delivery policy: fire the request and correlate the
/// reply later, through a shared reply queue named by the correlation tag
/// (`ctag`).
///
/// In deferred mode the policy hands back a single-shot [`Trigger`] instead
/// of sending; the caller fires it when ready. When a [`Watchdog`] and both
/// timeouts are configured (and the request asks for a reply), every fired
/// request is registered for timeout tracking.
pub struct Asynchronous {
    producer: Arc<Producer>,
    ctag: Option<Arc<str>>,
    timeout: (Option<u64>, Option<u64>),
    deferred: bool,
    watchdog: Option<Watchdog>,
}

/// What an asynchronous send produced: serial numbers for fired requests, or
/// triggers awaiting the caller in deferred mode.
#[derive(Debug)]
pub enum Sent {
    /// The request was fired; here is its serial number.
    Sn(String),
    /// Deferred mode: fire this trigger to send the request.
    Trigger(Trigger),
    /// The broadcast was fired; here are the serial numbers, one per
    /// destination.
    Sns(Vec<String>),
    /// Deferred mode: one trigger per destination.
    Triggers(Vec<Trigger>),
}

impl Asynchronous {
    /// Creates an asynchronous policy over the given producer, with no
    /// correlation tag, no timeouts, and no watchdog.
    pub fn new(producer: Producer) -> Self {
        Self {
            producer: Arc::new(producer),
            ctag: None,
            timeout: (None, None),
            deferred: false,
            watchdog: None,
        }
    }

    /// Sets the correlation tag, which names the shared reply queue.
    pub fn with_ctag(mut self, ctag: impl AsRef<str>) -> Self {
        self.ctag = Some(Arc::from(ctag.as_ref()));
        self
    }

    /// Sets the timeouts.
    pub fn with_timeout(mut self, timeout: TimeoutSpec) -> Self {
        let (started, finished) = timeout.normalized();
        self.timeout = (Some(started), Some(finished));
        self
    }

    /// Switches the policy into deferred mode: sends return [`Trigger`]s
    /// instead of firing immediately.
    pub fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }

    /// Attaches a watchdog for timeout tracking.
    pub fn with_watchdog(mut self, watchdog: Watchdog) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Sends the given request to the given destination (or defers it behind
    /// a trigger). Returns the serial number of the fired request, or the
    /// trigger in deferred mode.
    pub async fn send(
        &self,
        destination: &Destination,
        request: Request,
        any: Value,
    ) -> Result<Sent, CallError> {
        let trigger = self.trigger(destination.clone(), request, any);

        if self.deferred {
            return Ok(Sent::Trigger(trigger));
        }

        let sn = trigger.fire().await?;

        Ok(Sent::Sn(sn))
    }

    /// Sends the given request to every destination (or defers the whole
    /// batch). Returns one serial number (or one trigger) per destination,
    /// in the given order.
    pub async fn broadcast(
        &self,
        destinations: &[Destination],
        request: Request,
        any: Value,
    ) -> Result<Sent, CallError> {
        let triggers = destinations
            .iter()
            .map(|destination| self.trigger(destination.clone(), request.clone(), any.clone()))
            .collect::<Vec<_>>();

        if self.deferred {
            return Ok(Sent::Triggers(triggers));
        }

        let mut sns = Vec::with_capacity(triggers.len());
        for trigger in &triggers {
            sns.push(trigger.fire().await?);
        }

        Ok(Sent::Sns(sns))
    }

    fn trigger(&self, destination: Destination, request: Request, any: Value) -> Trigger {
        Trigger {
            producer: Arc::clone(&self.producer),
            ctag: self.ctag.clone(),
            timeout: self.timeout,
            watchdog: self.watchdog.clone(),
            destination,
            request,
            any,
            sn: Uuid::new_v4().to_string(),
            fired: AtomicBool::new(false),
        }
    }
}

/// A single-shot deferred send.
///
/// The one-shot guarantee is enforced by an atomic compare-and-set: under
/// concurrency, exactly one [`fire`](Trigger::fire) wins and every other
/// call fails with [`CallError::TriggerAlreadyFired`]. A fire that fails on
/// the wire still consumes the trigger.
pub struct Trigger {
    producer: Arc<Producer>,
    ctag: Option<Arc<str>>,
    timeout: (Option<u64>, Option<u64>),
    watchdog: Option<Watchdog>,
    destination: Destination,
    request: Request,
    any: Value,
    sn: String,
    fired: AtomicBool,
}

impl Trigger {
    /// Reports the serial number this trigger will send under.
    pub fn sn(&self) -> &str {
        &self.sn
    }

    /// Fires the deferred request. Returns the serial number on success.
    pub async fn fire(&self) -> Result<String, CallError> {
        let won = self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if !won {
            return Err(CallError::TriggerAlreadyFired {
                sn: self.sn.clone(),
            });
        }

        // The shared reply queue is named by the correlation tag
        let replyto = self
            .ctag
            .as_ref()
            .map(|ctag| Destination::queue(ctag.as_ref()).to_string());

        let mut draft = Envelope::for_request(self.request.clone())
            .with_sn(&self.sn)
            .with_any(self.any.clone());
        if let Some(replyto) = &replyto {
            draft = draft.with_replyto(replyto);
        }
        if let Some(started) = self.timeout.0 {
            draft = draft.with_ttl(started);
        }

        let sn = self.producer.send(&self.destination, draft).await?;

        debug!(
            destination = %self.destination,
            sn = sn.as_str(),
            "Fired an asynchronous request",
        );

        self.notify_watchdog(&sn, replyto.as_deref());

        Ok(sn)
    }

    /// Registers the request with the watchdog, provided *everything* needed
    /// for tracking is present: a reply address, a correlation tag, both
    /// timeouts, and the watchdog itself.
    fn notify_watchdog(&self, sn: &str, replyto: Option<&str>) {
        if let (Some(replyto), Some(_ctag), (Some(started), Some(finished)), Some(watchdog)) =
            (replyto, &self.ctag, self.timeout, &self.watchdog)
        {
            watchdog.track(sn, replyto, self.any.clone(), (started, finished));
        }
    }
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("sn", &self.sn)
            .field("destination", &self.destination)
            .field("fired", &self.fired.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use legate_amqp::{BrokerProfile, ConnectionRegistry};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn producer() -> Producer {
        let registry = ConnectionRegistry::new();
        let profile = BrokerProfile::new("amqp://localhost/".parse().unwrap());

        Producer::new(registry.connector(&profile))
    }

    #[test]
    fn scalar_timeout_applies_to_both_phases() {
        assert_eq!(TimeoutSpec::Scalar(30).normalized(), (30, 30));
        assert_eq!(TimeoutSpec::Pair(10, 90).normalized(), (10, 90));
    }

    #[tokio::test]
    async fn deferred_send_returns_a_trigger_without_sending() {
        // Given
        let policy = Asynchronous::new(producer()).with_ctag("c1").deferred();

        // When: no broker anywhere, yet this must succeed (nothing is sent)
        let sent = policy
            .send(
                &Destination::queue("agent-1"),
                Request::function("echo"),
                json!(null),
            )
            .await
            .unwrap();

        // Then
        match sent {
            Sent::Trigger(trigger) => assert!(!trigger.sn().is_empty()),
            other => panic!("expected a trigger, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn deferred_broadcast_returns_one_trigger_per_destination() {
        // Given
        let policy = Asynchronous::new(producer()).deferred();
        let destinations = [
            Destination::queue("agent-1"),
            Destination::queue("agent-2"),
            Destination::queue("agent-3"),
        ];

        // When
        let sent = policy
            .broadcast(&destinations, Request::function("echo"), json!(null))
            .await
            .unwrap();

        // Then: distinct serial numbers, one per destination
        match sent {
            Sent::Triggers(triggers) => {
                assert_eq!(triggers.len(), 3);
                assert!(triggers[0].sn() != triggers[1].sn());
                assert!(triggers[1].sn() != triggers[2].sn());
            }
            other => panic!("expected triggers, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn trigger_is_single_shot() {
        // Given: a trigger whose shot has already been spent
        let policy = Asynchronous::new(producer()).deferred();
        let sent = policy
            .send(
                &Destination::queue("agent-1"),
                Request::function("echo"),
                json!(null),
            )
            .await
            .unwrap();
        let trigger = match sent {
            Sent::Trigger(trigger) => trigger,
            other => panic!("expected a trigger, got {:?}", other),
        };
        trigger.fired.store(true, Ordering::Release);

        // When
        let error = trigger.fire().await.unwrap_err();

        // Then
        assert!(matches!(error, CallError::TriggerAlreadyFired { .. }));
    }

    #[test]
    fn remote_exception_materializes_the_failed_return() {
        // Given
        let outcome = Return::exception("ValueError", "bad", Some("trace".to_string()));

        // When
        let error = unpack(&outcome).unwrap_err();

        // Then
        match error {
            CallError::Remote(remote) => {
                assert_eq!(remote.kind, "ValueError");
                assert_eq!(remote.message, "bad");
                assert_eq!(remote.trace, Some("trace".to_string()));
            }
            other => panic!("expected a remote exception, got {:?}", other),
        }
    }
}
