use crate::{
    Authenticator, CodecError, ConnectError, Connector, Destination, Endpoint, Envelope,
    ValidationFailed, WIRE_VERSION,
};
use lapin::options::BasicPublishOptions;
use lapin::types::ShortString;
use lapin::BasicProperties;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Sends [`Envelope`]s to a named [`Destination`].
///
/// The producer owns the envelope's outbound bookkeeping: it stamps the
/// protocol [version](WIRE_VERSION), assigns a fresh serial number when the
/// draft does not carry one, copies the serial number into the broker's
/// correlation field, and maps the envelope `ttl` onto the per-message
/// expiration. The assigned serial number is returned to the caller.
pub struct Producer {
    endpoint: Endpoint,
}

/// Represents a failure to send an envelope.
#[derive(Error, Debug)]
pub enum SendError {
    /// The envelope did not encode.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// No broker session could be produced.
    #[error(transparent)]
    Connect(#[from] ConnectError),
    /// The publish itself failed on the wire.
    #[error("failed to publish an envelope: {0}")]
    Transport(#[from] lapin::Error),
    /// The attached authenticator refused to sign the envelope.
    #[error(transparent)]
    Sign(#[from] ValidationFailed),
}

impl Producer {
    /// Creates a new producer on the given connector.
    pub fn new(connector: Arc<Connector>) -> Self {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        let id = format!("amqp:producer:{}", COUNTER.fetch_add(1, Ordering::Relaxed));

        Self {
            endpoint: Endpoint::new(connector, id),
        }
    }

    /// Attaches a message-signing hook.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.endpoint = self.endpoint.with_authenticator(authenticator);
        self
    }

    /// Reports the identity of this producer's endpoint.
    pub fn id(&self) -> &str {
        self.endpoint.id()
    }

    /// Exposes the connector backing this producer.
    pub fn connector(&self) -> &Arc<Connector> {
        self.endpoint.connector()
    }

    /// Sends the given draft envelope to the given destination and returns
    /// its serial number.
    ///
    /// The serial number is assigned here, exactly once, when the draft does
    /// not already carry one; replies and re-sends that do carry one keep it
    /// verbatim.
    pub async fn send(
        &self,
        destination: &Destination,
        mut envelope: Envelope,
    ) -> Result<String, SendError> {
        envelope.version = WIRE_VERSION.to_string();
        if envelope.sn.is_empty() {
            envelope.sn = Uuid::new_v4().to_string();
        }
        let sn = envelope.sn.clone();

        // Encode (and sign, when an authenticator is attached)
        let mut bytes = envelope.encode()?;
        if let Some(authenticator) = self.endpoint.authenticator() {
            bytes = authenticator.sign(bytes)?;
        }

        // Mirror the correlation metadata into broker properties
        let mut properties = BasicProperties::default()
            .with_correlation_id(ShortString::from(sn.clone()));
        if let Some(replyto) = &envelope.replyto {
            properties = properties.with_reply_to(ShortString::from(replyto.clone()));
        }
        if let Some(ttl) = envelope.ttl {
            // Per-message expiration is in milliseconds
            properties =
                properties.with_expiration(ShortString::from((ttl * 1000).to_string()));
        }

        let channel = self.endpoint.session().await?;
        let (exchange, routing_key) = destination.address_parts();

        let result = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &bytes,
                properties,
            )
            .await;

        match result {
            Ok(_confirm) => {
                debug!(
                    producer = self.endpoint.id(),
                    destination = %destination,
                    sn = sn.as_str(),
                    "Sent an envelope",
                );

                Ok(sn)
            }
            Err(error) => {
                // The channel is suspect; fetch a fresh one next time
                self.endpoint.reset().await;

                Err(SendError::Transport(error))
            }
        }
    }

    /// Closes the underlying endpoint.
    pub async fn close(&self) {
        self.endpoint.close().await;
    }
}
