use crate::{Authenticator, ConnectError, Connector};
use lapin::message::Delivery;
use lapin::options::BasicAckOptions;
use lapin::Channel;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

/// The base of every producer and reader: a named party on the broker that
/// owns (at most) one channel obtained from a shared [`Connector`], plus an
/// optional [`Authenticator`].
///
/// The channel is opened lazily and cached; [`reset`](Endpoint::reset) drops
/// it so the next [`session`](Endpoint::session) call fetches a fresh one
/// (the usual move after a transport error). [`close`](Endpoint::close)
/// releases the channel regardless of its state.
pub struct Endpoint {
    /// The identity of this endpoint, derived from its destination.
    id: Arc<str>,
    connector: Arc<Connector>,
    authenticator: Option<Arc<dyn Authenticator>>,
    channel: AsyncMutex<Option<Channel>>,
}

impl Endpoint {
    /// Creates an endpoint with the given identity on the given connector.
    pub fn new(connector: Arc<Connector>, id: impl AsRef<str>) -> Self {
        Self {
            id: Arc::from(id.as_ref()),
            connector,
            authenticator: None,
            channel: AsyncMutex::new(None),
        }
    }

    /// Attaches a message-signing hook to this endpoint.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Reports the identity of this endpoint.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Exposes the connector backing this endpoint.
    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    /// Exposes the attached authenticator, if any.
    pub fn authenticator(&self) -> Option<&Arc<dyn Authenticator>> {
        self.authenticator.as_ref()
    }

    /// Returns the channel of this endpoint, opening one on first use.
    pub async fn session(&self) -> Result<Channel, ConnectError> {
        let mut channel_guard = self.channel.lock().await;

        match channel_guard.as_ref() {
            Some(channel) => Ok(channel.clone()),
            None => {
                let channel = self.connector.session().await?;
                *channel_guard = Some(channel.clone());

                debug!(endpoint = self.id.as_ref(), "Opened a channel");

                Ok(channel)
            }
        }
    }

    /// Acknowledges the given delivery.
    pub async fn ack(&self, delivery: &Delivery) -> Result<(), lapin::Error> {
        delivery.acker.ack(BasicAckOptions::default()).await
    }

    /// Drops the cached channel so the next [`session`](Endpoint::session)
    /// call fetches a fresh one.
    pub async fn reset(&self) {
        self.channel.lock().await.take();
    }

    /// Closes the channel of this endpoint. Idempotent; transport errors are
    /// logged and swallowed.
    pub async fn close(&self) {
        let optional_channel = self.channel.lock().await.take();

        if let Some(channel) = optional_channel {
            if let Err(error) = channel.close(0, "endpoint closed").await {
                warn!(
                    endpoint = self.id.as_ref(),
                    ?error,
                    error_message = %error,
                    "Failed to cleanly close a channel",
                );
            }
        }
    }
}
