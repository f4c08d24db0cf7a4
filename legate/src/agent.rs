use crate::action::ActionRunner;
use crate::{AgentConfig, Identity, RecurringAction};
use legate_amqp::{Authenticator, ConnectionRegistry, UrlError};
use legate_core::AgentContext;
use legate_rmi::{Dispatcher, PendingError, PendingStore, RemoteRegistry, RequestConsumer};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::select;
use tracing::{info, warn};

/// How often the identity provider is polled while the agent is not yet
/// associated.
const IDENTITY_POLL: Duration = Duration::from_secs(90);

/// How long shutdown waits for registered workers to complete.
const SPINDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The composition root of the agent runtime.
///
/// An agent is assembled by the host from its configuration, an [`Identity`]
/// provider, the [`RemoteRegistry`] of handlers collected by the plugin
/// loader, and the list of [`RecurringAction`]s. [`start`](Agent::start)
/// wires everything together and returns an [`AgentHandle`]; the host keeps
/// the handle and calls [`shutdown`](AgentHandle::shutdown) when its own
/// signal handling says so — the agent owns neither signals nor PID files.
pub struct Agent {
    config: AgentConfig,
    identity: Option<Arc<dyn Identity>>,
    remote: RemoteRegistry,
    actions: Vec<RecurringAction>,
    authenticator: Option<Arc<dyn Authenticator>>,
}

/// Assembles an [`Agent`] incrementally.
pub struct AgentBuilder {
    agent: Agent,
}

/// The host's grip on a started agent.
pub struct AgentHandle {
    context: AgentContext,
    registry: Arc<ConnectionRegistry>,
    uuid: Option<String>,
}

/// Represents a failure to start the agent.
#[derive(Error, Debug)]
pub enum AgentError {
    /// The configured broker URL is malformed.
    #[error(transparent)]
    Url(#[from] UrlError),
    /// The pending store could not be opened.
    #[error(transparent)]
    Pending(#[from] PendingError),
    /// Messaging is enabled but no identity provider was supplied.
    #[error("messaging is enabled but no identity provider is configured")]
    MissingIdentity,
    /// The context was terminated while start was still waiting (e.g. for
    /// the identity to be assigned).
    #[error("the agent was terminated before start completed")]
    Terminated,
}

impl Agent {
    /// Returns a builder seeded with the given configuration.
    pub fn builder(config: AgentConfig) -> AgentBuilder {
        AgentBuilder {
            agent: Agent {
                config,
                identity: None,
                remote: RemoteRegistry::builder().build(),
                actions: Vec::new(),
                authenticator: None,
            },
        }
    }

    /// Starts the agent: the recurring actions right away and, when
    /// messaging is configured, the request consumer on the durable queue
    /// named by the agent UUID.
    ///
    /// Blocks while polling the identity provider (every 90 seconds) until
    /// it yields a non-empty UUID.
    pub async fn start(self) -> Result<AgentHandle, AgentError> {
        let context = AgentContext::new();

        ActionRunner::start(self.actions, &context);

        let registry = Arc::new(ConnectionRegistry::new());

        let profile = match self.config.broker_profile()? {
            Some(profile) => profile,
            None => {
                warn!("Messaging is disabled; the agent runs recurring actions only");
                return Ok(AgentHandle {
                    context,
                    registry,
                    uuid: None,
                });
            }
        };

        let identity = self.identity.ok_or(AgentError::MissingIdentity)?;
        let uuid = match Self::await_identity(identity.as_ref(), &context).await {
            Some(uuid) => uuid,
            None => return Err(AgentError::Terminated),
        };

        let connector = registry.connector(&profile);
        let pending = Arc::new(PendingStore::open(
            &self.config.pending.dir,
            &uuid,
            self.config.pending.limit,
        )?);
        let dispatcher = Dispatcher::new(self.remote);

        let mut consumer = RequestConsumer::new(
            connector,
            &uuid,
            dispatcher,
            pending,
            context.clone(),
        )
        .with_threads(self.config.messaging.threads);
        if let Some(authenticator) = &self.authenticator {
            consumer = consumer.with_authenticator(Arc::clone(authenticator));
        }
        let _ = consumer.start();

        info!(agent = uuid.as_str(), "Agent started");

        Ok(AgentHandle {
            context,
            registry,
            uuid: Some(uuid),
        })
    }

    /// Polls the identity provider until it yields a non-empty UUID, or the
    /// context terminates.
    async fn await_identity(identity: &dyn Identity, context: &AgentContext) -> Option<String> {
        loop {
            if let Some(uuid) = identity.uuid().await {
                if !uuid.is_empty() {
                    return Some(uuid);
                }
            }

            info!("Agent identity not yet assigned");

            select! {
                biased;
                _ = context.terminated() => return None,
                _ = tokio::time::sleep(IDENTITY_POLL) => {}
            }
        }
    }
}

impl AgentBuilder {
    /// Supplies the identity provider.
    pub fn with_identity(mut self, identity: Arc<dyn Identity>) -> Self {
        self.agent.identity = Some(identity);
        self
    }

    /// Supplies the handler registry collected by the plugin loader.
    pub fn with_remote(mut self, remote: RemoteRegistry) -> Self {
        self.agent.remote = remote;
        self
    }

    /// Adds one recurring action.
    pub fn with_action(mut self, action: RecurringAction) -> Self {
        self.agent.actions.push(action);
        self
    }

    /// Supplies the whole list of recurring actions.
    pub fn with_actions(mut self, actions: Vec<RecurringAction>) -> Self {
        self.agent.actions = actions;
        self
    }

    /// Attaches a message-signing hook for the inbound side.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.agent.authenticator = Some(authenticator);
        self
    }

    /// Finishes the assembly.
    pub fn build(self) -> Agent {
        self.agent
    }
}

impl AgentHandle {
    /// Exposes the runtime context, e.g. for wiring client policies into
    /// the same lifecycle.
    pub fn context(&self) -> &AgentContext {
        &self.context
    }

    /// Exposes the connection registry, so clients hosted in the same
    /// process share broker connections with the agent.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Reports the agent UUID, when messaging is running.
    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    /// Terminates the runtime, waits (bounded) for the background workers
    /// to complete, and closes every broker connection.
    pub async fn shutdown(self) {
        self.context.terminate();

        if let Err(timeout) = self.context.spun_down(SPINDOWN_TIMEOUT).await {
            warn!(%timeout, "Shutdown left some workers behind");
        }

        self.registry.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticIdentity;

    #[tokio::test]
    async fn disabled_messaging_still_starts_and_shuts_down() {
        // Given: no messaging URL
        let agent = Agent::builder(AgentConfig::default()).build();

        // When
        let handle = agent.start().await.unwrap();

        // Then
        assert_eq!(handle.uuid(), None);

        // Finally
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn messaging_without_identity_is_refused() {
        // Given: a messaging URL but no identity provider
        let mut config = AgentConfig::default();
        config.messaging.url = Some("amqp://localhost/".to_string());
        let agent = Agent::builder(config).build();

        // When
        let error = match agent.start().await {
            Err(error) => error,
            Ok(_) => panic!("expected start to fail"),
        };

        // Then
        assert!(matches!(error, AgentError::MissingIdentity));
    }

    #[tokio::test]
    async fn identity_poll_honors_termination() {
        // Given: an identity that never materializes
        struct NeverIdentity;

        #[async_trait::async_trait]
        impl Identity for NeverIdentity {
            async fn uuid(&self) -> Option<String> {
                None
            }
        }

        let context = AgentContext::new();
        context.terminate();

        // When
        let uuid = Agent::await_identity(&NeverIdentity, &context).await;

        // Then
        assert_eq!(uuid, None);
    }

    #[tokio::test]
    async fn static_identity_resolves_immediately() {
        // Given
        let context = AgentContext::new();
        let identity = StaticIdentity::new("agent-uuid-1");

        // When
        let uuid = Agent::await_identity(&identity, &context).await;

        // Then
        assert_eq!(uuid.as_deref(), Some("agent-uuid-1"));
    }
}
