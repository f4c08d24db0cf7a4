use crate::BrokerProfile;
use lapin::{Channel, Connection, ConnectionProperties, Error as LapinError};
use legate_core::Backoff;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

/// A registry of [`Connector`]s keyed by broker URL.
///
/// Lookup-or-create is atomic: two tasks asking for the same URL get the same
/// connector (and thus share the underlying connection). The registry is an
/// explicit value constructed at startup and passed to whoever opens
/// endpoints; there is no process-wide instance.
pub struct ConnectionRegistry {
    connectors: SyncMutex<HashMap<String, Arc<Connector>>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            connectors: SyncMutex::new(HashMap::new()),
        }
    }

    /// Returns the [`Connector`] for the given profile, creating it on first
    /// use. The connector is keyed by the profile's
    /// [URL key](crate::BrokerUrl::key).
    pub fn connector(&self, profile: &BrokerProfile) -> Arc<Connector> {
        let key = profile.url().key();
        let mut connectors = self.connectors.lock();

        Arc::clone(
            connectors
                .entry(key)
                .or_insert_with(|| Arc::new(Connector::new(profile.clone()))),
        )
    }

    /// Removes and returns the connector for the given URL key, if present.
    /// Existing holders of the connector keep working; the next
    /// [`connector`](ConnectionRegistry::connector) call creates a fresh one.
    pub fn evict(&self, url_key: &str) -> Option<Arc<Connector>> {
        self.connectors.lock().remove(url_key)
    }

    /// Closes every registered connector and empties the registry.
    pub async fn close_all(&self) {
        let connectors = {
            let mut connectors = self.connectors.lock();
            connectors.drain().collect::<Vec<_>>()
        };

        for (_, connector) in connectors {
            connector.close().await;
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Maintains at most one live [`Connection`] to the broker named by its
/// [`BrokerProfile`] and hands out fresh multiplexed [`Channel`]s from it.
///
/// Reconnection is transparent: whenever a channel is requested and the
/// current connection cannot produce one, the connector re-establishes the
/// connection with an exponential backoff. After the profile's budget of
/// consecutive failed attempts is spent, the connector is marked failed and
/// every further [`session`](Connector::session) call fails loudly.
pub struct Connector {
    /// The globally unique name of this connector, for logging purposes.
    name: Arc<str>,
    profile: BrokerProfile,
    connection: AsyncMutex<Option<Connection>>,
    backoff: Backoff,
    defunct: AtomicBool,
}

/// Represents a failure to produce a broker session.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The connector has previously exhausted its retry budget.
    #[error("connection to '{url}' is marked failed; refusing to serve sessions")]
    Defunct {
        /// The broker URL key.
        url: String,
    },
    /// The retry budget was exhausted just now.
    #[error("failed to connect to '{url}' after {attempts} attempt(s)")]
    Exhausted {
        /// The broker URL key.
        url: String,
        /// How many attempts were made.
        attempts: usize,
    },
    /// The TLS material named by the profile could not be read.
    #[error("failed to read TLS material: {0}")]
    Tls(#[from] std::io::Error),
}

impl Connector {
    /// Creates a new connector for the given profile. No connection is
    /// attempted until the first [`session`](Connector::session) call.
    pub fn new(profile: BrokerProfile) -> Self {
        let name = Self::compose_name(&profile);
        let backoff = Backoff::new(profile.backoff());

        Self {
            name,
            profile,
            connection: AsyncMutex::new(None),
            backoff,
            defunct: AtomicBool::new(false),
        }
    }

    /// Composes a globally unique, human-readable name for this connector.
    fn compose_name(profile: &BrokerProfile) -> Arc<str> {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        Arc::from(format!(
            "amqp:connector:{}:{}",
            profile.url().host(),
            COUNTER.fetch_add(1, Ordering::Relaxed),
        ))
    }

    /// Reports the name of this connector.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exposes the profile of this connector.
    pub fn profile(&self) -> &BrokerProfile {
        &self.profile
    }

    /// Reports whether this connector has exhausted its retry budget.
    pub fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::Acquire)
    }
}

impl Connector {
    /// Returns a fresh multiplexed session (a [`Channel`]) on the current
    /// connection, transparently (re)connecting as needed.
    pub async fn session(&self) -> Result<Channel, ConnectError> {
        if self.is_defunct() {
            return Err(ConnectError::Defunct {
                url: self.profile.url().key(),
            });
        }

        // Grab the connection slot for the whole attempt sequence
        let mut connection_guard = self.connection.lock().await;
        let mut optional_connection = connection_guard.take();

        let budget = self.profile.connect_attempts();
        let mut attempts = 0usize;

        while attempts < budget {
            // Make sure there is a connection to work with
            let connection = match optional_connection.take() {
                Some(connection) => connection,
                None => {
                    attempts += 1;
                    match self.establish().await? {
                        Some(connection) => connection,
                        None => continue,
                    }
                }
            };

            // Try to open a channel on it
            match connection.create_channel().await {
                Ok(channel) => {
                    // Put the healthy connection back under lock
                    *connection_guard = Some(connection);
                    self.backoff.reset();

                    return Ok(channel);
                }
                Err(error) => {
                    warn!(
                        connector = self.name.as_ref(),
                        url = self.profile.url().key(),
                        ?error,
                        error_message = %error,
                        "Failed to create a channel; discarding the connection",
                    );

                    Self::discard(self.name.clone(), connection);
                    self.backoff.sleep_next().await;
                }
            }
        }

        // Budget spent: mark this connector failed for good
        self.defunct.store(true, Ordering::Release);

        Err(ConnectError::Exhausted {
            url: self.profile.url().key(),
            attempts,
        })
    }

    /// Closes the current connection, if any. Idempotent; transport errors
    /// are logged and swallowed.
    pub async fn close(&self) {
        let optional_connection = self.connection.lock().await.take();

        if let Some(connection) = optional_connection {
            info!(connector = self.name.as_ref(), "Closing the broker connection");
            Self::close_connection(&self.name, connection).await;
        }
    }

    /// Attempts one fresh connection. Returns `Ok(None)` on a transient
    /// failure (after sleeping out the backoff interval); only unreadable TLS
    /// material fails immediately.
    async fn establish(&self) -> Result<Option<Connection>, ConnectError> {
        // Wire lapin into the current tokio runtime
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        if !self.profile.host_validation() {
            // The rustls transport offers no relaxed-verification mode
            warn!(
                connector = self.name.as_ref(),
                "Hostname validation cannot be disabled on this transport; flag ignored",
            );
        }

        let dsn = self.profile.dsn();
        let result = if self.profile.carries_tls_material() {
            let tls = self.profile.tls()?;
            Connection::connect_with_config(dsn.unsecure(), properties, tls).await
        } else {
            Connection::connect(dsn.unsecure(), properties).await
        };

        match result {
            Ok(connection) => {
                info!(
                    connector = self.name.as_ref(),
                    url = self.profile.url().key(),
                    "Connected to the broker",
                );

                Ok(Some(connection))
            }
            Err(error) => {
                warn!(
                    connector = self.name.as_ref(),
                    url = self.profile.url().key(),
                    ?error,
                    error_message = %error,
                    "Failed to connect to the broker",
                );

                self.backoff.sleep_next().await;

                Ok(None)
            }
        }
    }

    /// Sends a bad connection off to be closed in the background.
    fn discard(name: Arc<str>, connection: Connection) {
        tokio::spawn(async move {
            Self::close_connection(&name, connection).await;
        });
    }

    /// Closes the given connection, logging the outcome.
    async fn close_connection(name: &str, connection: Connection) {
        let result = connection.close(0, "discarded connection").await;

        match result {
            Ok(()) => info!(connector = name, "Closed a broker connection"),
            Err(LapinError::InvalidConnectionState(_)) => {
                info!(connector = name, "Discarded a previously lost broker connection")
            }
            Err(error) => warn!(
                connector = name,
                ?error,
                error_message = %error,
                "Failed to cleanly close a broker connection",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn profile(url: &str) -> BrokerProfile {
        BrokerProfile::new(url.parse().unwrap())
    }

    #[test]
    fn same_url_yields_the_same_connector() {
        // Given
        let registry = ConnectionRegistry::new();

        // When
        let first = registry.connector(&profile("amqp://localhost/"));
        let second = registry.connector(&profile("amqp://localhost/"));

        // Then
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn different_urls_yield_different_connectors() {
        // Given
        let registry = ConnectionRegistry::new();

        // When
        let first = registry.connector(&profile("amqp://host-a/"));
        let second = registry.connector(&profile("amqp://host-b/"));

        // Then
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn eviction_forces_a_fresh_connector() {
        // Given
        let registry = ConnectionRegistry::new();
        let url = profile("amqp://localhost/");
        let first = registry.connector(&url);

        // When
        let evicted = registry.evict(&url.url().key());
        let second = registry.connector(&url);

        // Then
        assert!(evicted.is_some());
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn defunct_connector_fails_loudly() {
        // Given
        let connector = Connector::new(profile("amqp://localhost/"));
        connector.defunct.store(true, Ordering::Release);

        // When
        let error = connector.session().await.unwrap_err();

        // Then
        assert!(matches!(error, ConnectError::Defunct { .. }));
    }

    #[tokio::test]
    async fn exhausted_budget_marks_the_connector_defunct() {
        // Given: a port that nothing listens on, a tight budget, a tiny backoff
        let profile = profile("amqp://127.0.0.1:1/")
            .with_connect_attempts(2)
            .with_backoff(legate_core::BackoffConfig {
                initial_interval: std::time::Duration::from_millis(1),
                max_interval: std::time::Duration::from_millis(2),
                multiplier: 1.0,
                randomization_factor: 0.0,
            });
        let connector = Connector::new(profile);

        // When
        let error = connector.session().await.unwrap_err();

        // Then
        match error {
            ConnectError::Exhausted { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected Exhausted, got {:?}", other),
        }
        assert!(connector.is_defunct());
    }
}
