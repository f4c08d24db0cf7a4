use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// A broker-native address: either a plain queue, or an exchange paired with
/// a routing key.
///
/// The string form is what travels in the `replyto` field of an envelope: a
/// bare queue name, or `exchange/routing_key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// A plain queue, addressed through the default exchange.
    Queue(String),
    /// An exchange with a routing key.
    Exchange {
        /// The exchange name.
        exchange: String,
        /// The routing key.
        routing_key: String,
    },
}

/// Represents a malformed destination address.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DestinationError {
    /// The address was empty.
    #[error("destination address is empty")]
    Empty,
    /// The address named an exchange but no routing key, or vice versa.
    #[error("destination address '{0}' has an empty exchange or routing key")]
    Lopsided(String),
}

impl Destination {
    /// Creates a queue destination.
    pub fn queue(name: impl AsRef<str>) -> Self {
        Self::Queue(name.as_ref().to_string())
    }

    /// Creates an exchange destination.
    pub fn exchange(exchange: impl AsRef<str>, routing_key: impl AsRef<str>) -> Self {
        Self::Exchange {
            exchange: exchange.as_ref().to_string(),
            routing_key: routing_key.as_ref().to_string(),
        }
    }

    /// Splits this destination into the `(exchange, routing_key)` pair
    /// expected by a publish call. A queue publishes through the default
    /// exchange with the queue name as the routing key.
    pub fn address_parts(&self) -> (&str, &str) {
        match self {
            Self::Queue(name) => ("", name),
            Self::Exchange {
                exchange,
                routing_key,
            } => (exchange, routing_key),
        }
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queue(name) => f.write_str(name),
            Self::Exchange {
                exchange,
                routing_key,
            } => write!(f, "{}/{}", exchange, routing_key),
        }
    }
}

impl FromStr for Destination {
    type Err = DestinationError;

    fn from_str(address: &str) -> Result<Self, Self::Err> {
        if address.is_empty() {
            return Err(DestinationError::Empty);
        }

        match address.split_once('/') {
            None => Ok(Self::Queue(address.to_string())),
            Some((exchange, routing_key)) => {
                if exchange.is_empty() || routing_key.is_empty() {
                    return Err(DestinationError::Lopsided(address.to_string()));
                }

                Ok(Self::Exchange {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn queue_round_trip() {
        let destination = Destination::queue("agent-1");

        assert_eq!(destination.to_string(), "agent-1");
        assert_eq!("agent-1".parse::<Destination>().unwrap(), destination);
        assert_eq!(destination.address_parts(), ("", "agent-1"));
    }

    #[test]
    fn exchange_round_trip() {
        let destination = Destination::exchange("amq.topic", "agents.eu");

        assert_eq!(destination.to_string(), "amq.topic/agents.eu");
        assert_eq!(
            "amq.topic/agents.eu".parse::<Destination>().unwrap(),
            destination,
        );
        assert_eq!(destination.address_parts(), ("amq.topic", "agents.eu"));
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        assert_eq!(
            "".parse::<Destination>().unwrap_err(),
            DestinationError::Empty,
        );
        assert!(matches!(
            "topic/".parse::<Destination>().unwrap_err(),
            DestinationError::Lopsided(_),
        ));
        assert!(matches!(
            "/key".parse::<Destination>().unwrap_err(),
            DestinationError::Lopsided(_),
        ));
    }
}
