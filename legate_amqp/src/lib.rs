#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// The protocol tag stamped onto every outgoing envelope. Envelopes carrying
/// any other tag are dropped by the consuming side without dispatch.
pub const WIRE_VERSION: &str = "1.0";

/// Exposes the wire data model.
mod model {
    pub mod destination;
    pub mod envelope;
    pub mod outcome;
    pub mod request;
    pub mod window;
}

// Re-export model types
pub use self::model::destination::{Destination, DestinationError};
pub use self::model::envelope::{CodecError, Envelope};
pub use self::model::outcome::{
    Return, KIND_NOT_FOUND, KIND_PENDING_FULL, KIND_REQUEST_TIMEOUT, KIND_WINDOW_MISSED,
};
pub use self::model::request::Request;
pub use self::model::window::{unix_now, Eligibility, Window};

/// Exposes the broker descriptor and URL parsing.
mod profile;
pub use self::profile::{BrokerProfile, BrokerUrl, Scheme, UrlError};

/// Exposes the connection registry and the per-URL connector.
mod connection;
pub use self::connection::{ConnectError, ConnectionRegistry, Connector};

/// Exposes the base endpoint shared by producers and readers.
mod endpoint;
pub use self::endpoint::Endpoint;

/// Exposes the message-signing hook.
mod auth;
pub use self::auth::{Authenticator, ValidationFailed};

/// Exposes the envelope producer.
mod producer;
pub use self::producer::{Producer, SendError};

/// Exposes the envelope reader.
mod reader;
pub use self::reader::{Ack, ReadError, Reader};
