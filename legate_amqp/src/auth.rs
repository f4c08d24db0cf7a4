use thiserror::Error;

/// An optional message-signing hook.
///
/// When an authenticator is attached to an [`Endpoint`](crate::Endpoint),
/// outgoing envelope bytes are passed through [`sign`](Authenticator::sign)
/// before publishing, and incoming message bytes are passed through
/// [`validate`](Authenticator::validate) before decoding. A message that
/// fails validation is acknowledged and dropped by the reader.
///
/// This is deliberately the whole authentication surface: there is no
/// built-in credential scheme beyond what the broker itself enforces.
pub trait Authenticator: Send + Sync {
    /// Wraps the given outgoing bytes into their signed form.
    fn sign(&self, bytes: Vec<u8>) -> Result<Vec<u8>, ValidationFailed>;

    /// Validates the given incoming bytes.
    fn validate(&self, bytes: &[u8]) -> Result<(), ValidationFailed>;
}

/// Represents a message that failed authentication.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("message failed validation: {reason}")]
pub struct ValidationFailed {
    /// Why the message was rejected.
    pub reason: String,
}

impl ValidationFailed {
    /// Creates a new validation failure with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
