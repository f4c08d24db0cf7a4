use async_trait::async_trait;

/// Supplies the agent's UUID.
///
/// The identity is external to the runtime (it may come from a registration
/// service, a file dropped by provisioning, or plain configuration). The
/// agent polls the provider until it yields a non-empty UUID, then names its
/// durable inbound queue after it.
#[async_trait]
pub trait Identity: Send + Sync {
    /// Returns the agent UUID, or `None` while the agent is not yet
    /// associated.
    async fn uuid(&self) -> Option<String>;
}

/// An [`Identity`] fixed at construction time.
pub struct StaticIdentity {
    uuid: String,
}

impl StaticIdentity {
    /// Creates an identity that always reports the given UUID.
    pub fn new(uuid: impl Into<String>) -> Self {
        Self { uuid: uuid.into() }
    }
}

#[async_trait]
impl Identity for StaticIdentity {
    async fn uuid(&self) -> Option<String> {
        Some(self.uuid.clone())
    }
}
