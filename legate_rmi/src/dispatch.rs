use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use legate_amqp::{Request, Return};
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// A single remotely callable handler.
///
/// Handlers receive the positional and keyword arguments of the request
/// verbatim and either return a JSON value or fail with a [`HandlerFault`].
/// A handler that panics is caught by the [`Dispatcher`] and captured as a
/// fault; nothing a handler does can tear down the consumer loop.
#[async_trait]
pub trait RemoteHandler: Send + Sync {
    /// Invokes the handler with the request arguments.
    async fn invoke(
        &self,
        args: Vec<Value>,
        kws: Map<String, Value>,
    ) -> Result<Value, HandlerFault>;
}

/// A failure produced by (or on behalf of) a handler: a kind, a message, and
/// optionally a captured trace.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct HandlerFault {
    /// The failure kind (an error type name).
    pub kind: String,
    /// The human-readable message.
    pub message: String,
    /// The captured trace text, when available.
    pub trace: Option<String>,
}

impl HandlerFault {
    /// Creates a fault with the given kind and message.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        }
    }

    /// Attaches a trace text to this fault.
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

/// Wraps an async closure into a [`RemoteHandler`].
pub fn handler_fn<F, Fut>(function: F) -> Arc<dyn RemoteHandler>
where
    F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerFault>> + Send + 'static,
{
    type BoxedHandler = Box<
        dyn Fn(Vec<Value>, Map<String, Value>) -> BoxFuture<'static, Result<Value, HandlerFault>>
            + Send
            + Sync,
    >;

    struct FnHandler(BoxedHandler);

    #[async_trait]
    impl RemoteHandler for FnHandler {
        async fn invoke(
            &self,
            args: Vec<Value>,
            kws: Map<String, Value>,
        ) -> Result<Value, HandlerFault> {
            (self.0)(args, kws).await
        }
    }

    Arc::new(FnHandler(Box::new(move |args, kws| {
        Box::pin(function(args, kws))
    })))
}

/// Builds the read-only table of remotely callable targets.
///
/// The table is populated once, at startup, by the plugin-loading
/// collaborator; the [`Dispatcher`] only ever reads from it. Registering the
/// same name twice replaces the earlier handler.
#[derive(Default)]
pub struct RemoteRegistryBuilder {
    functions: HashMap<String, Arc<dyn RemoteHandler>>,
    methods: HashMap<String, HashMap<String, Arc<dyn RemoteHandler>>>,
}

/// The read-only table of remotely callable targets: bare functions by name,
/// and methods grouped under their class name.
#[derive(Clone)]
pub struct RemoteRegistry {
    inner: Arc<RemoteRegistryBuilder>,
}

impl RemoteRegistryBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a bare function.
    pub fn function(mut self, name: impl Into<String>, handler: Arc<dyn RemoteHandler>) -> Self {
        self.functions.insert(name.into(), handler);
        self
    }

    /// Registers a method under a class name.
    pub fn method(
        mut self,
        classname: impl Into<String>,
        method: impl Into<String>,
        handler: Arc<dyn RemoteHandler>,
    ) -> Self {
        self.methods
            .entry(classname.into())
            .or_default()
            .insert(method.into(), handler);
        self
    }

    /// Freezes the builder into a read-only [`RemoteRegistry`].
    pub fn build(self) -> RemoteRegistry {
        RemoteRegistry {
            inner: Arc::new(self),
        }
    }
}

impl RemoteRegistry {
    /// Returns a fresh builder.
    pub fn builder() -> RemoteRegistryBuilder {
        RemoteRegistryBuilder::new()
    }

    /// Resolves the handler for the given request, if registered.
    fn resolve(&self, request: &Request) -> Option<&Arc<dyn RemoteHandler>> {
        match &request.classname {
            Some(classname) => self
                .inner
                .methods
                .get(classname)
                .and_then(|methods| methods.get(&request.method)),
            None => self.inner.functions.get(&request.method),
        }
    }

    /// Lists every registered target (`Class.method` and bare function
    /// names), sorted.
    pub fn targets(&self) -> Vec<String> {
        let mut targets = Vec::new();

        for name in self.inner.functions.keys() {
            targets.push(name.clone());
        }
        for (classname, methods) in &self.inner.methods {
            for method in methods.keys() {
                targets.push(format!("{}.{}", classname, method));
            }
        }

        targets.sort();
        targets
    }
}

/// Resolves incoming requests against the [`RemoteRegistry`] and invokes the
/// matching handler, capturing the outcome as a [`Return`].
///
/// Nothing escapes: an unresolved target, a handler fault, and even a
/// handler panic all come back as failed returns.
#[derive(Clone)]
pub struct Dispatcher {
    registry: RemoteRegistry,
}

impl Dispatcher {
    /// Creates a dispatcher over the given registry.
    pub fn new(registry: RemoteRegistry) -> Self {
        Self { registry }
    }

    /// Dispatches the given request and captures its outcome.
    pub async fn dispatch(&self, request: &Request) -> Return {
        let target = request.target();

        let handler = match self.registry.resolve(request) {
            Some(handler) => Arc::clone(handler),
            None => {
                warn!(target = target.as_str(), "Dispatch target is not registered");
                return Return::not_found(&target);
            }
        };

        let invocation =
            AssertUnwindSafe(handler.invoke(request.args.clone(), request.kws.clone()))
                .catch_unwind();

        match invocation.await {
            Ok(Ok(value)) => {
                debug!(target = target.as_str(), "Dispatch succeeded");
                Return::succeeded(value)
            }
            Ok(Err(fault)) => {
                debug!(
                    target = target.as_str(),
                    kind = fault.kind.as_str(),
                    "Dispatch failed in the handler",
                );
                Return::exception(fault.kind, fault.message, fault.trace)
            }
            Err(panic) => {
                let message = panic_message(panic);
                warn!(
                    alert = true,
                    target = target.as_str(),
                    message = message.as_str(),
                    "Handler panicked",
                );
                Return::exception("Panic", message, None)
            }
        }
    }
}

/// Extracts a readable message from a panic payload.
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn echo_registry() -> RemoteRegistry {
        RemoteRegistry::builder()
            .function(
                "echo",
                handler_fn(|args, _kws| async move {
                    Ok(args.into_iter().next().unwrap_or(Value::Null))
                }),
            )
            .method(
                "Admin",
                "hello",
                handler_fn(|_args, _kws| async move { Ok(json!("hello from the agent")) }),
            )
            .function(
                "fails",
                handler_fn(|_args, _kws| async move {
                    Err(HandlerFault::new("ValueError", "bad").with_trace("at fails()"))
                }),
            )
            .function(
                "explodes",
                handler_fn(|args, _kws| async move {
                    if args.is_empty() {
                        panic!("boom");
                    }
                    Ok(Value::Null)
                }),
            )
            .build()
    }

    #[tokio::test]
    async fn dispatches_a_function() {
        // Given
        let dispatcher = Dispatcher::new(echo_registry());
        let request = Request::function("echo").with_args(vec![json!("hi")]);

        // When
        let outcome = dispatcher.dispatch(&request).await;

        // Then
        assert_eq!(outcome, Return::succeeded(json!("hi")));
    }

    #[tokio::test]
    async fn dispatches_a_method() {
        // Given
        let dispatcher = Dispatcher::new(echo_registry());
        let request = Request::method("Admin", "hello");

        // When
        let outcome = dispatcher.dispatch(&request).await;

        // Then
        assert_eq!(outcome, Return::succeeded(json!("hello from the agent")));
    }

    #[tokio::test]
    async fn unresolved_target_fails_as_not_found() {
        // Given
        let dispatcher = Dispatcher::new(echo_registry());
        let request = Request::method("Admin", "nonexistent");

        // When
        let outcome = dispatcher.dispatch(&request).await;

        // Then
        assert!(outcome.failed());
        assert_eq!(outcome.kind(), Some(legate_amqp::KIND_NOT_FOUND));
    }

    #[tokio::test]
    async fn handler_fault_is_captured() {
        // Given
        let dispatcher = Dispatcher::new(echo_registry());
        let request = Request::function("fails");

        // When
        let outcome = dispatcher.dispatch(&request).await;

        // Then
        assert_eq!(
            outcome,
            Return::exception("ValueError", "bad", Some("at fails()".to_string())),
        );
    }

    #[tokio::test]
    async fn handler_panic_is_captured() {
        // Given
        let dispatcher = Dispatcher::new(echo_registry());
        let request = Request::function("explodes");

        // When
        let outcome = dispatcher.dispatch(&request).await;

        // Then
        assert!(outcome.failed());
        assert_eq!(outcome.kind(), Some("Panic"));
    }

    #[test]
    fn targets_are_listed_sorted() {
        // Given
        let registry = echo_registry();

        // When
        let targets = registry.targets();

        // Then
        assert_eq!(targets, vec!["Admin.hello", "echo", "explodes", "fails"]);
    }
}
