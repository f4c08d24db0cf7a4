#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Exposes the handler registry and the dispatcher.
mod dispatch;
pub use self::dispatch::{
    handler_fn, Dispatcher, HandlerFault, RemoteHandler, RemoteRegistry, RemoteRegistryBuilder,
};

/// Exposes the durable store of future-windowed requests.
mod pending;
pub use self::pending::{PendingError, PendingStore};

/// Exposes the server-side request consumer.
mod consumer;
pub use self::consumer::RequestConsumer;

/// Exposes the client-side delivery policies.
mod policy;
pub use self::policy::{
    Asynchronous, CallError, RemoteException, Sent, Synchronous, TimeoutSpec, Trigger,
};

/// Exposes the watchdog of outstanding asynchronous requests.
mod watchdog;
pub use self::watchdog::Watchdog;

/// Exposes the shared reply-queue monitor for asynchronous callers.
mod monitor;
pub use self::monitor::{ReplyListener, ReplyMonitor};
