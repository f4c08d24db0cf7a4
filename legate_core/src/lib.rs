#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Exposes the agent-wide runtime context.
mod context;
pub use self::context::AgentContext;

/// Exposes the spindown registry used to await background workers on shutdown.
mod spindown;
pub use self::spindown::{SpindownTimeout, SpindownToken};

/// Exposes the exponential backoff wrapper used by reconnect loops.
mod backoff;
pub use self::backoff::{Backoff, BackoffConfig};
