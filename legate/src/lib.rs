#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Exposes the application configuration.
mod config;
pub use self::config::{AgentConfig, ConfigError, MessagingConfig, PendingConfig};

/// Exposes the agent identity contract.
mod identity;
pub use self::identity::{Identity, StaticIdentity};

/// Exposes recurring actions and their runner.
mod action;
pub use self::action::{action_fn, ActionHandler, RecurringAction};

/// Exposes the agent runtime.
mod agent;
pub use self::agent::{Agent, AgentBuilder, AgentError, AgentHandle};

/// Re-exports the runtime context types for convenience.
pub use legate_core::{AgentContext, SpindownTimeout, SpindownToken};

/// Re-exports the AMQP layer.
pub use legate_amqp as amqp;

/// Re-exports the RPC engine.
pub use legate_rmi as rmi;
