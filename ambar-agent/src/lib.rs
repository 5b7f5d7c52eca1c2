//! Agents: independent, asynchronous state for ambar.
//!
//! An [`Agent`] holds a value that changes only through actions sent to it.
//! Actions of one agent run one at a time, in the order they were sent, on
//! one of two process-wide worker pools:
//!
//! - [`Agent::send`] uses a fixed-size pool for CPU-bound work;
//! - [`Agent::send_off`] uses a pool that grows for work that blocks.
//!
//! Sends are coordinated with the rest of ambar: a send issued inside
//! [`dosync`](ambar_stm::dosync) is dispatched only if that transaction
//! commits, and a send issued by a running action is dispatched only once
//! that action's result has been installed.
//!
//! # Example
//!
//! ```
//! use ambar_agent::{Agent, ErrorMode};
//!
//! let hits = Agent::new(0u64);
//! for _ in 0..10 {
//!     hits.send(|n| n + 1);
//! }
//! hits.await_actions().unwrap();
//! assert_eq!(hits.deref(), 10);
//!
//! hits.set_error_mode(ErrorMode::Continue);
//! hits.try_send(|_| Err::<u64, _>("not a number"));
//! hits.send(|n| n * 2);
//! hits.await_actions().unwrap();
//! assert_eq!(hits.deref(), 20);
//! ```

#![warn(missing_docs)]

mod agent;
mod errors;
mod pool;

pub use agent::{Agent, ErrorHandler, ErrorMode, RestartOptions, agent, await_all};
pub use ambar::{Reference, ValidationError, add_validator, add_watch, remove_watch};
pub use errors::{ActionError, AgentError, BoxError};
pub use pool::{PoolConfig, configure_pools};
