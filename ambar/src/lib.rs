//! Ambar: shared state primitives with validators and watches.
//!
//! This crate holds the pieces every ambar reference type is built from:
//!
//! - [`VersionedCell`]: an epoch-reclaimed, lock-free `(value, version)` slot
//! - [`Atom`]: independent, synchronous updates by compare-and-swap
//! - [`Hooks`] and the [`Reference`] trait: validators that can veto a new
//!   state and watches that observe committed changes
//!
//! Coordinated updates over several locations live in `ambar-stm`, and
//! asynchronous per-cell action queues in `ambar-agent`.
//!
//! # Example
//!
//! ```rust
//! use ambar::{Reference, atom};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! let temperature = atom(20);
//! temperature.add_validator(|t| (-50..=60).contains(t)).unwrap();
//!
//! let changes = Arc::new(AtomicU64::new(0));
//! let seen = changes.clone();
//! temperature.add_watch("log", move |_key, _old, _new| {
//!     seen.fetch_add(1, Ordering::Relaxed);
//! });
//!
//! temperature.swap(|t| t + 5).unwrap();
//! assert!(temperature.reset(500).is_err());
//! assert_eq!(temperature.deref(), 25);
//! assert_eq!(changes.load(Ordering::Relaxed), 1);
//! ```

#![warn(missing_docs)]

mod atom;
mod cell;
mod errors;
mod hooks;

pub use atom::{Atom, atom};
pub use cell::{Versioned, VersionedCell};
pub use errors::ValidationError;
pub use hooks::{
    Hooks, Reference, Validator, Watch, add_validator, add_watch, panic_message, remove_watch,
};
