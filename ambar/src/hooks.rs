//! Validators and watches.
//!
//! Every reference type owns a [`Hooks<T>`]. Validators are predicates that
//! run *before* a new state is accepted; any `false` rejects the change and
//! nothing is written. Watches run *after* a state change has been
//! published, on the thread that published it, and receive the old and the
//! new value. A panicking watch is caught and logged; the change it observed
//! stays in place.

use crate::errors::ValidationError;
use parking_lot::RwLock;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Predicate deciding whether a proposed state is acceptable.
pub type Validator<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Observer called with `(key, old, new)` after a state change.
pub type Watch<T> = Arc<dyn Fn(&str, &T, &T) + Send + Sync>;

/// Validator and watch lists of a single reference.
pub struct Hooks<T> {
    validators: RwLock<Vec<Validator<T>>>,
    watches: RwLock<Vec<(String, Watch<T>)>>,
}

impl<T> Default for Hooks<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Hooks<T> {
    /// Empty hook set.
    pub const fn new() -> Self {
        Self {
            validators: RwLock::new(Vec::new()),
            watches: RwLock::new(Vec::new()),
        }
    }

    /// Appends a validator. Does not check the current state; see
    /// [`Reference::add_validator`] for that.
    pub fn push_validator(&self, validator: Validator<T>) {
        self.validators.write().push(validator);
    }

    /// Number of registered validators.
    pub fn validator_count(&self) -> usize {
        self.validators.read().len()
    }

    /// Drops every validator.
    pub fn clear_validators(&self) {
        self.validators.write().clear();
    }

    /// Runs every validator against `value`, stopping at the first rejection.
    pub fn validate(&self, value: &T) -> Result<(), ValidationError> {
        // Snapshot so a validator may itself register hooks without deadlocking.
        let validators = self.validators.read().clone();
        for (index, validator) in validators.iter().enumerate() {
            if !validator(value) {
                return Err(ValidationError { index });
            }
        }
        Ok(())
    }

    /// Registers `watch` under `key`, replacing a watch with the same key.
    pub fn insert_watch(&self, key: String, watch: Watch<T>) {
        let mut watches = self.watches.write();
        match watches.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = watch,
            None => watches.push((key, watch)),
        }
    }

    /// Removes the watch registered under `key`. Returns whether one existed.
    pub fn remove_watch(&self, key: &str) -> bool {
        let mut watches = self.watches.write();
        let before = watches.len();
        watches.retain(|(k, _)| k != key);
        watches.len() != before
    }

    /// Whether any watch is registered. Lets writers skip cloning old values.
    pub fn has_watches(&self) -> bool {
        !self.watches.read().is_empty()
    }

    /// Calls every watch with `(key, old, new)` in registration order.
    pub fn notify(&self, old: &T, new: &T) {
        let watches = self.watches.read().clone();
        for (key, watch) in &watches {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| watch(key.as_str(), old, new)));
            if let Err(payload) = outcome {
                tracing::warn!(
                    watch = %key,
                    panic = %panic_message(payload.as_ref()),
                    "watch panicked, state change kept"
                );
            }
        }
    }
}

/// Extracts a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("non-string panic payload")
    }
}

/// Common surface of [`Atom`](crate::Atom), refs and agents: anything that
/// holds a state and carries [`Hooks`].
pub trait Reference<T: Clone + Send + Sync + 'static> {
    /// The reference's hook set.
    fn hooks(&self) -> &Hooks<T>;

    /// Current (committed) state.
    fn current(&self) -> T;

    /// Adds a validator after checking that the current state satisfies it.
    fn add_validator<F>(&self, validator: F) -> Result<(), ValidationError>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
        Self: Sized,
    {
        let validator: Validator<T> = Arc::new(validator);
        if !validator(&self.current()) {
            return Err(ValidationError {
                index: self.hooks().validator_count(),
            });
        }
        self.hooks().push_validator(validator);
        Ok(())
    }

    /// Removes all validators.
    fn clear_validators(&self) {
        self.hooks().clear_validators();
    }

    /// Registers a watch under `key`, replacing an existing one.
    fn add_watch<F>(&self, key: impl Into<String>, watch: F)
    where
        F: Fn(&str, &T, &T) + Send + Sync + 'static,
        Self: Sized,
    {
        self.hooks().insert_watch(key.into(), Arc::new(watch));
    }

    /// Removes the watch under `key`.
    fn remove_watch(&self, key: &str) -> bool {
        self.hooks().remove_watch(key)
    }
}

/// Adds a validator to any reference.
pub fn add_validator<T, R, F>(reference: &R, validator: F) -> Result<(), ValidationError>
where
    T: Clone + Send + Sync + 'static,
    R: Reference<T>,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    reference.add_validator(validator)
}

/// Adds a watch to any reference.
pub fn add_watch<T, R, F>(reference: &R, key: impl Into<String>, watch: F)
where
    T: Clone + Send + Sync + 'static,
    R: Reference<T>,
    F: Fn(&str, &T, &T) + Send + Sync + 'static,
{
    reference.add_watch(key, watch)
}

/// Removes a watch from any reference.
pub fn remove_watch<T, R>(reference: &R, key: &str) -> bool
where
    T: Clone + Send + Sync + 'static,
    R: Reference<T>,
{
    reference.remove_watch(key)
}
