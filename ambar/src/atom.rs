//! `Atom<T>`: independent, synchronous, compare-and-swap state.
//!
//! An atom wraps one [`VersionedCell`] together with its [`Hooks`]. Every
//! update is a read / compute / validate / CAS loop: the update function
//! sees the current value, its result is checked by the validators, and the
//! new node is published only if nobody else got there first. Otherwise
//! the function is simply called again against the fresher value.
//!
//! # Key Properties
//!
//! - **Non-blocking reads**: `deref()` is an epoch pin plus a pointer load
//! - **Linearizable per atom**: each successful update bumps the version by one
//! - **Side-effect-free rejection**: a failed validation leaves value and version untouched
//! - **Watches on the writer's thread**: fired after the CAS, never under a lock
//!
//! # Example
//!
//! ```rust
//! use ambar::atom;
//!
//! let counter = atom(0);
//! assert_eq!(counter.swap(|x| x + 1).unwrap(), 1);
//! assert_eq!(counter.deref(), 1);
//! ```

use crate::cell::VersionedCell;
use crate::errors::ValidationError;
use crate::hooks::{Hooks, Reference};
use crossbeam_epoch as epoch;
use crossbeam_utils::Backoff;
use std::fmt;
use std::sync::Arc;

struct AtomCore<T> {
    cell: VersionedCell<T>,
    hooks: Hooks<T>,
}

/// A shared, independently updated state cell.
///
/// Cloning an `Atom` clones the handle; all clones refer to the same state.
///
/// # Examples
///
/// ```rust
/// use ambar::{Atom, Reference};
///
/// let balance = Atom::new(100i64);
/// balance.add_validator(|b| *b >= 0).unwrap();
///
/// assert!(balance.swap(|b| b - 150).is_err());
/// assert_eq!(balance.deref(), 100);
/// ```
pub struct Atom<T: Clone + Send + Sync + 'static> {
    inner: Arc<AtomCore<T>>,
}

impl<T: Clone + Send + Sync + 'static> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Atom<T> {
    // ---- Construction ----

    /// Creates an atom holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(AtomCore {
                cell: VersionedCell::new(initial),
                hooks: Hooks::new(),
            }),
        }
    }

    // ---- Reading ----

    /// Clone of the current value. Never blocks.
    #[inline]
    #[allow(clippy::should_implement_trait)]
    pub fn deref(&self) -> T {
        self.inner.cell.peek(T::clone)
    }

    /// Calls `f` with a reference to the current value, without cloning it.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ambar::Atom;
    ///
    /// let names = Atom::new(vec!["a", "b"]);
    /// assert_eq!(names.peek(|v| v.len()), 2);
    /// ```
    #[inline]
    pub fn peek<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.inner.cell.peek(f)
    }

    /// Number of successful updates so far.
    #[inline]
    pub fn version(&self) -> u64 {
        self.inner.cell.version()
    }

    // ---- Writing ----

    /// Atomically replaces the value with `f(current)` and returns the new value.
    ///
    /// `f` may be called several times under contention, so it must not have
    /// side effects of its own.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ambar::Atom;
    ///
    /// let hits = Atom::new(0u64);
    /// hits.swap(|n| n + 1).unwrap();
    /// assert_eq!(hits.deref(), 1);
    /// ```
    pub fn swap<F>(&self, f: F) -> Result<T, ValidationError>
    where
        F: FnMut(&T) -> T,
    {
        self.swap_vals(f).map(|(_, new)| new)
    }

    /// Like [`swap`](Atom::swap) but returns `(old, new)`.
    pub fn swap_vals<F>(&self, mut f: F) -> Result<(T, T), ValidationError>
    where
        F: FnMut(&T) -> T,
    {
        let backoff = Backoff::new();
        loop {
            let guard = epoch::pin();
            let current = self.inner.cell.load(&guard);
            let proposed = f(&current.value);
            self.inner.hooks.validate(&proposed)?;

            match self.inner.cell.compare_and_swap(current, proposed, &guard) {
                Ok(installed) => {
                    let old = current.value.clone();
                    let new = installed.value.clone();
                    drop(guard);
                    self.inner.hooks.notify(&old, &new);
                    return Ok((old, new));
                }
                // Somebody else won; recompute against their value.
                Err(_) => backoff.snooze(),
            }
        }
    }

    /// Unconditionally sets the value and returns the previous one.
    pub fn reset(&self, value: T) -> Result<T, ValidationError> {
        self.reset_vals(value).map(|(old, _)| old)
    }

    /// Like [`reset`](Atom::reset) but returns `(old, new)`.
    pub fn reset_vals(&self, value: T) -> Result<(T, T), ValidationError> {
        self.inner.hooks.validate(&value)?;

        let guard = epoch::pin();
        let (previous, installed) = self.inner.cell.replace(value, 0, &guard);
        let old = previous.value.clone();
        let new = installed.value.clone();
        drop(guard);

        self.inner.hooks.notify(&old, &new);
        Ok((old, new))
    }

    /// Sets the value to `new` only if the current value equals `expected`.
    ///
    /// Returns `Ok(false)` without touching the atom on mismatch. Validators
    /// only run when the values match.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ambar::Atom;
    ///
    /// let state = Atom::new(String::from("idle"));
    /// assert!(state.compare_and_set(&"idle".to_string(), "busy".to_string()).unwrap());
    /// assert!(!state.compare_and_set(&"idle".to_string(), "busy".to_string()).unwrap());
    /// ```
    pub fn compare_and_set(&self, expected: &T, new: T) -> Result<bool, ValidationError>
    where
        T: PartialEq,
    {
        let backoff = Backoff::new();
        let mut new = new;
        let mut validated = false;

        loop {
            let guard = epoch::pin();
            let current = self.inner.cell.load(&guard);
            if current.value != *expected {
                return Ok(false);
            }
            if !validated {
                self.inner.hooks.validate(&new)?;
                validated = true;
            }

            match self.inner.cell.compare_and_swap(current, new, &guard) {
                Ok(installed) => {
                    let old = current.value.clone();
                    let installed = installed.value.clone();
                    drop(guard);
                    self.inner.hooks.notify(&old, &installed);
                    return Ok(true);
                }
                Err(rejected) => {
                    // The node changed but the value may still be equal.
                    new = rejected;
                    backoff.spin();
                }
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Reference<T> for Atom<T> {
    fn hooks(&self) -> &Hooks<T> {
        &self.inner.hooks
    }

    fn current(&self) -> T {
        self.deref()
    }
}

impl<T: Clone + Send + Sync + 'static + fmt::Debug> fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("value", &self.deref())
            .field("version", &self.version())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static + Default> Default for Atom<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Creates an [`Atom`] holding `initial`.
pub fn atom<T: Clone + Send + Sync + 'static>(initial: T) -> Atom<T> {
    Atom::new(initial)
}
