//! Software transactional memory over ambar refs.
//!
//! # Architecture
//!
//! A TL2-style (Transactional Locking II) algorithm with one global commit
//! clock.
//!
//! - **Reads**: Optimistic. No locks are taken. Every committed node carries
//!   the clock reading of the commit that installed it; an attempt only
//!   reads nodes stamped at or before the reading it started at, so it
//!   always sees one consistent snapshot.
//! - **Writes**: Buffered in a thread-local log. Locks are taken only during
//!   commit, in ref id order, then everything the attempt looked at is
//!   validated, commutes are replayed, validators run and the clock advances.
//! - **Reclamation**: Replaced nodes are retired through `crossbeam-epoch`.
//!
//! There is no explicit transaction handle: [`dosync`] installs one for the
//! current thread and [`Ref`] operations find it there. Calling a write
//! operation outside of `dosync` fails with [`StmError::NoTransaction`];
//! nested `dosync` calls join the enclosing transaction.
//!
//! # Example
//!
//! ```
//! use ambar_stm::{Ref, dosync};
//!
//! let checking = Ref::new(100i64);
//! let savings = Ref::new(0i64);
//!
//! let moved = dosync(|| {
//!     let amount = checking.deref() / 2;
//!     checking.alter(|c| c - amount)?;
//!     savings.alter(|s| s + amount)?;
//!     Ok(amount)
//! })
//! .unwrap();
//!
//! assert_eq!(moved, 50);
//! assert_eq!(checking.deref() + savings.deref(), 100);
//! ```

#![warn(missing_docs)]

mod config;
mod errors;
mod refs;
mod transaction;

pub use ambar::{Reference, ValidationError, add_validator, add_watch, remove_watch};
pub use config::StmConfig;
pub use errors::StmError;
pub use refs::{Ref, RefId};

use crossbeam_utils::Backoff;
use rand::Rng;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;
use transaction::{Attempt, Retry};

/// The STM engine. Holds the retry policy; the commit clock is process-wide.
#[derive(Debug, Clone)]
pub struct Stm {
    config: StmConfig,
}

impl Stm {
    /// Create an engine with the default retry policy.
    pub const fn new() -> Self {
        Self {
            config: StmConfig::new(),
        }
    }

    /// Create an engine with the given retry policy.
    pub const fn with_config(config: StmConfig) -> Self {
        Self { config }
    }

    /// Retry policy of this engine.
    pub fn config(&self) -> &StmConfig {
        &self.config
    }
}

impl Default for Stm {
    fn default() -> Self {
        Self::new()
    }
}

impl Stm {
    /// Execute a closure atomically.
    ///
    /// The closure is re-run from scratch whenever its attempt conflicts
    /// with a concurrent commit, so it must not perform I/O or other side
    /// effects of its own; use [`on_commit`] for those.
    ///
    /// Any error other than a conflict discards the attempt and is returned
    /// as is. Called while a transaction is already running on this thread,
    /// `f` simply runs as part of it.
    ///
    /// # Example
    ///
    /// ```
    /// use ambar_stm::{Ref, Stm, StmConfig};
    ///
    /// let stm = Stm::with_config(StmConfig::new().with_max_retries(100));
    /// let var = Ref::new(10);
    ///
    /// stm.dosync(|| {
    ///     let val = var.deref();
    ///     var.set(val + 1)?;
    ///     Ok(())
    /// })
    /// .unwrap();
    /// assert_eq!(var.deref(), 11);
    /// ```
    pub fn dosync<F, R>(&self, mut f: F) -> Result<R, StmError>
    where
        F: FnMut() -> Result<R, StmError>,
    {
        if transaction::in_transaction() {
            return f();
        }

        let backoff = Backoff::new();
        let mut retries: u32 = 0;
        loop {
            let attempt = Attempt::begin();
            let outcome = match panic::catch_unwind(AssertUnwindSafe(&mut f)) {
                Ok(outcome) => outcome,
                Err(payload) if payload.is::<Retry>() => Err(StmError::Conflict),
                Err(payload) => panic::resume_unwind(payload),
            };
            let tx = attempt.finish();

            let error = match (outcome, tx) {
                (Ok(result), Some(tx)) => match tx.commit() {
                    Ok(()) => return Ok(result),
                    Err(err) => err,
                },
                // The slot is only emptied by `finish`.
                (Ok(_), None) => StmError::Conflict,
                (Err(err), _) => err,
            };

            if error != StmError::Conflict {
                tracing::debug!(%error, retries, "transaction failed");
                return Err(error);
            }

            retries += 1;
            if self.config.max_retries.is_some_and(|max| retries > max) {
                tracing::debug!(attempts = retries, "transaction retry limit reached");
                return Err(StmError::Timeout { attempts: retries });
            }
            tracing::trace!(retries, "transaction conflict, retrying");
            self.pause(retries, &backoff);
        }
    }

    fn pause(&self, retries: u32, backoff: &Backoff) {
        if retries <= self.config.spin_attempts {
            backoff.snooze();
            return;
        }
        let max = self.config.max_backoff.as_nanos().min(u64::MAX as u128) as u64;
        if max == 0 {
            thread::yield_now();
        } else {
            thread::sleep(Duration::from_nanos(rand::rng().random_range(0..=max)));
        }
    }
}

/// Global engine used by the free functions.
pub static STM: Stm = Stm::new();

/// Runs `f` atomically on the global engine. See [`Stm::dosync`].
pub fn dosync<F, R>(f: F) -> Result<R, StmError>
where
    F: FnMut() -> Result<R, StmError>,
{
    STM.dosync(f)
}

/// Whether a transaction is running on the current thread.
pub fn in_transaction() -> bool {
    transaction::in_transaction()
}

/// Schedules `f` to run once the current transaction has committed, after
/// every lock is released and every watch has fired.
///
/// A retried attempt drops the hooks it registered; the successful attempt
/// registers its own.
pub fn on_commit<F>(f: F) -> Result<(), StmError>
where
    F: FnOnce() + 'static,
{
    transaction::with_current(|tx| {
        tx.on_commit(Box::new(f));
        Ok(())
    })
}

/// Schedules `f` to run if the current attempt is thrown away, whether it
/// is retried, fails or panics.
pub fn on_rollback<F>(f: F) -> Result<(), StmError>
where
    F: FnOnce() + 'static,
{
    transaction::with_current(|tx| {
        tx.on_rollback(Box::new(f));
        Ok(())
    })
}

/// Gives up on the current transaction. Return it from the `dosync` body:
///
/// ```
/// use ambar_stm::{Ref, StmError, abort, dosync};
///
/// let stock = Ref::new(0u32);
/// let result = dosync(|| {
///     if stock.deref() == 0 {
///         return abort("out of stock");
///     }
///     stock.alter(|s| s - 1)
/// });
/// assert_eq!(result, Err(StmError::Aborted("out of stock".into())));
/// ```
pub fn abort<T>(reason: impl Into<String>) -> Result<T, StmError> {
    Err(StmError::Aborted(reason.into()))
}
