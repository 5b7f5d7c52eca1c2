//! `VersionedCell<T>`: the storage primitive behind every ambar reference.
//!
//! A cell publishes its state as one immutable [`Versioned`] node behind an
//! epoch-managed atomic pointer. Readers pin the epoch, load the pointer and
//! see a `(value, version, stamp)` triple that can never be torn. Writers
//! build a new node and install it with a single pointer CAS; the node they
//! replaced is handed to `crossbeam-epoch` and freed once no pinned reader
//! can still observe it.
//!
//! Versions start at zero and grow by exactly one per installed node.

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::Backoff;
use std::sync::atomic::Ordering;

/// One published state of a [`VersionedCell`].
#[derive(Debug)]
pub struct Versioned<T> {
    /// The value itself.
    pub value: T,
    /// Number of writes installed before this one.
    pub version: u64,
    /// Global commit timestamp of the transaction that installed this node.
    /// Cells written outside of transactions keep it at zero.
    pub stamp: u64,
}

/// A lock-free, versioned single-value container.
pub struct VersionedCell<T> {
    head: Atomic<Versioned<T>>,
}

impl<T: Send + Sync + 'static> VersionedCell<T> {
    /// Creates a cell holding `value` at version zero.
    pub fn new(value: T) -> Self {
        Self {
            head: Atomic::new(Versioned {
                value,
                version: 0,
                stamp: 0,
            }),
        }
    }

    /// Loads the current node.
    ///
    /// The reference stays valid for as long as `guard` is pinned.
    #[inline]
    pub fn load<'g>(&self, guard: &'g Guard) -> &'g Versioned<T> {
        let shared = self.head.load(Ordering::Acquire, guard);
        // SAFETY: head is never null, and replaced nodes are only destroyed
        // through `defer_destroy`, so they outlive every pinned guard.
        unsafe { shared.deref() }
    }

    /// Calls `f` with the current value inside a short critical section.
    #[inline]
    pub fn peek<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = epoch::pin();
        f(&self.load(&guard).value)
    }

    /// Current version.
    #[inline]
    pub fn version(&self) -> u64 {
        let guard = epoch::pin();
        self.load(&guard).version
    }

    /// Clones the current value together with its version.
    pub fn snapshot(&self) -> (T, u64)
    where
        T: Clone,
    {
        let guard = epoch::pin();
        let node = self.load(&guard);
        (node.value.clone(), node.version)
    }

    /// Installs `value` if `current` is still the published node.
    ///
    /// On success returns the freshly installed node. On failure hands
    /// `value` back so the caller can retry without reallocating.
    pub fn compare_and_swap<'g>(
        &self,
        current: &'g Versioned<T>,
        value: T,
        guard: &'g Guard,
    ) -> Result<&'g Versioned<T>, T> {
        let expected = Shared::from(current as *const Versioned<T>);
        let node = Owned::new(Versioned {
            value,
            version: current.version + 1,
            stamp: current.stamp,
        });

        match self
            .head
            .compare_exchange(expected, node, Ordering::AcqRel, Ordering::Acquire, guard)
        {
            Ok(installed) => {
                // SAFETY: `expected` was unlinked by our CAS and is retired
                // exactly once.
                unsafe {
                    guard.defer_destroy(expected);
                    Ok(installed.deref())
                }
            }
            Err(rejected) => Err(rejected.new.into_box().value),
        }
    }

    /// Unconditionally installs `value` with the given commit `stamp`.
    ///
    /// Returns `(previous, installed)`. Intended for writers that already
    /// exclude each other (a committing transaction holding the ref lock, or
    /// the single worker of an agent); concurrent writers are still handled
    /// correctly, the loser simply retries.
    pub fn replace<'g>(
        &self,
        value: T,
        stamp: u64,
        guard: &'g Guard,
    ) -> (&'g Versioned<T>, &'g Versioned<T>) {
        let backoff = Backoff::new();
        let mut node = Owned::new(Versioned {
            value,
            version: 0,
            stamp,
        });

        loop {
            let current = self.head.load(Ordering::Acquire, guard);
            // SAFETY: head is never null; see `load`.
            let previous = unsafe { current.deref() };
            node.version = previous.version + 1;

            match self
                .head
                .compare_exchange(current, node, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(installed) => {
                    // SAFETY: `current` was unlinked by our CAS and is retired once.
                    unsafe {
                        guard.defer_destroy(current);
                        return (previous, installed.deref());
                    }
                }
                Err(rejected) => {
                    node = rejected.new;
                    backoff.spin();
                }
            }
        }
    }
}

impl<T> Drop for VersionedCell<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can reach the head node.
        unsafe {
            let guard = epoch::unprotected();
            let head = self.head.load(Ordering::Relaxed, guard);
            if !head.is_null() {
                drop(head.into_owned());
            }
        }
    }
}

impl<T: Send + Sync + 'static + std::fmt::Debug> std::fmt::Debug for VersionedCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = epoch::pin();
        let node = self.load(&guard);
        f.debug_struct("VersionedCell")
            .field("value", &node.value)
            .field("version", &node.version)
            .finish()
    }
}
