use crate::errors::StmError;
use crate::refs::{Ref, RefCore, RefId, RefLock};
use ambar::ValidationError;
use crossbeam_epoch::{self as epoch, Guard};
use crossbeam_utils::Backoff;
use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global commit clock.
///
/// A writing commit advances it by one while holding the locks of everything
/// it writes, and stamps the nodes it installs with the new reading. An
/// attempt may only read nodes stamped at or before the reading it started at.
static COMMIT_CLOCK: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: RefCell<Option<Transaction>> = const { RefCell::new(None) };
}

type Commute<T> = Box<dyn Fn(&T) -> T>;
type Hook = Box<dyn FnOnce()>;

/// Per-ref record of one attempt.
struct Entry<T> {
    core: Arc<RefCore<T>>,
    /// Version of the committed node the entry was seeded from.
    version: u64,
    /// In-transaction value.
    value: T,
    /// The body read the seeded value (deref, alter, set, ensure).
    observed: bool,
    ensured: bool,
    written: bool,
    /// Commutative updates to replay at commit, in call order.
    commutes: Vec<Commute<T>>,
}

impl<T> Entry<T> {
    fn writes(&self) -> bool {
        self.written || !self.commutes.is_empty()
    }
}

/// Type-erased view of an [`Entry`], so one log can hold refs of any type.
trait LogEntry {
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Whether commit must hold this ref's lock.
    fn needs_lock(&self) -> bool;

    fn lock(&self) -> Arc<dyn RefLock>;

    /// Whether the committed node still matches what the attempt saw.
    /// Called with every needed lock held.
    fn is_current(&self, guard: &Guard) -> bool;

    /// Replays commutes against the latest committed value and runs the
    /// ref's validators over the value about to be installed.
    fn prepare(&mut self, guard: &Guard) -> Result<(), ValidationError>;

    /// Publishes the in-transaction value. Returns the watch notification
    /// to fire once every lock is released.
    fn install(&mut self, stamp: u64, guard: &Guard) -> Option<Hook>;
}

impl<T: Clone + Send + Sync + 'static> LogEntry for Entry<T> {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn needs_lock(&self) -> bool {
        self.writes() || self.ensured
    }

    fn lock(&self) -> Arc<dyn RefLock> {
        self.core.clone()
    }

    fn is_current(&self, guard: &Guard) -> bool {
        // Locks we hold ourselves were taken before this check.
        if !self.needs_lock() && self.core.is_locked() {
            return false;
        }
        // A commute-only entry never looked at its seed, so a newer node is fine.
        let seen = self.observed || self.written || self.ensured;
        !seen || self.core.cell.load(guard).version == self.version
    }

    fn prepare(&mut self, guard: &Guard) -> Result<(), ValidationError> {
        if !self.written && !self.commutes.is_empty() {
            let mut value = self.core.cell.load(guard).value.clone();
            for f in &self.commutes {
                value = f(&value);
            }
            self.value = value;
        }
        if self.writes() {
            self.core.hooks.validate(&self.value)?;
        }
        Ok(())
    }

    fn install(&mut self, stamp: u64, guard: &Guard) -> Option<Hook> {
        if !self.writes() {
            return None;
        }
        let (previous, installed) = self.core.cell.replace(self.value.clone(), stamp, guard);
        if !self.core.hooks.has_watches() {
            return None;
        }
        let old = previous.value.clone();
        let new = installed.value.clone();
        let core = Arc::clone(&self.core);
        Some(Box::new(move || core.hooks.notify(&old, &new)))
    }
}

/// Locks held by a committing transaction. Released on drop, including
/// when a commute function or validator panics mid-commit.
struct HeldLocks(Vec<Arc<dyn RefLock>>);

impl HeldLocks {
    fn acquire(&mut self, lock: Arc<dyn RefLock>) -> bool {
        let backoff = Backoff::new();
        while !lock.try_lock() {
            if backoff.is_completed() {
                return false;
            }
            backoff.snooze();
        }
        self.0.push(lock);
        true
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        for lock in &self.0 {
            lock.unlock();
        }
    }
}

/// State of one `dosync` attempt on the current thread.
pub(crate) struct Transaction {
    /// Commit clock reading at the start of the attempt.
    read_stamp: u64,
    /// Ordered by ref id, which is also the lock order.
    entries: BTreeMap<RefId, Box<dyn LogEntry>>,
    /// Set once a read could not be served from the snapshot. Every later
    /// operation fails with `Conflict` and commit refuses.
    doomed: bool,
    /// Side effects to run only after a successful commit.
    post_commit_hooks: Vec<Hook>,
    /// Side effects to run if the attempt is thrown away.
    post_rollback_hooks: Vec<Hook>,
    committed: bool,
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.committed {
            let hooks = std::mem::take(&mut self.post_rollback_hooks);
            for hook in hooks {
                hook();
            }
        }
    }
}

impl Transaction {
    fn new() -> Self {
        Self {
            read_stamp: COMMIT_CLOCK.load(Ordering::SeqCst),
            entries: BTreeMap::new(),
            doomed: false,
            post_commit_hooks: Vec::new(),
            post_rollback_hooks: Vec::new(),
            committed: false,
        }
    }

    pub(crate) fn on_commit(&mut self, hook: Hook) {
        self.post_commit_hooks.push(hook);
    }

    pub(crate) fn on_rollback(&mut self, hook: Hook) {
        self.post_rollback_hooks.push(hook);
    }

    fn entry_mut<T: Clone + Send + Sync + 'static>(&mut self, r: &Ref<T>) -> Option<&mut Entry<T>> {
        self.entries
            .get_mut(&r.core.id)
            .and_then(|entry| entry.as_any_mut().downcast_mut::<Entry<T>>())
    }

    /// Committed value and version of `core`, if the snapshot may see it.
    fn read_committed<T: Clone + Send + Sync + 'static>(&self, core: &RefCore<T>) -> Option<(T, u64)> {
        if core.is_locked() {
            return None;
        }
        let guard = epoch::pin();
        let node = core.cell.load(&guard);
        (node.stamp <= self.read_stamp).then(|| (node.value.clone(), node.version))
    }

    /// Latest committed value and version of `core`, whatever its stamp.
    fn read_latest<T: Clone + Send + Sync + 'static>(core: &RefCore<T>) -> (T, u64) {
        let guard = epoch::pin();
        let node = core.cell.load(&guard);
        (node.value.clone(), node.version)
    }

    /// Entry for `r`, seeded on first touch. An observed ref is seeded from
    /// the snapshot; a commuted one from the latest commit, since commit
    /// replays its commutes anyway.
    fn touch<T: Clone + Send + Sync + 'static>(
        &mut self,
        r: &Ref<T>,
        observed: bool,
    ) -> Result<&mut Entry<T>, StmError> {
        if self.doomed {
            return Err(StmError::Conflict);
        }
        if !self.entries.contains_key(&r.core.id) {
            let seed = if observed {
                self.read_committed(&r.core)
            } else {
                Some(Self::read_latest(&r.core))
            };
            let Some((value, version)) = seed else {
                tracing::trace!(ref_id = ?r.core.id, read_stamp = self.read_stamp, "read past snapshot");
                self.doomed = true;
                return Err(StmError::Conflict);
            };
            self.entries.insert(
                r.core.id,
                Box::new(Entry {
                    core: Arc::clone(&r.core),
                    version,
                    value,
                    observed,
                    ensured: false,
                    written: false,
                    commutes: Vec::new(),
                }),
            );
        }
        self.entry_mut(r).ok_or(StmError::Conflict)
    }

    /// In-transaction value of `r`, or `Conflict` once the attempt is doomed.
    pub(crate) fn deref<T: Clone + Send + Sync + 'static>(&mut self, r: &Ref<T>) -> Result<T, StmError> {
        if self.doomed {
            return Err(StmError::Conflict);
        }
        if let Some(entry) = self.entry_mut(r) {
            return Ok(entry.value.clone());
        }
        Ok(self.touch(r, true)?.value.clone())
    }

    pub(crate) fn value_for_write<T: Clone + Send + Sync + 'static>(
        &mut self,
        r: &Ref<T>,
    ) -> Result<T, StmError> {
        let entry = self.touch(r, true)?;
        if !entry.commutes.is_empty() {
            return Err(StmError::AlterAfterCommute);
        }
        Ok(entry.value.clone())
    }

    pub(crate) fn write<T: Clone + Send + Sync + 'static>(
        &mut self,
        r: &Ref<T>,
        value: T,
    ) -> Result<(), StmError> {
        let entry = self.touch(r, true)?;
        if !entry.commutes.is_empty() {
            return Err(StmError::AlterAfterCommute);
        }
        entry.value = value;
        entry.written = true;
        Ok(())
    }

    pub(crate) fn value_for_commute<T: Clone + Send + Sync + 'static>(
        &mut self,
        r: &Ref<T>,
    ) -> Result<T, StmError> {
        Ok(self.touch(r, false)?.value.clone())
    }

    pub(crate) fn commute<T: Clone + Send + Sync + 'static>(
        &mut self,
        r: &Ref<T>,
        value: T,
        f: Commute<T>,
    ) -> Result<(), StmError> {
        let entry = self.touch(r, false)?;
        entry.value = value;
        // Once written, the ref is locked and validated anyway; nothing to replay.
        if !entry.written {
            entry.commutes.push(f);
        }
        Ok(())
    }

    pub(crate) fn ensure<T: Clone + Send + Sync + 'static>(&mut self, r: &Ref<T>) -> Result<T, StmError> {
        let entry = self.touch(r, true)?;
        entry.ensured = true;
        Ok(entry.value.clone())
    }

    /// Commits the attempt.
    ///
    /// `Err(Conflict)` means the attempt must be re-run, `Err(Validation)`
    /// that a validator rejected a value replayed at commit time. Either
    /// way nothing was published and the rollback hooks run when `self`
    /// drops.
    pub(crate) fn commit(mut self) -> Result<(), StmError> {
        if self.doomed {
            return Err(StmError::Conflict);
        }
        let post_commit_hooks = std::mem::take(&mut self.post_commit_hooks);

        // 0. Read-only: the snapshot was consistent at every read.
        if !self.entries.values().any(|entry| entry.needs_lock()) {
            self.committed = true;
            for hook in post_commit_hooks {
                hook();
            }
            return Ok(());
        }

        let guard = epoch::pin();

        // 1. Acquire locks in ref id order.
        let mut held = HeldLocks(Vec::new());
        for entry in self.entries.values().filter(|entry| entry.needs_lock()) {
            if !held.acquire(entry.lock()) {
                tracing::trace!("commit lock busy");
                return Err(StmError::Conflict);
            }
        }

        // 2. Validate everything the attempt looked at.
        if !self.entries.values().all(|entry| entry.is_current(&guard)) {
            tracing::trace!(read_stamp = self.read_stamp, "stale read at commit");
            return Err(StmError::Conflict);
        }

        // 3. Replay commutes and run validators.
        self.entries
            .values_mut()
            .try_for_each(|entry| entry.prepare(&guard))?;

        // 4. Advance the clock only once the commit can no longer fail.
        let stamp = COMMIT_CLOCK.fetch_add(1, Ordering::SeqCst) + 1;

        // 5. Publish.
        let notifications: Vec<Hook> = self
            .entries
            .values_mut()
            .filter_map(|entry| entry.install(stamp, &guard))
            .collect();

        drop(held);
        drop(guard);
        self.committed = true;

        for notify in notifications {
            notify();
        }
        for hook in post_commit_hooks {
            hook();
        }
        Ok(())
    }
}

/// Unwind payload of a read that left the attempt's snapshot. Raised with
/// `resume_unwind` so no panic hook runs; `dosync` turns it into a retry.
pub(crate) struct Retry;

/// Abandons the running attempt from inside an infallible read.
pub(crate) fn retry_now() -> ! {
    std::panic::resume_unwind(Box::new(Retry))
}

/// Installs a fresh transaction for the current thread; clears the slot
/// again on drop, whether the attempt committed, failed or panicked.
pub(crate) struct Attempt {
    _thread_bound: PhantomData<*const ()>,
}

impl Attempt {
    pub(crate) fn begin() -> Self {
        CURRENT.with(|current| *current.borrow_mut() = Some(Transaction::new()));
        Self {
            _thread_bound: PhantomData,
        }
    }

    /// Takes the transaction out of the slot so it can commit while other
    /// code (watches, hooks) may open transactions of its own.
    pub(crate) fn finish(self) -> Option<Transaction> {
        take()
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        // Dropped outside the borrow: rollback hooks may touch refs.
        let leftover = CURRENT
            .try_with(|current| current.try_borrow_mut().ok().and_then(|mut slot| slot.take()))
            .ok()
            .flatten();
        drop(leftover);
    }
}

fn take() -> Option<Transaction> {
    CURRENT.with(|current| current.borrow_mut().take())
}

/// Runs `f` against the current thread's transaction.
pub(crate) fn with_current<R>(f: impl FnOnce(&mut Transaction) -> Result<R, StmError>) -> Result<R, StmError> {
    CURRENT.with(|current| match current.borrow_mut().as_mut() {
        Some(tx) => f(tx),
        None => Err(StmError::NoTransaction),
    })
}

/// Like [`with_current`], but `None` when no transaction is running.
pub(crate) fn try_with_current<R>(f: impl FnOnce(&mut Transaction) -> R) -> Option<R> {
    CURRENT.with(|current| current.borrow_mut().as_mut().map(f))
}

pub(crate) fn in_transaction() -> bool {
    CURRENT.with(|current| current.try_borrow().map_or(true, |slot| slot.is_some()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_commit_installs_nothing() {
        let r = Ref::new(1);

        let attempt = Attempt::begin();
        assert_eq!(try_with_current(|tx| tx.deref(&r)), Some(Ok(1)));
        attempt.finish().unwrap().commit().unwrap();

        assert_eq!(r.version(), 0);
    }

    #[test]
    fn written_node_carries_commit_stamp() {
        let r = Ref::new(0u32);
        let attempt = Attempt::begin();
        with_current(|tx| tx.write(&r, 5)).unwrap();
        attempt.finish().unwrap().commit().unwrap();

        let guard = epoch::pin();
        let node = r.core.cell.load(&guard);
        assert_eq!(node.value, 5);
        assert!(node.stamp > 0);
        assert!(node.stamp <= COMMIT_CLOCK.load(Ordering::SeqCst));
    }

    #[test]
    fn commit_after_foreign_write_conflicts() {
        let r = Ref::new(0);

        let attempt = Attempt::begin();
        assert_eq!(with_current(|tx| tx.value_for_write(&r)).unwrap(), 0);
        with_current(|tx| tx.write(&r, 1)).unwrap();
        let tx = attempt.finish().unwrap();

        // Somebody else commits in between.
        let other = Attempt::begin();
        with_current(|tx| tx.write(&r, 10)).unwrap();
        other.finish().unwrap().commit().unwrap();

        assert_eq!(tx.commit(), Err(StmError::Conflict));
        assert_eq!(r.committed(), 10);
    }

    #[test]
    fn doomed_attempt_refuses_further_work() {
        let r = Ref::new(0);
        let attempt = Attempt::begin();

        // Publish a node stamped after our snapshot.
        let tx = take().unwrap();
        let writer = Attempt::begin();
        with_current(|w| w.write(&r, 1)).unwrap();
        writer.finish().unwrap().commit().unwrap();
        CURRENT.with(|current| *current.borrow_mut() = Some(tx));

        assert_eq!(with_current(|tx| tx.value_for_write(&r)), Err(StmError::Conflict));
        assert_eq!(try_with_current(|tx| tx.deref(&r)), Some(Err(StmError::Conflict)));
        assert_eq!(attempt.finish().unwrap().commit(), Err(StmError::Conflict));
    }

    #[test]
    fn first_commute_ignores_newer_commit() {
        let r = Ref::new(0);
        let attempt = Attempt::begin();

        let tx = take().unwrap();
        let writer = Attempt::begin();
        with_current(|w| w.write(&r, 10)).unwrap();
        writer.finish().unwrap().commit().unwrap();
        CURRENT.with(|current| *current.borrow_mut() = Some(tx));

        assert_eq!(with_current(|tx| tx.value_for_commute(&r)), Ok(10));
        with_current(|tx| tx.commute(&r, 11, Box::new(|v: &i32| v + 1))).unwrap();
        attempt.finish().unwrap().commit().unwrap();
        assert_eq!(r.committed(), 11);
    }

    #[test]
    fn attempt_drop_clears_slot() {
        {
            let _attempt = Attempt::begin();
            assert!(in_transaction());
        }
        assert!(!in_transaction());
        assert_eq!(with_current(|_| Ok(())), Err(StmError::NoTransaction));
    }
}
