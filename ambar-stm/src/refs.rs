use crate::errors::StmError;
use crate::transaction;
use ambar::{Hooks, Reference, VersionedCell};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Process-wide identity of a [`Ref`]. Also the lock acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefId(u64);

impl RefId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) struct RefCore<T> {
    pub(crate) id: RefId,
    pub(crate) cell: VersionedCell<T>,
    pub(crate) hooks: Hooks<T>,
    /// Held by a committing transaction from lock acquisition until its
    /// writes are installed.
    locked: AtomicBool,
}

impl<T> RefCore<T> {
    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }
}

/// Type-erased commit lock of a ref, so one transaction can hold the locks
/// of refs with different value types.
pub(crate) trait RefLock {
    fn try_lock(&self) -> bool;
    fn unlock(&self);
}

impl<T> RefLock for RefCore<T> {
    #[inline]
    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }
}

/// A transactional reference.
///
/// Reads work anywhere; writes (`alter`, `commute`, `set`, `ensure`) only
/// inside [`dosync`](crate::dosync). All writes of one transaction become
/// visible together, or not at all.
///
/// # Example
///
/// ```
/// use ambar_stm::{Ref, dosync};
///
/// let from = Ref::new(10);
/// let to = Ref::new(20);
///
/// dosync(|| {
///     from.alter(|x| x - 5)?;
///     to.alter(|x| x + 5)?;
///     Ok(())
/// })
/// .unwrap();
///
/// assert_eq!((from.deref(), to.deref()), (5, 25));
/// ```
pub struct Ref<T: Clone + Send + Sync + 'static> {
    pub(crate) core: Arc<RefCore<T>>,
}

impl<T: Clone + Send + Sync + 'static> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Ref<T> {
    /// Create a new Ref.
    pub fn new(initial: T) -> Self {
        Self {
            core: Arc::new(RefCore {
                id: RefId::next(),
                cell: VersionedCell::new(initial),
                hooks: Hooks::new(),
                locked: AtomicBool::new(false),
            }),
        }
    }

    /// Identity of this ref, shared by its clones.
    pub fn id(&self) -> RefId {
        self.core.id
    }

    /// Number of commits that wrote this ref.
    pub fn version(&self) -> u64 {
        self.core.cell.version()
    }

    /// Current value.
    ///
    /// Outside a transaction this is the last committed value. Inside one it
    /// is the transaction's pending value if the ref was written, otherwise
    /// the committed value as of the transaction's snapshot. A read that
    /// cannot be served from that snapshot abandons the attempt on the spot
    /// and `dosync` runs the body again, so the body never sees torn state.
    #[allow(clippy::should_implement_trait)]
    pub fn deref(&self) -> T {
        match transaction::try_with_current(|tx| tx.deref(self)) {
            None => self.committed(),
            Some(Ok(value)) => value,
            Some(Err(_)) => transaction::retry_now(),
        }
    }

    /// Last committed value, ignoring any running transaction.
    pub fn committed(&self) -> T {
        self.core.cell.peek(T::clone)
    }

    /// Sets the in-transaction value to `f(current)` and returns it.
    pub fn alter<F>(&self, f: F) -> Result<T, StmError>
    where
        F: FnOnce(&T) -> T,
    {
        let current = transaction::with_current(|tx| tx.value_for_write(self))?;
        let proposed = f(&current);
        self.write(proposed)
    }

    /// Sets the in-transaction value (ref-set).
    pub fn set(&self, value: T) -> Result<T, StmError> {
        transaction::with_current(|tx| tx.value_for_write(self).map(drop))?;
        self.write(value)
    }

    /// Records a commutative update.
    ///
    /// `f` is applied right away to the in-transaction value (that result is
    /// returned) and applied again at commit time to the latest committed
    /// value, so a concurrent commit to this ref does not force a retry.
    /// `f` must therefore be order-independent with respect to other
    /// commutes of the same ref.
    pub fn commute<F>(&self, f: F) -> Result<T, StmError>
    where
        F: Fn(&T) -> T + 'static,
    {
        let current = transaction::with_current(|tx| tx.value_for_commute(self))?;
        let proposed = f(&current);
        transaction::with_current(|tx| tx.commute(self, proposed.clone(), Box::new(f)))?;
        Ok(proposed)
    }

    /// Protects the ref from concurrent writes until this transaction commits,
    /// without writing it. Returns the in-transaction value.
    pub fn ensure(&self) -> Result<T, StmError> {
        transaction::with_current(|tx| tx.ensure(self))
    }

    fn write(&self, value: T) -> Result<T, StmError> {
        self.core.hooks.validate(&value)?;
        transaction::with_current(|tx| tx.write(self, value.clone()))?;
        Ok(value)
    }
}

impl<T: Clone + Send + Sync + 'static> Reference<T> for Ref<T> {
    fn hooks(&self) -> &Hooks<T> {
        &self.core.hooks
    }

    fn current(&self) -> T {
        self.committed()
    }
}

impl<T: Clone + Send + Sync + 'static + fmt::Debug> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref")
            .field("id", &self.core.id)
            .field("value", &self.committed())
            .field("version", &self.version())
            .finish()
    }
}
