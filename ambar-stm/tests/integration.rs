use ambar_stm::{
    Ref, Reference, Stm, StmConfig, StmError, ValidationError, abort, dosync, in_transaction,
    on_commit, on_rollback,
};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

#[test]
fn test_basic_transaction() {
    let var = Ref::new(10);

    let result = dosync(|| {
        let val = var.deref();
        var.set(val + 5)?;
        Ok(val)
    });

    assert_eq!(result, Ok(10));
    assert_eq!(var.deref(), 15);
    assert_eq!(var.version(), 1);
}

#[test]
fn test_read_your_own_writes() {
    let var = Ref::new(10);

    dosync(|| {
        assert_eq!(var.deref(), 10);

        var.set(20)?;
        assert_eq!(var.deref(), 20); // Should see the uncommitted write

        var.alter(|v| v + 10)?;
        assert_eq!(var.deref(), 30);

        // Other threads still see the committed value.
        assert_eq!(var.committed(), 10);
        Ok(())
    })
    .unwrap();

    assert_eq!(var.deref(), 30);
}

#[test]
fn test_multiple_refs_move_together() {
    let a = Ref::new(10);
    let b = Ref::new(20);

    dosync(|| {
        a.alter(|x| x - 5)?;
        b.alter(|x| x + 5)?;
        Ok(())
    })
    .unwrap();

    assert_eq!((a.deref(), b.deref()), (5, 25));
}

#[test]
fn test_mixed_value_types() {
    let name = Ref::new(String::from("draft"));
    let revision = Ref::new(0u32);
    let tags = Ref::new(Vec::<&'static str>::new());

    dosync(|| {
        name.set(String::from("published"))?;
        revision.alter(|r| r + 1)?;
        tags.alter(|t| {
            let mut t = t.clone();
            t.push("final");
            t
        })?;
        Ok(())
    })
    .unwrap();

    assert_eq!(name.deref(), "published");
    assert_eq!(revision.deref(), 1);
    assert_eq!(tags.deref(), vec!["final"]);
}

#[test]
fn test_isolation() {
    let var = Ref::new(0);
    let var_clone = var.clone();

    // T1 signals it has written (but not committed), main thread signals it has read
    let t1_wrote = Arc::new(AtomicBool::new(false));
    let t1_wrote_clone = t1_wrote.clone();
    let main_read = Arc::new(AtomicBool::new(false));
    let main_read_clone = main_read.clone();

    let t1 = thread::spawn(move || {
        dosync(|| {
            var_clone.set(100)?;

            // Signal: we've written but haven't committed yet
            t1_wrote_clone.store(true, Ordering::SeqCst);

            // Wait: don't return (and commit) until main thread has read
            while !main_read_clone.load(Ordering::SeqCst) {
                thread::yield_now();
            }

            Ok(())
        })
    });

    // Wait for T1 to have written inside its transaction
    while !t1_wrote.load(Ordering::SeqCst) {
        thread::yield_now();
    }

    // Read while T1 is mid-transaction, should NOT see uncommitted write
    assert_eq!(var.deref(), 0);
    assert_eq!(dosync(|| Ok(var.deref())), Ok(0));

    // Let T1 commit
    main_read.store(true, Ordering::SeqCst);
    t1.join().unwrap().unwrap();

    assert_eq!(var.deref(), 100);
}

#[test]
fn test_conflict_retry() {
    let var = Ref::new(0);

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let var = var.clone();
            thread::spawn(move || {
                for _ in 0..10_000 {
                    dosync(|| var.alter(|v| v + 1)).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(var.deref(), 20_000);
    assert_eq!(var.version(), 20_000);
}

#[test]
fn test_stale_read_is_retried() {
    let var = Ref::new(1);
    let attempts = AtomicUsize::new(0);

    let seen = dosync(|| {
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            // Another thread commits after our snapshot was taken.
            let var = var.clone();
            thread::spawn(move || dosync(|| var.set(2)).unwrap())
                .join()
                .unwrap();
        }
        Ok(var.deref())
    });

    assert_eq!(seen, Ok(2));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn test_body_never_sees_torn_state() {
    let x = Ref::new(100);
    let y = Ref::new(0);
    let attempts = AtomicUsize::new(0);
    let observed = Mutex::new(Vec::new());

    let total = dosync(|| {
        let seen_x = x.deref();
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            // Move 50 from x to y between our two reads.
            let (x, y) = (x.clone(), y.clone());
            thread::spawn(move || {
                dosync(|| {
                    x.alter(|v| v - 50)?;
                    y.alter(|v| v + 50)
                })
                .unwrap()
            })
            .join()
            .unwrap();
        }
        let seen_y = y.deref();
        observed.lock().push((seen_x, seen_y));
        // A body relying on the invariant must not trip over a torn read.
        assert_eq!(seen_x + seen_y, 100);
        Ok(seen_x + seen_y)
    });

    assert_eq!(total, Ok(100));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(*observed.lock(), vec![(50, 50)]);
}

#[test]
fn test_side_effects() {
    let var = Ref::new(0);

    let commits = Arc::new(AtomicUsize::new(0));
    let rollbacks = Arc::new(AtomicUsize::new(0));

    // 1. Successful transaction
    let c = commits.clone();
    let r = rollbacks.clone();
    dosync(|| {
        var.set(1)?;
        let c = c.clone();
        let r = r.clone();
        on_commit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })?;
        on_rollback(move || {
            r.fetch_add(1, Ordering::SeqCst);
        })?;
        Ok(())
    })
    .unwrap();

    assert_eq!(commits.load(Ordering::SeqCst), 1);
    assert_eq!(rollbacks.load(Ordering::SeqCst), 0);

    // 2. Retry transaction (Conflict)
    // T1: Reads, waits, writes. (Slow)
    // T2: Writes immediately. (Fast)
    // T1 fails to commit, retries, and the first attempt's rollback hook runs.
    let commits = Arc::new(AtomicUsize::new(0));
    let rollbacks = Arc::new(AtomicUsize::new(0));

    let var_t1 = var.clone();
    let c_t1 = commits.clone();
    let r_t1 = rollbacks.clone();

    let t1_ready = Arc::new(AtomicBool::new(false));
    let t1_ready_clone = t1_ready.clone();
    let t2_committed = Arc::new(AtomicBool::new(false));
    let t2_committed_clone = t2_committed.clone();

    let t1 = thread::spawn(move || {
        dosync(|| {
            // Read to pin the version we depend on
            let _ = var_t1.deref();

            let c = c_t1.clone();
            let r = r_t1.clone();
            on_commit(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })?;
            on_rollback(move || {
                r.fetch_add(1, Ordering::SeqCst);
            })?;

            t1_ready_clone.store(true, Ordering::SeqCst);

            // Wait for T2 to commit before we try to commit (forces conflict)
            while !t2_committed_clone.load(Ordering::SeqCst) {
                thread::yield_now();
            }

            var_t1.set(100)?;
            Ok(())
        })
    });

    while !t1_ready.load(Ordering::SeqCst) {
        thread::yield_now();
    }

    dosync(|| var.set(200)).unwrap();
    t2_committed.store(true, Ordering::SeqCst);

    t1.join().unwrap().unwrap();

    assert_eq!(
        commits.load(Ordering::SeqCst),
        1,
        "Should have 1 successful commit"
    );
    assert!(
        rollbacks.load(Ordering::SeqCst) >= 1,
        "Should have at least 1 rollback due to retry"
    );
    assert_eq!(var.deref(), 100);
}

#[test]
fn test_commit_hook_sees_committed_state() {
    let var = Ref::new(0);
    let observed = Arc::new(Mutex::new(None));

    let o = observed.clone();
    let v = var.clone();
    dosync(|| {
        var.set(7)?;
        let o = o.clone();
        let v = v.clone();
        on_commit(move || {
            *o.lock() = Some((in_transaction(), v.deref()));
        })
    })
    .unwrap();

    assert_eq!(*observed.lock(), Some((false, 7)));
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_writes_outside_transaction() {
    let var = Ref::new(0);

    assert_eq!(var.alter(|v| v + 1), Err(StmError::NoTransaction));
    assert_eq!(var.set(1), Err(StmError::NoTransaction));
    assert_eq!(var.commute(|v| v + 1), Err(StmError::NoTransaction));
    assert_eq!(var.ensure(), Err(StmError::NoTransaction));
    assert_eq!(on_commit(|| {}), Err(StmError::NoTransaction));

    // Reads are fine anywhere.
    assert_eq!(var.deref(), 0);
    assert_eq!(var.version(), 0);
}

#[test]
fn test_validator_aborts_whole_transaction() {
    let first = Ref::new(0);
    let second = Ref::new(10);
    second.add_validator(|v| *v >= 0).unwrap();

    let rollbacks = Arc::new(AtomicUsize::new(0));
    let r = rollbacks.clone();
    let result = dosync(|| {
        let r = r.clone();
        on_rollback(move || {
            r.fetch_add(1, Ordering::SeqCst);
        })?;
        first.alter(|v| v + 1)?;
        second.alter(|v| v - 20)?;
        Ok(())
    });

    assert_eq!(result, Err(StmError::Validation(ValidationError { index: 0 })));
    assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
    // No partial commit.
    assert_eq!((first.deref(), second.deref()), (0, 10));
    assert_eq!((first.version(), second.version()), (0, 0));
}

#[test]
fn test_validator_runs_on_replayed_commute() {
    let counter = Ref::new(4);
    counter.add_validator(|v| *v < 5).unwrap();

    let result = dosync(|| counter.commute(|v| v + 1));
    assert_eq!(result, Err(StmError::Validation(ValidationError { index: 0 })));
    assert_eq!(counter.deref(), 4);
}

#[test]
fn test_user_abort() {
    let stock = Ref::new(3u32);
    let attempts = AtomicUsize::new(0);

    let result: Result<(), _> = dosync(|| {
        attempts.fetch_add(1, Ordering::SeqCst);
        stock.alter(|s| s - 1)?;
        abort("payment declined")
    });

    assert_eq!(result, Err(StmError::Aborted("payment declined".into())));
    assert_eq!(attempts.load(Ordering::SeqCst), 1, "aborts are not retried");
    assert_eq!(stock.deref(), 3);
}

#[test]
fn test_retry_limit() {
    let stm = Stm::with_config(StmConfig::new().with_max_retries(0));
    let var = Ref::new(0);

    let result = stm.dosync(|| {
        let current = var.deref();
        let other = var.clone();
        thread::spawn(move || dosync(|| other.alter(|v| v + 1)).unwrap())
            .join()
            .unwrap();
        var.set(current + 100)
    });

    assert_eq!(result, Err(StmError::Timeout { attempts: 1 }));
    assert_eq!(var.deref(), 1);
}

#[test]
fn test_panic_in_body_clears_transaction() {
    let var = Ref::new(0);
    let rolled_back = Arc::new(AtomicBool::new(false));

    let r = rolled_back.clone();
    let v = var.clone();
    let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
        dosync(|| -> Result<(), StmError> {
            let r = r.clone();
            on_rollback(move || r.store(true, Ordering::SeqCst))?;
            v.set(1)?;
            panic!("body failed")
        })
    }));

    assert!(outcome.is_err());
    assert!(!in_transaction());
    assert!(rolled_back.load(Ordering::SeqCst));
    assert_eq!(var.deref(), 0);

    // The thread is still usable.
    dosync(|| var.set(2)).unwrap();
    assert_eq!(var.deref(), 2);
}

// ============================================================================
// Nesting
// ============================================================================

#[test]
fn test_nested_dosync_joins_outer() {
    let var = Ref::new(0);

    let result: Result<(), _> = dosync(|| {
        dosync(|| var.set(1))?;
        assert_eq!(var.deref(), 1);
        // Nothing is visible before the outer transaction commits.
        assert_eq!(var.committed(), 0);
        abort("outer gives up")
    });

    assert!(result.is_err());
    assert_eq!(var.deref(), 0);

    dosync(|| {
        dosync(|| var.alter(|v| v + 1))?;
        var.alter(|v| v + 1)
    })
    .unwrap();
    assert_eq!(var.deref(), 2);
    assert_eq!(var.version(), 1);
}

// ============================================================================
// Commute and ensure
// ============================================================================

#[test]
fn test_commute_returns_in_transaction_value() {
    let hits = Ref::new(10);

    let seen = dosync(|| {
        let first = hits.commute(|h| h + 1)?;
        let second = hits.commute(|h| h * 2)?;
        Ok((first, second, hits.deref()))
    });

    assert_eq!(seen, Ok((11, 22, 22)));
    assert_eq!(hits.deref(), 22);
}

#[test]
fn test_commute_survives_concurrent_commit() {
    let hits = Ref::new(0);
    let attempts = AtomicUsize::new(0);

    dosync(|| {
        attempts.fetch_add(1, Ordering::SeqCst);
        hits.commute(|h| h + 1)?;
        // A concurrent commit lands before ours; commute replays on top of it.
        let other = hits.clone();
        if attempts.load(Ordering::SeqCst) == 1 {
            thread::spawn(move || dosync(|| other.set(100)).unwrap())
                .join()
                .unwrap();
        }
        Ok(())
    })
    .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(hits.deref(), 101);
}

#[test]
fn test_commute_after_newer_commit_needs_no_retry() {
    let stm = Stm::with_config(StmConfig::new().with_max_retries(0));
    let hits = Ref::new(0);
    let attempts = AtomicUsize::new(0);

    let seen = stm.dosync(|| {
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            // Lands after our snapshot but before the first commute.
            let other = hits.clone();
            thread::spawn(move || dosync(|| other.set(100)).unwrap())
                .join()
                .unwrap();
        }
        hits.commute(|h| h + 1)
    });

    assert_eq!(seen, Ok(101));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(hits.deref(), 101);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_concurrent_commutes() {
    let hits = Ref::new(0u64);
    let threads = 8;
    let per_thread = 1_000;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let hits = hits.clone();
            thread::spawn(move || {
                for _ in 0..per_thread {
                    dosync(|| hits.commute(|h| h + 1)).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(hits.deref(), threads * per_thread);
}

#[test]
fn test_alter_after_commute() {
    let var = Ref::new(1);

    let result = dosync(|| {
        var.commute(|v| v + 1)?;
        var.alter(|v| v * 10)
    });
    assert_eq!(result, Err(StmError::AlterAfterCommute));

    let result = dosync(|| {
        var.commute(|v| v + 1)?;
        var.set(0)
    });
    assert_eq!(result, Err(StmError::AlterAfterCommute));
    assert_eq!(var.deref(), 1);

    // The other way round is allowed.
    dosync(|| {
        var.alter(|v| v * 10)?;
        var.commute(|v| v + 1)
    })
    .unwrap();
    assert_eq!(var.deref(), 11);
}

#[test]
fn test_ensure_detects_concurrent_write() {
    let limit = Ref::new(10);
    let used = Ref::new(0);
    let attempts = AtomicUsize::new(0);

    dosync(|| {
        let n = attempts.fetch_add(1, Ordering::SeqCst);
        let max = limit.ensure()?;
        if n == 0 {
            let limit = limit.clone();
            thread::spawn(move || dosync(|| limit.set(5)).unwrap())
                .join()
                .unwrap();
        }
        used.set(max)
    })
    .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(used.deref(), 5);
    // Ensuring does not write.
    assert_eq!(limit.version(), 1);
}

// ============================================================================
// Watches
// ============================================================================

#[test]
fn test_watches_fire_after_commit() {
    let var = Ref::new(0);
    let log = Arc::new(Mutex::new(Vec::new()));

    let l = log.clone();
    var.add_watch("log", move |key, old, new| {
        l.lock().push((key.to_string(), *old, *new));
    });

    dosync(|| {
        var.alter(|v| v + 1)?;
        var.alter(|v| v + 1)
    })
    .unwrap();
    let _: Result<(), _> = dosync(|| {
        var.set(99)?;
        abort("never mind")
    });

    // One notification per commit, none for the aborted one.
    assert_eq!(*log.lock(), vec![("log".to_string(), 0, 2)]);
}

#[test]
fn test_watch_can_start_transaction() {
    let source = Ref::new(0);
    let mirror = Ref::new(0);

    let m = mirror.clone();
    source.add_watch("mirror", move |_, _, new| {
        let new = *new;
        dosync(|| m.set(new)).unwrap();
    });

    dosync(|| source.set(5)).unwrap();
    assert_eq!(mirror.deref(), 5);
}
