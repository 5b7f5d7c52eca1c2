use ambar_stm::{Ref, dosync};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

#[test]
#[cfg_attr(miri, ignore)]
fn test_concurrent_counter() {
    let var = Ref::new(0i64);

    let threads = 8;
    let increments = 1_000;

    let mut handles = vec![];
    for _ in 0..threads {
        let var = var.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..increments {
                dosync(|| var.alter(|v| v + 1)).unwrap();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(var.deref(), threads * increments);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_bank_transfer() {
    let num_accounts = 10;
    let accounts: Arc<Vec<Ref<i64>>> = Arc::new((0..num_accounts).map(|_| Ref::new(1000)).collect());

    let threads = 4;
    let transfers = 500;

    let mut handles = vec![];
    for _ in 0..threads {
        let accounts = accounts.clone();
        handles.push(thread::spawn(move || {
            let mut rng = rand::rng();
            for _ in 0..transfers {
                let from = rng.random_range(0..num_accounts);
                let to = rng.random_range(0..num_accounts);
                let amount = rng.random_range(1..=50);

                dosync(|| {
                    let from_bal = accounts[from].deref();
                    if from_bal >= amount && from != to {
                        accounts[from].alter(|b| b - amount)?;
                        accounts[to].alter(|b| b + amount)?;
                    }
                    Ok(())
                })
                .unwrap();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    // Total money should be conserved
    let total: i64 = dosync(|| Ok(accounts.iter().map(Ref::deref).sum())).unwrap();
    assert_eq!(
        total,
        num_accounts as i64 * 1000,
        "money not conserved: total = {}",
        total
    );
    assert!(accounts.iter().all(|a| a.deref() >= 0));
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_readers_never_see_partial_commits() {
    let refs: Arc<Vec<Ref<u64>>> = Arc::new((0..5).map(|_| Ref::new(0)).collect());
    let done = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..2)
        .map(|_| {
            let refs = refs.clone();
            thread::spawn(move || {
                for _ in 0..2_000 {
                    dosync(|| {
                        for r in refs.iter() {
                            r.alter(|v| v + 1)?;
                        }
                        Ok(())
                    })
                    .unwrap();
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let refs = refs.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut snapshots = 0;
                while !done.load(Ordering::SeqCst) {
                    let values = dosync(|| Ok(refs.iter().map(Ref::deref).collect::<Vec<_>>())).unwrap();
                    assert!(
                        values.windows(2).all(|w| w[0] == w[1]),
                        "torn snapshot: {values:?}"
                    );
                    snapshots += 1;
                }
                snapshots
            })
        })
        .collect();

    for w in writers {
        w.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    for r in readers {
        r.join().unwrap();
    }

    assert!(refs.iter().all(|r| r.deref() == 4_000));
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_multi_ref_swap() {
    let a = Ref::new(1i64);
    let b = Ref::new(2i64);

    let threads = 4;
    let swaps = 100;

    let mut handles = vec![];
    for _ in 0..threads {
        let a = a.clone();
        let b = b.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..swaps {
                dosync(|| {
                    let va = a.deref();
                    let vb = b.deref();
                    a.set(vb)?;
                    b.set(va)?;
                    Ok(())
                })
                .unwrap();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    let (va, vb) = dosync(|| Ok((a.deref(), b.deref()))).unwrap();
    assert!(
        (va == 1 && vb == 2) || (va == 2 && vb == 1),
        "unexpected: a={}, b={}",
        va,
        vb
    );
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_ensure_prevents_write_skew() {
    // Two on-call doctors; each transaction takes one off call only if the
    // other is still on call. Without ensure both could go off call.
    for _ in 0..200 {
        let alice = Ref::new(true);
        let bob = Ref::new(true);

        let spawn = |me: Ref<bool>, other: Ref<bool>| {
            thread::spawn(move || {
                dosync(|| {
                    if other.ensure()? {
                        me.set(false)?;
                    }
                    Ok(())
                })
                .unwrap();
            })
        };
        let t1 = spawn(alice.clone(), bob.clone());
        let t2 = spawn(bob.clone(), alice.clone());
        t1.join().unwrap();
        t2.join().unwrap();

        assert!(alice.deref() || bob.deref(), "both went off call");
    }
}
