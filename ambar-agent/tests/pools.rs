//! Pool configuration is process-wide, so it gets its own test binary.

use ambar_agent::{Agent, PoolConfig, configure_pools};
use std::thread;
use std::time::Duration;

#[test]
fn configured_pools_are_used() {
    let config = PoolConfig::new()
        .with_send_threads(2)
        .with_send_off_keep_alive(Duration::from_millis(50))
        .with_thread_name("ledger");
    assert!(configure_pools(config));
    assert!(!configure_pools(PoolConfig::default()), "only the first configuration counts");

    let names = Agent::new(Vec::new());
    names.send(|n: &Vec<String>| {
        let mut n = n.clone();
        n.push(thread::current().name().unwrap_or_default().to_string());
        n
    });
    names.send_off(|n: &Vec<String>| {
        let mut n = n.clone();
        n.push(thread::current().name().unwrap_or_default().to_string());
        n
    });
    names.await_actions().unwrap();

    let names = names.deref();
    assert!(names[0].starts_with("ledger-send-"), "{names:?}");
    assert!(names[1].starts_with("ledger-send-off-"), "{names:?}");

    // Idle send-off workers retire after the keep-alive; later sends still run.
    thread::sleep(Duration::from_millis(200));
    let counter = Agent::new(0);
    counter.send_off(|x| x + 1);
    counter.await_actions().unwrap();
    assert_eq!(counter.deref(), 1);
}
