//! Worker pools that run agent actions.
//!
//! Two process-wide pools back the two send flavours:
//!
//! - the **send** pool has a fixed number of threads and is meant for short,
//!   CPU-bound actions;
//! - the **send-off** pool starts empty, spawns a thread whenever a task
//!   arrives and no worker is idle, and retires workers that stay idle for
//!   longer than the keep-alive. Blocking actions belong here.
//!
//! Both pools are created on first use from the [`PoolConfig`] installed by
//! [`configure_pools`], or from the default one.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// Sizing of the agent worker pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Threads of the fixed `send` pool.
    pub send_threads: usize,
    /// How long an idle `send_off` worker waits for work before exiting.
    pub send_off_keep_alive: Duration,
    /// Prefix of worker thread names.
    pub thread_name: String,
}

impl PoolConfig {
    /// Defaults: `available_parallelism + 2` send threads, a 60s keep-alive
    /// and `ambar-agent` thread names.
    pub fn new() -> Self {
        let cpus = thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            send_threads: cpus + 2,
            send_off_keep_alive: Duration::from_secs(60),
            thread_name: String::from("ambar-agent"),
        }
    }

    /// Size of the `send` pool, at least one.
    pub fn with_send_threads(mut self, send_threads: usize) -> Self {
        self.send_threads = send_threads.max(1);
        self
    }

    /// Idle time after which a `send_off` worker exits.
    pub fn with_send_off_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.send_off_keep_alive = keep_alive;
        self
    }

    /// Prefix of worker thread names.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

static CONFIG: OnceLock<PoolConfig> = OnceLock::new();
static SEND_POOL: OnceLock<FixedPool> = OnceLock::new();
static SEND_OFF_POOL: OnceLock<ElasticPool> = OnceLock::new();

/// Installs the pool configuration.
///
/// Must run before the first action is sent. Returns `false`, and changes
/// nothing, once a configuration is in place.
pub fn configure_pools(config: PoolConfig) -> bool {
    CONFIG.set(config).is_ok()
}

fn config() -> &'static PoolConfig {
    CONFIG.get_or_init(PoolConfig::default)
}

/// Which pool runs an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Send,
    SendOff,
}

impl Dispatch {
    pub(crate) fn execute(self, task: Task) {
        match self {
            Dispatch::Send => SEND_POOL.get_or_init(|| FixedPool::new(config())).execute(task),
            Dispatch::SendOff => SEND_OFF_POOL.get_or_init(|| ElasticPool::new(config())).execute(task),
        }
    }
}

fn run(task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        tracing::warn!(
            panic = %ambar::panic_message(payload.as_ref()),
            "agent task panicked"
        );
    }
}

struct FixedPool {
    sender: Sender<Task>,
}

impl FixedPool {
    fn new(config: &PoolConfig) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let mut spawned = 0;
        for index in 0..config.send_threads.max(1) {
            let receiver = receiver.clone();
            let spawn = thread::Builder::new()
                .name(format!("{}-send-{index}", config.thread_name))
                .spawn(move || {
                    for task in receiver.iter() {
                        run(task);
                    }
                });
            match spawn {
                Ok(_) => spawned += 1,
                Err(error) => tracing::error!(%error, "failed to spawn send worker"),
            }
        }
        tracing::debug!(threads = spawned, "send pool started");
        Self { sender }
    }

    fn execute(&self, task: Task) {
        // Workers hold receivers for the life of the process.
        if self.sender.send(task).is_err() {
            tracing::error!("send pool has no workers");
        }
    }
}

struct ElasticPool {
    sender: Sender<Task>,
    receiver: Receiver<Task>,
    /// Waiting workers that no submitted task has claimed yet.
    idle: AtomicUsize,
    spawned: AtomicUsize,
    keep_alive: Duration,
    thread_name: String,
}

impl ElasticPool {
    fn new(config: &PoolConfig) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            sender,
            receiver,
            idle: AtomicUsize::new(0),
            spawned: AtomicUsize::new(0),
            keep_alive: config.send_off_keep_alive,
            thread_name: config.thread_name.clone(),
        }
    }

    fn claim_idle(&self) -> bool {
        self.idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn execute(&'static self, task: Task) {
        if self.sender.send(task).is_err() {
            return;
        }
        if !self.claim_idle() {
            self.spawn_worker();
        }
    }

    fn spawn_worker(&'static self) {
        let index = self.spawned.fetch_add(1, Ordering::Relaxed);
        let spawn = thread::Builder::new()
            .name(format!("{}-send-off-{index}", self.thread_name))
            .spawn(move || self.work());
        if let Err(error) = spawn {
            // The task stays queued for the next worker that frees up.
            tracing::error!(%error, "failed to spawn send-off worker");
        }
    }

    fn work(&self) {
        loop {
            match self.receiver.recv_timeout(self.keep_alive) {
                Ok(task) => {
                    run(task);
                    self.idle.fetch_add(1, Ordering::AcqRel);
                }
                Err(RecvTimeoutError::Timeout) => {
                    // Retire only if no task is on its way to us.
                    if self.claim_idle() {
                        tracing::trace!("idle send-off worker retired");
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}
