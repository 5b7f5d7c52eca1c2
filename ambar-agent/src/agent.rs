//! `Agent<T>`: independent, asynchronous state.
//!
//! An agent owns a state and a FIFO queue of actions. Sending an action
//! never blocks: it is appended to the queue and, if the agent is idle, a
//! drain task is handed to the pool matching the action. The drain task
//! applies exactly one action, installs its result, then hands itself to the
//! pool of the next queued action. At most one drain task per agent exists at
//! any time, so actions of one agent never overlap and run in send order.
//!
//! A failing action (an error, a panic or a rejected result) leaves the state
//! untouched. In [`ErrorMode::Fail`] the agent then stops until
//! [`restart`](Agent::restart); in [`ErrorMode::Continue`] the action is
//! skipped. The error handler, if any, is told in both modes.

use crate::errors::{ActionError, AgentError, BoxError};
use crate::pool::{Dispatch, Task};
use ambar::{Hooks, Reference, VersionedCell, panic_message};
use crossbeam_epoch as epoch;
use parking_lot::{Condvar, Mutex, RwLock};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

type Update<T> = Box<dyn FnOnce(&T) -> Result<T, BoxError> + Send + 'static>;
type HeldSend = Box<dyn FnOnce()>;

/// Called with the agent and the error of every failed action.
pub type ErrorHandler<T> = Arc<dyn Fn(&Agent<T>, &ActionError) + Send + Sync>;

thread_local! {
    /// Sends issued by the action running on this thread, dispatched once
    /// its result is installed. `Some` exactly while the action function runs.
    static HELD: RefCell<Option<Vec<HeldSend>>> = const { RefCell::new(None) };

    /// Set while this thread handles an action: the action itself, the
    /// watches of its result and the error handler.
    static IN_ACTION: Cell<bool> = const { Cell::new(false) };
}

fn in_action() -> bool {
    IN_ACTION.with(Cell::get)
}

/// Marks the current thread as handling an action until dropped.
struct ActionScope {
    outer: bool,
}

impl ActionScope {
    fn enter() -> Self {
        Self {
            outer: IN_ACTION.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for ActionScope {
    fn drop(&mut self) {
        IN_ACTION.with(|flag| flag.set(self.outer));
    }
}

/// What an agent does after an action fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorMode {
    /// Store the error and stop processing until restarted.
    #[default]
    Fail,
    /// Skip the failed action and go on with the next one.
    Continue,
}

/// Options of [`Agent::restart_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestartOptions {
    /// Drop the actions queued while the agent was failed.
    pub clear_actions: bool,
}

struct Action<T> {
    dispatch: Dispatch,
    update: Update<T>,
}

enum Job<T> {
    Action(Action<T>),
    /// Set once every job queued before it has been handled.
    Barrier(Arc<AtomicBool>),
}

struct Queue<T> {
    jobs: VecDeque<Job<T>>,
    /// A drain task is queued on a pool or running.
    running: bool,
    error: Option<Arc<ActionError>>,
    mode: ErrorMode,
}

struct AgentCore<T: Clone + Send + Sync + 'static> {
    state: VersionedCell<T>,
    hooks: Hooks<T>,
    queue: Mutex<Queue<T>>,
    /// Signalled when barriers are released or the agent fails.
    settled: Condvar,
    handler: RwLock<Option<ErrorHandler<T>>>,
}

/// A shared state updated asynchronously by queued actions.
///
/// # Examples
///
/// ```rust
/// use ambar_agent::Agent;
///
/// let log = Agent::new(Vec::new());
/// for line in ["a", "b", "c"] {
///     log.send(move |l: &Vec<&str>| {
///         let mut l = l.clone();
///         l.push(line);
///         l
///     });
/// }
/// log.await_actions().unwrap();
/// assert_eq!(log.deref(), vec!["a", "b", "c"]);
/// ```
pub struct Agent<T: Clone + Send + Sync + 'static> {
    core: Arc<AgentCore<T>>,
}

impl<T: Clone + Send + Sync + 'static> Clone for Agent<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Agent<T> {
    /// Creates an idle agent holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            core: Arc::new(AgentCore {
                state: VersionedCell::new(initial),
                hooks: Hooks::new(),
                queue: Mutex::new(Queue {
                    jobs: VecDeque::new(),
                    running: false,
                    error: None,
                    mode: ErrorMode::default(),
                }),
                settled: Condvar::new(),
                handler: RwLock::new(None),
            }),
        }
    }

    /// Current state. Never blocks, also while an action runs.
    #[allow(clippy::should_implement_trait)]
    pub fn deref(&self) -> T {
        self.core.state.peek(T::clone)
    }

    /// Number of states installed so far.
    pub fn version(&self) -> u64 {
        self.core.state.version()
    }

    /// Queues `f` on the fixed `send` pool. For short, non-blocking work.
    pub fn send<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T + Send + 'static,
    {
        self.dispatch(Dispatch::Send, Box::new(move |state| Ok(f(state))));
    }

    /// Queues `f` on the growing `send_off` pool. For work that may block.
    pub fn send_off<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T + Send + 'static,
    {
        self.dispatch(Dispatch::SendOff, Box::new(move |state| Ok(f(state))));
    }

    /// Like [`send`](Agent::send), for actions that can fail.
    pub fn try_send<F, E>(&self, f: F)
    where
        F: FnOnce(&T) -> Result<T, E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.dispatch(Dispatch::Send, Box::new(move |state| f(state).map_err(Into::into)));
    }

    /// Like [`send_off`](Agent::send_off), for actions that can fail.
    pub fn try_send_off<F, E>(&self, f: F)
    where
        F: FnOnce(&T) -> Result<T, E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.dispatch(Dispatch::SendOff, Box::new(move |state| f(state).map_err(Into::into)));
    }

    /// Routes a new action: held until commit inside a transaction, held
    /// until the current action's result is installed inside an action,
    /// queued right away otherwise.
    fn dispatch(&self, dispatch: Dispatch, update: Update<T>) {
        let pending = Rc::new(Cell::new(Some(Action { dispatch, update })));

        let on_commit = {
            let agent = self.clone();
            let pending = Rc::clone(&pending);
            move || {
                if let Some(action) = pending.take() {
                    agent.enqueue(action);
                }
            }
        };
        if ambar_stm::on_commit(on_commit).is_ok() {
            tracing::trace!("agent send held until commit");
            return;
        }

        let mut action = pending.take();
        HELD.with(|held| {
            if let Some(sends) = held.borrow_mut().as_mut() {
                if let Some(action) = action.take() {
                    let agent = self.clone();
                    sends.push(Box::new(move || agent.enqueue(action)));
                }
            }
        });
        if let Some(action) = action {
            self.enqueue(action);
        }
    }

    fn enqueue(&self, action: Action<T>) {
        let mut queue = self.core.queue.lock();
        queue.jobs.push_back(Job::Action(action));
        self.schedule(&mut queue);
    }

    /// Starts a drain task unless one is running or the agent is failed.
    fn schedule(&self, queue: &mut Queue<T>) {
        if queue.running || queue.error.is_some() {
            return;
        }
        self.release_barriers(queue);
        let Some(Job::Action(next)) = queue.jobs.front() else {
            return;
        };
        queue.running = true;
        let dispatch = next.dispatch;
        let agent = self.clone();
        let task: Task = Box::new(move || agent.run_next());
        tracing::trace!(?dispatch, "agent drain scheduled");
        dispatch.execute(task);
    }

    fn release_barriers(&self, queue: &mut Queue<T>) {
        let mut released = false;
        while let Some(Job::Barrier(_)) = queue.jobs.front() {
            if let Some(Job::Barrier(done)) = queue.jobs.pop_front() {
                done.store(true, Ordering::SeqCst);
                released = true;
            }
        }
        if released {
            self.core.settled.notify_all();
        }
    }

    /// Body of the drain task: applies one action, then reschedules.
    fn run_next(&self) {
        let action = {
            let mut queue = self.core.queue.lock();
            self.release_barriers(&mut queue);
            match queue.jobs.pop_front() {
                Some(Job::Action(action)) if queue.error.is_none() => action,
                Some(job) => {
                    // Failed in the meantime; keep the job for a restart.
                    queue.jobs.push_front(job);
                    queue.running = false;
                    return;
                }
                None => {
                    queue.running = false;
                    return;
                }
            }
        };

        self.apply(action);

        let mut queue = self.core.queue.lock();
        queue.running = false;
        self.schedule(&mut queue);
    }

    fn apply(&self, action: Action<T>) {
        let _scope = ActionScope::enter();
        let old = self.deref();
        let previous = HELD.with(|held| held.replace(Some(Vec::new())));

        let update = action.update;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<T, ActionError> {
            let new = update(&old).map_err(ActionError::Failed)?;
            self.core.hooks.validate(&new).map_err(ActionError::Rejected)?;
            Ok(new)
        }))
        .unwrap_or_else(|payload| Err(ActionError::Panicked(panic_message(payload.as_ref()))));

        let held = HELD.with(|held| held.replace(previous)).unwrap_or_default();

        match outcome {
            Ok(new) => {
                self.install(old, new);
                for send in held {
                    send();
                }
            }
            Err(error) => {
                drop(held);
                self.fail(error);
            }
        }
    }

    fn install(&self, old: T, new: T) {
        let guard = epoch::pin();
        let (_, installed) = self.core.state.replace(new, 0, &guard);
        if !self.core.hooks.has_watches() {
            return;
        }
        let new = installed.value.clone();
        drop(guard);
        self.core.hooks.notify(&old, &new);
    }

    fn fail(&self, error: ActionError) {
        let error = Arc::new(error);
        let mode = {
            let mut queue = self.core.queue.lock();
            if queue.mode == ErrorMode::Fail {
                queue.error = Some(Arc::clone(&error));
                self.core.settled.notify_all();
            }
            queue.mode
        };
        tracing::debug!(%error, ?mode, "agent action failed");

        let handler = self.core.handler.read().clone();
        if let Some(handler) = handler {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(self, &error)));
            if let Err(payload) = outcome {
                tracing::warn!(
                    panic = %panic_message(payload.as_ref()),
                    "agent error handler panicked"
                );
            }
        }
    }

    /// Error that failed the agent, if it is failed.
    pub fn error(&self) -> Option<Arc<ActionError>> {
        self.core.queue.lock().error.clone()
    }

    /// Current error mode.
    pub fn error_mode(&self) -> ErrorMode {
        self.core.queue.lock().mode
    }

    /// Changes the error mode. Does not restart a failed agent.
    pub fn set_error_mode(&self, mode: ErrorMode) {
        self.core.queue.lock().mode = mode;
    }

    /// Installs `handler`, called on the worker thread after every failed
    /// action, in either error mode.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&Agent<T>, &ActionError) + Send + Sync + 'static,
    {
        *self.core.handler.write() = Some(Arc::new(handler));
    }

    /// Removes the error handler.
    pub fn clear_error_handler(&self) {
        *self.core.handler.write() = None;
    }

    /// Clears the failure, installs `state` and resumes the queued actions.
    pub fn restart(&self, state: T) -> Result<(), AgentError> {
        self.restart_with(state, RestartOptions::default())
    }

    /// [`restart`](Agent::restart) with options.
    pub fn restart_with(&self, state: T, options: RestartOptions) -> Result<(), AgentError> {
        if self.core.queue.lock().error.is_none() {
            return Err(AgentError::NotFailed);
        }
        self.core.hooks.validate(&state)?;

        let (old, new) = {
            let mut queue = self.core.queue.lock();
            if queue.error.is_none() {
                return Err(AgentError::NotFailed);
            }

            let guard = epoch::pin();
            let (previous, installed) = self.core.state.replace(state, 0, &guard);
            let values = (previous.value.clone(), installed.value.clone());
            drop(guard);

            if options.clear_actions {
                queue.jobs.retain(|job| matches!(job, Job::Barrier(_)));
            }
            queue.error = None;
            tracing::debug!(
                clear_actions = options.clear_actions,
                backlog = queue.jobs.len(),
                "agent restarted"
            );
            self.schedule(&mut queue);
            values
        };
        self.core.hooks.notify(&old, &new);
        Ok(())
    }

    /// Blocks until every action queued before this call has been handled.
    ///
    /// Fails with [`AgentError::Failed`] if the agent is or becomes failed
    /// first, and with [`AgentError::AwaitInAction`] when called from an
    /// agent action.
    pub fn await_actions(&self) -> Result<(), AgentError> {
        self.await_until(None).map(drop)
    }

    /// Like [`await_actions`](Agent::await_actions), giving up after
    /// `timeout`. Returns whether the queued actions were all handled.
    pub fn await_for(&self, timeout: Duration) -> Result<bool, AgentError> {
        self.await_until(Some(Instant::now() + timeout))
    }

    fn await_until(&self, deadline: Option<Instant>) -> Result<bool, AgentError> {
        if in_action() {
            return Err(AgentError::AwaitInAction);
        }
        let mut queue = self.core.queue.lock();
        if let Some(error) = &queue.error {
            return Err(AgentError::Failed(Arc::clone(error)));
        }
        if !queue.running && queue.jobs.is_empty() {
            return Ok(true);
        }

        let done = Arc::new(AtomicBool::new(false));
        queue.jobs.push_back(Job::Barrier(Arc::clone(&done)));
        loop {
            if done.load(Ordering::SeqCst) {
                return Ok(true);
            }
            if let Some(error) = &queue.error {
                return Err(AgentError::Failed(Arc::clone(error)));
            }
            match deadline {
                None => self.core.settled.wait(&mut queue),
                Some(deadline) => {
                    if self.core.settled.wait_until(&mut queue, deadline).timed_out() {
                        return Ok(done.load(Ordering::SeqCst));
                    }
                }
            }
        }
    }

    /// Number of actions waiting to run, not counting the running one.
    pub fn queue_len(&self) -> usize {
        self.core
            .queue
            .lock()
            .jobs
            .iter()
            .filter(|job| matches!(job, Job::Action(_)))
            .count()
    }
}

impl<T: Clone + Send + Sync + 'static> Reference<T> for Agent<T> {
    fn hooks(&self) -> &Hooks<T> {
        &self.core.hooks
    }

    fn current(&self) -> T {
        self.deref()
    }
}

impl<T: Clone + Send + Sync + 'static + fmt::Debug> fmt::Debug for Agent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.core.queue.lock();
        f.debug_struct("Agent")
            .field("value", &self.deref())
            .field("version", &self.version())
            .field("queued", &queue.jobs.len())
            .field("failed", &queue.error.is_some())
            .field("mode", &queue.mode)
            .finish()
    }
}

/// Creates an [`Agent`] holding `initial`.
pub fn agent<T: Clone + Send + Sync + 'static>(initial: T) -> Agent<T> {
    Agent::new(initial)
}

/// Waits for every agent in `agents`. See [`Agent::await_actions`].
pub fn await_all<T: Clone + Send + Sync + 'static>(agents: &[Agent<T>]) -> Result<(), AgentError> {
    agents.iter().try_for_each(Agent::await_actions)
}
