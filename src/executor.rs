//! Executors decide where promise callbacks run.
//!
//! The promise core only ever calls [`Executor::submit`]. Everything else in
//! this module is a ready-made executor: run inline, run on a dedicated
//! worker, run on a pool, or queue on a [`Looper`] that some thread drains.
//!
//! A FIFO executor (a [`Looper`], a [`SingleWorker`]) delivers the callbacks
//! of one chain in order. A [`Pool`] gives no such guarantee.
use crate::Error;
use futures::executor::ThreadPool;
use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    num::NonZeroUsize,
    panic::{self, AssertUnwindSafe},
    sync::{
        mpsc::{channel, Sender},
        Arc, Condvar, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

/// A unit of work handed to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The executor every promise cell holds on to.
pub type SharedExecutor = Arc<dyn Executor>;

/// Accepts a task and eventually runs it.
pub trait Executor: Send + Sync + 'static {
    fn submit(&self, task: Task);
}

impl<F> Executor for F
where
    F: Fn(Task) + Send + Sync + 'static,
{
    fn submit(&self, task: Task) {
        self(task)
    }
}

/// Runs a task on a worker thread. A panicking task is logged instead of
/// taking the worker down with it.
fn run_guarded(task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        log::error!(
            "task panicked on {:?}: {}",
            thread::current().name().unwrap_or("<unnamed>"),
            crate::panic_message(payload.as_ref())
        );
    }
}

fn parallelism() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

thread_local! {
    // Tasks submitted while this thread is already running an inline task.
    static INLINE: RefCell<Option<VecDeque<Task>>> = RefCell::new(None);
}

/// Closes the inline queue of this thread, even if a task panicked.
struct Draining;

impl Drop for Draining {
    fn drop(&mut self) {
        let leftover = INLINE.try_with(|queue| queue.borrow_mut().take());
        drop(leftover);
    }
}

/// Runs every task on the submitting thread, before the outermost `submit`
/// returns.
///
/// A task submitted from inside a running task is queued and runs once the
/// current one returns, in submission order. A chain of any length therefore
/// settles at constant stack depth.
///
/// Blocking inside a task on work that was submitted to this executor from
/// the same task never finishes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl Executor for Immediate {
    fn submit(&self, task: Task) {
        let task = INLINE.with(|queue| match queue.borrow_mut().as_mut() {
            Some(tasks) => {
                tasks.push_back(task);
                None
            }
            None => Some(task),
        });
        let Some(task) = task else {
            return;
        };
        INLINE.with(|queue| *queue.borrow_mut() = Some(VecDeque::new()));
        let _draining = Draining;
        task();
        while let Some(task) =
            INLINE.with(|queue| queue.borrow_mut().as_mut().and_then(VecDeque::pop_front))
        {
            task();
        }
    }
}

/// One dedicated background thread fed through a channel.
pub struct SingleWorker {
    sender: Mutex<Sender<Task>>,
}

impl SingleWorker {
    pub fn new(name: &str) -> Result<Self, Error> {
        let (tx, rx) = channel::<Task>();
        thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    run_guarded(task);
                }
                log::trace!("single worker exiting");
            })
            .map_err(|err| Error::ExecutorUnavailable(err.to_string()))?;
        Ok(Self {
            sender: Mutex::new(tx),
        })
    }
}

impl fmt::Debug for SingleWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleWorker").finish_non_exhaustive()
    }
}

impl Executor for SingleWorker {
    fn submit(&self, task: Task) {
        let sender = self.sender.lock().unwrap();
        if sender.send(task).is_err() {
            log::error!("single worker has exited, dropping task");
        }
    }
}

/// Settings for a [`Pool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: parallelism(),
            name_prefix: String::from("thenable-pool-"),
        }
    }
}

/// A fixed-size pool of worker threads.
#[derive(Debug, Clone)]
pub struct Pool {
    pool: ThreadPool,
}

impl Pool {
    pub fn new() -> Result<Self, Error> {
        Self::with_config(&PoolConfig::default())
    }

    pub fn with_config(config: &PoolConfig) -> Result<Self, Error> {
        let pool = ThreadPool::builder()
            .pool_size(config.size.max(1))
            .name_prefix(config.name_prefix.clone())
            .create()
            .map_err(|err| Error::ExecutorUnavailable(err.to_string()))?;
        Ok(Self { pool })
    }
}

impl Executor for Pool {
    fn submit(&self, task: Task) {
        self.pool.spawn_ok(async move { run_guarded(task) });
    }
}

#[derive(Default)]
struct Queue {
    tasks: Mutex<VecDeque<Task>>,
    ready: Condvar,
}

/// A FIFO task queue that runs nothing by itself.
///
/// Whichever thread calls one of the `run` methods becomes the loop thread,
/// the way a UI thread drains its event queue.
#[derive(Clone, Default)]
pub struct Looper {
    queue: Arc<Queue>,
}

impl Looper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executor(&self) -> SharedExecutor {
        Arc::new(self.clone())
    }

    /// Number of queued tasks.
    pub fn pending(&self) -> usize {
        self.queue.tasks.lock().unwrap().len()
    }

    fn pop(&self) -> Option<Task> {
        self.queue.tasks.lock().unwrap().pop_front()
    }

    /// Run queued tasks, including ones queued while running, until the
    /// queue is empty. Returns how many tasks ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.pop() {
            task();
            ran += 1;
        }
        ran
    }

    /// Run tasks as they arrive until `done` returns true or `deadline`
    /// passes. Returns the final value of `done`.
    pub fn run_until(&self, deadline: Instant, done: impl Fn() -> bool) -> bool {
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let task = {
                let tasks = self.queue.tasks.lock().unwrap();
                let wait = (deadline - now).min(Duration::from_millis(10));
                let (mut tasks, _) = self
                    .queue
                    .ready
                    .wait_timeout_while(tasks, wait, |tasks| tasks.is_empty())
                    .unwrap();
                tasks.pop_front()
            };
            if let Some(task) = task {
                task();
            }
        }
    }
}

impl fmt::Debug for Looper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Looper")
            .field("pending", &self.pending())
            .finish()
    }
}

impl Executor for Looper {
    fn submit(&self, task: Task) {
        self.queue.tasks.lock().unwrap().push_back(task);
        self.queue.ready.notify_one();
    }
}

/// Run `task` on a timer thread once `delay` has elapsed. If the timer
/// thread cannot be started the task is dropped.
pub fn after(delay: Duration, task: Task) {
    let spawned = thread::Builder::new()
        .name(String::from("thenable-timer"))
        .spawn(move || {
            thread::sleep(delay);
            task();
        });
    if let Err(err) = spawned {
        log::error!("failed to start timer thread: {err}");
    }
}

fn or_immediate<E: Executor>(kind: &str, built: Result<E, Error>) -> SharedExecutor {
    match built {
        Ok(executor) => Arc::new(executor),
        Err(err) => {
            log::error!("{kind} executor unavailable, running inline instead: {err}");
            Arc::new(Immediate)
        }
    }
}

/// Runs tasks inline on the submitting thread.
pub fn immediate() -> SharedExecutor {
    Arc::new(Immediate)
}

/// Process-wide pool for work that spends its time waiting.
pub fn io() -> SharedExecutor {
    static IO: OnceLock<SharedExecutor> = OnceLock::new();
    IO.get_or_init(|| {
        let config = PoolConfig {
            size: parallelism() * 4,
            name_prefix: String::from("thenable-io-"),
        };
        or_immediate("io", Pool::with_config(&config))
    })
    .clone()
}

/// Process-wide pool with one thread per core.
pub fn computation() -> SharedExecutor {
    static COMPUTATION: OnceLock<SharedExecutor> = OnceLock::new();
    COMPUTATION
        .get_or_init(|| {
            let config = PoolConfig {
                name_prefix: String::from("thenable-computation-"),
                ..PoolConfig::default()
            };
            or_immediate("computation", Pool::with_config(&config))
        })
        .clone()
}

/// Process-wide single background worker.
pub fn new_thread() -> SharedExecutor {
    static WORKER: OnceLock<SharedExecutor> = OnceLock::new();
    WORKER
        .get_or_init(|| or_immediate("new_thread", SingleWorker::new("thenable-worker")))
        .clone()
}

/// The process-wide main loop. Some thread has to drain it.
pub fn main_looper() -> Looper {
    static MAIN: OnceLock<Looper> = OnceLock::new();
    MAIN.get_or_init(Looper::new).clone()
}

pub fn main_loop() -> SharedExecutor {
    main_looper().executor()
}

thread_local! {
    static CURRENT: Looper = Looper::new();
}

/// The calling thread's own loop.
pub fn current_looper() -> Looper {
    CURRENT.with(Looper::clone)
}

/// Queue tasks on the calling thread's loop; they run when that thread
/// drains [`current_looper`].
pub fn current_thread() -> SharedExecutor {
    current_looper().executor()
}
