//! Callbacks paired with the execution context they must run on

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

use flume::RecvTimeoutError;
use tracing::{debug, error, warn};

use crate::deadline::Deadline;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere a callback can be submitted to run.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

/// Jobs run on tokio's blocking pool so callbacks are free to block.
impl Executor for tokio::runtime::Handle {
    fn execute(&self, job: Job) {
        drop(self.spawn_blocking(job));
    }
}

/// A dedicated single thread running jobs strictly in submission order.
///
/// The thread exits once the executor is dropped and its queue drains.
pub struct SerialExecutor {
    name: String,
    jobs: flume::Sender<Job>,
}

impl SerialExecutor {
    pub fn new(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let (jobs, queue) = flume::unbounded::<Job>();
        let thread_name = name.clone();
        thread::Builder::new().name(name.clone()).spawn(move || {
            for job in queue.iter() {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("job panicked on serial executor {}", thread_name);
                }
            }
            debug!("serial executor {} exiting", thread_name);
        })?;
        Ok(Self { name, jobs })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Executor for SerialExecutor {
    fn execute(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            warn!("serial executor {} is gone; dropping job", self.name);
        }
    }
}

/// A callback target plus the executor on which it must be invoked.
pub struct Continuation<T: ?Sized> {
    target: Arc<T>,
    executor: Arc<dyn Executor>,
}

impl<T: ?Sized> Clone for Continuation<T> {
    fn clone(&self) -> Self {
        Self {
            target: Arc::clone(&self.target),
            executor: Arc::clone(&self.executor),
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> Continuation<T> {
    pub fn new(executor: Arc<dyn Executor>, target: Arc<T>) -> Self {
        Self { target, executor }
    }

    pub fn target(&self) -> &Arc<T> {
        &self.target
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// Submit `f(target)` to the continuation's executor. Never runs inline.
    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let target = Arc::clone(&self.target);
        self.executor.execute(Box::new(move || f(&target)));
    }

    /// A continuation for a different target that runs where this one runs
    pub fn with_target<U: ?Sized>(&self, target: Arc<U>) -> Continuation<U> {
        Continuation {
            target,
            executor: Arc::clone(&self.executor),
        }
    }
}

const PENDING: u8 = 0;
const FINISHED: u8 = 1;
const EXPIRED: u8 = 2;

/// Outcome of waiting on a [`ContinuationSynchronizer`]
#[derive(Debug)]
pub enum Synchronized<T> {
    Finished(Option<T>),
    Expired,
}

/// Bridges an asynchronous completion back to a waiting thread, bounded by a
/// deadline.
///
/// Exactly one of "finished" and "expired" wins. A completion arriving after
/// expiry is handed back to its producer instead of being delivered.
pub struct ContinuationSynchronizer<T> {
    deadline: Deadline,
    state: AtomicU8,
    tx: flume::Sender<Option<T>>,
    rx: flume::Receiver<Option<T>>,
}

impl<T> ContinuationSynchronizer<T> {
    pub fn new(deadline: Deadline) -> Self {
        let (tx, rx) = flume::bounded(1);
        Self {
            deadline,
            state: AtomicU8::new(PENDING),
            tx,
            rx,
        }
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    /// Deliver the result. Returns the value back if the wait already
    /// finished or expired.
    pub fn finish(&self, value: Option<T>) -> Result<(), Option<T>> {
        if self
            .state
            .compare_exchange(PENDING, FINISHED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(value);
        }
        // Capacity one and a single winner: this never blocks.
        self.tx.send(value).map_err(|err| err.into_inner())
    }

    /// Block until finished or until the deadline passes.
    pub fn wait(&self) -> Synchronized<T> {
        match self.rx.recv_deadline(self.deadline.instant()) {
            Ok(value) => Synchronized::Finished(value),
            Err(RecvTimeoutError::Timeout) => {
                if self
                    .state
                    .compare_exchange(PENDING, EXPIRED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    Synchronized::Expired
                } else {
                    // A finisher won the race and is about to send.
                    Synchronized::Finished(self.rx.recv().ok().flatten())
                }
            }
            Err(RecvTimeoutError::Disconnected) => Synchronized::Finished(None),
        }
    }
}
