//! A bounded pool of OCR workers.
//!
//! [`WorkerPool`] owns a fixed number of worker slots, each running its own
//! [`crate::recognizer::Recognizer`], plus a FIFO queue of pending page
//! tasks. Tasks are handed to the first idle slot (lowest index first) in
//! strict submission order, although they may finish in any order.
//!
//! The pool itself is a cheap, cloneable handle. The real state lives in a
//! background scheduler task, which only changes state in response to
//! messages from handles and slots. Every submitted task's future settles
//! exactly once: with the per-region results, or with a [`PoolError`].
//!
//! There are no per-task timeouts. A wedged engine will hold its task
//! forever, and [`WorkerPool::terminate`] is the only way to force every
//! outstanding future to settle. Callers that need bounded latency should
//! race the returned future against their own timer.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{
    FutureExt as _,
    channel::{mpsc, oneshot},
};

use crate::{
    async_utils::{BoxedFuture, JoinWorker},
    prelude::*,
    recognizer::{PageImage, RecognizerFactory, Region, RegionText},
};

use self::scheduler::{Command, Scheduler, Task};

mod scheduler;
mod slot;

/// The default number of workers: one less than the number of CPUs, so the
/// rest of the program can keep running.
pub fn default_pool_size() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

/// Called by a worker after each region of a task, with the number of
/// regions finished so far.
pub type RegionProgress = Arc<dyn Fn(usize) + Send + Sync>;

/// Pool configuration.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of worker slots. Must be at least 1.
    pub size: usize,

    /// Language model identifier passed to each engine, like `eng`.
    pub lang: String,

    /// How long to wait for every slot to initialize. `None` waits forever.
    pub init_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            lang: "eng".to_owned(),
            init_timeout: None,
        }
    }
}

/// Why a pool operation failed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("OCR worker pool not initialized, call initialize() first")]
    NotInitialized,

    #[error("OCR worker {slot} failed to initialize: {message}")]
    InitializationFault { slot: usize, message: String },

    #[error("{pending} OCR worker(s) did not initialize within {timeout:?}")]
    InitializationTimeout { pending: usize, timeout: Duration },

    #[error("OCR worker error: {message}")]
    Task { message: String },

    #[error("OCR worker {slot} error: {message}")]
    WorkerFault { slot: usize, message: String },

    #[error("OCR worker {slot} terminated unexpectedly")]
    UnexpectedTermination { slot: usize },

    #[error("OCR worker pool terminated {0}")]
    Terminated(&'static str),

    #[error("no OCR workers are left to process the task")]
    NoLiveWorkers,

    #[error("OCR worker pool has shut down")]
    Closed,
}

/// A unique, monotonically assigned task identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ocr-task-{}", self.0)
    }
}

/// A snapshot of the pool's state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of slots. Zero before `initialize` and after `terminate`.
    pub slots: usize,
    pub initializing: usize,
    pub idle: usize,
    pub busy: usize,
    pub errored: usize,
    pub terminated: usize,
    /// Tasks waiting for a free slot.
    pub pending: usize,
    /// Tasks bound to a slot.
    pub in_flight: usize,
}

/// Handle to a pool of OCR workers. Cloning is cheap.
///
/// Dropping every handle shuts down the pool as if [`WorkerPool::terminate`]
/// had been called.
#[derive(Clone)]
pub struct WorkerPool {
    /// Commands for the scheduler task.
    commands: mpsc::UnboundedSender<Command>,

    /// Source of task IDs.
    next_task_id: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Create a new, uninitialized pool. Must be called from inside a Tokio
    /// runtime.
    ///
    /// The returned [`JoinWorker`] completes once every handle has been
    /// dropped and the scheduler has cleaned up.
    pub fn new(
        mut config: PoolConfig,
        factory: Arc<dyn RecognizerFactory>,
    ) -> (Self, JoinWorker) {
        if config.size == 0 {
            warn!("OCR worker pool size must be at least 1, using 1");
            config.size = 1;
        }
        let (commands, commands_rx) = mpsc::unbounded();
        let (events_tx, events_rx) = mpsc::unbounded();
        let scheduler = Scheduler::new(config, factory, events_tx);
        let handle = tokio::spawn(async move {
            scheduler.run(commands_rx, events_rx).await;
            Ok(())
        });
        let pool = Self {
            commands,
            next_task_id: Arc::new(AtomicU64::new(0)),
        };
        (pool, JoinWorker::from_handle(handle))
    }

    /// Start every worker and wait until all of them are ready.
    ///
    /// The request is registered before this function returns, so tasks
    /// submitted afterwards are accepted even if the returned future has not
    /// been polled yet. Calling this again is harmless: it waits for (or
    /// returns) the outcome of the first call.
    pub fn initialize(&self) -> BoxedFuture<Result<(), PoolError>> {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .commands
            .unbounded_send(Command::Initialize { reply })
            .is_ok();
        async move {
            if !sent {
                return Err(PoolError::Closed);
            }
            rx.await.map_err(|_| PoolError::Closed)?
        }
        .boxed()
    }

    /// Queue a page for recognition. This never blocks; the returned future
    /// yields one [`RegionText`] per region, in order.
    pub fn submit(
        &self,
        image: Arc<PageImage>,
        regions: Vec<Region>,
        page_number: u32,
    ) -> BoxedFuture<Result<Vec<RegionText>, PoolError>> {
        self.submit_task(image, regions, page_number, None)
    }

    /// Like [`WorkerPool::submit`], but call `progress` as each region is
    /// recognized.
    pub fn submit_with_progress(
        &self,
        image: Arc<PageImage>,
        regions: Vec<Region>,
        page_number: u32,
        progress: RegionProgress,
    ) -> BoxedFuture<Result<Vec<RegionText>, PoolError>> {
        self.submit_task(image, regions, page_number, Some(progress))
    }

    fn submit_task(
        &self,
        image: Arc<PageImage>,
        regions: Vec<Region>,
        page_number: u32,
        progress: Option<RegionProgress>,
    ) -> BoxedFuture<Result<Vec<RegionText>, PoolError>> {
        let id = TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        let task = Task::new(id, page_number, image, regions, progress, tx);
        let sent = self.commands.unbounded_send(Command::Submit(task)).is_ok();
        async move {
            if !sent {
                return Err(PoolError::Closed);
            }
            rx.await.map_err(|_| PoolError::Closed)?
        }
        .boxed()
    }

    /// Get a snapshot of the pool's state.
    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .unbounded_send(Command::Stats { reply })
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)
    }

    /// Reject every pending and running task, shut down all workers, and
    /// return to the uninitialized state. Safe to call at any time, any
    /// number of times.
    #[instrument(level = "debug", skip_all)]
    pub async fn terminate(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .unbounded_send(Command::Terminate { reply })
            .is_ok()
        {
            rx.await.ok();
        }
    }
}
