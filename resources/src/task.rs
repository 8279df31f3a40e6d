//! Worker execution for loader and constructor tasks
//!
//! Scheduling policy is not the cache's business, it only needs somewhere to run a closure off
//! the designated thread. [`TaskRunner`] is that seam.
use anyhow::Result;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs closures on some worker thread
pub trait TaskRunner: Send + Sync {
    fn spawn(&self, task: Task);
}

impl<R: TaskRunner + ?Sized> TaskRunner for Arc<R> {
    fn spawn(&self, task: Task) {
        (**self).spawn(task)
    }
}

/// Run `work`, reporting a panic inside it as an error
pub(crate) fn catch_panic<R>(work: impl FnOnce() -> Result<R>) -> Result<R> {
    match catch_unwind(AssertUnwindSafe(work)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|message| message.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| String::from("unknown panic payload"));
            Err(anyhow::anyhow!("Task panicked: {message}"))
        }
    }
}

/// Runs every task immediately on the calling thread
#[derive(Debug, Default, Copy, Clone)]
pub struct InlineRunner;

impl TaskRunner for InlineRunner {
    fn spawn(&self, task: Task) {
        task()
    }
}

/// Fixed set of worker threads fed through a channel
#[derive(Debug)]
pub struct WorkerPool {
    sender: Option<crossbeam_channel::Sender<Task>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: &str, thread_count: usize) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let threads = (0..thread_count.max(1))
            .map(|index| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                                tracing::error!("Worker task panicked");
                            }
                        }
                        tracing::trace!("Worker thread stopped");
                    })
                    .map_err(anyhow::Error::from)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            sender: Some(sender),
            threads,
        })
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }
}

impl TaskRunner for WorkerPool {
    fn spawn(&self, task: Task) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        if let Err(e) = sender.send(task) {
            // dropping the task still releases whatever it captured
            tracing::error!("Failed to submit task to worker pool: {e}");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        tracing::trace!("Dropping worker pool");
        // closing the channel lets workers finish the backlog and exit
        self.sender.take();
        let current = std::thread::current().id();
        for thread in self.threads.drain(..) {
            // the last task may be the one releasing the pool
            if thread.thread().id() != current {
                let _ = thread.join();
            }
        }
    }
}

/// Runs tasks on a tokio runtime's blocking pool
#[derive(Debug, Clone)]
pub struct TokioRunner {
    runtime: tokio::runtime::Handle,
}

impl TokioRunner {
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        Self { runtime }
    }

    /// Runner on the runtime of the calling context
    ///
    /// # Panics
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self {
            runtime: tokio::runtime::Handle::current(),
        }
    }
}

impl TaskRunner for TokioRunner {
    fn spawn(&self, task: Task) {
        // the join handle is not needed, the task reports through its own channels
        drop(self.runtime.spawn_blocking(task));
    }
}

/// Runs tasks on a rayon pool, the global one unless a pool is given
#[derive(Debug, Default, Clone)]
pub struct RayonRunner {
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl RayonRunner {
    pub fn new(pool: Arc<rayon::ThreadPool>) -> Self {
        Self { pool: Some(pool) }
    }
}

impl TaskRunner for RayonRunner {
    fn spawn(&self, task: Task) {
        match self.pool.as_ref() {
            Some(pool) => pool.spawn(task),
            None => rayon::spawn(task),
        }
    }
}

#[derive(Debug, Default)]
struct TrackerInner {
    outstanding: Mutex<usize>,
    idle: Condvar,
}

impl TrackerInner {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.outstanding
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Counts tasks which have been dispatched but not finished
#[derive(Debug, Default, Clone)]
pub struct TaskTracker {
    inner: Arc<TrackerInner>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a task as outstanding until the returned guard is dropped
    pub fn begin(&self) -> TaskGuard {
        *self.inner.lock() += 1;
        TaskGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn outstanding(&self) -> usize {
        *self.inner.lock()
    }

    pub fn wait_idle(&self) {
        let mut outstanding = self.inner.lock();
        while *outstanding != 0 {
            outstanding = self
                .inner
                .idle
                .wait(outstanding)
                .unwrap_or_else(|poison| poison.into_inner());
        }
    }

    /// Returns whether the tracker went idle before `timeout`
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outstanding = self.inner.lock();
        while *outstanding != 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            outstanding = self
                .inner
                .idle
                .wait_timeout(outstanding, deadline - now)
                .unwrap_or_else(|poison| poison.into_inner())
                .0;
        }
        true
    }
}

/// Keeps a task counted, released on drop so a panicking task is still accounted for
#[derive(Debug)]
pub struct TaskGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let mut outstanding = self.inner.lock();
        *outstanding -= 1;
        if *outstanding == 0 {
            self.inner.idle.notify_all();
        }
    }
}
