//! Single-lane background worker.
//!
//! Used for slow, fallible work that must not block the poll loop, such as
//! opening and compiling a project archive. Each task reports back through
//! one of two callbacks, and a failure says whether the task returned an
//! error or panicked.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;

use crate::session::thread::panic_message;

/// Identifier assigned to each submitted task.
pub type TaskId = u64;

/// A unit of background work.
pub type Task = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Callback run on the worker after a task succeeded.
pub type SuccessCallback = Box<dyn FnOnce(TaskId) + Send + 'static>;

/// Callback run on the worker after a task failed.
pub type FailureCallback = Box<dyn FnOnce(TaskId, TaskFailure) + Send + 'static>;

/// How a task failed.
#[derive(Debug)]
pub enum TaskFailure {
    /// The task returned an error.
    ReturnedError(anyhow::Error),
    /// The task panicked; the payload message is kept.
    Panicked(String),
    /// The worker had stopped; the task never ran. Holds the worker name.
    Rejected(String),
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReturnedError(e) => write!(f, "task returned an error: {e:#}"),
            Self::Panicked(message) => write!(f, "task panicked: {message}"),
            Self::Rejected(worker) => write!(f, "task rejected: worker `{worker}` is stopped"),
        }
    }
}

/// Outcome of a task, without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task succeeded.
    Ok,
    /// The task returned an error.
    ReturnedError,
    /// The task panicked.
    Panicked,
    /// The task was never run.
    Rejected,
}

impl TaskFailure {
    /// Payload-free classification.
    #[must_use]
    pub const fn outcome(&self) -> TaskOutcome {
        match self {
            Self::ReturnedError(_) => TaskOutcome::ReturnedError,
            Self::Panicked(_) => TaskOutcome::Panicked,
            Self::Rejected(_) => TaskOutcome::Rejected,
        }
    }
}

/// Log completion at info level.
pub fn default_success_handler(task_id: TaskId) {
    tracing::info!(task_id, "Background worker completed task");
}

/// Log failure at error level.
pub fn default_fail_handler(task_id: TaskId, failure: TaskFailure) {
    tracing::error!(task_id, outcome = ?failure.outcome(), error = %failure, "Background worker failed task");
}

struct Job {
    id: TaskId,
    task: Task,
    on_success: SuccessCallback,
    on_fail: FailureCallback,
}

/// A background worker with a FIFO task queue.
///
/// Dropping the pool (or calling [`WorkerPool::shutdown`]) lets the queued
/// tasks finish, then joins the worker.
pub struct WorkerPool {
    name: String,
    sender: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("running", &self.worker.is_some())
            .field("submitted", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl WorkerPool {
    /// Start a worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn new(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Job>();

        let worker = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_jobs(receiver))?;

        tracing::debug!(worker = %name, "Background worker started");

        Ok(Self {
            name,
            sender: Some(sender),
            worker: Some(worker),
            next_id: AtomicU64::new(0),
        })
    }

    /// Queue a task with explicit callbacks.
    ///
    /// If the worker has already stopped, `on_fail` is called immediately on
    /// the caller's thread with a [`TaskFailure::Rejected`].
    pub fn execute(
        &self,
        task: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
        on_success: impl FnOnce(TaskId) + Send + 'static,
        on_fail: impl FnOnce(TaskId, TaskFailure) + Send + 'static,
    ) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job = Job {
            id,
            task: Box::new(task),
            on_success: Box::new(on_success),
            on_fail: Box::new(on_fail),
        };

        let rejected = match &self.sender {
            Some(sender) => sender.send(job).err().map(|mpsc::SendError(job)| job),
            None => Some(job),
        };
        if let Some(job) = rejected {
            (job.on_fail)(id, TaskFailure::Rejected(self.name.clone()));
        }

        id
    }

    /// Queue a task whose outcome is only logged.
    pub fn execute_logged(&self, task: impl FnOnce() -> anyhow::Result<()> + Send + 'static) -> TaskId {
        self.execute(task, default_success_handler, default_fail_handler)
    }

    /// Finish the queued tasks and stop the worker.
    pub fn shutdown(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::error!(worker = %self.name, "Background worker panicked");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_jobs(receiver: mpsc::Receiver<Job>) {
    for job in receiver {
        let Job {
            id,
            task,
            on_success,
            on_fail,
        } = job;

        tracing::debug!(task_id = id, "Running background task");
        match catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(())) => on_success(id),
            Ok(Err(e)) => on_fail(id, TaskFailure::ReturnedError(e)),
            Err(payload) => on_fail(id, TaskFailure::Panicked(panic_message(&*payload))),
        }
    }
}
