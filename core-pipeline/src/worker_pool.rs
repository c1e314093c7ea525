//! # Chapter Worker Pool
//!
//! Runs chapter futures with bounded concurrency.
//!
//! - `submit` waits for a semaphore permit before spawning, so at most
//!   `max_concurrency` tasks run at once and producers feel backpressure.
//! - Each task's error or panic is captured under its index; nothing is
//!   propagated to the caller or to sibling tasks.
//! - `shutdown(false)` cancels the pool token and marks tasks that never got
//!   a slot `Cancelled`. Running tasks are not aborted: they observe the token
//!   at their next checkpoint, and the call waits for them to return.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::task::{ChapterTask, TaskFailure, TaskStatus};

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const SHUT_DOWN: u8 = 2;

/// Receipt for a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle {
    index: usize,
}

impl TaskHandle {
    pub fn index(&self) -> usize {
        self.index
    }
}

struct PoolShared<T> {
    tasks: Mutex<BTreeMap<usize, ChapterTask>>,
    results: Mutex<BTreeMap<usize, T>>,
    errors: Mutex<BTreeMap<usize, TaskFailure>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl<T> PoolShared<T> {
    fn update_task(&self, index: usize, update: impl FnOnce(&mut ChapterTask) -> Result<()>) {
        if let Some(task) = self.tasks.lock().get_mut(&index) {
            if let Err(err) = update(task) {
                warn!(chapter = index, error = %err, "Ignoring task status update");
            }
        }
    }
}

/// Decrements the active count even when the task panics.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ChapterWorkerPool<T> {
    max_concurrency: usize,
    semaphore: Arc<Semaphore>,
    state: AtomicU8,
    cancel: CancellationToken,
    shared: Arc<PoolShared<T>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> ChapterWorkerPool<T> {
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            max_concurrency,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            state: AtomicU8::new(NOT_STARTED),
            cancel: CancellationToken::new(),
            shared: Arc::new(PoolShared {
                tasks: Mutex::new(BTreeMap::new()),
                results: Mutex::new(BTreeMap::new()),
                errors: Mutex::new(BTreeMap::new()),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Ties the pool to a parent token; cancelling the parent cancels the pool.
    pub fn with_parent_token(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Token handed to task futures so they can observe shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn start(&self) {
        if self
            .state
            .compare_exchange(NOT_STARTED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(max_concurrency = self.max_concurrency, "Worker pool started");
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    pub async fn submit<F>(&self, index: usize, future: F) -> Result<TaskHandle>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.submit_task(ChapterTask::new(index), future).await
    }

    /// Waits for a free slot, then spawns `future` as task `task.index`.
    pub async fn submit_task<F>(&self, task: ChapterTask, future: F) -> Result<TaskHandle>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        if !self.is_running() {
            return Err(PipelineError::PoolNotRunning);
        }

        let index = task.index;
        {
            let mut tasks = self.shared.tasks.lock();
            if tasks.contains_key(&index) {
                return Err(PipelineError::Worker(format!(
                    "task {} was already submitted",
                    index
                )));
            }
            tasks.insert(index, task);
        }

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok(),
        };
        let permit = match permit {
            Some(permit) if self.is_running() => permit,
            _ => {
                self.shared.update_task(index, ChapterTask::cancel);
                return Err(if self.cancel.is_cancelled() {
                    PipelineError::Cancelled
                } else {
                    PipelineError::PoolNotRunning
                });
            }
        };

        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            if cancel.is_cancelled() {
                shared.update_task(index, ChapterTask::cancel);
                debug!(chapter = index, "Task cancelled before it started");
                return;
            }
            shared.update_task(index, ChapterTask::start);

            let active = shared.active.fetch_add(1, Ordering::SeqCst) + 1;
            shared.peak.fetch_max(active, Ordering::SeqCst);
            let outcome = {
                let _active = ActiveGuard(&shared.active);
                AssertUnwindSafe(future).catch_unwind().await
            };

            match outcome {
                Ok(Ok(value)) => {
                    shared.results.lock().insert(index, value);
                    shared.update_task(index, ChapterTask::complete);
                    debug!(chapter = index, "Task completed");
                }
                Ok(Err(err)) if err.is_cancelled() => {
                    shared.update_task(index, ChapterTask::cancel);
                    info!(chapter = index, "Task cancelled");
                }
                Ok(Err(err)) => {
                    let failure = TaskFailure::from(&err);
                    warn!(chapter = index, code = %failure.code, error = %err, "Task failed");
                    shared.errors.lock().insert(index, failure.clone());
                    shared.update_task(index, |task| task.fail(failure));
                }
                Err(panic) => {
                    let failure = TaskFailure {
                        code: "E500".to_string(),
                        message: format!("worker panicked: {}", panic_message(&*panic)),
                    };
                    warn!(chapter = index, error = %failure.message, "Task panicked");
                    shared.errors.lock().insert(index, failure.clone());
                    shared.update_task(index, |task| task.fail(failure));
                }
            }
        });
        self.handles.lock().push(handle);

        Ok(TaskHandle { index })
    }

    /// Waits for every submitted task and drains the results.
    pub async fn wait_for_all(&self) -> BTreeMap<usize, T> {
        self.join_all().await;
        std::mem::take(&mut *self.shared.results.lock())
    }

    pub fn results(&self) -> BTreeMap<usize, T>
    where
        T: Clone,
    {
        self.shared.results.lock().clone()
    }

    pub fn errors(&self) -> BTreeMap<usize, TaskFailure> {
        self.shared.errors.lock().clone()
    }

    pub fn task(&self, index: usize) -> Option<ChapterTask> {
        self.shared.tasks.lock().get(&index).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn peak_active(&self) -> usize {
        self.shared.peak.load(Ordering::SeqCst)
    }

    /// Stops the pool and waits for running tasks to return. Without `wait`
    /// the pool token is cancelled first, so tasks stop at their next
    /// checkpoint instead of running to completion.
    pub async fn shutdown(&self, wait: bool) {
        if self.state.swap(SHUT_DOWN, Ordering::SeqCst) == SHUT_DOWN {
            return;
        }

        if !wait {
            self.cancel.cancel();
        }
        self.join_all().await;

        if !wait {
            let mut tasks = self.shared.tasks.lock();
            for task in tasks
                .values_mut()
                .filter(|task| task.status == TaskStatus::Pending)
            {
                task.cancel().ok();
            }
        }

        self.semaphore.close();
        info!(
            wait,
            completed = self.count(TaskStatus::Completed),
            failed = self.count(TaskStatus::Failed),
            "Worker pool shut down"
        );
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.shared
            .tasks
            .lock()
            .values()
            .filter(|task| task.status == status)
            .count()
    }

    async fn join_all(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(err) = handle.await {
                    if !err.is_cancelled() {
                        warn!(error = %err, "Worker task did not finish cleanly");
                    }
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
