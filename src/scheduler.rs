//! Admission-controlled task queue.
//!
//! At most `limit` tasks run at once; the rest wait in FIFO order and start as
//! slots free up. A task that fails or panics releases its slot like any other,
//! and its outcome goes to its own [`TaskHandle`] only.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task failed: {0:#}")]
    Failed(anyhow::Error),
    #[error("task panicked")]
    Panicked,
    #[error("task was cancelled before reporting a result")]
    Cancelled,
}

type Job = Box<dyn FnOnce(Arc<Inner>) + Send>;

struct Inner {
    limit: usize,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    running: usize,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Jobs never run under the lock, so a poisoned guard still holds
        // consistent counters.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn advance(self: &Arc<Self>) {
        loop {
            let job = {
                let mut state = self.lock();
                if state.running >= self.limit {
                    return;
                }
                let Some(job) = state.pending.pop_front() else {
                    return;
                };
                state.running += 1;
                job
            };
            job(Arc::clone(self));
        }
    }

    fn finish(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            state.running = state.running.saturating_sub(1);
        }
        self.advance();
    }
}

/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    /// A `limit` of zero is treated as one.
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                limit: limit.max(1),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Tasks queued or running.
    pub fn remaining_len(&self) -> usize {
        let state = self.inner.lock();
        state.pending.len() + state.running
    }

    pub fn running(&self) -> usize {
        self.inner.lock().running
    }

    /// Queues `task`. Must be called from within a tokio runtime.
    ///
    /// The closure is only invoked once the task is admitted. Dropping the
    /// returned handle does not cancel the task.
    pub fn submit<F, Fut, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |inner: Arc<Inner>| {
            tokio::spawn(async move {
                // Run the task on its own so a panic surfaces as a JoinError
                // instead of tearing down the slot bookkeeping.
                let joined = tokio::spawn(async move { task().await }).await;
                inner.finish();
                let result = match joined {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(TaskError::Failed(err)),
                    Err(err) if err.is_panic() => Err(TaskError::Panicked),
                    Err(_) => Err(TaskError::Cancelled),
                };
                let _ = tx.send(result);
            });
        });

        self.inner.lock().pending.push_back(job);
        self.inner.advance();
        TaskHandle { rx }
    }

    /// Submits every task and waits for all of them. Results come back in
    /// submission order; one failure does not affect the others.
    pub async fn submit_all<I, F, Fut, T>(&self, tasks: I) -> Vec<Result<T, TaskError>>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let handles: Vec<TaskHandle<T>> = tasks.into_iter().map(|t| self.submit(t)).collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.join().await);
        }
        out
    }
}

pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    pub async fn join(self) -> Result<T, TaskError> {
        self.rx.await.unwrap_or(Err(TaskError::Cancelled))
    }
}
