//! Bounded work pools.
//!
//! `WorkerPool` runs a batch of tasks with at most N in flight and a deadline
//! per task; the caller waits for the whole batch. `BackgroundQueue` is
//! fire-and-forget: a bounded channel drained by a fixed set of workers, with
//! duplicate keys collapsed while a job for that key is pending.

use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{MetaError, Result};

#[derive(Debug)]
pub enum TaskOutcome<T> {
    Done(T),
    Failed(MetaError),
    TimedOut,
    Cancelled,
}

impl<T> TaskOutcome<T> {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, TaskOutcome::TimedOut)
    }
}

pub struct WorkerPool {
    name: &'static str,
    permits: Arc<Semaphore>,
    deadline: Duration,
}

impl WorkerPool {
    pub fn new(name: &'static str, workers: usize, deadline: Duration) -> Self {
        Self { name, permits: Arc::new(Semaphore::new(workers.max(1))), deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Run one task per input and wait for all of them. Outcomes come back in
    /// input order. A slow task only costs its own slot: the deadline starts
    /// once the task holds a permit.
    pub async fn run_batch<I, T, F, Fut>(&self, inputs: Vec<I>, task: F, cancel: &CancellationToken) -> Vec<TaskOutcome<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let task = Arc::new(task);
        let handles: Vec<_> = inputs
            .into_iter()
            .map(|input| {
                let permits = Arc::clone(&self.permits);
                let task = Arc::clone(&task);
                let cancel = cancel.clone();
                let deadline = self.deadline;
                tokio::spawn(async move {
                    let _permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return TaskOutcome::Cancelled,
                        permit = permits.acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => return TaskOutcome::Failed(MetaError::State("pool semaphore closed".into())),
                        },
                    };

                    let work = (*task)(input);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => TaskOutcome::Cancelled,
                        res = tokio::time::timeout(deadline, work) => match res {
                            Ok(Ok(v)) => TaskOutcome::Done(v),
                            Ok(Err(e)) => TaskOutcome::Failed(e),
                            Err(_) => TaskOutcome::TimedOut,
                        },
                    }
                })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            outcomes.push(match handle.await {
                Ok(outcome) => outcome,
                Err(e) => TaskOutcome::Failed(MetaError::State(format!("[{}] task aborted: {}", self.name, e))),
            });
        }

        let timed_out = outcomes.iter().filter(|o| o.is_timed_out()).count();
        if timed_out > 0 {
            tracing::debug!("[Pool:{}] {} of {} task(s) timed out", self.name, timed_out, outcomes.len());
        }
        outcomes
    }
}

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct BackgroundQueue {
    name: &'static str,
    tx: mpsc::Sender<(String, Job)>,
    pending: Arc<DashMap<String, ()>>,
}

impl BackgroundQueue {
    /// Spawn `workers` consumers on the current runtime.
    pub fn start(name: &'static str, workers: usize, capacity: usize, job_deadline: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<(String, Job)>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let pending: Arc<DashMap<String, ()>> = Arc::new(DashMap::new());

        for worker in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let pending = Arc::clone(&pending);
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some((key, job)) = next else { break };
                    if tokio::time::timeout(job_deadline, job).await.is_err() {
                        tracing::warn!("[Queue:{}] worker {} gave up on {} after {:?}", name, worker, key, job_deadline);
                    }
                    pending.remove(&key);
                }
            });
        }

        Self { name, tx, pending }
    }

    /// Queue `job` under `key`. Returns false when the key is already pending
    /// or the queue is full.
    pub fn submit<F>(&self, key: impl Into<String>, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        if self.pending.insert(key.clone(), ()).is_some() {
            return false;
        }
        match self.tx.try_send((key.clone(), Box::pin(job))) {
            Ok(()) => true,
            Err(e) => {
                self.pending.remove(&key);
                tracing::debug!("[Queue:{}] dropped {}: {}", self.name, key, e);
                false
            }
        }
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
