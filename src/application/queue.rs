//! Bounded worker pool with retry and a trailing job history.
//!
//! Jobs wait in a FIFO until one of `concurrency` workers takes them. A failed job
//! is re-enqueued after `backoff_base_ms * 2^(attempt - 1)` until `attempts` is
//! exhausted. Per-flow exclusion is not the queue's concern.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::Notify, task::JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::QueueConfig,
    core::{
        domain::TestJob,
        error::{Error, Result},
        ports::{Clock, QueueStats},
    },
};

/// Processes one job attempt. An `Err` makes the attempt eligible for retry.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &TestJob) -> Result<()>;
}

/// A finished job kept for operational visibility.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub job_id: String,
    pub flow_id: String,
    pub attempts: u32,
    pub finished_at: i64,
    pub error: Option<String>,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<TestJob>,
    delayed: HashMap<String, TestJob>,
    active: HashMap<String, TestJob>,
    completed: VecDeque<JobRecord>,
    failed: VecDeque<JobRecord>,
}

struct Inner {
    config: QueueConfig,
    handler: Arc<dyn JobHandler>,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    notify: Notify,
    closed: AtomicBool,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_next(&self) -> Option<TestJob> {
        let mut state = self.state();
        let job = state.waiting.pop_front()?;
        state.active.insert(job.id.clone(), job.clone());
        Some(job)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.config.backoff_base_ms.saturating_mul(factor))
    }

    async fn process(self: &Arc<Self>, job: TestJob) {
        debug!(job_id = %job.id, flow_id = %job.flow_id, attempt = job.attempt, "job started");
        let outcome = self.handler.handle(&job).await;
        let now = self.clock.now_ms();

        let mut state = self.state();
        state.active.remove(&job.id);
        match outcome {
            Ok(()) => {
                push_bounded(
                    &mut state.completed,
                    JobRecord {
                        job_id: job.id.clone(),
                        flow_id: job.flow_id.clone(),
                        attempts: job.attempt,
                        finished_at: now,
                        error: None,
                    },
                    self.config.keep_completed,
                );
                debug!(job_id = %job.id, "job completed");
            }
            Err(err) if job.attempt < self.config.attempts && !self.closed.load(Ordering::SeqCst) => {
                let delay = self.backoff(job.attempt);
                warn!(
                    job_id = %job.id,
                    flow_id = %job.flow_id,
                    attempt = job.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "job failed, retrying"
                );
                let retry = TestJob {
                    id: Uuid::new_v4().to_string(),
                    attempt: job.attempt + 1,
                    enqueued_at: now,
                    ..job
                };
                let retry_id = retry.id.clone();
                state.delayed.insert(retry_id.clone(), retry);
                drop(state);

                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let mut state = inner.state();
                    if let Some(job) = state.delayed.remove(&retry_id) {
                        state.waiting.push_back(job);
                        drop(state);
                        inner.notify.notify_one();
                    }
                });
            }
            Err(err) => {
                warn!(
                    job_id = %job.id,
                    flow_id = %job.flow_id,
                    attempts = job.attempt,
                    error = %err,
                    "job failed permanently"
                );
                push_bounded(
                    &mut state.failed,
                    JobRecord {
                        job_id: job.id.clone(),
                        flow_id: job.flow_id.clone(),
                        attempts: job.attempt,
                        finished_at: now,
                        error: Some(err.to_string()),
                    },
                    self.config.keep_failed,
                );
            }
        }
    }
}

fn push_bounded(records: &mut VecDeque<JobRecord>, record: JobRecord, keep: usize) {
    records.push_back(record);
    while records.len() > keep {
        records.pop_front();
    }
}

async fn worker(inner: Arc<Inner>, index: usize) {
    debug!(worker = index, "queue worker started");
    loop {
        let notified = inner.notify.notified();
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        match inner.take_next() {
            Some(job) => {
                inner.process(job).await;
                // Hand the wakeup on in case several jobs arrived together.
                inner.notify.notify_one();
            }
            None => notified.await,
        }
    }
    debug!(worker = index, "queue worker stopped");
}

/// Explicitly constructed job queue. Call [`JobQueue::shutdown`] before exit.
pub struct JobQueue {
    inner: Arc<Inner>,
    workers: tokio::sync::Mutex<JoinSet<()>>,
}

impl JobQueue {
    /// Creates the queue and spawns its workers on the current runtime.
    pub fn start(config: QueueConfig, handler: Arc<dyn JobHandler>, clock: Arc<dyn Clock>) -> Self {
        let concurrency = config.concurrency.max(1);
        let inner = Arc::new(Inner {
            config,
            handler,
            clock,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let mut workers = JoinSet::new();
        for index in 0..concurrency {
            workers.spawn(worker(Arc::clone(&inner), index));
        }
        info!(concurrency, "job queue started");
        Self {
            inner,
            workers: tokio::sync::Mutex::new(workers),
        }
    }

    pub fn enqueue(&self, flow_id: &str, user_id: &str, project_id: &str) -> Result<String> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("job queue is shut down".into()));
        }
        let job = TestJob {
            id: Uuid::new_v4().to_string(),
            flow_id: flow_id.to_string(),
            user_id: user_id.to_string(),
            project_id: project_id.to_string(),
            attempt: 1,
            attempt_group: Uuid::new_v4().to_string(),
            enqueued_at: self.inner.clock.now_ms(),
        };
        let job_id = job.id.clone();
        self.inner.state().waiting.push_back(job);
        self.inner.notify.notify_one();
        debug!(%job_id, flow_id, "job enqueued");
        Ok(job_id)
    }

    /// Delayed retries count as waiting.
    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state();
        QueueStats {
            waiting: state.waiting.len() + state.delayed.len(),
            active: state.active.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
        }
    }

    /// Whether the flow has a waiting, delayed or active job.
    pub fn is_pending(&self, flow_id: &str) -> bool {
        let state = self.inner.state();
        state.waiting.iter().any(|j| j.flow_id == flow_id)
            || state.delayed.values().any(|j| j.flow_id == flow_id)
            || state.active.values().any(|j| j.flow_id == flow_id)
    }

    pub fn recent_failures(&self) -> Vec<JobRecord> {
        self.inner.state().failed.iter().cloned().collect()
    }

    /// Stops accepting work, drops queued and delayed jobs, and waits for active ones.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let dropped = {
            let mut state = self.inner.state();
            let dropped = state.waiting.len() + state.delayed.len();
            state.waiting.clear();
            state.delayed.clear();
            dropped
        };
        if dropped > 0 {
            info!(dropped, "dropping queued jobs on shutdown");
        }
        self.inner.notify.notify_waiters();
        let mut workers = self.workers.lock().await;
        while workers.join_next().await.is_some() {}
        info!("job queue stopped");
    }
}
