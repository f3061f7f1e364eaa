//! Time-driven sweeps: periodic re-runs of eligible flows and result retention.

use std::{sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    application::queue::JobQueue,
    config::{RetentionConfig, SchedulerConfig},
    core::{
        domain::{FlowStatus, TestFlow},
        error::Result,
        ports::{Clock, FlowRepository, ScreenshotStore},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sweep {
    General,
    Priority,
    Retention,
}

/// Decides which sweeps are due. Time comes from the injected clock only.
pub struct Ticker {
    clock: Arc<dyn Clock>,
    schedule: Vec<(Sweep, i64, i64)>,
}

impl Ticker {
    /// Every sweep first fires one full interval after construction.
    pub fn new(clock: Arc<dyn Clock>, config: &SchedulerConfig) -> Self {
        let now = clock.now_ms();
        let schedule = [
            (Sweep::General, config.general_interval_secs),
            (Sweep::Priority, config.priority_interval_secs),
            (Sweep::Retention, config.retention_interval_secs),
        ]
        .into_iter()
        .map(|(sweep, secs)| {
            let interval = (secs as i64).saturating_mul(1000).max(1);
            (sweep, interval, now + interval)
        })
        .collect();
        Self { clock, schedule }
    }

    /// Sweeps whose time has come, each at most once per call.
    pub fn due(&mut self) -> Vec<Sweep> {
        let now = self.clock.now_ms();
        let mut due = Vec::new();
        for (sweep, interval, next) in &mut self.schedule {
            if now >= *next {
                due.push(*sweep);
                while *next <= now {
                    *next += *interval;
                }
            }
        }
        due
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub results: usize,
    pub screenshots: usize,
}

pub struct Scheduler {
    repo: Arc<dyn FlowRepository>,
    queue: Arc<JobQueue>,
    screenshots: Arc<dyn ScreenshotStore>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    retention: RetentionConfig,
}

impl Scheduler {
    pub fn new(
        repo: Arc<dyn FlowRepository>,
        queue: Arc<JobQueue>,
        screenshots: Arc<dyn ScreenshotStore>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
        retention: RetentionConfig,
    ) -> Self {
        Self {
            repo,
            queue,
            screenshots,
            clock,
            config,
            retention,
        }
    }

    /// Quiescent and outside its category's minimum re-run interval.
    ///
    /// Quiescent deliberately means any status but RUNNING, not IDLE only: a flow that
    /// finished SUCCESS or FAILED is re-run once its interval has passed, otherwise
    /// periodic sweeps would never revisit it.
    pub fn should_run(&self, flow: &TestFlow, now: i64) -> bool {
        if flow.status == FlowStatus::Running {
            return false;
        }
        match flow.last_run {
            None => true,
            Some(last_run) => now - last_run >= self.config.min_rerun.interval_ms(flow.category),
        }
    }

    /// Enqueues every eligible flow, `batch_size` at a time. Returns how many were enqueued.
    pub async fn sweep(&self, priority_only: bool) -> Result<usize> {
        let now = self.clock.now_ms();
        let candidates: Vec<_> = self
            .repo
            .list_schedulable_flows()
            .await?
            .into_iter()
            .filter(|c| !priority_only || self.config.priority_categories.contains(&c.flow.category))
            .filter(|c| self.should_run(&c.flow, now))
            .filter(|c| !self.queue.is_pending(&c.flow.id))
            .collect();

        let mut enqueued = 0;
        for (index, batch) in candidates.chunks(self.config.batch_size.max(1)).enumerate() {
            if index > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.batch_delay_ms)).await;
            }
            for candidate in batch {
                let flow = &candidate.flow;
                match self
                    .queue
                    .enqueue(&flow.id, &candidate.owner_id, &flow.project_id)
                {
                    Ok(job_id) => {
                        debug!(flow_id = %flow.id, %job_id, "scheduled run enqueued");
                        enqueued += 1;
                    }
                    Err(err) => {
                        warn!(flow_id = %flow.id, error = %err, "could not enqueue scheduled run");
                    }
                }
            }
        }
        info!(enqueued, priority_only, "scheduler sweep finished");
        Ok(enqueued)
    }

    /// Deletes results older than the retention window, their screenshots, and orphan files.
    pub async fn retention_sweep(&self) -> Result<RetentionReport> {
        let cutoff = self.clock.now_ms() - self.retention.max_age_ms();
        let deleted = self.repo.delete_results_before(cutoff).await?;
        let mut report = RetentionReport {
            results: deleted.len(),
            screenshots: 0,
        };
        for url in deleted.iter().flat_map(|r| r.screenshot_urls.iter()) {
            match self.screenshots.remove(url).await {
                Ok(()) => report.screenshots += 1,
                Err(err) => warn!(%url, error = %err, "could not remove screenshot"),
            }
        }
        report.screenshots += self.screenshots.prune_older_than(cutoff).await?;
        info!(
            results = report.results,
            screenshots = report.screenshots,
            "retention sweep finished"
        );
        Ok(report)
    }

    async fn fire(&self, sweep: Sweep) {
        let outcome = match sweep {
            Sweep::General => self.sweep(false).await.map(|_| ()),
            Sweep::Priority => self.sweep(true).await.map(|_| ()),
            Sweep::Retention => self.retention_sweep().await.map(|_| ()),
        };
        if let Err(err) = outcome {
            error!(?sweep, error = %err, "scheduled sweep failed");
        }
    }

    /// Ticks until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = Ticker::new(Arc::clone(&self.clock), &self.config);
        let mut interval = tokio::time::interval(self.config.tick());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(tick_secs = self.config.tick_secs, "scheduler started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for sweep in ticker.due() {
                        self.fire(sweep).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }
}
