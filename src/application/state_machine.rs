//! Flow lifecycle: IDLE|SUCCESS|FAILED -> RUNNING -> SUCCESS|FAILED.

use std::{sync::Arc, time::Duration};

use tracing::{debug, warn};

use crate::core::{
    domain::{FlowStatus, FlowStatusEvent, ResultStatus},
    error::Result,
    ports::{Clock, FlowRepository, StatusPublisher},
};

const FINISH_ATTEMPTS: u32 = 3;
const FINISH_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { started_at: i64 },
    AlreadyRunning,
}

/// The only writer of a flow's `status`.
#[derive(Clone)]
pub struct FlowStateMachine {
    repo: Arc<dyn FlowRepository>,
    clock: Arc<dyn Clock>,
    publisher: Arc<dyn StatusPublisher>,
}

impl FlowStateMachine {
    pub fn new(
        repo: Arc<dyn FlowRepository>,
        clock: Arc<dyn Clock>,
        publisher: Arc<dyn StatusPublisher>,
    ) -> Self {
        Self {
            repo,
            clock,
            publisher,
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Moves the flow to RUNNING, or reports that another run holds it.
    pub async fn begin(&self, flow_id: &str) -> Result<StartOutcome> {
        let started_at = self.clock.now_ms();
        if !self.repo.try_start(flow_id, started_at).await? {
            debug!(flow_id, "flow already running");
            return Ok(StartOutcome::AlreadyRunning);
        }
        self.publisher.publish(FlowStatusEvent {
            flow_id: flow_id.to_string(),
            status: FlowStatus::Running,
            last_run: Some(started_at),
            duration: None,
            result_id: None,
        });
        Ok(StartOutcome::Started { started_at })
    }

    /// Moves a RUNNING flow to the terminal state matching `status`.
    ///
    /// The write is retried a few times before giving up.
    pub async fn complete(
        &self,
        flow_id: &str,
        status: ResultStatus,
        duration: i64,
        result_id: Option<&str>,
    ) -> Result<()> {
        let terminal = FlowStatus::from(status);
        let mut attempt = 1;
        loop {
            match self.repo.finish(flow_id, terminal, duration).await {
                Ok(()) => break,
                Err(err) if attempt < FINISH_ATTEMPTS => {
                    warn!(flow_id, attempt, error = %err, "terminal transition failed, retrying");
                    tokio::time::sleep(FINISH_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
        self.publisher.publish(FlowStatusEvent {
            flow_id: flow_id.to_string(),
            status: terminal,
            last_run: None,
            duration: Some(duration),
            result_id: result_id.map(String::from),
        });
        Ok(())
    }
}
