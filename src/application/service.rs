//! Application service implementation that provides the `ExecutionService` trait.
//! This is the primary use-case port implementation that driving adapters consume.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::{
    application::{
        broadcaster::StatusBroadcaster,
        orchestrator::{Orchestrator, RunOutcome, RunRequest},
        queue::JobQueue,
    },
    core::{
        domain::{AccessToken, FlowStatus, FlowStatusEvent, Project, TestFlow, TestResult},
        error::{Error as CoreError, Result as CoreResult},
        ports::{
            ExecutionService, FlowRepository, FlowStatusView, NewFlow, NewProject, Pagination,
            QueueStats, ResultListing, RunFlowRequest, RunMode, RunResponse, ScreenshotStore,
        },
    },
};

pub const MAX_PAGE_SIZE: usize = 100;

/// Application service that implements `ExecutionService`.
///
/// Holds the engine's collaborators and is injected into driving adapters
/// (CLI, HTTP server).
pub struct AppService {
    repo: Arc<dyn FlowRepository>,
    orchestrator: Arc<Orchestrator>,
    queue: Arc<JobQueue>,
    broadcaster: Arc<StatusBroadcaster>,
    screenshots: Arc<dyn ScreenshotStore>,
}

impl AppService {
    pub fn new(
        repo: Arc<dyn FlowRepository>,
        orchestrator: Arc<Orchestrator>,
        queue: Arc<JobQueue>,
        broadcaster: Arc<StatusBroadcaster>,
        screenshots: Arc<dyn ScreenshotStore>,
    ) -> Self {
        Self {
            repo,
            orchestrator,
            queue,
            broadcaster,
            screenshots,
        }
    }

    async fn require_flow(&self, flow_id: &str) -> CoreResult<TestFlow> {
        self.repo
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Flow {flow_id}")))
    }

    async fn require_project(&self, project_id: &str) -> CoreResult<Project> {
        self.repo
            .get_project(project_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Project {project_id}")))
    }
}

/// 1-based page count for `total` rows.
pub fn total_pages(total: usize, limit: usize) -> usize {
    total.div_ceil(limit.max(1))
}

#[async_trait]
impl ExecutionService for AppService {
    async fn request_run(&self, request: RunFlowRequest) -> CoreResult<RunResponse> {
        let flow = self.require_flow(&request.flow_id).await?;
        match request.mode {
            RunMode::Queued => {
                if flow.status == FlowStatus::Running {
                    return Ok(RunResponse::AlreadyRunning);
                }
                let project = self.require_project(&flow.project_id).await?;
                let user_id = request.user_id.unwrap_or(project.owner_id);
                let job_id = self.queue.enqueue(&flow.id, &user_id, &project.id)?;
                info!(flow_id = %flow.id, %job_id, "run queued");
                Ok(RunResponse::Queued { job_id })
            }
            RunMode::Immediate => {
                let outcome = self
                    .orchestrator
                    .run(RunRequest::immediate(flow.id, request.user_id))
                    .await?;
                Ok(match outcome {
                    RunOutcome::Completed(execution) => {
                        RunResponse::Completed(Box::new(execution.result))
                    }
                    RunOutcome::AlreadyRunning => RunResponse::AlreadyRunning,
                })
            }
        }
    }

    async fn flow_status(&self, flow_id: &str) -> CoreResult<Option<FlowStatusView>> {
        Ok(self.repo.get_flow(flow_id).await?.map(|flow| FlowStatusView {
            id: flow.id,
            name: flow.name,
            status: flow.status,
            last_run: flow.last_run,
            duration: flow.duration,
            category: flow.category,
            methods: flow.methods,
        }))
    }

    async fn list_results(
        &self,
        flow_id: &str,
        page: usize,
        limit: usize,
    ) -> CoreResult<ResultListing> {
        self.require_flow(flow_id).await?;
        let page = page.max(1);
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let found = self.repo.list_results(flow_id, page, limit).await?;
        Ok(ResultListing {
            results: found.results,
            pagination: Pagination {
                page,
                limit,
                total: found.total,
                total_pages: total_pages(found.total, limit),
            },
        })
    }

    async fn result_detail(
        &self,
        flow_id: &str,
        result_id: &str,
    ) -> CoreResult<Option<TestResult>> {
        self.repo.get_result(flow_id, result_id).await
    }

    async fn queue_stats(&self) -> CoreResult<QueueStats> {
        Ok(self.queue.stats())
    }

    fn subscribe(&self, flow_id: &str) -> broadcast::Receiver<FlowStatusEvent> {
        self.broadcaster.subscribe(flow_id)
    }

    async fn screenshot(&self, file_name: &str) -> CoreResult<Option<Vec<u8>>> {
        self.screenshots.read(file_name).await
    }

    async fn create_project(&self, project: NewProject) -> CoreResult<String> {
        if project.name.trim().is_empty() {
            return Err(CoreError::InvalidState("project name must not be empty".into()));
        }
        let record = Project {
            id: Uuid::new_v4().to_string(),
            name: project.name,
            owner_id: project.owner_id,
            github_url: project.github_url,
            staging_url: project.staging_url,
            active: true,
        };
        self.repo.save_project(&record).await?;
        Ok(record.id)
    }

    async fn create_flow(&self, flow: NewFlow) -> CoreResult<String> {
        self.require_project(&flow.project_id).await?;
        if flow.methods.is_empty() {
            return Err(CoreError::InvalidState(
                "a flow needs at least one method".into(),
            ));
        }
        let record = TestFlow {
            id: Uuid::new_v4().to_string(),
            project_id: flow.project_id,
            name: flow.name,
            description: flow.description,
            category: flow.category,
            methods: flow.methods,
            status: FlowStatus::Idle,
            last_run: None,
            duration: None,
        };
        self.repo.save_flow(&record).await?;
        Ok(record.id)
    }

    async fn link_credential(&self, user_id: &str, token: &str) -> CoreResult<()> {
        self.repo
            .save_access_token(user_id, &AccessToken::new(token))
            .await
    }
}
