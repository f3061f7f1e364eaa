//! Inbound ports (use-case ports) define the application service interface that
//! driving adapters (CLI, HTTP server) consume.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::{
    domain::{Category, FlowStatus, FlowStatusEvent, TestResult},
    error::Result,
};

/// Whether a run goes through the job queue or executes in the caller's task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Queued,
    Immediate,
}

#[derive(Debug, Clone)]
pub struct RunFlowRequest {
    pub flow_id: String,
    /// Whose credential authenticates materialization. Defaults to the project owner.
    pub user_id: Option<String>,
    pub mode: RunMode,
}

#[derive(Debug, Clone)]
pub enum RunResponse {
    Queued { job_id: String },
    Completed(Box<TestResult>),
    AlreadyRunning,
}

/// `GET /flows/{id}/status` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStatusView {
    pub id: String,
    pub name: String,
    pub status: FlowStatus,
    pub last_run: Option<i64>,
    pub duration: Option<i64>,
    pub category: Category,
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultListing {
    pub results: Vec<TestResult>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Seeding request for the project collaborator record.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub name: String,
    pub owner_id: String,
    pub github_url: Option<String>,
    pub staging_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewFlow {
    pub project_id: String,
    pub name: String,
    pub description: String,
    pub category: Category,
    pub methods: Vec<String>,
}

/// The application service driving adapters consume.
#[async_trait]
pub trait ExecutionService: Send + Sync {
    /// Requests a run. An already running flow is a normal outcome, not an error.
    async fn request_run(&self, request: RunFlowRequest) -> Result<RunResponse>;

    async fn flow_status(&self, flow_id: &str) -> Result<Option<FlowStatusView>>;

    /// Newest first. `page` is 1-based.
    async fn list_results(&self, flow_id: &str, page: usize, limit: usize)
    -> Result<ResultListing>;

    async fn result_detail(&self, flow_id: &str, result_id: &str) -> Result<Option<TestResult>>;

    async fn queue_stats(&self) -> Result<QueueStats>;

    /// Joins the flow's live topic. Dropping the receiver leaves it.
    fn subscribe(&self, flow_id: &str) -> broadcast::Receiver<FlowStatusEvent>;

    async fn screenshot(&self, file_name: &str) -> Result<Option<Vec<u8>>>;

    async fn create_project(&self, project: NewProject) -> Result<String>;

    async fn create_flow(&self, flow: NewFlow) -> Result<String>;

    async fn link_credential(&self, user_id: &str, token: &str) -> Result<()>;
}
