use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use crate::core::{
    domain::{
        AccessToken, FlowStatus, FlowStatusEvent, LogLine, LogSink, Project, TestFlow, TestResult,
    },
    error::Result,
};

/// One page of a flow's result history, newest first.
#[derive(Debug, Clone)]
pub struct ResultPage {
    pub results: Vec<TestResult>,
    pub total: usize,
}

/// A flow the scheduler may enqueue, together with whoever owns its project.
#[derive(Debug, Clone)]
pub struct SchedulableFlow {
    pub flow: TestFlow,
    pub owner_id: String,
}

/// Storage for flows, results and the read-only project/user collaborators.
#[async_trait]
pub trait FlowRepository: Send + Sync {
    async fn get_flow(&self, flow_id: &str) -> Result<Option<TestFlow>>;
    async fn get_project(&self, project_id: &str) -> Result<Option<Project>>;
    /// The user's source-hosting credential, if one is linked.
    async fn access_token(&self, user_id: &str) -> Result<Option<AccessToken>>;

    /// Moves the flow to RUNNING and stamps `last_run` unless it is already RUNNING.
    /// Returns `false` when another run holds the flow. Must be atomic.
    async fn try_start(&self, flow_id: &str, started_at: i64) -> Result<bool>;
    /// Moves a RUNNING flow to its terminal status.
    async fn finish(&self, flow_id: &str, status: FlowStatus, duration: i64) -> Result<()>;

    async fn insert_result(&self, result: &TestResult) -> Result<()>;
    async fn list_results(&self, flow_id: &str, page: usize, limit: usize) -> Result<ResultPage>;
    async fn get_result(&self, flow_id: &str, result_id: &str) -> Result<Option<TestResult>>;

    /// Non-running flows that belong to active projects.
    async fn list_schedulable_flows(&self) -> Result<Vec<SchedulableFlow>>;
    /// Deletes results that ended before `cutoff` and returns them.
    async fn delete_results_before(&self, cutoff: i64) -> Result<Vec<TestResult>>;

    async fn save_project(&self, project: &Project) -> Result<()>;
    async fn save_flow(&self, flow: &TestFlow) -> Result<()>;
    async fn save_access_token(&self, user_id: &str, token: &AccessToken) -> Result<()>;
}

/// A single sandboxed invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub image: String,
    pub workdir: PathBuf,
    pub command: String,
}

/// Runs one shell command in a disposable environment.
///
/// Every output line goes to `sink`, stderr tagged. Resolves with the captured
/// stdout on exit code zero, `CommandFailed` otherwise, and `ProcessSpawnFailed`
/// when the environment cannot be started.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec, sink: &LogSink) -> Result<String>;
}

/// Captured outcome of one version-control invocation.
#[derive(Debug, Clone, Default)]
pub struct VcsOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub lines: Vec<LogLine>,
}

impl VcsOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Direct version-control invocation. Only spawn failures are errors.
#[async_trait]
pub trait VcsClient: Send + Sync {
    async fn run(&self, args: &[String], cwd: Option<&Path>) -> Result<VcsOutput>;
}

/// How a credential reaches the version-control host.
pub trait CredentialInjector: Send + Sync {
    /// The remote URL to use while the credential is needed.
    fn authenticated_url(&self, public_url: &str, token: &AccessToken) -> String;

    /// Removes every trace of the credential from a line of output.
    fn scrub(&self, text: &str, token: &AccessToken) -> String {
        if token.expose().is_empty() {
            return text.to_string();
        }
        text.replace(token.expose(), "***")
    }
}

/// A local checkout, exclusively held until dropped.
#[derive(Debug)]
pub struct Checkout {
    pub path: PathBuf,
    _guard: Option<OwnedMutexGuard<()>>,
}

impl Checkout {
    pub fn locked(path: PathBuf, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            path,
            _guard: Some(guard),
        }
    }

    pub fn unlocked(path: PathBuf) -> Self {
        Self { path, _guard: None }
    }
}

#[async_trait]
pub trait RepositoryMaterializer: Send + Sync {
    /// Ensures an up-to-date local checkout of `repo_url` exists.
    async fn materialize(
        &self,
        repo_url: &str,
        token: Option<&AccessToken>,
        sink: &LogSink,
    ) -> Result<Checkout>;
}

/// Opens headless browsing contexts.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>>;
}

/// One browsing context. Callers close it on every exit path.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn goto(&mut self, url: &str) -> Result<()>;
    async fn click(&mut self, selector: &str) -> Result<()>;
    async fn exists(&mut self, selector: &str) -> Result<bool>;
    /// PNG bytes of the current viewport.
    async fn screenshot(&mut self) -> Result<Vec<u8>>;
    async fn close(&mut self) -> Result<()>;
}

/// PNG artifacts referenced from results as `/screenshots/<file>`.
#[async_trait]
pub trait ScreenshotStore: Send + Sync {
    /// Stores the image and returns its public reference.
    async fn save(&self, file_name: &str, png: &[u8]) -> Result<String>;
    async fn read(&self, file_name: &str) -> Result<Option<Vec<u8>>>;
    /// Removes the file behind a public reference. Missing files are ignored.
    async fn remove(&self, reference: &str) -> Result<()>;
    /// Removes files last modified before `cutoff` (ms since epoch).
    async fn prune_older_than(&self, cutoff: i64) -> Result<usize>;
}

/// Outcome of one probe request.
#[derive(Debug, Clone, Copy)]
pub struct ProbeSample {
    pub ok: bool,
    pub elapsed_ms: u64,
}

/// HTTP GET against a deployed target, used by load probes.
#[async_trait]
pub trait HttpProbe: Send + Sync {
    async fn get(&self, url: &str) -> Result<ProbeSample>;
}

/// Abstraction for getting the current time.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// Best-effort fan-out of lifecycle transitions.
pub trait StatusPublisher: Send + Sync {
    fn publish(&self, event: FlowStatusEvent);
}
