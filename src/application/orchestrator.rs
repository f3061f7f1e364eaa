//! One end-to-end run: RUNNING, dispatch, persist, terminal state.
//!
//! Once a flow has entered RUNNING every exit path writes a result and moves the
//! flow to SUCCESS or FAILED, including strategy panics.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    application::{
        queue::JobHandler,
        state_machine::{FlowStateMachine, StartOutcome},
        strategies::{Artifacts, RunContext, StrategyRegistry},
    },
    core::{
        domain::{LogSink, ResultStatus, TestFlow, TestJob, TestResult},
        error::{Error, Result},
        ports::FlowRepository,
    },
};

const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub flow_id: String,
    /// Whose credential authenticates materialization. Defaults to the project owner.
    pub requested_by: Option<String>,
    /// Shared by every retry of one queued request.
    pub attempt_group: Option<String>,
    pub attempt: u32,
}

impl RunRequest {
    pub fn immediate(flow_id: impl Into<String>, requested_by: Option<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            requested_by,
            attempt_group: None,
            attempt: 1,
        }
    }
}

impl From<&TestJob> for RunRequest {
    fn from(job: &TestJob) -> Self {
        Self {
            flow_id: job.flow_id.clone(),
            requested_by: Some(job.user_id.clone()),
            attempt_group: Some(job.attempt_group.clone()),
            attempt: job.attempt,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub result: TestResult,
    /// The failure behind a FAILED result, if any.
    pub error: Option<Error>,
}

impl ExecutionResult {
    /// Whether another attempt could succeed.
    pub fn retryable(&self) -> bool {
        self.error.as_ref().is_some_and(Error::is_transient)
    }
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(ExecutionResult),
    AlreadyRunning,
}

pub struct Orchestrator {
    repo: Arc<dyn FlowRepository>,
    machine: FlowStateMachine,
    strategies: StrategyRegistry,
}

impl Orchestrator {
    pub fn new(
        repo: Arc<dyn FlowRepository>,
        machine: FlowStateMachine,
        strategies: StrategyRegistry,
    ) -> Self {
        Self {
            repo,
            machine,
            strategies,
        }
    }

    /// Runs a flow to completion.
    ///
    /// Errors only for failures before the flow enters RUNNING (unknown flow,
    /// unreachable store) or when the terminal write itself cannot be made.
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome> {
        let flow = self
            .repo
            .get_flow(&request.flow_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Flow {}", request.flow_id)))?;

        let started_at = match self.machine.begin(&flow.id).await? {
            StartOutcome::Started { started_at } => started_at,
            StartOutcome::AlreadyRunning => return Ok(RunOutcome::AlreadyRunning),
        };
        info!(
            flow_id = %flow.id,
            category = %flow.category,
            attempt = request.attempt,
            "run started"
        );

        let sink = LogSink::new();
        let mut artifacts = Artifacts::default();
        let outcome = AssertUnwindSafe(self.dispatch(&flow, &request, &sink, &mut artifacts))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(Error::System(format!(
                    "strategy panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        let ended_at = self.machine.now_ms();
        let duration = (ended_at - started_at).max(1);
        let (status, error) = match outcome {
            Ok(()) => {
                sink.stdout(format!("Test completed successfully in {duration} ms"));
                (ResultStatus::Success, None)
            }
            Err(err) => {
                sink.stdout(format!("Test failed: {err}"));
                (ResultStatus::Failed, Some(err))
            }
        };

        let result = TestResult {
            id: Uuid::new_v4().to_string(),
            flow_id: flow.id.clone(),
            status,
            started_at,
            ended_at,
            duration,
            logs: sink.snapshot(),
            screenshot_urls: artifacts.screenshot_urls,
            error_message: error.as_ref().map(ToString::to_string),
            attempt_group: request.attempt_group.clone(),
            attempt: request.attempt,
        };

        let persisted = self.persist(&result).await;
        let result_id = persisted.is_ok().then_some(result.id.as_str());
        if let Err(err) = self
            .machine
            .complete(&flow.id, status, duration, result_id)
            .await
        {
            error!(flow_id = %flow.id, error = %err, "flow left RUNNING: terminal write failed");
            return Err(err);
        }
        persisted?;

        match &error {
            None => info!(flow_id = %flow.id, duration, "run succeeded"),
            Some(err) => warn!(
                flow_id = %flow.id,
                duration,
                kind = err.kind(),
                error = %err,
                "run failed"
            ),
        }
        Ok(RunOutcome::Completed(ExecutionResult { result, error }))
    }

    async fn dispatch(
        &self,
        flow: &TestFlow,
        request: &RunRequest,
        sink: &LogSink,
        artifacts: &mut Artifacts,
    ) -> Result<()> {
        let project = self
            .repo
            .get_project(&flow.project_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Project {}", flow.project_id)))?;
        let strategy = self.strategies.get(flow.category)?;

        let token = if flow.category.requires_repository() {
            let user_id = request.requested_by.as_deref().unwrap_or(&project.owner_id);
            self.repo.access_token(user_id).await?
        } else {
            None
        };

        let ctx = RunContext {
            flow,
            project: &project,
            token: token.as_ref(),
        };
        strategy.execute(ctx, sink, artifacts).await
    }

    async fn persist(&self, result: &TestResult) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.repo.insert_result(result).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < PERSIST_ATTEMPTS => {
                    warn!(flow_id = %result.flow_id, attempt, error = %err, "result write failed, retrying");
                    tokio::time::sleep(PERSIST_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(flow_id = %result.flow_id, error = %err, "result could not be stored");
                    return Err(err);
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl JobHandler for Orchestrator {
    async fn handle(&self, job: &TestJob) -> Result<()> {
        match self.run(RunRequest::from(job)).await? {
            RunOutcome::AlreadyRunning => {
                info!(job_id = %job.id, flow_id = %job.flow_id, "flow busy, job skipped");
                Ok(())
            }
            RunOutcome::Completed(execution) => match execution.error {
                Some(err) if err.is_transient() => Err(err),
                _ => Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapters::outbound::clock::SystemClock,
        application::{
            strategies::{CategoryStrategy, PerformanceStrategy, RepositoryStrategy},
            test_support::{
                FakeMaterializer, FakeProbe, MemoryRepository, RecordingPublisher,
                ScriptedRunner, flow, project,
            },
        },
        config::InstallCommands,
        core::domain::{AccessToken, Category, FlowStatus},
    };
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    struct Harness {
        _repo_dir: TempDir,
        repo: Arc<MemoryRepository>,
        runner: Arc<ScriptedRunner>,
        materializer: Arc<FakeMaterializer>,
        publisher: Arc<RecordingPublisher>,
        orchestrator: Arc<Orchestrator>,
    }

    fn harness_with(
        project: crate::core::domain::Project,
        flows: &[TestFlow],
        runner: ScriptedRunner,
        extra: Option<Arc<dyn CategoryStrategy>>,
    ) -> Harness {
        let repo_dir = tempdir().unwrap();
        let repo = Arc::new(MemoryRepository::with(project, flows));
        let runner = Arc::new(runner);
        let materializer = Arc::new(FakeMaterializer::new(repo_dir.path()));
        let publisher = Arc::new(RecordingPublisher::default());
        let mut strategies = StrategyRegistry::new()
            .with(Arc::new(RepositoryStrategy::new(
                Category::Unit,
                "node:20",
                vec!["npm test".into(), "npm run test:unit".into()],
                InstallCommands::default(),
                runner.clone(),
                materializer.clone(),
            )))
            .with(Arc::new(RepositoryStrategy::new(
                Category::Backend,
                "node:20",
                vec!["npm test".into()],
                InstallCommands::default(),
                runner.clone(),
                materializer.clone(),
            )))
            .with(Arc::new(PerformanceStrategy::new(
                "node:20",
                "npx lighthouse {url}",
                2,
                repo_dir.path().join("scratch"),
                runner.clone(),
                Arc::new(FakeProbe::healthy()),
            )));
        if let Some(strategy) = extra {
            strategies = strategies.with(strategy);
        }
        let machine = FlowStateMachine::new(repo.clone(), Arc::new(SystemClock), publisher.clone());
        let orchestrator = Arc::new(Orchestrator::new(repo.clone(), machine, strategies));
        Harness {
            _repo_dir: repo_dir,
            repo,
            runner,
            materializer,
            publisher,
            orchestrator,
        }
    }

    fn completed(outcome: RunOutcome) -> ExecutionResult {
        match outcome {
            RunOutcome::Completed(result) => result,
            RunOutcome::AlreadyRunning => panic!("expected a completed run"),
        }
    }

    #[tokio::test]
    async fn unit_flow_with_passing_command_succeeds() {
        let h = harness_with(
            project(Some("https://github.com/acme/calc"), None),
            &[flow("f1", Category::Unit, &["add numbers"])],
            ScriptedRunner::new(),
            None,
        );

        let execution = completed(
            h.orchestrator
                .run(RunRequest::immediate("f1", None))
                .await
                .unwrap(),
        );

        assert_eq!(execution.result.status, ResultStatus::Success);
        assert!(execution.result.duration > 0);
        assert!(execution.error.is_none());
        let stored = h.repo.flow("f1");
        assert_eq!(stored.status, FlowStatus::Success);
        assert_eq!(h.repo.results(), vec![execution.result.clone()]);
        let events = h.publisher.events();
        assert_eq!(events.first().unwrap().status, FlowStatus::Running);
        let last = events.last().unwrap();
        assert_eq!(last.status, FlowStatus::Success);
        assert_eq!(last.result_id.as_deref(), Some(execution.result.id.as_str()));
    }

    #[tokio::test]
    async fn backend_flow_without_repository_fails_fast() {
        let h = harness_with(
            project(None, None),
            &[flow("f1", Category::Backend, &["GET /health"])],
            ScriptedRunner::new(),
            None,
        );

        let execution = completed(
            h.orchestrator
                .run(RunRequest::immediate("f1", None))
                .await
                .unwrap(),
        );

        assert_eq!(execution.result.status, ResultStatus::Failed);
        assert!(matches!(
            execution.error,
            Some(Error::PrerequisiteMissing {
                category: Category::Backend,
                ..
            })
        ));
        assert_eq!(
            execution.result.error_message.as_deref(),
            Some("Project must configure a repository URL to run BACKEND tests")
        );
        assert_eq!(h.materializer.calls(), 0);
        assert_eq!(h.repo.flow("f1").status, FlowStatus::Failed);
        assert_eq!(h.repo.results().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_runs_of_one_flow_start_once() {
        let h = harness_with(
            project(Some("https://github.com/acme/calc"), None),
            &[flow("f1", Category::Unit, &["add numbers"])],
            ScriptedRunner::new().slow(Duration::from_millis(100)),
            None,
        );

        let first = h.orchestrator.run(RunRequest::immediate("f1", None));
        let second = h.orchestrator.run(RunRequest::immediate("f1", None));
        let (first, second) = tokio::join!(first, second);
        let outcomes = [first.unwrap(), second.unwrap()];

        let already = outcomes
            .iter()
            .filter(|o| matches!(o, RunOutcome::AlreadyRunning))
            .count();
        assert_eq!(already, 1);
        assert_eq!(h.repo.results().len(), 1);
        assert_eq!(h.repo.flow("f1").status, FlowStatus::Success);
    }

    #[tokio::test]
    async fn fallback_logs_are_kept_in_the_result() {
        let h = harness_with(
            project(Some("https://github.com/acme/calc"), None),
            &[flow("f1", Category::Unit, &["add numbers"])],
            ScriptedRunner::new().fail("npm test", 1),
            None,
        );

        let execution = completed(
            h.orchestrator
                .run(RunRequest::immediate("f1", None))
                .await
                .unwrap(),
        );
        assert_eq!(execution.result.status, ResultStatus::Success);
        let lines: Vec<String> = execution
            .result
            .logs
            .iter()
            .map(ToString::to_string)
            .collect();
        let primary = lines.iter().position(|l| l == "Trying: npm test").unwrap();
        let stderr = lines
            .iter()
            .position(|l| l == "STDERR: npm test exited 1")
            .unwrap();
        let secondary = lines
            .iter()
            .position(|l| l == "Trying: npm run test:unit")
            .unwrap();
        assert!(primary < stderr && stderr < secondary);
        assert_eq!(h.runner.commands(), ["npm test", "npm run test:unit"]);
    }

    #[tokio::test]
    async fn spawn_failures_are_retryable() {
        let h = harness_with(
            project(Some("https://github.com/acme/calc"), None),
            &[flow("f1", Category::Unit, &["add numbers"])],
            ScriptedRunner::new().spawn_failure(),
            None,
        );
        let execution = completed(
            h.orchestrator
                .run(RunRequest::immediate("f1", None))
                .await
                .unwrap(),
        );
        assert!(execution.retryable());
        assert_eq!(h.repo.flow("f1").status, FlowStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_flow_is_an_error_without_side_effects() {
        let h = harness_with(project(None, None), &[], ScriptedRunner::new(), None);
        let err = h
            .orchestrator
            .run(RunRequest::immediate("nope", None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(h.repo.results().is_empty());
        assert!(h.publisher.events().is_empty());
    }

    #[tokio::test]
    async fn requesting_users_credential_reaches_the_strategy() {
        struct TokenProbe(Mutex<Option<String>>);

        #[async_trait]
        impl CategoryStrategy for TokenProbe {
            fn category(&self) -> Category {
                Category::Frontend
            }

            async fn execute(
                &self,
                ctx: RunContext<'_>,
                _sink: &LogSink,
                _artifacts: &mut Artifacts,
            ) -> Result<()> {
                *self.0.lock().unwrap() = ctx.token.map(|t| t.expose().to_string());
                Ok(())
            }
        }

        let probe = Arc::new(TokenProbe(Mutex::new(None)));
        let h = harness_with(
            project(Some("https://github.com/acme/web"), None),
            &[flow("f1", Category::Frontend, &["renders"])],
            ScriptedRunner::new(),
            Some(probe.clone()),
        );
        h.repo
            .save_access_token("alice", &AccessToken::new("ghs_alice"))
            .await
            .unwrap();
        h.repo
            .save_access_token("owner-1", &AccessToken::new("ghs_owner"))
            .await
            .unwrap();

        h.orchestrator
            .run(RunRequest::immediate("f1", Some("alice".into())))
            .await
            .unwrap();
        assert_eq!(probe.0.lock().unwrap().as_deref(), Some("ghs_alice"));

        h.orchestrator
            .run(RunRequest::immediate("f1", None))
            .await
            .unwrap();
        assert_eq!(probe.0.lock().unwrap().as_deref(), Some("ghs_owner"));
    }

    mod fault_injection {
        use super::*;

        struct Faulty {
            mode: &'static str,
        }

        #[async_trait]
        impl CategoryStrategy for Faulty {
            fn category(&self) -> Category {
                Category::Frontend
            }

            async fn execute(
                &self,
                _ctx: RunContext<'_>,
                sink: &LogSink,
                artifacts: &mut Artifacts,
            ) -> Result<()> {
                sink.stdout("before fault");
                artifacts.screenshot_urls.push("/screenshots/screenshot-f1-a-1.png".into());
                match self.mode {
                    "panic" => panic!("browser crashed"),
                    "error" => Err(Error::Browser("session lost".into())),
                    _ => Ok(()),
                }
            }
        }

        fn faulty(mode: &'static str) -> Harness {
            harness_with(
                project(Some("https://github.com/acme/web"), None),
                &[
                    flow("f1", Category::Frontend, &["renders"]),
                    flow("f2", Category::Performance, &["lighthouse"]),
                ],
                ScriptedRunner::new(),
                Some(Arc::new(Faulty { mode })),
            )
        }

        #[tokio::test]
        async fn panicking_strategy_still_reaches_failed() {
            let h = faulty("panic");
            let execution = completed(
                h.orchestrator
                    .run(RunRequest::immediate("f1", None))
                    .await
                    .unwrap(),
            );
            assert_eq!(execution.result.status, ResultStatus::Failed);
            assert!(
                execution
                    .result
                    .error_message
                    .unwrap()
                    .contains("browser crashed")
            );
            assert_eq!(execution.result.screenshot_urls.len(), 1);
            assert_eq!(h.repo.flow("f1").status, FlowStatus::Failed);
        }

        #[tokio::test]
        async fn strategy_error_keeps_partial_logs() {
            let h = faulty("error");
            let execution = completed(
                h.orchestrator
                    .run(RunRequest::immediate("f1", None))
                    .await
                    .unwrap(),
            );
            assert_eq!(execution.result.logs[0].text, "before fault");
            assert_eq!(h.repo.flow("f1").status, FlowStatus::Failed);
        }

        #[tokio::test]
        async fn missing_staging_url_reaches_failed() {
            let h = faulty("ok");
            completed(
                h.orchestrator
                    .run(RunRequest::immediate("f2", None))
                    .await
                    .unwrap(),
            );
            assert_eq!(h.repo.flow("f2").status, FlowStatus::Failed);
        }

        #[tokio::test]
        async fn transient_store_failures_are_retried() {
            let h = faulty("ok");
            h.repo.fail_inserts(2);
            h.repo.fail_finishes(2);
            completed(
                h.orchestrator
                    .run(RunRequest::immediate("f1", None))
                    .await
                    .unwrap(),
            );
            assert_eq!(h.repo.results().len(), 1);
            assert_eq!(h.repo.flow("f1").status, FlowStatus::Success);
        }

        #[tokio::test]
        async fn lost_result_write_still_reaches_terminal_state() {
            let h = faulty("ok");
            h.repo.fail_inserts(PERSIST_ATTEMPTS as usize);
            let err = h
                .orchestrator
                .run(RunRequest::immediate("f1", None))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Persistence(_)));
            assert_ne!(h.repo.flow("f1").status, FlowStatus::Running);
            let last = h.publisher.events().pop().unwrap();
            assert_eq!(last.result_id, None);
        }
    }
}
