//! In-memory fakes for the outbound ports.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::core::{
    domain::{
        AccessToken, Category, FlowStatus, FlowStatusEvent, LogSink, Project, TestFlow,
        TestResult,
    },
    error::{Error, Result},
    ports::{
        BrowserLauncher, BrowserSession, Checkout, CommandRunner, CommandSpec, FlowRepository,
        HttpProbe, ProbeSample, RepositoryMaterializer, ResultPage, SchedulableFlow,
        StatusPublisher,
    },
};

pub fn project(github_url: Option<&str>, staging_url: Option<&str>) -> Project {
    Project {
        id: "p1".into(),
        name: "Acme".into(),
        owner_id: "owner-1".into(),
        github_url: github_url.map(String::from),
        staging_url: staging_url.map(String::from),
        active: true,
    }
}

pub fn flow(id: &str, category: Category, methods: &[&str]) -> TestFlow {
    TestFlow {
        id: id.into(),
        project_id: "p1".into(),
        name: format!("{id}-name"),
        description: String::new(),
        category,
        methods: methods.iter().map(|m| m.to_string()).collect(),
        status: FlowStatus::Idle,
        last_run: None,
        duration: None,
    }
}

enum Script {
    Output(String),
    Exit(i32),
}

/// Command runner answering from a script. Unscripted commands succeed with no output.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: HashMap<String, Script>,
    spawn_failure: bool,
    delay: Option<Duration>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(mut self, command: &str, code: i32) -> Self {
        self.scripts.insert(command.into(), Script::Exit(code));
        self
    }

    pub fn output(mut self, command: &str, stdout: &str) -> Self {
        self.scripts
            .insert(command.into(), Script::Output(stdout.into()));
        self
    }

    pub fn spawn_failure(mut self) -> Self {
        self.spawn_failure = true;
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|spec| spec.command.clone())
            .collect()
    }

    pub fn workdirs(&self) -> Vec<PathBuf> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|spec| spec.workdir.clone())
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec, sink: &LogSink) -> Result<String> {
        self.calls.lock().unwrap().push(spec.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.spawn_failure {
            return Err(Error::ProcessSpawnFailed("container runtime missing".into()));
        }
        match self.scripts.get(&spec.command) {
            Some(Script::Exit(code)) => {
                sink.stderr(format!("{} exited {code}", spec.command));
                Err(Error::CommandFailed {
                    command: spec.command.clone(),
                    exit_code: Some(*code),
                })
            }
            Some(Script::Output(stdout)) => {
                for line in stdout.lines() {
                    sink.stdout(line);
                }
                Ok(stdout.clone())
            }
            None => Ok(String::new()),
        }
    }
}

pub struct FakeMaterializer {
    dir: PathBuf,
    failure: Option<Error>,
    calls: AtomicUsize,
}

impl FakeMaterializer {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self, err: Error) -> Self {
        self.failure = Some(err);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepositoryMaterializer for FakeMaterializer {
    async fn materialize(
        &self,
        _repo_url: &str,
        _token: Option<&AccessToken>,
        sink: &LogSink,
    ) -> Result<Checkout> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        sink.stdout("Repository up to date");
        Ok(Checkout::unlocked(self.dir.clone()))
    }
}

/// Browser launcher whose sessions record every action into one shared log.
#[derive(Default)]
pub struct FakeLauncher {
    unavailable: bool,
    missing: HashSet<String>,
    actions: Arc<Mutex<Vec<String>>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn missing(mut self, selector: &str) -> Self {
        self.missing.insert(selector.into());
        self
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>> {
        if self.unavailable {
            return Err(Error::Browser("WebDriver unreachable".into()));
        }
        Ok(Box::new(FakeSession {
            missing: self.missing.clone(),
            actions: self.actions.clone(),
        }))
    }
}

struct FakeSession {
    missing: HashSet<String>,
    actions: Arc<Mutex<Vec<String>>>,
}

impl FakeSession {
    fn record(&self, action: String) {
        self.actions.lock().unwrap().push(action);
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn goto(&mut self, url: &str) -> Result<()> {
        self.record(format!("goto {url}"));
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<()> {
        self.record(format!("click {selector}"));
        if self.missing.contains(selector) {
            return Err(Error::Browser(format!("Element not found: {selector}")));
        }
        Ok(())
    }

    async fn exists(&mut self, selector: &str) -> Result<bool> {
        self.record(format!("exists {selector}"));
        Ok(!self.missing.contains(selector))
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>> {
        self.record("screenshot".into());
        Ok(b"\x89PNG".to_vec())
    }

    async fn close(&mut self) -> Result<()> {
        self.record("close".into());
        Ok(())
    }
}

pub struct FakeProbe {
    ok: bool,
    calls: AtomicUsize,
}

impl FakeProbe {
    pub fn healthy() -> Self {
        Self {
            ok: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            ok: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpProbe for FakeProbe {
    async fn get(&self, _url: &str) -> Result<ProbeSample> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ProbeSample {
            ok: self.ok,
            elapsed_ms: 12,
        })
    }
}

#[derive(Default)]
struct MemoryState {
    projects: HashMap<String, Project>,
    flows: HashMap<String, TestFlow>,
    tokens: HashMap<String, AccessToken>,
    results: Vec<TestResult>,
}

/// `FlowRepository` over a mutex-guarded map, with injectable write failures.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
    failing_inserts: AtomicUsize,
    failing_finishes: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(project: Project, flows: &[TestFlow]) -> Self {
        let repo = Self::new();
        {
            let mut state = repo.state.lock().unwrap();
            state.projects.insert(project.id.clone(), project);
            for flow in flows {
                state.flows.insert(flow.id.clone(), flow.clone());
            }
        }
        repo
    }

    /// The next `n` result inserts fail.
    pub fn fail_inserts(&self, n: usize) {
        self.failing_inserts.store(n, Ordering::SeqCst);
    }

    /// The next `n` terminal transitions fail.
    pub fn fail_finishes(&self, n: usize) {
        self.failing_finishes.store(n, Ordering::SeqCst);
    }

    pub fn flow(&self, id: &str) -> TestFlow {
        self.state.lock().unwrap().flows[id].clone()
    }

    pub fn set_flow(&self, flow: TestFlow) {
        self.state
            .lock()
            .unwrap()
            .flows
            .insert(flow.id.clone(), flow);
    }

    pub fn results(&self) -> Vec<TestResult> {
        self.state.lock().unwrap().results.clone()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl FlowRepository for MemoryRepository {
    async fn get_flow(&self, flow_id: &str) -> Result<Option<TestFlow>> {
        Ok(self.state.lock().unwrap().flows.get(flow_id).cloned())
    }

    async fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
        Ok(self.state.lock().unwrap().projects.get(project_id).cloned())
    }

    async fn access_token(&self, user_id: &str) -> Result<Option<AccessToken>> {
        Ok(self.state.lock().unwrap().tokens.get(user_id).cloned())
    }

    async fn try_start(&self, flow_id: &str, started_at: i64) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let flow = state
            .flows
            .get_mut(flow_id)
            .ok_or_else(|| Error::NotFound(format!("Flow {flow_id}")))?;
        if flow.status == FlowStatus::Running {
            return Ok(false);
        }
        flow.status = FlowStatus::Running;
        flow.last_run = Some(started_at);
        Ok(true)
    }

    async fn finish(&self, flow_id: &str, status: FlowStatus, duration: i64) -> Result<()> {
        if Self::take_failure(&self.failing_finishes) {
            return Err(Error::Persistence("database is locked".into()));
        }
        let mut state = self.state.lock().unwrap();
        let flow = state
            .flows
            .get_mut(flow_id)
            .ok_or_else(|| Error::NotFound(format!("Flow {flow_id}")))?;
        flow.status = status;
        flow.duration = Some(duration);
        Ok(())
    }

    async fn insert_result(&self, result: &TestResult) -> Result<()> {
        if Self::take_failure(&self.failing_inserts) {
            return Err(Error::Persistence("disk I/O error".into()));
        }
        self.state.lock().unwrap().results.push(result.clone());
        Ok(())
    }

    async fn list_results(&self, flow_id: &str, page: usize, limit: usize) -> Result<ResultPage> {
        let state = self.state.lock().unwrap();
        let mut matching: Vec<TestResult> = state
            .results
            .iter()
            .filter(|r| r.flow_id == flow_id)
            .cloned()
            .collect();
        matching.reverse();
        let total = matching.len();
        let results = matching
            .into_iter()
            .skip(page.saturating_sub(1) * limit)
            .take(limit)
            .collect();
        Ok(ResultPage { results, total })
    }

    async fn get_result(&self, flow_id: &str, result_id: &str) -> Result<Option<TestResult>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .results
            .iter()
            .find(|r| r.flow_id == flow_id && r.id == result_id)
            .cloned())
    }

    async fn list_schedulable_flows(&self) -> Result<Vec<SchedulableFlow>> {
        let state = self.state.lock().unwrap();
        let mut flows: Vec<SchedulableFlow> = state
            .flows
            .values()
            .filter(|f| f.status != FlowStatus::Running)
            .filter_map(|f| {
                let project = state.projects.get(&f.project_id)?;
                project.active.then(|| SchedulableFlow {
                    flow: f.clone(),
                    owner_id: project.owner_id.clone(),
                })
            })
            .collect();
        flows.sort_by(|a, b| a.flow.id.cmp(&b.flow.id));
        Ok(flows)
    }

    async fn delete_results_before(&self, cutoff: i64) -> Result<Vec<TestResult>> {
        let mut state = self.state.lock().unwrap();
        let (old, kept): (Vec<TestResult>, Vec<TestResult>) = state
            .results
            .drain(..)
            .partition(|r| r.ended_at < cutoff);
        state.results = kept;
        Ok(old)
    }

    async fn save_project(&self, project: &Project) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .projects
            .insert(project.id.clone(), project.clone());
        Ok(())
    }

    async fn save_flow(&self, flow: &TestFlow) -> Result<()> {
        self.set_flow(flow.clone());
        Ok(())
    }

    async fn save_access_token(&self, user_id: &str, token: &AccessToken) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .tokens
            .insert(user_id.into(), token.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<FlowStatusEvent>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<FlowStatusEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl StatusPublisher for RecordingPublisher {
    fn publish(&self, event: FlowStatusEvent) {
        self.events.lock().unwrap().push(event);
    }
}
