//! Category executor strategies.
//!
//! A strategy turns a flow's ordered methods into sandboxed work against either a
//! materialized repository or a staging URL. Methods run strictly in order and the
//! run stops at the first failing one.

pub mod chain;
pub mod frontend;
pub mod performance;
pub mod repository;

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{
    domain::{AccessToken, Category, LogSink, Project, TestFlow},
    error::{Error, Result},
};

pub use frontend::FrontendStrategy;
pub use performance::PerformanceStrategy;
pub use repository::RepositoryStrategy;

/// Everything a strategy reads about the run it executes.
#[derive(Debug, Clone, Copy)]
pub struct RunContext<'a> {
    pub flow: &'a TestFlow,
    pub project: &'a Project,
    pub token: Option<&'a AccessToken>,
}

impl RunContext<'_> {
    pub fn repository_url(&self) -> Result<&str> {
        self.project
            .github_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| Error::PrerequisiteMissing {
                category: self.flow.category,
                missing: "repository URL".into(),
            })
    }

    pub fn staging_url(&self) -> Result<&str> {
        self.project
            .staging_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| Error::PrerequisiteMissing {
                category: self.flow.category,
                missing: "staging URL".into(),
            })
    }
}

/// Artifacts collected during a run. Kept even when the run fails.
#[derive(Debug, Default, Clone)]
pub struct Artifacts {
    pub screenshot_urls: Vec<String>,
}

#[async_trait]
pub trait CategoryStrategy: Send + Sync {
    fn category(&self) -> Category;

    async fn execute(
        &self,
        ctx: RunContext<'_>,
        sink: &LogSink,
        artifacts: &mut Artifacts,
    ) -> Result<()>;
}

/// Executes one method at a time for [`execute_methods`].
#[async_trait]
pub trait MethodRunner: Send {
    async fn run_method(
        &mut self,
        method: &str,
        sink: &LogSink,
        artifacts: &mut Artifacts,
    ) -> Result<()>;

    /// Releases per-run resources. Called on every exit path.
    async fn finish(&mut self, _sink: &LogSink) {}
}

/// Runs `methods` in order, stopping at the first failure.
///
/// A method failure is reported as `MethodExecutionFailed` naming that method,
/// except a sandbox that cannot start, which keeps its own error so the queue can
/// retry the job.
pub async fn execute_methods(
    runner: &mut dyn MethodRunner,
    methods: &[String],
    sink: &LogSink,
    artifacts: &mut Artifacts,
) -> Result<()> {
    let mut outcome = Ok(());
    for method in methods {
        sink.stdout(format!("Executing method: {method}"));
        match runner.run_method(method, sink, artifacts).await {
            Ok(()) => sink.stdout(format!("Method passed: {method}")),
            Err(err) => {
                sink.stdout(format!("Method failed: {method}: {err}"));
                outcome = Err(match err {
                    spawn @ Error::ProcessSpawnFailed(_) => spawn,
                    _ => Error::MethodExecutionFailed {
                        method: method.clone(),
                    },
                });
                break;
            }
        }
    }
    runner.finish(sink).await;
    outcome
}

/// Indexes strategies by category. A missing entry surfaces as `UnsupportedCategory`.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn CategoryStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `strategy`, replacing any earlier one for the same category.
    pub fn with(mut self, strategy: Arc<dyn CategoryStrategy>) -> Self {
        self.strategies
            .retain(|existing| existing.category() != strategy.category());
        self.strategies.push(strategy);
        self
    }

    pub fn get(&self, category: Category) -> Result<Arc<dyn CategoryStrategy>> {
        self.strategies
            .iter()
            .find(|s| s.category() == category)
            .cloned()
            .ok_or_else(|| Error::UnsupportedCategory(category.as_str().to_string()))
    }
}
