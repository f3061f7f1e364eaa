use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tracing::info;

use crate::{
    application::strategies::{
        Artifacts, CategoryStrategy, MethodRunner, RunContext,
        chain::{FallbackChain, install_dependencies},
        execute_methods,
    },
    config::InstallCommands,
    core::{
        domain::{Category, LogSink},
        error::Result,
        ports::{CommandRunner, RepositoryMaterializer},
    },
};

/// BACKEND and UNIT: a fallback chain of test-runner commands per method, inside a
/// fresh checkout of the project's repository.
pub struct RepositoryStrategy {
    category: Category,
    image: String,
    chain: Vec<String>,
    install: InstallCommands,
    runner: Arc<dyn CommandRunner>,
    materializer: Arc<dyn RepositoryMaterializer>,
}

impl RepositoryStrategy {
    pub fn new(
        category: Category,
        image: impl Into<String>,
        chain: Vec<String>,
        install: InstallCommands,
        runner: Arc<dyn CommandRunner>,
        materializer: Arc<dyn RepositoryMaterializer>,
    ) -> Self {
        Self {
            category,
            image: image.into(),
            chain,
            install,
            runner,
            materializer,
        }
    }
}

struct ChainRunner<'a> {
    runner: &'a dyn CommandRunner,
    image: &'a str,
    workdir: PathBuf,
    chain: &'a [String],
}

#[async_trait]
impl MethodRunner for ChainRunner<'_> {
    async fn run_method(
        &mut self,
        method: &str,
        sink: &LogSink,
        _artifacts: &mut Artifacts,
    ) -> Result<()> {
        FallbackChain {
            runner: self.runner,
            image: self.image,
            workdir: &self.workdir,
            templates: self.chain,
        }
        .run(method, sink)
        .await
    }
}

#[async_trait]
impl CategoryStrategy for RepositoryStrategy {
    fn category(&self) -> Category {
        self.category
    }

    async fn execute(
        &self,
        ctx: RunContext<'_>,
        sink: &LogSink,
        artifacts: &mut Artifacts,
    ) -> Result<()> {
        let repo_url = ctx.repository_url()?;
        sink.stdout(format!(
            "Starting {} test for flow: {}",
            self.category, ctx.flow.name
        ));
        let checkout = self.materializer.materialize(repo_url, ctx.token, sink).await?;
        info!(
            flow_id = %ctx.flow.id,
            category = %self.category,
            path = %checkout.path.display(),
            "repository ready"
        );

        install_dependencies(
            self.runner.as_ref(),
            &self.image,
            &checkout.path,
            &self.install,
            sink,
        )
        .await?;

        let mut runner = ChainRunner {
            runner: self.runner.as_ref(),
            image: &self.image,
            workdir: checkout.path.clone(),
            chain: &self.chain,
        };
        execute_methods(&mut runner, &ctx.flow.methods, sink, artifacts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        application::test_support::{FakeMaterializer, ScriptedRunner, flow, project},
        core::error::Error,
    };
    use tempfile::tempdir;

    fn strategy(
        category: Category,
        runner: Arc<ScriptedRunner>,
        materializer: Arc<FakeMaterializer>,
    ) -> RepositoryStrategy {
        RepositoryStrategy::new(
            category,
            "node:20",
            vec!["npm test".into(), "npx jest".into()],
            InstallCommands::default(),
            runner,
            materializer,
        )
    }

    #[tokio::test]
    async fn runs_each_method_in_the_checkout() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("package.json"), "{}").unwrap();
        std::fs::write(temp.path().join("yarn.lock"), "").unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let materializer = Arc::new(FakeMaterializer::new(temp.path()));
        let strategy = strategy(Category::Unit, runner.clone(), materializer.clone());

        let flow = flow("f1", Category::Unit, &["add numbers", "subtract"]);
        let project = project(Some("https://github.com/acme/calc"), None);
        let sink = LogSink::new();
        strategy
            .execute(
                RunContext {
                    flow: &flow,
                    project: &project,
                    token: None,
                },
                &sink,
                &mut Artifacts::default(),
            )
            .await
            .unwrap();

        assert_eq!(
            runner.commands(),
            ["yarn install --frozen-lockfile", "npm test", "npm test"]
        );
        assert!(runner.workdirs().iter().all(|dir| dir == temp.path()));
        assert_eq!(materializer.calls(), 1);
        assert_eq!(
            sink.snapshot()[0].text,
            "Starting UNIT test for flow: f1-name"
        );
    }

    #[tokio::test]
    async fn missing_repository_fails_before_materializing() {
        let temp = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let materializer = Arc::new(FakeMaterializer::new(temp.path()));
        let strategy = strategy(Category::Backend, runner.clone(), materializer.clone());

        let flow = flow("f1", Category::Backend, &["GET /health"]);
        let project = project(None, Some("https://staging.example.com"));
        let err = strategy
            .execute(
                RunContext {
                    flow: &flow,
                    project: &project,
                    token: None,
                },
                &LogSink::new(),
                &mut Artifacts::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(
            err,
            Error::PrerequisiteMissing {
                category: Category::Backend,
                missing: "repository URL".into()
            }
        );
        assert_eq!(materializer.calls(), 0);
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn access_denied_stops_the_run() {
        let temp = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let materializer = Arc::new(
            FakeMaterializer::new(temp.path())
                .failing(Error::RepositoryAccessDenied("Authentication failed".into())),
        );
        let strategy = strategy(Category::Unit, runner.clone(), materializer);

        let flow = flow("f1", Category::Unit, &["add numbers"]);
        let project = project(Some("https://github.com/acme/calc"), None);
        let err = strategy
            .execute(
                RunContext {
                    flow: &flow,
                    project: &project,
                    token: None,
                },
                &LogSink::new(),
                &mut Artifacts::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RepositoryAccessDenied(_)));
        assert!(runner.commands().is_empty());
    }
}
