//! Wires the outbound adapters, strategies and application services into one engine.

use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    adapters::outbound::{
        browser::WebDriverLauncher,
        clock::SystemClock,
        git::{GitCli, GitMaterializer, UrlEmbedInjector},
        http_probe::ReqwestProbe,
        persistence::SqliteStore,
        sandbox::{DockerSandbox, HostSandbox},
        screenshots::FsScreenshotStore,
    },
    application::{
        AppService, FlowStateMachine, JobQueue, Orchestrator, Scheduler, StatusBroadcaster,
        strategies::{FrontendStrategy, PerformanceStrategy, RepositoryStrategy, StrategyRegistry},
    },
    config::{EngineConfig, SandboxKind},
    core::{
        domain::Category,
        ports::{BrowserLauncher, Clock, CommandRunner, RepositoryMaterializer, ScreenshotStore},
    },
};

/// A running engine. Dropping it without [`Engine::shutdown`] abandons queued jobs.
pub struct Engine {
    pub service: Arc<AppService>,
    pub queue: Arc<JobQueue>,
    scheduler: Arc<Scheduler>,
    scheduler_task: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

impl Engine {
    /// Builds the engine over the data directory `root`. Must run inside a Tokio runtime.
    pub fn build(config: &EngineConfig, root: PathBuf) -> Result<Self> {
        let store = SqliteStore::open(Some(root.clone()))?;
        let recovered = store.recover_interrupted()?;
        if recovered > 0 {
            warn!(recovered, "flows interrupted by a previous shutdown marked FAILED");
        }
        let repo = Arc::new(store);

        let scratch = root.join("scratch");
        fs::create_dir_all(&scratch)
            .with_context(|| format!("Failed to create scratch directory {}", scratch.display()))?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let runner: Arc<dyn CommandRunner> = match config.sandbox.kind {
            SandboxKind::Docker => Arc::new(DockerSandbox::new(config.sandbox.runtime.clone())),
            SandboxKind::Host => Arc::new(HostSandbox::new()),
        };
        let materializer: Arc<dyn RepositoryMaterializer> = Arc::new(GitMaterializer::new(
            root.join("repos"),
            Arc::new(GitCli),
            Arc::new(UrlEmbedInjector),
        ));
        let screenshots: Arc<dyn ScreenshotStore> =
            Arc::new(FsScreenshotStore::new(root.join("screenshots")));
        let browser: Option<Arc<dyn BrowserLauncher>> = if config.browser.enabled {
            Some(Arc::new(WebDriverLauncher::new(
                config.browser.webdriver_url.clone(),
                config.browser.headless,
            )?))
        } else {
            None
        };

        let images = &config.sandbox.images;
        let chains = &config.strategies;
        let repository = |category: Category, chain: &Vec<String>| {
            Arc::new(RepositoryStrategy::new(
                category,
                images.image_for(category),
                chain.clone(),
                chains.install.clone(),
                Arc::clone(&runner),
                Arc::clone(&materializer),
            ))
        };
        let strategies = StrategyRegistry::new()
            .with(repository(Category::Backend, &chains.backend))
            .with(repository(Category::Unit, &chains.unit))
            .with(Arc::new(FrontendStrategy::new(
                images.image_for(Category::Frontend),
                chains.frontend.clone(),
                chains.install.clone(),
                Arc::clone(&runner),
                Arc::clone(&materializer),
                browser,
                Arc::clone(&screenshots),
                Arc::clone(&clock),
            )))
            .with(Arc::new(PerformanceStrategy::new(
                images.image_for(Category::Performance),
                chains.lighthouse.clone(),
                chains.load_probe_requests,
                scratch,
                Arc::clone(&runner),
                Arc::new(ReqwestProbe::new()?),
            )));

        let broadcaster = Arc::new(StatusBroadcaster::new());
        let machine = FlowStateMachine::new(repo.clone(), Arc::clone(&clock), broadcaster.clone());
        let orchestrator = Arc::new(Orchestrator::new(repo.clone(), machine, strategies));
        let queue = Arc::new(JobQueue::start(
            config.queue.clone(),
            orchestrator.clone(),
            Arc::clone(&clock),
        ));
        let scheduler = Arc::new(Scheduler::new(
            repo.clone(),
            queue.clone(),
            Arc::clone(&screenshots),
            clock,
            config.scheduler.clone(),
            config.retention.clone(),
        ));
        let service = Arc::new(AppService::new(
            repo,
            orchestrator,
            queue.clone(),
            broadcaster,
            screenshots,
        ));

        info!(sandbox = ?config.sandbox.kind, root = %root.display(), "engine ready");
        Ok(Self {
            service,
            queue,
            scheduler,
            scheduler_task: None,
        })
    }

    /// Starts periodic sweeps in the background.
    pub fn start_scheduler(&mut self) {
        if self.scheduler_task.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&self.scheduler).run(rx));
        self.scheduler_task = Some((tx, handle));
    }

    /// Stops the scheduler, then drains in-flight jobs.
    pub async fn shutdown(mut self) {
        if let Some((tx, handle)) = self.scheduler_task.take() {
            let _ = tx.send(true);
            if let Err(err) = handle.await {
                warn!(error = %err, "scheduler task ended abnormally");
            }
        }
        self.queue.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ports::{ExecutionService, NewFlow, NewProject};
    use tempfile::tempdir;

    fn host_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.sandbox.kind = SandboxKind::Host;
        config.browser.enabled = false;
        config
    }

    #[tokio::test]
    async fn builds_over_an_empty_data_directory() {
        let dir = tempdir().unwrap();
        let engine = Engine::build(&host_config(), dir.path().to_path_buf()).unwrap();

        assert!(dir.path().join("flowbench.sqlite3").exists());
        assert!(dir.path().join("scratch").is_dir());
        assert_eq!(engine.service.queue_stats().await.unwrap().waiting, 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn records_survive_a_rebuild() {
        let dir = tempdir().unwrap();
        let engine = Engine::build(&host_config(), dir.path().to_path_buf()).unwrap();
        let project_id = engine
            .service
            .create_project(NewProject {
                name: "site".into(),
                owner_id: "u1".into(),
                github_url: None,
                staging_url: Some("https://staging.example.com".into()),
            })
            .await
            .unwrap();
        let flow_id = engine
            .service
            .create_flow(NewFlow {
                project_id,
                name: "perf".into(),
                description: String::new(),
                category: Category::Performance,
                methods: vec!["lighthouse".into()],
            })
            .await
            .unwrap();
        engine.shutdown().await;

        let mut engine = Engine::build(&host_config(), dir.path().to_path_buf()).unwrap();
        engine.start_scheduler();
        let view = engine.service.flow_status(&flow_id).await.unwrap().unwrap();
        assert_eq!(view.name, "perf");
        engine.shutdown().await;
    }
}
