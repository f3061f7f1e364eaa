use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    adapters::outbound::screenshots::file_name_for,
    application::strategies::{
        Artifacts, CategoryStrategy, MethodRunner, RunContext,
        chain::{FallbackChain, install_dependencies},
        execute_methods,
    },
    config::InstallCommands,
    core::{
        domain::{Category, LogSink},
        error::{Error, Result},
        ports::{
            BrowserLauncher, BrowserSession, Clock, CommandRunner, RepositoryMaterializer,
            ScreenshotStore,
        },
    },
};

/// A method the browser session executes directly instead of a UI test command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserAction {
    /// `navigate` with no argument opens the staging URL.
    Navigate(Option<String>),
    Click(String),
    Check(String),
}

impl BrowserAction {
    pub fn parse(method: &str) -> Option<Self> {
        let trimmed = method.trim();
        let (verb, rest) = trimmed
            .split_once(char::is_whitespace)
            .map(|(verb, rest)| (verb, rest.trim()))
            .unwrap_or((trimmed, ""));
        match verb.to_ascii_lowercase().as_str() {
            "navigate" if rest.is_empty() => Some(BrowserAction::Navigate(None)),
            "navigate" => Some(BrowserAction::Navigate(Some(rest.to_string()))),
            "click" if !rest.is_empty() => Some(BrowserAction::Click(rest.to_string())),
            "check" if !rest.is_empty() => Some(BrowserAction::Check(rest.to_string())),
            _ => None,
        }
    }
}

/// FRONTEND: UI test commands in the checkout, plus browser actions and a screenshot
/// before every method while a browser session is available.
pub struct FrontendStrategy {
    image: String,
    chain: Vec<String>,
    install: InstallCommands,
    runner: Arc<dyn CommandRunner>,
    materializer: Arc<dyn RepositoryMaterializer>,
    browser: Option<Arc<dyn BrowserLauncher>>,
    screenshots: Arc<dyn ScreenshotStore>,
    clock: Arc<dyn Clock>,
}

impl FrontendStrategy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        image: impl Into<String>,
        chain: Vec<String>,
        install: InstallCommands,
        runner: Arc<dyn CommandRunner>,
        materializer: Arc<dyn RepositoryMaterializer>,
        browser: Option<Arc<dyn BrowserLauncher>>,
        screenshots: Arc<dyn ScreenshotStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            image: image.into(),
            chain,
            install,
            runner,
            materializer,
            browser,
            screenshots,
            clock,
        }
    }

    async fn open_browser(&self, sink: &LogSink) -> Option<Box<dyn BrowserSession>> {
        let launcher = self.browser.as_ref()?;
        match launcher.launch().await {
            Ok(session) => Some(session),
            Err(err) => {
                warn!(error = %err, "browser unavailable, screenshots disabled");
                sink.stdout(format!("Browser unavailable, screenshots disabled: {err}"));
                None
            }
        }
    }
}

struct FrontendRunner<'a> {
    runner: &'a dyn CommandRunner,
    image: &'a str,
    workdir: PathBuf,
    chain: &'a [String],
    session: Option<Box<dyn BrowserSession>>,
    screenshots: &'a dyn ScreenshotStore,
    clock: &'a dyn Clock,
    flow_id: &'a str,
    staging_url: Option<&'a str>,
}

impl FrontendRunner<'_> {
    async fn capture(&mut self, method: &str, sink: &LogSink, artifacts: &mut Artifacts) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let png = match session.screenshot().await {
            Ok(png) => png,
            Err(err) => {
                sink.stdout(format!("Screenshot skipped: {err}"));
                return;
            }
        };
        let name = file_name_for(self.flow_id, method, self.clock.now_ms());
        match self.screenshots.save(&name, &png).await {
            Ok(url) => {
                debug!(%url, "screenshot stored");
                artifacts.screenshot_urls.push(url);
            }
            Err(err) => sink.stdout(format!("Screenshot not stored: {err}")),
        }
    }

    async fn perform(&mut self, action: BrowserAction, sink: &LogSink) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::Browser("no browser session available".into()))?;
        match action {
            BrowserAction::Navigate(target) => {
                let url = target
                    .as_deref()
                    .or(self.staging_url)
                    .ok_or_else(|| Error::Browser("navigate needs a URL".into()))?;
                sink.stdout(format!("Navigating to {url}"));
                session.goto(url).await
            }
            BrowserAction::Click(selector) => {
                sink.stdout(format!("Clicking {selector}"));
                session.click(&selector).await
            }
            BrowserAction::Check(selector) => {
                if session.exists(&selector).await? {
                    sink.stdout(format!("Found {selector}"));
                    Ok(())
                } else {
                    Err(Error::Browser(format!("Element not found: {selector}")))
                }
            }
        }
    }
}

#[async_trait]
impl MethodRunner for FrontendRunner<'_> {
    async fn run_method(
        &mut self,
        method: &str,
        sink: &LogSink,
        artifacts: &mut Artifacts,
    ) -> Result<()> {
        self.capture(method, sink, artifacts).await;
        match BrowserAction::parse(method) {
            Some(action) => self.perform(action, sink).await,
            None => {
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
    }

    async fn finish(&mut self, sink: &LogSink) {
        if let Some(mut session) = self.session.take()
            && let Err(err) = session.close().await
        {
            sink.stdout(format!("Browser did not close cleanly: {err}"));
        }
    }
}

/// Covers runs that unwind before `finish`: the session is closed in the background.
impl Drop for FrontendRunner<'_> {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = session.close().await {
                        warn!(error = %err, "abandoned browser session did not close");
                    }
                });
            }
            Err(_) => warn!("browser session leaked: no runtime to close it on"),
        }
    }
}

#[async_trait]
impl CategoryStrategy for FrontendStrategy {
    fn category(&self) -> Category {
        Category::Frontend
    }

    async fn execute(
        &self,
        ctx: RunContext<'_>,
        sink: &LogSink,
        artifacts: &mut Artifacts,
    ) -> Result<()> {
        let repo_url = ctx.repository_url()?;
        sink.stdout(format!("Starting FRONTEND test for flow: {}", ctx.flow.name));
        let checkout = self.materializer.materialize(repo_url, ctx.token, sink).await?;
        install_dependencies(
            self.runner.as_ref(),
            &self.image,
            &checkout.path,
            &self.install,
            sink,
        )
        .await?;

        let mut runner = FrontendRunner {
            runner: self.runner.as_ref(),
            image: &self.image,
            workdir: checkout.path.clone(),
            chain: &self.chain,
            session: self.open_browser(sink).await,
            screenshots: self.screenshots.as_ref(),
            clock: self.clock.as_ref(),
            flow_id: &ctx.flow.id,
            staging_url: ctx.project.staging_url.as_deref(),
        };
        execute_methods(&mut runner, &ctx.flow.methods, sink, artifacts).await
    }
}
