use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::info;

use crate::{
    application::strategies::{
        Artifacts, CategoryStrategy, MethodRunner, RunContext, chain::shell_quote,
        execute_methods,
    },
    core::{
        domain::{Category, LogSink},
        error::{Error, Result},
        ports::{CommandRunner, CommandSpec, HttpProbe},
    },
};

/// Lighthouse scores at or below this fail the method.
pub const SCORE_THRESHOLD: f64 = 70.0;

pub fn passes_threshold(score: f64) -> bool {
    score > SCORE_THRESHOLD
}

/// Reads `categories.performance.score` (0..1) from a Lighthouse JSON report as 0..100,
/// rounded to one decimal.
///
/// Anything printed before the report itself is skipped.
pub fn parse_score(report: &str) -> Result<f64> {
    let start = report
        .find('{')
        .ok_or_else(|| Error::System("no JSON report in lighthouse output".into()))?;
    let value: Value = serde_json::from_str(&report[start..])
        .map_err(|e| Error::System(format!("unreadable lighthouse report: {e}")))?;
    value
        .pointer("/categories/performance/score")
        .and_then(Value::as_f64)
        .map(|score| (score * 1000.0).round() / 10.0)
        .ok_or_else(|| Error::System("lighthouse report has no performance score".into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceCheck {
    Lighthouse,
    LoadProbe,
}

impl PerformanceCheck {
    pub fn classify(method: &str) -> Option<Self> {
        let lower = method.to_ascii_lowercase();
        if lower.contains("lighthouse") || lower.contains("performance") {
            Some(PerformanceCheck::Lighthouse)
        } else if lower.contains("load") || lower.contains("latency") {
            Some(PerformanceCheck::LoadProbe)
        } else {
            None
        }
    }
}

/// PERFORMANCE: audits and load probes against the project's staging URL.
pub struct PerformanceStrategy {
    image: String,
    lighthouse: String,
    probe_requests: usize,
    scratch: PathBuf,
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn HttpProbe>,
}

impl PerformanceStrategy {
    pub fn new(
        image: impl Into<String>,
        lighthouse: impl Into<String>,
        probe_requests: usize,
        scratch: PathBuf,
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn HttpProbe>,
    ) -> Self {
        Self {
            image: image.into(),
            lighthouse: lighthouse.into(),
            probe_requests,
            scratch,
            runner,
            probe,
        }
    }
}

struct PerformanceRunner<'a> {
    strategy: &'a PerformanceStrategy,
    url: &'a str,
}

impl PerformanceRunner<'_> {
    async fn audit(&self, sink: &LogSink) -> Result<()> {
        let command = self
            .strategy
            .lighthouse
            .replace("{url}", &shell_quote(self.url));
        sink.stdout(format!("Running: {command}"));
        let spec = CommandSpec {
            image: self.strategy.image.clone(),
            workdir: self.strategy.scratch.clone(),
            command,
        };
        let report = self.strategy.runner.run(&spec, sink).await?;
        let score = parse_score(&report)?;
        sink.stdout(format!("Performance score: {score:.0}"));
        if passes_threshold(score) {
            Ok(())
        } else {
            Err(Error::System(format!(
                "performance score {score:.0} is not above {SCORE_THRESHOLD:.0}"
            )))
        }
    }

    async fn load_probe(&self, sink: &LogSink) -> Result<()> {
        let total = self.strategy.probe_requests;
        sink.stdout(format!(
            "Sending {total} concurrent requests to {}",
            self.url
        ));
        let started = Instant::now();
        let mut set = JoinSet::new();
        for _ in 0..total {
            let probe = Arc::clone(&self.strategy.probe);
            let url = self.url.to_string();
            set.spawn(async move { probe.get(&url).await });
        }

        let mut ok = 0usize;
        let mut latency_ms = 0u64;
        while let Some(joined) = set.join_next().await {
            let sample = joined
                .map_err(|e| Error::System(format!("probe task failed: {e}")))??;
            latency_ms += sample.elapsed_ms;
            if sample.ok {
                ok += 1;
            }
        }
        let elapsed = started.elapsed().max(Duration::from_millis(1));
        let average = latency_ms / total.max(1) as u64;
        let rate = total as f64 / elapsed.as_secs_f64();
        sink.stdout(format!(
            "Average latency: {average} ms, {rate:.1} req/s, {ok}/{total} succeeded"
        ));
        info!(url = self.url, average, ok, total, "load probe finished");

        if ok == total {
            Ok(())
        } else {
            Err(Error::System(format!(
                "{} of {total} requests failed",
                total - ok
            )))
        }
    }
}

#[async_trait]
impl MethodRunner for PerformanceRunner<'_> {
    async fn run_method(
        &mut self,
        method: &str,
        sink: &LogSink,
        _artifacts: &mut Artifacts,
    ) -> Result<()> {
        match PerformanceCheck::classify(method) {
            Some(PerformanceCheck::Lighthouse) => self.audit(sink).await,
            Some(PerformanceCheck::LoadProbe) => self.load_probe(sink).await,
            None => Err(Error::System(format!(
                "unrecognized performance method: {method}"
            ))),
        }
    }
}

#[async_trait]
impl CategoryStrategy for PerformanceStrategy {
    fn category(&self) -> Category {
        Category::Performance
    }

    async fn execute(
        &self,
        ctx: RunContext<'_>,
        sink: &LogSink,
        artifacts: &mut Artifacts,
    ) -> Result<()> {
        let url = ctx.staging_url()?;
        sink.stdout(format!(
            "Starting PERFORMANCE test for flow: {} against {url}",
            ctx.flow.name
        ));
        tokio::fs::create_dir_all(&self.scratch)
            .await
            .map_err(|e| Error::FileSystem(format!("{}: {e}", self.scratch.display())))?;
        let mut runner = PerformanceRunner {
            strategy: self,
            url,
        };
        execute_methods(&mut runner, &ctx.flow.methods, sink, artifacts).await
    }
}
