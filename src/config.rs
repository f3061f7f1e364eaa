use std::{fs, path::Path, str::FromStr, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::core::domain::Category;

pub const METHOD_PLACEHOLDER: &str = "{method}";

/// Engine settings loaded from YAML. Every section falls back to built-in defaults.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub sandbox: SandboxConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub retention: RetentionConfig,
    pub strategies: StrategiesConfig,
    pub browser: BrowserConfig,
}

impl EngineConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let raw = fs::read_to_string(path_ref)
            .with_context(|| format!("Failed to read config file at {}", path_ref.display()))?;
        Self::from_yaml_str(&raw)
            .with_context(|| format!("Invalid configuration in {}", path_ref.display()))
    }

    /// Reads `path` when it exists, otherwise returns the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        if path_ref.exists() {
            Self::from_path(path_ref)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("Unable to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.queue.validate().context("queue section failed validation")?;
        self.scheduler
            .validate()
            .context("scheduler section failed validation")?;
        self.strategies
            .validate()
            .context("strategies section failed validation")?;
        ensure!(self.retention.days > 0, "retention.days must be > 0");
        ensure!(
            !self.server.bind.trim().is_empty(),
            "server.bind must not be empty"
        );
        Ok(())
    }
}

impl FromStr for EngineConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_yaml_str(s)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub default_page_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3001".into(),
            default_page_size: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    #[default]
    Docker,
    Host,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    pub kind: SandboxKind,
    /// Container runtime binary.
    pub runtime: String,
    pub images: CategoryImages,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            kind: SandboxKind::Docker,
            runtime: "docker".into(),
            images: CategoryImages::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CategoryImages {
    pub backend: String,
    pub frontend: String,
    pub performance: String,
    pub unit: String,
}

impl CategoryImages {
    pub fn image_for(&self, category: Category) -> &str {
        match category {
            Category::Backend => &self.backend,
            Category::Frontend => &self.frontend,
            Category::Performance => &self.performance,
            Category::Unit => &self.unit,
        }
    }
}

impl Default for CategoryImages {
    fn default() -> Self {
        let node = "node:20-bullseye".to_string();
        Self {
            backend: node.clone(),
            frontend: node.clone(),
            performance: node.clone(),
            unit: node,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub attempts: u32,
    pub backoff_base_ms: u64,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl QueueConfig {
    fn validate(&self) -> Result<()> {
        ensure!(self.concurrency > 0, "queue.concurrency must be > 0");
        ensure!(self.attempts > 0, "queue.attempts must be > 0");
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            attempts: 3,
            backoff_base_ms: 2000,
            keep_completed: 10,
            keep_failed: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_secs: u64,
    pub general_interval_secs: u64,
    pub priority_interval_secs: u64,
    pub retention_interval_secs: u64,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub priority_categories: Vec<Category>,
    pub min_rerun: MinRerunConfig,
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.tick_secs > 0, "scheduler.tick_secs must be > 0");
        ensure!(self.batch_size > 0, "scheduler.batch_size must be > 0");
        ensure!(
            self.general_interval_secs > 0
                && self.priority_interval_secs > 0
                && self.retention_interval_secs > 0,
            "scheduler intervals must be > 0"
        );
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tick_secs: 60,
            general_interval_secs: 60 * 60,
            priority_interval_secs: 15 * 60,
            retention_interval_secs: 24 * 60 * 60,
            batch_size: 5,
            batch_delay_ms: 1000,
            priority_categories: vec![Category::Unit],
            min_rerun: MinRerunConfig::default(),
        }
    }
}

/// Minimum time between two scheduled runs of the same flow, per category.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MinRerunConfig {
    pub unit_secs: u64,
    pub performance_secs: u64,
    pub default_secs: u64,
}

impl MinRerunConfig {
    pub fn interval_ms(&self, category: Category) -> i64 {
        let secs = match category {
            Category::Unit => self.unit_secs,
            Category::Performance => self.performance_secs,
            Category::Backend | Category::Frontend => self.default_secs,
        };
        (secs as i64).saturating_mul(1000)
    }
}

impl Default for MinRerunConfig {
    fn default() -> Self {
        Self {
            unit_secs: 30 * 60,
            performance_secs: 6 * 60 * 60,
            default_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetentionConfig {
    pub days: u32,
}

impl RetentionConfig {
    pub fn max_age_ms(&self) -> i64 {
        i64::from(self.days) * 24 * 60 * 60 * 1000
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { days: 30 }
    }
}

/// Fallback chains are tried in order; `{method}` is replaced by the shell-quoted method.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StrategiesConfig {
    pub backend: Vec<String>,
    pub unit: Vec<String>,
    pub frontend: Vec<String>,
    pub lighthouse: String,
    pub install: InstallCommands,
    pub load_probe_requests: usize,
}

impl StrategiesConfig {
    fn validate(&self) -> Result<()> {
        for (name, chain) in [
            ("backend", &self.backend),
            ("unit", &self.unit),
            ("frontend", &self.frontend),
        ] {
            ensure!(!chain.is_empty(), "strategies.{name} must list at least one command");
            for (idx, template) in chain.iter().enumerate() {
                ensure!(
                    !template.trim().is_empty(),
                    "strategies.{name}[{idx}] must not be blank"
                );
            }
        }
        ensure!(
            self.lighthouse.contains("{url}"),
            "strategies.lighthouse must contain a {{url}} placeholder"
        );
        ensure!(
            self.load_probe_requests > 0,
            "strategies.load_probe_requests must be > 0"
        );
        self.install.validate()
    }
}

impl Default for StrategiesConfig {
    fn default() -> Self {
        Self {
            backend: vec![
                "npm test -- --grep {method}".into(),
                "npm test".into(),
                "npx jest".into(),
            ],
            unit: vec![
                "npm test".into(),
                "npm run test:unit".into(),
                "npx jest --testPathPattern=unit".into(),
                "yarn test".into(),
            ],
            frontend: vec!["npm test".into(), "yarn test".into(), "npm run test".into()],
            lighthouse: "npx lighthouse {url} --output=json --quiet --chrome-flags=\"--headless\""
                .into(),
            install: InstallCommands::default(),
            load_probe_requests: 10,
        }
    }
}

/// Dependency install commands, chosen by which lockfile the checkout carries.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InstallCommands {
    pub pnpm: String,
    pub yarn: String,
    pub npm_ci: String,
    pub npm_install: String,
}

impl InstallCommands {
    fn validate(&self) -> Result<()> {
        for (name, cmd) in [
            ("pnpm", &self.pnpm),
            ("yarn", &self.yarn),
            ("npm_ci", &self.npm_ci),
            ("npm_install", &self.npm_install),
        ] {
            ensure!(
                !cmd.trim().is_empty(),
                "strategies.install.{name} must not be blank"
            );
        }
        Ok(())
    }
}

impl Default for InstallCommands {
    fn default() -> Self {
        Self {
            pnpm: "corepack enable && pnpm install --frozen-lockfile".into(),
            yarn: "yarn install --frozen-lockfile".into(),
            npm_ci: "npm ci".into(),
            npm_install: "npm install".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrowserConfig {
    pub enabled: bool,
    pub webdriver_url: String,
    pub headless: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webdriver_url: "http://127.0.0.1:9515".into(),
            headless: true,
        }
    }
}
