//! Repository materialization over the `git` command line.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, LazyLock, Mutex as StdMutex},
};

use async_trait::async_trait;
use regex::Regex;
use tokio::{process::Command, sync::Mutex};
use tracing::{info, warn};

use crate::core::{
    domain::{AccessToken, LogLine, LogSink},
    error::{Error, Result},
    ports::{Checkout, CredentialInjector, RepositoryMaterializer, VcsClient, VcsOutput},
};

static GITHUB_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://github\.com/([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+?)(?:\.git)?/?$")
        .expect("valid regex")
});

const ACCESS_DENIED_MARKERS: [&str; 2] = ["Authentication failed", "Repository not found"];

/// Owner and name of a hosted repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRef {
    pub owner: String,
    pub name: String,
}

impl RepositoryRef {
    pub fn parse(url: &str) -> Result<Self> {
        let caps = GITHUB_URL
            .captures(url.trim())
            .ok_or_else(|| Error::InvalidRepositoryUrl(url.to_string()))?;
        Ok(Self {
            owner: caps[1].to_string(),
            name: caps[2].to_string(),
        })
    }

    /// Remote URL without credentials. This is the only form written to disk.
    pub fn public_url(&self) -> String {
        format!("https://github.com/{}/{}.git", self.owner, self.name)
    }

    pub fn local_dir_name(&self) -> String {
        format!("{}-{}", self.owner, self.name)
    }
}

/// Embeds the token as the URL's userinfo. Used only while a clone or pull runs.
#[derive(Debug, Default)]
pub struct UrlEmbedInjector;

impl CredentialInjector for UrlEmbedInjector {
    fn authenticated_url(&self, public_url: &str, token: &AccessToken) -> String {
        public_url.replacen(
            "https://github.com/",
            &format!("https://x-access-token:{}@github.com/", token.expose()),
            1,
        )
    }
}

/// Runs `git` with interactive prompts disabled.
#[derive(Debug, Default)]
pub struct GitCli;

#[async_trait]
impl VcsClient for GitCli {
    async fn run(&self, args: &[String], cwd: Option<&Path>) -> Result<VcsOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::ProcessSpawnFailed(format!("git: {e}")))?;

        let mut lines: Vec<LogLine> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(LogLine::stdout)
            .collect();
        lines.extend(
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .map(LogLine::stderr),
        );
        Ok(VcsOutput {
            exit_code: output.status.code(),
            lines,
        })
    }
}

/// Keeps one checkout per repository under `root`, serialized by a per-repository lock.
pub struct GitMaterializer {
    root: PathBuf,
    vcs: Arc<dyn VcsClient>,
    injector: Arc<dyn CredentialInjector>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GitMaterializer {
    pub fn new(
        root: PathBuf,
        vcs: Arc<dyn VcsClient>,
        injector: Arc<dyn CredentialInjector>,
    ) -> Self {
        Self {
            root,
            vcs,
            injector,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Runs one git invocation and forwards its scrubbed output to `sink`.
    async fn git(
        &self,
        args: &[String],
        cwd: Option<&Path>,
        token: Option<&AccessToken>,
        sink: &LogSink,
    ) -> Result<()> {
        let output = self.vcs.run(args, cwd).await?;
        let mut transcript = String::new();
        for line in output.lines.iter() {
            let text = match token {
                Some(token) => self.injector.scrub(&line.text, token),
                None => line.text.clone(),
            };
            transcript.push_str(&text);
            transcript.push('\n');
            sink.push(LogLine {
                stream: line.stream,
                text,
            });
        }
        if output.success() {
            return Ok(());
        }

        let action = args.first().map(String::as_str).unwrap_or("git");
        if ACCESS_DENIED_MARKERS.iter().any(|m| transcript.contains(m))
            || transcript.to_lowercase().contains("access denied")
        {
            return Err(Error::RepositoryAccessDenied(format!(
                "git {action} was rejected; check the access token"
            )));
        }
        Err(Error::CommandFailed {
            command: format!("git {action}"),
            exit_code: output.exit_code,
        })
    }

    async fn set_remote(
        &self,
        path: &Path,
        url: String,
        token: Option<&AccessToken>,
        sink: &LogSink,
    ) -> Result<()> {
        let args = vec![
            "remote".to_string(),
            "set-url".to_string(),
            "origin".to_string(),
            url,
        ];
        self.git(&args, Some(path), token, sink).await
    }

    async fn update(
        &self,
        repo: &RepositoryRef,
        path: &Path,
        token: Option<&AccessToken>,
        sink: &LogSink,
    ) -> Result<()> {
        sink.stdout(format!("Updating repository {}", repo.local_dir_name()));
        info!(repo = %repo.local_dir_name(), "pulling checkout");

        let Some(token) = token else {
            return self.git(&["pull".to_string()], Some(path), None, sink).await;
        };

        let authed = self.injector.authenticated_url(&repo.public_url(), token);
        let pulled = match self.set_remote(path, authed, Some(token), sink).await {
            Ok(()) => {
                self.git(&["pull".to_string()], Some(path), Some(token), sink)
                    .await
            }
            Err(err) => Err(err),
        };
        // The credential must not survive on disk, whatever the pull did.
        let reverted = self
            .set_remote(path, repo.public_url(), Some(token), sink)
            .await;
        if let Err(err) = &reverted {
            warn!(repo = %repo.local_dir_name(), error = %err, "failed to restore public remote");
        }
        pulled.and(reverted)
    }

    async fn fresh_clone(
        &self,
        repo: &RepositoryRef,
        path: &Path,
        token: Option<&AccessToken>,
        sink: &LogSink,
    ) -> Result<()> {
        sink.stdout(format!("Cloning repository {}", repo.local_dir_name()));
        info!(repo = %repo.local_dir_name(), "cloning checkout");

        let url = match token {
            Some(token) => self.injector.authenticated_url(&repo.public_url(), token),
            None => repo.public_url(),
        };
        let args = vec![
            "clone".to_string(),
            url,
            path.to_string_lossy().into_owned(),
        ];
        let cloned = self.git(&args, None, token, sink).await;
        let result = match (cloned, token) {
            (Ok(()), Some(token)) => {
                self.set_remote(path, repo.public_url(), Some(token), sink)
                    .await
            }
            (other, _) => other,
        };
        if result.is_err()
            && path.exists()
            && let Err(e) = tokio::fs::remove_dir_all(path).await
        {
            warn!(path = %path.display(), error = %e, "failed to remove partial clone");
        }
        result
    }
}

#[async_trait]
impl RepositoryMaterializer for GitMaterializer {
    async fn materialize(
        &self,
        repo_url: &str,
        token: Option<&AccessToken>,
        sink: &LogSink,
    ) -> Result<Checkout> {
        let repo = RepositoryRef::parse(repo_url)?;
        let dir_name = repo.local_dir_name();
        let guard = self.lock_for(&dir_name).lock_owned().await;

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::FileSystem(format!("{}: {e}", self.root.display())))?;
        let path = self.root.join(&dir_name);

        if path.join(".git").is_dir() {
            self.update(&repo, &path, token, sink).await?;
        } else {
            if path.exists() {
                tokio::fs::remove_dir_all(&path)
                    .await
                    .map_err(|e| Error::FileSystem(format!("{}: {e}", path.display())))?;
            }
            self.fresh_clone(&repo, &path, token, sink).await?;
        }
        Ok(Checkout::locked(path, guard))
    }
}
