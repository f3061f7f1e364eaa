use std::{
    path::PathBuf,
    sync::LazyLock,
    time::{Duration, UNIX_EPOCH},
};

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::core::{
    error::{Error, Result},
    ports::ScreenshotStore,
};

pub const URL_PREFIX: &str = "/screenshots/";

static FILE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^screenshot-[A-Za-z0-9-]+\.png$").expect("valid regex"));

/// Whether `name` is a file this store could have produced. Rejects path tricks.
pub fn is_valid_file_name(name: &str) -> bool {
    FILE_NAME.is_match(name)
}

/// Builds `screenshot-<flow>-<method-slug>-<ms>.png`.
pub fn file_name_for(flow_id: &str, method: &str, at_ms: i64) -> String {
    format!(
        "screenshot-{}-{}-{at_ms}.png",
        slug(flow_id),
        slug(method)
    )
}

fn slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "step".to_string()
    } else {
        trimmed.chars().take(60).collect()
    }
}

/// Screenshots kept as plain files in one directory.
#[derive(Debug, Clone)]
pub struct FsScreenshotStore {
    dir: PathBuf,
}

impl FsScreenshotStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn io_err(&self, e: std::io::Error) -> Error {
        Error::FileSystem(format!("{}: {e}", self.dir.display()))
    }
}

#[async_trait]
impl ScreenshotStore for FsScreenshotStore {
    async fn save(&self, file_name: &str, png: &[u8]) -> Result<String> {
        if !is_valid_file_name(file_name) {
            return Err(Error::InvalidState(format!(
                "refusing to store screenshot as {file_name}"
            )));
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| self.io_err(e))?;
        tokio::fs::write(self.dir.join(file_name), png)
            .await
            .map_err(|e| self.io_err(e))?;
        Ok(format!("{URL_PREFIX}{file_name}"))
    }

    async fn read(&self, file_name: &str) -> Result<Option<Vec<u8>>> {
        if !is_valid_file_name(file_name) {
            return Ok(None);
        }
        match tokio::fs::read(self.dir.join(file_name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_err(e)),
        }
    }

    async fn remove(&self, reference: &str) -> Result<()> {
        let name = reference.strip_prefix(URL_PREFIX).unwrap_or(reference);
        if !is_valid_file_name(name) {
            return Ok(());
        }
        match tokio::fs::remove_file(self.dir.join(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    async fn prune_older_than(&self, cutoff: i64) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(self.io_err(e)),
        };
        let cutoff_time = UNIX_EPOCH + Duration::from_millis(u64::try_from(cutoff).unwrap_or(0));
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|e| self.io_err(e))? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !is_valid_file_name(name) {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .and_then(|meta| meta.modified())
                .map_err(|e| self.io_err(e))?;
            if modified < cutoff_time {
                tokio::fs::remove_file(entry.path())
                    .await
                    .map_err(|e| self.io_err(e))?;
                removed += 1;
            }
        }
        debug!(removed, "pruned screenshots");
        Ok(removed)
    }
}
