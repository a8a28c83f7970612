//! Append-only JSON-lines knowledge store.
//!
//! One record per line. Appends take an exclusive `fs2` lock on a sidecar
//! `.lock` file so concurrent processes never interleave lines. Lines that
//! are not UTF-8 or not a record are skipped with a warning.

use anyhow::{Context, Result};
use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::{KnowledgeRecord, KnowledgeStore};

#[derive(Debug, Clone)]
pub struct JsonlKnowledgeStore {
    path: PathBuf,
}

impl JsonlKnowledgeStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut lock = self.path.clone();
        lock.set_extension("lock");
        lock
    }

    fn append_blocking(path: &Path, lock_path: &Path, line: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)
            .context("Failed to open knowledge lock file")?;
        lock.lock_exclusive()
            .context("Failed to lock knowledge base")?;

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))
            .and_then(|mut file| {
                file.write_all(line.as_bytes())
                    .context("Failed to append knowledge record")
            });

        let _ = FileExt::unlock(&lock);
        result
    }

    fn load_blocking(path: &Path) -> Result<Vec<KnowledgeRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        let mut records = Vec::new();
        for (index, bytes) in BufReader::new(file).split(b'\n').enumerate() {
            let bytes = bytes.context("Failed to read knowledge base")?;
            let line = match std::str::from_utf8(&bytes) {
                Ok(line) => line,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        line = index + 1,
                        "skipping knowledge record that is not UTF-8: {e}"
                    );
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<KnowledgeRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    path = %path.display(),
                    line = index + 1,
                    "skipping malformed knowledge record: {e}"
                ),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl KnowledgeStore for JsonlKnowledgeStore {
    async fn append(&self, record: KnowledgeRecord) -> Result<()> {
        let mut line =
            serde_json::to_string(&record).context("Failed to serialize knowledge record")?;
        line.push('\n');
        let path = self.path.clone();
        let lock_path = self.lock_path();
        tokio::task::spawn_blocking(move || Self::append_blocking(&path, &lock_path, &line))
            .await
            .context("Knowledge append task failed")?
    }

    async fn load_all(&self) -> Result<Vec<KnowledgeRecord>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::load_blocking(&path))
            .await
            .context("Knowledge load task failed")?
    }
}
