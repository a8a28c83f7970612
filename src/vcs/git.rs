//! git2-backed work tree.
//!
//! Patches are parsed with `Diff::from_buffer` and checked before they touch
//! the tree. Rollback applies the reversed diff. Whether a patch is already in
//! the tree is decided by content, so an apply or rollback repeated from a
//! different process is still a no-op.

use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::{ApplyLocation, ApplyOptions, Diff, Repository};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use super::{ApplyOutcome, VersionControl};
use crate::model::{HunkCursor, Patch};

static HUNK_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@@ -(\d+(?:,\d+)?) \+(\d+(?:,\d+)?) @@(.*)$").unwrap());

pub struct GitWorkspace {
    root: PathBuf,
    applied: Mutex<HashSet<Uuid>>,
}

impl GitWorkspace {
    pub fn open(root: &Path) -> Result<Self> {
        Repository::open(root).context("Failed to open git repository")?;
        Ok(Self {
            root: root.to_path_buf(),
            applied: Mutex::new(HashSet::new()),
        })
    }

    fn is_tracked(&self, id: Uuid) -> bool {
        self.applied.lock().map(|set| set.contains(&id)).unwrap_or(false)
    }

    fn track(&self, id: Uuid, applied: bool) {
        if let Ok(mut set) = self.applied.lock() {
            if applied {
                set.insert(id);
            } else {
                set.remove(&id);
            }
        }
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Repository) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&root).context("Failed to open git repository")?;
            f(&repo)
        })
        .await
        .context("git task panicked")?
    }
}

/// Dry-run the diff against the work tree.
fn check(repo: &Repository, diff: &Diff<'_>) -> Result<(), git2::Error> {
    let mut opts = ApplyOptions::new();
    opts.check(true);
    repo.apply(diff, ApplyLocation::WorkDir, Some(&mut opts))
}

fn parse(text: &str) -> Result<Diff<'static>> {
    Diff::from_buffer(with_git_headers(text).as_bytes()).context("Failed to parse patch")
}

fn apply_forward(repo: &Repository, text: &str) -> Result<ApplyOutcome> {
    let forward = parse(text)?;
    match check(repo, &forward) {
        Ok(()) => {
            repo.apply(&forward, ApplyLocation::WorkDir, None)
                .context("Failed to apply patch")?;
            Ok(ApplyOutcome::Applied)
        }
        Err(conflict) => {
            let reverse = parse(&reverse_diff(text))?;
            if check(repo, &reverse).is_ok() {
                debug!("patch already present in work tree");
                Ok(ApplyOutcome::Applied)
            } else {
                Ok(ApplyOutcome::Conflict(conflict.message().to_string()))
            }
        }
    }
}

fn apply_reverse(repo: &Repository, text: &str) -> Result<()> {
    let reverse = parse(&reverse_diff(text))?;
    match check(repo, &reverse) {
        Ok(()) => repo
            .apply(&reverse, ApplyLocation::WorkDir, None)
            .context("Failed to roll back patch"),
        Err(e) => {
            let forward = parse(text)?;
            if check(repo, &forward).is_ok() {
                debug!("patch already absent from work tree");
                Ok(())
            } else {
                anyhow::bail!("Cannot roll back patch: {}", e.message())
            }
        }
    }
}

#[async_trait]
impl VersionControl for GitWorkspace {
    async fn apply_patch(&self, patch: &Patch) -> Result<ApplyOutcome> {
        if self.is_tracked(patch.id) {
            return Ok(ApplyOutcome::Applied);
        }
        let text = patch.diff.clone();
        let outcome = self.blocking(move |repo| apply_forward(repo, &text)).await?;
        if outcome == ApplyOutcome::Applied {
            self.track(patch.id, true);
            info!(patch_id = %patch.id, files = ?patch.files_touched, "patch applied");
        }
        Ok(outcome)
    }

    async fn rollback(&self, patch: &Patch) -> Result<()> {
        let text = patch.diff.clone();
        self.blocking(move |repo| apply_reverse(repo, &text)).await?;
        self.track(patch.id, false);
        info!(patch_id = %patch.id, "patch rolled back");
        Ok(())
    }
}

/// Insert a `diff --git` line before each file header that lacks one, which
/// the libgit2 parser requires.
pub fn with_git_headers(diff: &str) -> String {
    let lines: Vec<&str> = diff.lines().collect();
    let mut out = String::with_capacity(diff.len() + 64);
    let mut in_git_header = false;
    let mut hunk = HunkCursor::default();

    for (i, line) in lines.iter().enumerate() {
        if hunk.is_open() {
            hunk.consume(line);
        } else if hunk.start(line) {
            in_git_header = false;
        } else if line.starts_with("diff --git ") {
            in_git_header = true;
        } else if let Some(old) = line.strip_prefix("--- ")
            && !in_git_header
            && let Some(new) = lines.get(i + 1).and_then(|l| l.strip_prefix("+++ "))
        {
            let old_path = header_path(old, "a/");
            let new_path = header_path(new, "b/");
            let (a, b) = match (old_path.as_str(), new_path.as_str()) {
                ("/dev/null", path) | (path, "/dev/null") => (path.to_string(), path.to_string()),
                (a, b) => (a.to_string(), b.to_string()),
            };
            out.push_str(&format!("diff --git a/{} b/{}\n", a, b));
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn header_path(raw: &str, prefix: &str) -> String {
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    raw.strip_prefix(prefix).unwrap_or(raw).to_string()
}

/// Invert a unified diff so applying it undoes the original.
pub fn reverse_diff(diff: &str) -> String {
    let mut out = String::with_capacity(diff.len());
    let lines: Vec<&str> = diff.lines().collect();
    let mut i = 0;
    let mut hunk = HunkCursor::default();

    while i < lines.len() {
        let line = lines[i];
        if hunk.is_open() {
            hunk.consume(line);
            let mut chars = line.chars();
            match chars.next() {
                Some('+') => out.push('-'),
                Some('-') => out.push('+'),
                Some(other) => out.push(other),
                None => {}
            }
            out.push_str(chars.as_str());
            out.push('\n');
            i += 1;
            continue;
        }
        hunk.start(line);
        if let Some(old) = line.strip_prefix("--- ")
            && let Some(new) = lines.get(i + 1).and_then(|l| l.strip_prefix("+++ "))
        {
            out.push_str(&format!("--- {}\n+++ {}\n", swap_side(new), swap_side(old)));
            i += 2;
            continue;
        }

        if let Some(caps) = HUNK_HEADER.captures(line) {
            out.push_str(&format!("@@ -{} +{} @@{}\n", &caps[2], &caps[1], &caps[3]));
        } else if let Some(rest) = line.strip_prefix("diff --git ") {
            let mut parts = rest.splitn(2, ' ');
            match (parts.next(), parts.next()) {
                (Some(a), Some(b)) => {
                    out.push_str(&format!("diff --git {} {}\n", swap_side(b), swap_side(a)))
                }
                _ => {
                    out.push_str(line);
                    out.push('\n');
                }
            }
        } else if let Some(mode) = line.strip_prefix("new file mode ") {
            out.push_str(&format!("deleted file mode {}\n", mode));
        } else if let Some(mode) = line.strip_prefix("deleted file mode ") {
            out.push_str(&format!("new file mode {}\n", mode));
        } else if let Some(range) = line.strip_prefix("index ") {
            let (ids, mode) = match range.split_once(' ') {
                Some((ids, mode)) => (ids, Some(mode)),
                None => (range, None),
            };
            match ids.split_once("..") {
                Some((from, to)) => {
                    out.push_str(&format!("index {}..{}", to, from));
                    if let Some(mode) = mode {
                        out.push(' ');
                        out.push_str(mode);
                    }
                    out.push('\n');
                }
                None => {
                    out.push_str(line);
                    out.push('\n');
                }
            }
        } else if let Some(rest) = line.strip_prefix('+') {
            out.push('-');
            out.push_str(rest);
            out.push('\n');
        } else if let Some(rest) = line.strip_prefix('-') {
            out.push('+');
            out.push_str(rest);
            out.push('\n');
        } else {
            out.push_str(line);
            out.push('\n');
        }
        i += 1;
    }
    out
}

/// `a/x` ↔ `b/x`; `/dev/null` stays.
fn swap_side(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("a/") {
        format!("b/{}", rest)
    } else if let Some(rest) = path.strip_prefix("b/") {
        format!("a/{}", rest)
    } else {
        path.to_string()
    }
}
