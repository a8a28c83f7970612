//! Version-control seam: apply and roll back patches.

pub mod git;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::Patch;

pub use git::GitWorkspace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The patch does not apply to the current tree.
    Conflict(String),
}

/// Both operations are idempotent: repeating a completed apply or rollback is
/// a no-op.
#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn apply_patch(&self, patch: &Patch) -> Result<ApplyOutcome>;

    async fn rollback(&self, patch: &Patch) -> Result<()>;
}
