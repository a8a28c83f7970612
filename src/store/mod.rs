//! Run persistence.
//!
//! An [`ArtifactStore`] keeps three things per run: the latest snapshot of the
//! [`RunRecord`], an append-only event log, and one patch per attempt. Runs are
//! archived, never deleted.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::model::{
    Decision, FailureNote, Patch, RunId, RunRecord, RunState, StageKind, TargetRef,
};

pub use memory::MemoryArtifactStore;
pub use sqlite::SqliteArtifactStore;

/// Something that happened to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum RunEventKind {
    Admitted {
        target: TargetRef,
    },
    Transition {
        from: RunState,
        to: RunState,
    },
    StageRecorded {
        stage: StageKind,
        attempt: u32,
        success: bool,
    },
    AttemptFailed {
        note: FailureNote,
    },
    CountdownStarted {
        deadline: DateTime<Utc>,
    },
    Concluded {
        decision: Decision,
        reason: String,
    },
    RolledBack {
        patch_id: uuid::Uuid,
    },
}

impl RunEventKind {
    /// One-line summary for logs and the CLI.
    pub fn summary(&self) -> String {
        match self {
            Self::Admitted { target } => format!("admitted {}", target),
            Self::Transition { from, to } => format!("{} -> {}", from, to),
            Self::StageRecorded {
                stage,
                attempt,
                success,
            } => format!(
                "{} (attempt {}) {}",
                stage,
                attempt,
                if *success { "ok" } else { "failed" }
            ),
            Self::AttemptFailed { note } => {
                format!("attempt {} failed in {}: {}", note.attempt, note.stage, note.detail)
            }
            Self::CountdownStarted { deadline } => {
                format!("merge countdown until {}", deadline.to_rfc3339())
            }
            Self::Concluded { decision, reason } => format!("{}: {}", decision, reason),
            Self::RolledBack { patch_id } => format!("rolled back patch {}", patch_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Position in the store's global append order.
    pub seq: i64,
    pub run_id: RunId,
    pub recorded_at: DateTime<Utc>,
    pub kind: RunEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPatch {
    pub run_id: RunId,
    pub attempt: u32,
    pub patch: Patch,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Insert or replace the snapshot of a run.
    async fn save_run(&self, run: &RunRecord) -> Result<(), StoreError>;

    async fn append_event(&self, run_id: RunId, kind: RunEventKind) -> Result<(), StoreError>;

    /// Store the patch produced by one attempt. A second patch for the same
    /// attempt is ignored.
    async fn save_patch(&self, run_id: RunId, attempt: u32, patch: &Patch)
    -> Result<(), StoreError>;

    async fn get_run(&self, id: RunId) -> Result<RunRecord, StoreError>;

    /// Runs newest first.
    async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError>;

    /// Events of one run in append order.
    async fn events(&self, run_id: RunId) -> Result<Vec<RunEvent>, StoreError>;

    /// Patches of one run by attempt.
    async fn patches(&self, run_id: RunId) -> Result<Vec<StoredPatch>, StoreError>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Flush and release resources. Later calls fail with [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError>;
}
