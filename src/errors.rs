//! Typed error hierarchy for the mender orchestrator.
//!
//! Three top-level enums cover the three infrastructure subsystems:
//! - `RegistryError` — run admission and release
//! - `StoreError` — artifact store persistence
//! - `HealError` — everything a caller of the orchestrator can observe before a run exists
//!
//! Stage-level failures are not errors at this level: they are folded into a
//! `StageResult` by the stage executor and recovered by the retry loop.

use thiserror::Error;

/// Errors from the run registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("A run is already active for target {target} (run {run_id})")]
    AlreadyRunning { target: String, run_id: uuid::Uuid },

    #[error("Run registry unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the artifact store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Run {id} not found")]
    RunNotFound { id: uuid::Uuid },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Failed to (de)serialize {what}: {source}")]
    Serialization {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Artifact store is closed")]
    Closed,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.into())
    }
}

/// Errors surfaced to callers of the orchestrator.
///
/// Once a run has been admitted, failures no longer surface here: they end the
/// run as `ESCALATED` with a reason instead.
#[derive(Debug, Error)]
pub enum HealError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Run task for {run_id} ended abnormally: {message}")]
    RunTaskFailed { run_id: uuid::Uuid, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HealError {
    /// True when admission was refused because the target already has an active run.
    pub fn is_already_running(&self) -> bool {
        matches!(self, HealError::Registry(RegistryError::AlreadyRunning { .. }))
    }
}
