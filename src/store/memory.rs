//! In-process artifact store.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{ArtifactStore, RunEvent, RunEventKind, StoredPatch};
use crate::errors::StoreError;
use crate::model::{Patch, RunId, RunRecord};

#[derive(Debug, Default)]
struct State {
    runs: HashMap<RunId, RunRecord>,
    /// Insertion order, used as a tiebreak when listing.
    order: Vec<RunId>,
    events: Vec<RunEvent>,
    patches: BTreeMap<(RunId, u32), StoredPatch>,
    settings: HashMap<String, String>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    state: Mutex<State>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let mut state = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
        if state.closed {
            return Err(StoreError::Closed);
        }
        f(&mut state)
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn save_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.with_state(|state| {
            if state.runs.insert(run.id, run.clone()).is_none() {
                state.order.push(run.id);
            }
            Ok(())
        })
    }

    async fn append_event(&self, run_id: RunId, kind: RunEventKind) -> Result<(), StoreError> {
        self.with_state(|state| {
            let seq = state.events.len() as i64 + 1;
            state.events.push(RunEvent {
                seq,
                run_id,
                recorded_at: Utc::now(),
                kind,
            });
            Ok(())
        })
    }

    async fn save_patch(
        &self,
        run_id: RunId,
        attempt: u32,
        patch: &Patch,
    ) -> Result<(), StoreError> {
        self.with_state(|state| {
            state
                .patches
                .entry((run_id, attempt))
                .or_insert_with(|| StoredPatch {
                    run_id,
                    attempt,
                    patch: patch.clone(),
                    created_at: Utc::now(),
                });
            Ok(())
        })
    }

    async fn get_run(&self, id: RunId) -> Result<RunRecord, StoreError> {
        self.with_state(|state| {
            state
                .runs
                .get(&id)
                .cloned()
                .ok_or(StoreError::RunNotFound { id })
        })
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        self.with_state(|state| {
            let mut runs: Vec<(usize, &RunRecord)> = state
                .order
                .iter()
                .enumerate()
                .filter_map(|(i, id)| state.runs.get(id).map(|r| (i, r)))
                .collect();
            runs.sort_by(|(ia, a), (ib, b)| b.created_at.cmp(&a.created_at).then(ib.cmp(ia)));
            Ok(runs.into_iter().take(limit).map(|(_, r)| r.clone()).collect())
        })
    }

    async fn events(&self, run_id: RunId) -> Result<Vec<RunEvent>, StoreError> {
        self.with_state(|state| {
            Ok(state
                .events
                .iter()
                .filter(|e| e.run_id == run_id)
                .cloned()
                .collect())
        })
    }

    async fn patches(&self, run_id: RunId) -> Result<Vec<StoredPatch>, StoreError> {
        self.with_state(|state| {
            Ok(state
                .patches
                .values()
                .filter(|p| p.run_id == run_id)
                .cloned()
                .collect())
        })
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_state(|state| Ok(state.settings.get(key).cloned()))
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_state(|state| {
            state.settings.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.with_state(|state| {
            state.closed = true;
            Ok(())
        })
    }
}
