//! In-flight run registry: at most one active run per target.
//!
//! [`RunRegistry::admit`] hands out an [`Admission`] guard. The guard removes
//! its entry exactly once, either through [`Admission::release`] or on drop, so
//! a run that panics or whose task is aborted still frees its target.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::errors::RegistryError;
use crate::model::{RunId, TargetRef};

#[derive(Debug, Default)]
struct Inner {
    active: Mutex<HashMap<String, RunId>>,
    admitted: AtomicU64,
    released: AtomicU64,
}

/// Shared registry of active runs keyed by target identity.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    inner: Arc<Inner>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `target` for `run_id`. Fails without side effects when the
    /// target already has an active run.
    pub fn admit(&self, target: &TargetRef, run_id: RunId) -> Result<Admission, RegistryError> {
        let key = target.key();
        {
            let mut active = self
                .inner
                .active
                .lock()
                .map_err(|_| RegistryError::Unavailable("registry lock poisoned".into()))?;
            if let Some(existing) = active.get(&key) {
                return Err(RegistryError::AlreadyRunning {
                    target: key,
                    run_id: *existing,
                });
            }
            active.insert(key.clone(), run_id);
        }
        self.inner.admitted.fetch_add(1, Ordering::SeqCst);
        debug!(target = %key, run_id = %run_id, "admitted");

        Ok(Admission {
            registry: Arc::clone(&self.inner),
            key,
            run_id,
            released: AtomicBool::new(false),
        })
    }

    /// Run currently holding `target`, if any.
    pub fn active_run(&self, target: &TargetRef) -> Option<RunId> {
        self.inner
            .active
            .lock()
            .ok()
            .and_then(|active| active.get(&target.key()).copied())
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// Total admissions granted since creation.
    pub fn admitted_total(&self) -> u64 {
        self.inner.admitted.load(Ordering::SeqCst)
    }

    /// Total releases performed since creation.
    pub fn released_total(&self) -> u64 {
        self.inner.released.load(Ordering::SeqCst)
    }
}

/// Exclusive claim on a target. Released exactly once.
#[derive(Debug)]
pub struct Admission {
    registry: Arc<Inner>,
    key: String,
    run_id: RunId,
    released: AtomicBool,
}

impl Admission {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn target_key(&self) -> &str {
        &self.key
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Free the target. Returns false if it was already released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        // Removal proceeds even on a poisoned lock.
        let mut active = match self.registry.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(target = %self.key, "registry lock poisoned during release");
                poisoned.into_inner()
            }
        };
        if active.get(&self.key) == Some(&self.run_id) {
            active.remove(&self.key);
        }
        drop(active);
        self.registry.released.fetch_add(1, Ordering::SeqCst);
        debug!(target = %self.key, run_id = %self.run_id, "released");
        true
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.release();
    }
}
