//! Pluggable repair stages.
//!
//! A [`Stage`] turns a [`StageInput`] into a [`StagePayload`]. The
//! orchestrator never calls stages directly; it goes through
//! [`executor::StageExecutor`], which bounds each call with a timeout and
//! folds every outcome into a [`crate::model::StageResult`].

pub mod command;
pub mod executor;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::knowledge::KnowledgeRecord;
use crate::model::{FailureNote, RunId, StageInput, StageKind, StagePayload, StageResult, TargetRef};

pub use command::CommandStage;
pub use executor::StageExecutor;

/// What a stage knows about the run it is working for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageContext {
    pub run_id: RunId,
    pub target: TargetRef,
    pub attempt: u32,
    /// Results recorded so far, oldest first.
    #[serde(default)]
    pub prior_results: Vec<StageResult>,
    /// Nearest past outcomes for similar bugs.
    #[serde(default)]
    pub hints: Vec<KnowledgeRecord>,
    /// Why earlier attempts failed.
    #[serde(default)]
    pub failures: Vec<FailureNote>,
}

impl StageContext {
    pub fn new(run_id: RunId, target: TargetRef, attempt: u32) -> Self {
        Self {
            run_id,
            target,
            attempt,
            prior_results: Vec::new(),
            hints: Vec::new(),
            failures: Vec::new(),
        }
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    async fn run(&self, ctx: &StageContext, input: StageInput) -> Result<StagePayload>;
}

/// One stage implementation per kind. Complete by construction.
#[derive(Clone)]
pub struct StageSet {
    analyze: Arc<dyn Stage>,
    plan: Arc<dyn Stage>,
    fix: Arc<dyn Stage>,
    test: Arc<dyn Stage>,
    evaluate: Arc<dyn Stage>,
}

impl std::fmt::Debug for StageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSet").finish_non_exhaustive()
    }
}

impl StageSet {
    pub fn builder() -> StageSetBuilder {
        StageSetBuilder::default()
    }

    pub fn get(&self, kind: StageKind) -> Arc<dyn Stage> {
        let stage = match kind {
            StageKind::Analyze => &self.analyze,
            StageKind::Plan => &self.plan,
            StageKind::Fix => &self.fix,
            StageKind::Test => &self.test,
            StageKind::Evaluate => &self.evaluate,
        };
        Arc::clone(stage)
    }
}

#[derive(Default)]
pub struct StageSetBuilder {
    stages: BTreeMap<StageKind, Arc<dyn Stage>>,
}

impl StageSetBuilder {
    pub fn with(mut self, kind: StageKind, stage: Arc<dyn Stage>) -> Self {
        self.stages.insert(kind, stage);
        self
    }

    /// Fails if any stage kind has no implementation.
    pub fn build(mut self) -> Result<StageSet> {
        let missing: Vec<&str> = StageKind::ALL
            .iter()
            .filter(|kind| !self.stages.contains_key(kind))
            .map(|kind| kind.as_str())
            .collect();
        let mut take = |kind: StageKind| self.stages.remove(&kind);
        match (
            take(StageKind::Analyze),
            take(StageKind::Plan),
            take(StageKind::Fix),
            take(StageKind::Test),
            take(StageKind::Evaluate),
        ) {
            (Some(analyze), Some(plan), Some(fix), Some(test), Some(evaluate)) => Ok(StageSet {
                analyze,
                plan,
                fix,
                test,
                evaluate,
            }),
            _ => anyhow::bail!("No stage registered for: {}", missing.join(", ")),
        }
    }
}

/// Digest identifying a stage input snapshot.
pub fn input_ref(input: &StageInput) -> String {
    match serde_json::to_vec(input) {
        Ok(bytes) => hex::encode(Sha256::digest(&bytes)),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TestOutcome, TargetRef};

    struct Fixed;

    #[async_trait]
    impl Stage for Fixed {
        async fn run(&self, _ctx: &StageContext, _input: StageInput) -> Result<StagePayload> {
            Ok(StagePayload::TestOutcome(TestOutcome {
                passed: true,
                summary: String::new(),
                generated_tests: 0,
            }))
        }
    }

    #[test]
    fn test_build_fails_when_kind_missing() {
        let err = StageSet::builder()
            .with(StageKind::Analyze, Arc::new(Fixed))
            .with(StageKind::Plan, Arc::new(Fixed))
            .build()
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("fix"));
        assert!(message.contains("evaluate"));
        assert!(!message.contains("plan"));
    }

    #[test]
    fn test_build_succeeds_with_all_kinds() {
        let set = StageKind::ALL
            .into_iter()
            .fold(StageSet::builder(), |b, kind| b.with(kind, Arc::new(Fixed)))
            .build()
            .unwrap();
        let _ = set.get(StageKind::Evaluate);
    }

    #[test]
    fn test_input_ref_is_stable_and_content_addressed() {
        let a = StageInput::Analyze {
            target: TargetRef::file("a.py"),
            trace: None,
        };
        let b = StageInput::Analyze {
            target: TargetRef::file("b.py"),
            trace: None,
        };
        assert_eq!(input_ref(&a), input_ref(&a.clone()));
        assert_ne!(input_ref(&a), input_ref(&b));
        assert_eq!(input_ref(&a).len(), 64);
    }
}
