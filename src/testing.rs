//! Test doubles for driving the orchestrator without real stages, stores or
//! repositories.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::model::{
    BugReport, CriticReport, Location, Patch, RepairPlan, RunId, RunRecord, Severity,
    StageInput, StageKind, StagePayload, Strategy, TestOutcome, Verdict,
};
use crate::stage::{Stage, StageContext, StageSet};
use crate::store::{ArtifactStore, MemoryArtifactStore, RunEvent, RunEventKind, StoredPatch};
use crate::vcs::{ApplyOutcome, VersionControl};

/// One scripted stage response.
#[derive(Debug, Clone)]
pub enum Step {
    Return(StagePayload),
    Fail(String),
    Panic(String),
    /// Sleep for the given time, then fail.
    Stall(Duration),
    /// Sleep for the given time, then return the payload.
    Slow(Duration, StagePayload),
}

/// A stage that replays a script and then repeats its last step.
#[derive(Debug)]
pub struct ScriptedStage {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    calls: AtomicUsize,
    inputs: Mutex<Vec<(StageContext, StageInput)>>,
}

impl ScriptedStage {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        })
    }

    pub fn returning(payload: StagePayload) -> Arc<Self> {
        Self::new([Step::Return(payload)])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Contexts and inputs seen so far, in call order.
    pub fn seen(&self) -> Vec<(StageContext, StageInput)> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    async fn run(&self, ctx: &StageContext, input: StageInput) -> Result<StagePayload> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push((ctx.clone(), input));
        let step = {
            let mut steps = self.steps.lock().unwrap();
            let mut last = self.last.lock().unwrap();
            match steps.pop_front() {
                Some(step) => {
                    *last = Some(step.clone());
                    step
                }
                None => last.clone().unwrap_or(Step::Fail("script exhausted".into())),
            }
        };
        match step {
            Step::Return(payload) => Ok(payload),
            Step::Fail(message) => bail!(message),
            Step::Panic(message) => panic!("{}", message),
            Step::Stall(duration) => {
                tokio::time::sleep(duration).await;
                bail!("stalled stage woke up")
            }
            Step::Slow(duration, payload) => {
                tokio::time::sleep(duration).await;
                Ok(payload)
            }
        }
    }
}

/// The five scripted stages of a pipeline.
#[derive(Debug, Clone)]
pub struct Doubles {
    pub analyze: Arc<ScriptedStage>,
    pub plan: Arc<ScriptedStage>,
    pub fix: Arc<ScriptedStage>,
    pub test: Arc<ScriptedStage>,
    pub evaluate: Arc<ScriptedStage>,
}

impl Doubles {
    /// A pipeline that produces a low-risk, passing one-line fix.
    pub fn happy() -> Self {
        Self {
            analyze: ScriptedStage::returning(StagePayload::BugReport(bug_report())),
            plan: ScriptedStage::returning(StagePayload::RepairPlan(plan(Strategy::OneLineFix))),
            fix: ScriptedStage::returning(StagePayload::Patch(patch(3))),
            test: ScriptedStage::returning(StagePayload::TestOutcome(tests_passed(true))),
            evaluate: ScriptedStage::returning(StagePayload::CriticReport(critic(
                Verdict::Pass,
                0.95,
            ))),
        }
    }

    pub fn with(mut self, kind: StageKind, stage: Arc<ScriptedStage>) -> Self {
        match kind {
            StageKind::Analyze => self.analyze = stage,
            StageKind::Plan => self.plan = stage,
            StageKind::Fix => self.fix = stage,
            StageKind::Test => self.test = stage,
            StageKind::Evaluate => self.evaluate = stage,
        }
        self
    }

    pub fn stage_set(&self) -> StageSet {
        StageSet::builder()
            .with(StageKind::Analyze, self.analyze.clone())
            .with(StageKind::Plan, self.plan.clone())
            .with(StageKind::Fix, self.fix.clone())
            .with(StageKind::Test, self.test.clone())
            .with(StageKind::Evaluate, self.evaluate.clone())
            .build()
            .unwrap()
    }
}

pub fn bug_report() -> BugReport {
    BugReport {
        category: "null_dereference".into(),
        location: Location {
            file: "app/views.py".into(),
            line: Some(2),
            symbol: Some("handler".into()),
        },
        severity: Severity::High,
        description: "handler dereferences a missing user".into(),
    }
}

pub fn plan(strategy: Strategy) -> RepairPlan {
    RepairPlan {
        strategy,
        location: bug_report().location,
        estimated_lines: 3,
        rationale: "guard the missing user".into(),
    }
}

/// A valid patch with `lines` changed lines.
pub fn patch(lines: u32) -> Patch {
    let mut diff = String::from("--- a/app/views.py\n+++ b/app/views.py\n");
    diff.push_str(&format!("@@ -1,1 +1,{} @@\n", lines.saturating_sub(1)));
    diff.push_str("-    return user.name\n");
    for i in 1..lines {
        diff.push_str(&format!("+    check_{}(user)\n", i));
    }
    Patch::from_diff(&diff)
}

pub fn invalid_patch() -> Patch {
    Patch {
        syntax_valid: false,
        ..patch(3)
    }
}

pub fn tests_passed(passed: bool) -> TestOutcome {
    TestOutcome {
        passed,
        summary: if passed { "12 passed" } else { "1 failed, 11 passed" }.into(),
        generated_tests: 1,
    }
}

pub fn critic(verdict: Verdict, confidence: f64) -> CriticReport {
    CriticReport {
        verdict,
        notes: "reviewed".into(),
        confidence,
    }
}

/// How [`RecordingVcs`] answers apply calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyBehaviour {
    Apply,
    Conflict,
    Fail,
    Stall,
}

/// Version control that records calls instead of touching a repository.
#[derive(Debug)]
pub struct RecordingVcs {
    behaviour: ApplyBehaviour,
    applied: Mutex<Vec<Uuid>>,
    rolled_back: Mutex<Vec<Uuid>>,
}

impl RecordingVcs {
    pub fn new(behaviour: ApplyBehaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            applied: Mutex::new(Vec::new()),
            rolled_back: Mutex::new(Vec::new()),
        })
    }

    pub fn applied(&self) -> Vec<Uuid> {
        self.applied.lock().unwrap().clone()
    }

    pub fn rolled_back(&self) -> Vec<Uuid> {
        self.rolled_back.lock().unwrap().clone()
    }
}

#[async_trait]
impl VersionControl for RecordingVcs {
    async fn apply_patch(&self, patch: &Patch) -> Result<ApplyOutcome> {
        self.applied.lock().unwrap().push(patch.id);
        match self.behaviour {
            ApplyBehaviour::Apply => Ok(ApplyOutcome::Applied),
            ApplyBehaviour::Conflict => Ok(ApplyOutcome::Conflict("hunk 1 failed".into())),
            ApplyBehaviour::Fail => bail!("index locked"),
            ApplyBehaviour::Stall => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ApplyOutcome::Applied)
            }
        }
    }

    async fn rollback(&self, patch: &Patch) -> Result<()> {
        self.rolled_back.lock().unwrap().push(patch.id);
        Ok(())
    }
}

type RunPredicate = Box<dyn Fn(&RunRecord) -> bool + Send + Sync>;

/// Memory store that can be told to fail.
pub struct FlakyStore {
    inner: MemoryArtifactStore,
    unavailable: AtomicBool,
    fail_save: Option<RunPredicate>,
}

impl FlakyStore {
    /// Every call fails.
    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryArtifactStore::new(),
            unavailable: AtomicBool::new(true),
            fail_save: None,
        })
    }

    /// `save_run` fails for records matching `predicate`.
    pub fn failing_when(predicate: impl Fn(&RunRecord) -> bool + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryArtifactStore::new(),
            unavailable: AtomicBool::new(false),
            fail_save: Some(Box::new(predicate)),
        })
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Database(anyhow::anyhow!("disk I/O error")));
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FlakyStore {
    async fn save_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.check()?;
        if self.fail_save.as_ref().is_some_and(|fail| fail(run)) {
            return Err(StoreError::Database(anyhow::anyhow!("database is locked")));
        }
        self.inner.save_run(run).await
    }

    async fn append_event(&self, run_id: RunId, kind: RunEventKind) -> Result<(), StoreError> {
        self.check()?;
        self.inner.append_event(run_id, kind).await
    }

    async fn save_patch(&self, run_id: RunId, attempt: u32, patch: &Patch) -> Result<(), StoreError> {
        self.check()?;
        self.inner.save_patch(run_id, attempt, patch).await
    }

    async fn get_run(&self, id: RunId) -> Result<RunRecord, StoreError> {
        self.check()?;
        self.inner.get_run(id).await
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        self.check()?;
        self.inner.list_runs(limit).await
    }

    async fn events(&self, run_id: RunId) -> Result<Vec<RunEvent>, StoreError> {
        self.check()?;
        self.inner.events(run_id).await
    }

    async fn patches(&self, run_id: RunId) -> Result<Vec<StoredPatch>, StoreError> {
        self.check()?;
        self.inner.patches(run_id).await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.inner.get_setting(key).await
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.set_setting(key, value).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.close().await
    }
}
