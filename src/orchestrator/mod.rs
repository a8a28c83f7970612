//! Healing orchestration.
//!
//! The [`Orchestrator`] admits one run per target, then drives it through
//! analyze → plan → fix → test → evaluate with retries, classifies the verified
//! patch and either merges it after a countdown, holds it for approval, or
//! escalates. Runs execute as independent tokio tasks; see [`Orchestrator::submit`].

pub mod controls;
mod machine;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

use crate::config::HealSettings;
use crate::errors::HealError;
use crate::knowledge::{KnowledgeBase, KnowledgeRecord};
use crate::model::{BugReport, Decision, RunId, RunRecord, StageKind, StagePayload, TargetRef};
use crate::registry::RunRegistry;
use crate::risk::RiskPolicy;
use crate::stage::{StageExecutor, StageSet};
use crate::store::{ArtifactStore, RunEventKind};
use crate::vcs::VersionControl;

pub use controls::{DecisionCell, MergeVerdict, RunControls, RunProgress};
use machine::RunMachine;

/// A request to heal one target.
#[derive(Debug, Clone, PartialEq)]
pub struct HealRequest {
    pub target: TargetRef,
    /// Failure trace handed to the Analyze stage.
    pub trace: Option<String>,
}

impl HealRequest {
    pub fn file(path: impl AsRef<std::path::Path>) -> Self {
        Self {
            target: TargetRef::file(path),
            trace: None,
        }
    }

    /// Target a failure trace; its digest becomes the target identity.
    pub fn trace(trace: impl Into<String>) -> Self {
        let trace = trace.into();
        Self {
            target: TargetRef::from_trace(&trace),
            trace: Some(trace),
        }
    }
}

pub struct Orchestrator {
    stages: StageSet,
    executor: StageExecutor,
    registry: RunRegistry,
    store: Arc<dyn ArtifactStore>,
    knowledge: KnowledgeBase,
    vcs: Arc<dyn VersionControl>,
    risk: RiskPolicy,
    settings: HealSettings,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("risk", &self.risk)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        stages: StageSet,
        store: Arc<dyn ArtifactStore>,
        knowledge: KnowledgeBase,
        vcs: Arc<dyn VersionControl>,
    ) -> Self {
        Self {
            stages,
            executor: StageExecutor::new(),
            registry: RunRegistry::new(),
            store,
            knowledge,
            vcs,
            risk: RiskPolicy::default(),
            settings: HealSettings::default(),
        }
    }

    pub fn with_registry(mut self, registry: RunRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_risk_policy(mut self, risk: RiskPolicy) -> Self {
        self.risk = risk;
        self
    }

    pub fn with_settings(mut self, settings: HealSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn knowledge(&self) -> &KnowledgeBase {
        &self.knowledge
    }

    pub fn settings(&self) -> &HealSettings {
        &self.settings
    }

    /// Admit a run and start it on its own task.
    ///
    /// Admission happens before this returns, so a second submit for the same
    /// target fails with `AlreadyRunning` until the first run ends.
    pub fn submit(self: &Arc<Self>, request: HealRequest) -> Result<RunHandle, HealError> {
        self.submit_with(request, RunControls::new())
    }

    pub fn submit_with(
        self: &Arc<Self>,
        request: HealRequest,
        controls: RunControls,
    ) -> Result<RunHandle, HealError> {
        let run_id = Uuid::new_v4();
        let admission = self.registry.admit(&request.target, run_id)?;

        let span = info_span!("run", run_id = %run_id, target = %request.target);
        let orchestrator = Arc::clone(self);
        let task_controls = controls.clone();
        let task = tokio::spawn(
            async move {
                let run = RunRecord::new(run_id, request.target);
                RunMachine::new(&orchestrator, admission, run, request.trace, task_controls)
                    .run()
                    .await
            }
            .instrument(span),
        );

        Ok(RunHandle {
            run_id,
            controls,
            task,
        })
    }

    /// Admit and drive a run on the current task.
    pub async fn heal(
        &self,
        request: HealRequest,
        controls: RunControls,
    ) -> Result<RunRecord, HealError> {
        let run_id = Uuid::new_v4();
        let admission = self.registry.admit(&request.target, run_id)?;
        let run = RunRecord::new(run_id, request.target);
        let span = info_span!("run", run_id = %run_id, target = %run.target);
        Ok(RunMachine::new(self, admission, run, request.trace, controls)
            .run()
            .instrument(span)
            .await)
    }

    /// Revert the patch an auto-merged run applied.
    pub async fn rollback(&self, run_id: RunId) -> Result<RunRecord, HealError> {
        revert_run(
            self.store.as_ref(),
            self.vcs.as_ref(),
            run_id,
            self.settings.vcs_timeout,
        )
        .await
    }

    /// Past outcomes nearest to the bug a run analysed.
    pub async fn similar(&self, run_id: RunId, k: usize) -> Result<Vec<KnowledgeRecord>, HealError> {
        similar_runs(self.store.as_ref(), &self.knowledge, run_id, k).await
    }
}

/// Revert the patch an auto-merged run applied and log the rollback.
pub async fn revert_run(
    store: &dyn ArtifactStore,
    vcs: &dyn VersionControl,
    run_id: RunId,
    limit: Duration,
) -> Result<RunRecord, HealError> {
    let run = store.get_run(run_id).await?;
    let patch = match (&run.decision, &run.final_patch) {
        (Some(Decision::AutoMerged), Some(patch)) => patch.clone(),
        (Some(Decision::AutoMerged), None) => {
            return Err(anyhow!("run {} has no recorded patch", run_id).into());
        }
        (decision, _) => {
            let decision = decision
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| run.state.to_string());
            return Err(anyhow!("run {} was not auto-merged ({})", run_id, decision).into());
        }
    };

    match timeout(limit, vcs.rollback(&patch)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(anyhow!("rollback of run {} timed out after {:?}", run_id, limit).into());
        }
    }
    store
        .append_event(run_id, RunEventKind::RolledBack { patch_id: patch.id })
        .await?;
    info!(run_id = %run_id, patch_id = %patch.id, "run rolled back");
    Ok(run)
}

/// Knowledge records nearest to a run's bug report, excluding the run itself.
pub async fn similar_runs(
    store: &dyn ArtifactStore,
    knowledge: &KnowledgeBase,
    run_id: RunId,
    k: usize,
) -> Result<Vec<KnowledgeRecord>, HealError> {
    let run = store.get_run(run_id).await?;
    let bug = bug_report(&run)
        .ok_or_else(|| anyhow!("run {} has no bug report to compare", run_id))?;
    let mut similar = knowledge.similar_to(bug, k.saturating_add(1)).await;
    similar.retain(|record| record.run_id != run_id);
    similar.truncate(k);
    Ok(similar)
}

/// The most recent bug report recorded for a run.
pub fn bug_report(run: &RunRecord) -> Option<&BugReport> {
    run.results_for(StageKind::Analyze)
        .filter_map(|result| match &result.payload {
            Some(StagePayload::BugReport(bug)) if result.success => Some(bug),
            _ => None,
        })
        .last()
}

/// A run started with [`Orchestrator::submit`].
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    controls: RunControls,
    task: JoinHandle<RunRecord>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn controls(&self) -> &RunControls {
        &self.controls
    }

    pub fn cancel(&self) {
        self.controls.cancel();
    }

    pub fn approve(&self) -> bool {
        self.controls.approve()
    }

    pub fn reject(&self) -> bool {
        self.controls.reject()
    }

    pub fn progress(&self) -> watch::Receiver<RunProgress> {
        self.controls.progress()
    }

    /// Wait for the run to reach its terminal state.
    pub async fn join(self) -> Result<RunRecord, HealError> {
        self.task.await.map_err(|e| HealError::RunTaskFailed {
            run_id: self.run_id,
            message: e.to_string(),
        })
    }
}
