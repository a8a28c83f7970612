//! The per-run state machine.
//!
//! A [`RunMachine`] owns one admitted run from ADMITTED to its terminal state.
//! Every transition and every stage result is persisted before the next step.
//! Stage-level failures go through the retry loop; store and transition
//! errors end the run as INFRASTRUCTURE_FAULT.

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::Orchestrator;
use super::controls::{MergeVerdict, RunControls, RunProgress};
use crate::config::ReplanPolicy;
use crate::errors::StoreError;
use crate::knowledge::{KnowledgeRecord, Outcome};
use crate::model::{
    BugReport, CriticReport, Decision, EscalationReason, FailureKind, FailureNote, Patch,
    RepairPlan, RunRecord, RunState, StageErrorKind, StageInput, StageKind, StagePayload,
    StageResult, TestOutcome, TransitionError, Verdict,
};
use crate::registry::Admission;
use crate::risk::{RiskAction, RiskInputs};
use crate::stage::StageContext;
use crate::store::RunEventKind;
use crate::vcs::ApplyOutcome;

/// How a run ends, before it is written to the record.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Conclusion {
    pub decision: Decision,
    pub reason: String,
}

impl Conclusion {
    fn new(decision: Decision, reason: impl Into<String>) -> Self {
        Self {
            decision,
            reason: reason.into(),
        }
    }

    fn escalated(reason: EscalationReason, detail: impl Into<String>) -> Self {
        Self::new(Decision::escalated(reason), detail)
    }

    fn cancelled() -> Self {
        Self::escalated(EscalationReason::Cancelled, "cancelled by operator")
    }

    fn infrastructure(detail: impl std::fmt::Display) -> Self {
        Self::escalated(
            EscalationReason::InfrastructureFault,
            format!("infrastructure fault: {}", detail),
        )
    }
}

impl From<StoreError> for Conclusion {
    fn from(err: StoreError) -> Self {
        Self::infrastructure(err)
    }
}

impl From<TransitionError> for Conclusion {
    fn from(err: TransitionError) -> Self {
        Self::infrastructure(err)
    }
}

/// Result of one pass through the pipeline.
enum Attempt {
    Failed(FailureNote),
    Concluded(Conclusion),
}

pub(crate) struct RunMachine<'a> {
    orchestrator: &'a Orchestrator,
    admission: Admission,
    controls: RunControls,
    run: RunRecord,
    trace: Option<String>,
    bug: Option<BugReport>,
    hints: Vec<KnowledgeRecord>,
    failures: Vec<FailureNote>,
    /// Patch merged into the workspace by this run, if any.
    merged: Option<Patch>,
}

impl<'a> RunMachine<'a> {
    pub(crate) fn new(
        orchestrator: &'a Orchestrator,
        admission: Admission,
        run: RunRecord,
        trace: Option<String>,
        controls: RunControls,
    ) -> Self {
        Self {
            orchestrator,
            admission,
            controls,
            run,
            trace,
            bug: None,
            hints: Vec::new(),
            failures: Vec::new(),
            merged: None,
        }
    }

    /// Drive the run to a terminal state. The admission is released on return
    /// and, through its guard, on every other exit.
    pub(crate) async fn run(mut self) -> RunRecord {
        info!(run_id = %self.run.id, target = %self.run.target, "run admitted");
        let conclusion = match self.start().await {
            Ok(()) => self.pipeline().await.unwrap_or_else(|end| end),
            Err(end) => end,
        };
        self.finish(conclusion).await;
        self.record_knowledge().await;
        self.admission.release();
        self.run
    }

    async fn start(&mut self) -> Result<(), Conclusion> {
        let store = &self.orchestrator.store;
        store.save_run(&self.run).await?;
        store
            .append_event(
                self.run.id,
                RunEventKind::Admitted {
                    target: self.run.target.clone(),
                },
            )
            .await?;
        Ok(())
    }

    /// Both arms end the run; `Err` lets infrastructure faults and
    /// cancellation short-circuit through `?`.
    async fn pipeline(&mut self) -> Result<Conclusion, Conclusion> {
        let max_attempts = self.orchestrator.settings.max_attempts.max(1);
        loop {
            match self.attempt().await? {
                Attempt::Concluded(conclusion) => return Ok(conclusion),
                Attempt::Failed(note) => {
                    warn!(
                        run_id = %self.run.id,
                        stage = %note.stage,
                        attempt = note.attempt,
                        "attempt failed: {}",
                        note.detail
                    );
                    self.orchestrator
                        .store
                        .append_event(self.run.id, RunEventKind::AttemptFailed { note: note.clone() })
                        .await?;
                    self.failures.push(note);

                    if self.run.attempts >= max_attempts {
                        let last = self
                            .failures
                            .last()
                            .map(|n| n.detail.clone())
                            .unwrap_or_default();
                        return Ok(Conclusion::escalated(
                            EscalationReason::ExhaustedRetries,
                            format!("{} attempts failed; last: {}", self.run.attempts, last),
                        ));
                    }
                    self.run.attempts += 1;
                }
            }
        }
    }

    async fn attempt(&mut self) -> Result<Attempt, Conclusion> {
        let reuse = self.orchestrator.settings.replan_policy == ReplanPolicy::ReuseReport;
        let bug = match self.bug.clone() {
            Some(bug) if reuse => bug,
            _ => match self.analyze().await? {
                Ok(bug) => bug,
                Err(end) => return Ok(end),
            },
        };

        self.enter(RunState::Planning).await?;
        let input = StageInput::Plan {
            bug: bug.clone(),
            failures: self.failures.clone(),
        };
        let result = self.invoke(StageKind::Plan, input).await?;
        let plan = match result.payload {
            Some(StagePayload::RepairPlan(plan)) if result.success => plan,
            _ => return Ok(Attempt::Failed(self.note(&result))),
        };
        self.run.strategy = Some(plan.strategy);

        self.enter(RunState::Fixing).await?;
        let input = StageInput::Fix {
            bug: bug.clone(),
            plan: plan.clone(),
        };
        let result = self.invoke(StageKind::Fix, input).await?;
        let patch = match result.payload {
            Some(StagePayload::Patch(patch)) if result.success => patch.bound_to(&plan),
            _ => return Ok(Attempt::Failed(self.note(&result))),
        };
        self.orchestrator
            .store
            .save_patch(self.run.id, self.run.attempts, &patch)
            .await?;

        self.enter(RunState::Testing).await?;
        let input = StageInput::Test {
            bug: bug.clone(),
            plan: plan.clone(),
            patch: patch.clone(),
        };
        let result = self.invoke(StageKind::Test, input).await?;
        let test = match result.payload {
            Some(StagePayload::TestOutcome(test)) if result.success => test,
            _ => return Ok(Attempt::Failed(self.note(&result))),
        };
        if !test.passed {
            return Ok(Attempt::Failed(self.failure(
                StageKind::Test,
                FailureKind::TestsFailed,
                format!("tests failed: {}", test.summary),
            )));
        }

        self.enter(RunState::Evaluating).await?;
        let input = StageInput::Evaluate {
            bug,
            plan: plan.clone(),
            patch: patch.clone(),
            test: test.clone(),
        };
        let result = self.invoke(StageKind::Evaluate, input).await?;
        let critic = match result.payload {
            Some(StagePayload::CriticReport(critic)) if result.success => critic,
            _ => return Ok(Attempt::Failed(self.note(&result))),
        };

        match critic.verdict {
            Verdict::Retry => Ok(Attempt::Failed(self.failure(
                StageKind::Evaluate,
                FailureKind::CriticRetry,
                format!("critic asked for another attempt: {}", critic.notes),
            ))),
            Verdict::Escalate => Ok(Attempt::Concluded(Conclusion::escalated(
                EscalationReason::CriticEscalated,
                format!("critic escalated: {}", critic.notes),
            ))),
            Verdict::Pass => self
                .decide(&plan, patch, &test, &critic)
                .await
                .map(Attempt::Concluded),
        }
    }

    /// Run the Analyze stage. The inner `Err` ends the attempt.
    async fn analyze(&mut self) -> Result<Result<BugReport, Attempt>, Conclusion> {
        self.enter(RunState::Analyzing).await?;
        let input = StageInput::Analyze {
            target: self.run.target.clone(),
            trace: self.trace.clone(),
        };
        let result = self.invoke(StageKind::Analyze, input).await?;
        match result.payload {
            Some(StagePayload::BugReport(bug)) if result.success => {
                self.hints = self
                    .orchestrator
                    .knowledge
                    .similar_to(&bug, self.orchestrator.settings.nearest_k)
                    .await;
                debug!(
                    run_id = %self.run.id,
                    hints = self.hints.len(),
                    category = %bug.category,
                    "defect found"
                );
                self.bug = Some(bug.clone());
                Ok(Ok(bug))
            }
            Some(StagePayload::NoDefect { summary }) if result.success => {
                let reason = if summary.is_empty() {
                    "no defect detected".to_string()
                } else {
                    format!("no defect detected: {}", summary)
                };
                Ok(Err(Attempt::Concluded(Conclusion::new(
                    Decision::Rejected,
                    reason,
                ))))
            }
            _ => Ok(Err(Attempt::Failed(self.note(&result)))),
        }
    }

    /// Classify the verified patch and carry out the risk action.
    async fn decide(
        &mut self,
        plan: &RepairPlan,
        patch: Patch,
        test: &TestOutcome,
        critic: &CriticReport,
    ) -> Result<Conclusion, Conclusion> {
        let assessment = self.orchestrator.risk.classify(&RiskInputs {
            confidence: critic.confidence,
            patch_lines: patch.line_count,
            strategy: plan.strategy,
            tests_passed: test.passed,
        });
        info!(
            run_id = %self.run.id,
            tier = %assessment.tier,
            strategy = %plan.strategy,
            lines = patch.line_count,
            "patch classified"
        );
        self.run.risk_tier = Some(assessment.tier);
        self.run.final_patch = Some(patch.clone());

        match assessment.action {
            RiskAction::RequireApproval { .. } => Ok(Conclusion::new(
                Decision::PendingApproval { expires_at: None },
                assessment.describe(),
            )),
            RiskAction::AutoMerge { grace } => {
                self.countdown(grace, patch, assessment.describe()).await
            }
        }
    }

    async fn countdown(
        &mut self,
        grace: Duration,
        patch: Patch,
        description: String,
    ) -> Result<Conclusion, Conclusion> {
        let now = Utc::now();
        let deadline = TimeDelta::from_std(grace)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(now);
        self.run.merge_deadline = Some(deadline);
        self.enter(RunState::MergeCountdown).await?;
        self.orchestrator
            .store
            .append_event(self.run.id, RunEventKind::CountdownStarted { deadline })
            .await?;

        let decision = self.controls.decision().clone();
        let verdict = if grace.is_zero() {
            decision.resolve(MergeVerdict::TimerFired)
        } else {
            tokio::select! {
                verdict = decision.settled() => verdict,
                _ = self.controls.token().cancelled() => decision.resolve(MergeVerdict::Cancelled),
                _ = tokio::time::sleep(grace) => decision.resolve(MergeVerdict::TimerFired),
            }
        };
        debug!(run_id = %self.run.id, ?verdict, "countdown decided");

        match verdict {
            MergeVerdict::Cancelled => Ok(Conclusion::cancelled()),
            MergeVerdict::Rejected => Ok(Conclusion::new(
                Decision::Rejected,
                "merge rejected during countdown",
            )),
            MergeVerdict::TimerFired | MergeVerdict::Approved => {
                let how = if verdict == MergeVerdict::Approved {
                    "merged on approval"
                } else {
                    "merged after grace period"
                };
                Ok(self.merge(patch, format!("{}; {}", description, how)).await)
            }
        }
    }

    async fn merge(&mut self, patch: Patch, reason: String) -> Conclusion {
        let limit = self.orchestrator.settings.vcs_timeout;
        match timeout(limit, self.orchestrator.vcs.apply_patch(&patch)).await {
            Ok(Ok(ApplyOutcome::Applied)) => {
                info!(run_id = %self.run.id, patch_id = %patch.id, "patch merged");
                self.merged = Some(patch);
                Conclusion::new(Decision::AutoMerged, reason)
            }
            Ok(Ok(ApplyOutcome::Conflict(detail))) => Conclusion::escalated(
                EscalationReason::MergeConflict,
                format!("patch does not apply: {}", detail),
            ),
            Ok(Err(e)) => Conclusion::escalated(
                EscalationReason::MergeFailed,
                format!("merge failed: {:#}", e),
            ),
            Err(_) => Conclusion::escalated(
                EscalationReason::MergeFailed,
                format!("merge timed out after {:?}", limit),
            ),
        }
    }

    /// Invoke one stage, record its result and persist before returning.
    async fn invoke(&mut self, kind: StageKind, input: StageInput) -> Result<StageResult, Conclusion> {
        if self.controls.is_cancelled() {
            return Err(Conclusion::cancelled());
        }

        let mut ctx = StageContext::new(self.run.id, self.run.target.clone(), self.run.attempts);
        ctx.prior_results = self.run.stage_results.clone();
        ctx.hints = self.hints.clone();
        ctx.failures = self.failures.clone();

        let stage = self.orchestrator.stages.get(kind);
        let limit = self.orchestrator.settings.stage_timeout(kind);
        let executor = self.orchestrator.executor;
        // Cancellation waits for the stage; the executor timeout bounds it.
        let result = screen(executor.invoke(kind, stage, &ctx, input, limit).await);

        self.run.stage_results.push(result.clone());
        self.persist(RunEventKind::StageRecorded {
            stage: kind,
            attempt: result.attempt,
            success: result.success,
        })
        .await?;
        if self.controls.is_cancelled() {
            return Err(Conclusion::cancelled());
        }
        Ok(result)
    }

    /// Move to a non-terminal state and persist the transition.
    async fn enter(&mut self, to: RunState) -> Result<(), Conclusion> {
        if self.controls.is_cancelled() {
            return Err(Conclusion::cancelled());
        }
        let from = self.run.advance(to)?;
        debug!(run_id = %self.run.id, attempt = self.run.attempts, "{} -> {}", from, to);
        self.persist(RunEventKind::Transition { from, to }).await?;
        self.publish();
        Ok(())
    }

    async fn persist(&self, event: RunEventKind) -> Result<(), StoreError> {
        let store = &self.orchestrator.store;
        store.save_run(&self.run).await?;
        store.append_event(self.run.id, event).await
    }

    fn publish(&self) {
        self.controls.publish(RunProgress {
            state: self.run.state,
            attempt: self.run.attempts,
            merge_deadline: self.run.merge_deadline,
        });
    }

    /// Failure note for a failed stage result.
    fn note(&self, result: &StageResult) -> FailureNote {
        let (kind, detail) = match &result.error {
            Some(error) => (FailureKind::from(error.kind), error.message.clone()),
            None => (
                FailureKind::StageFailure,
                format!("{} stage produced no usable payload", result.stage),
            ),
        };
        self.failure(result.stage, kind, detail)
    }

    fn failure(&self, stage: StageKind, kind: FailureKind, detail: String) -> FailureNote {
        FailureNote {
            attempt: self.run.attempts,
            stage,
            kind,
            detail,
            strategy: self.run.strategy,
        }
    }

    /// Write the terminal state. A failed write escalates the run and undoes
    /// any merge it performed.
    async fn finish(&mut self, conclusion: Conclusion) {
        let mut concluded = self.run.clone();
        let from = match concluded.conclude(conclusion.decision.clone(), conclusion.reason.clone()) {
            Ok(from) => from,
            Err(e) => {
                warn!(run_id = %self.run.id, "cannot conclude run: {e}");
                let fallback = Conclusion::infrastructure(&e);
                match concluded.conclude(fallback.decision, fallback.reason) {
                    Ok(from) => from,
                    Err(_) => return,
                }
            }
        };

        let persisted = self.persist_final(&concluded, from).await;
        let Err(err) = persisted else {
            self.run = concluded;
            self.log_conclusion();
            return;
        };

        warn!(run_id = %self.run.id, "failed to persist final state: {err}");
        if concluded.decision.as_ref().and_then(Decision::escalation_reason)
            == Some(EscalationReason::InfrastructureFault)
        {
            self.run = concluded;
            self.log_conclusion();
            return;
        }

        let mut detail = format!("failed to persist final state: {}", err);
        if let Some(patch) = self.merged.take() {
            detail.push_str(&self.roll_back(&patch).await);
        }
        let fault = Conclusion::infrastructure(detail);
        match self.run.conclude(fault.decision, fault.reason) {
            Ok(from) => {
                if let Err(e) = self.persist_final(&self.run, from).await {
                    warn!(run_id = %self.run.id, "failed to persist escalation: {e}");
                }
            }
            Err(e) => warn!(run_id = %self.run.id, "cannot escalate run: {e}"),
        }
        self.log_conclusion();
    }

    async fn persist_final(&self, run: &RunRecord, from: RunState) -> Result<(), StoreError> {
        let store = &self.orchestrator.store;
        store.save_run(run).await?;
        store
            .append_event(run.id, RunEventKind::Transition { from, to: run.state })
            .await?;
        if let Some(decision) = &run.decision {
            store
                .append_event(
                    run.id,
                    RunEventKind::Concluded {
                        decision: decision.clone(),
                        reason: run.reason.clone().unwrap_or_default(),
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Undo a merge whose run could not be recorded. Returns a note for the
    /// run's reason.
    async fn roll_back(&self, patch: &Patch) -> String {
        let limit = self.orchestrator.settings.vcs_timeout;
        match timeout(limit, self.orchestrator.vcs.rollback(patch)).await {
            Ok(Ok(())) => {
                info!(run_id = %self.run.id, patch_id = %patch.id, "merged patch rolled back");
                if let Err(e) = self
                    .orchestrator
                    .store
                    .append_event(self.run.id, RunEventKind::RolledBack { patch_id: patch.id })
                    .await
                {
                    debug!(run_id = %self.run.id, "could not log rollback: {e}");
                }
                "; merged patch rolled back".to_string()
            }
            Ok(Err(e)) => {
                warn!(run_id = %self.run.id, "rollback failed: {e:#}");
                format!("; rollback failed: {:#}", e)
            }
            Err(_) => {
                warn!(run_id = %self.run.id, "rollback timed out");
                "; rollback timed out".to_string()
            }
        }
    }

    fn log_conclusion(&self) {
        self.publish();
        let decision = self
            .run
            .decision
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        info!(
            run_id = %self.run.id,
            attempts = self.run.attempts,
            decision = %decision,
            "run concluded: {}",
            self.run.reason.as_deref().unwrap_or("")
        );
    }

    async fn record_knowledge(&self) {
        let Some(decision) = &self.run.decision else {
            return;
        };
        let fingerprint = self
            .bug
            .as_ref()
            .map(|bug| self.orchestrator.knowledge.fingerprint(bug))
            .unwrap_or_default();
        let outcome = if decision.is_success() {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        self.orchestrator
            .knowledge
            .record(KnowledgeRecord {
                fingerprint,
                strategy: self.run.strategy,
                outcome,
                risk_tier: self.run.risk_tier,
                target: self.run.target.key(),
                run_id: self.run.id,
                recorded_at: Utc::now(),
            })
            .await;
    }
}

/// Patches that are not syntactically valid fail the Fix stage.
fn screen(result: StageResult) -> StageResult {
    let invalid = matches!(
        &result.payload,
        Some(StagePayload::Patch(patch)) if result.success && !patch.syntax_valid
    );
    if invalid {
        result.into_failure(StageErrorKind::SyntaxInvalid, "patch is not syntactically valid")
    } else {
        result
    }
}
