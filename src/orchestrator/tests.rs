use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use super::*;
use crate::config::ReplanPolicy;
use crate::knowledge::{Fingerprinter, HashingFingerprinter, KnowledgeStore, MemoryKnowledgeStore, Outcome};
use crate::model::{
    EscalationReason, FailureKind, RiskTier, RunState, StageErrorKind, StageInput, Strategy,
    Verdict,
};
use crate::store::MemoryArtifactStore;
use crate::testing::{
    ApplyBehaviour, Doubles, FlakyStore, RecordingVcs, ScriptedStage, Step, bug_report, critic,
    invalid_patch, plan, tests_passed,
};

struct Harness {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn ArtifactStore>,
    knowledge: Arc<MemoryKnowledgeStore>,
    vcs: Arc<RecordingVcs>,
}

fn build(
    doubles: &Doubles,
    settings: HealSettings,
    store: Arc<dyn ArtifactStore>,
    vcs: Arc<RecordingVcs>,
) -> Harness {
    let knowledge = Arc::new(MemoryKnowledgeStore::new());
    let orchestrator = Orchestrator::new(
        doubles.stage_set(),
        Arc::clone(&store),
        KnowledgeBase::new(knowledge.clone()),
        vcs.clone(),
    )
    .with_settings(settings);
    Harness {
        orchestrator: Arc::new(orchestrator),
        store,
        knowledge,
        vcs,
    }
}

fn harness(doubles: &Doubles) -> Harness {
    build(
        doubles,
        HealSettings::default(),
        Arc::new(MemoryArtifactStore::new()),
        RecordingVcs::new(ApplyBehaviour::Apply),
    )
}

fn escalated(reason: EscalationReason) -> Option<Decision> {
    Some(Decision::escalated(reason))
}

async fn transitions(store: &Arc<dyn ArtifactStore>, run_id: RunId) -> Vec<(RunState, RunState)> {
    store
        .events(run_id)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|e| match e.kind {
            RunEventKind::Transition { from, to } => Some((from, to)),
            _ => None,
        })
        .collect()
}

async fn wait_for_state(handle: &RunHandle, state: RunState) {
    let mut progress = handle.progress();
    progress.wait_for(|p| p.state == state).await.unwrap();
}

fn assert_released_once(h: &Harness) {
    let registry = h.orchestrator.registry();
    assert_eq!(registry.admitted_total(), 1);
    assert_eq!(registry.released_total(), 1);
    assert_eq!(registry.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_happy_path_auto_merges_after_countdown() {
    let doubles = Doubles::happy();
    let h = harness(&doubles);

    let handle = h.orchestrator.submit(HealRequest::file("app/views.py")).unwrap();
    let run = handle.join().await.unwrap();

    assert_eq!(run.state, RunState::AutoMerged);
    assert_eq!(run.decision, Some(Decision::AutoMerged));
    assert!(run.reason.as_deref().unwrap().contains("merged after grace period"));
    assert_eq!(run.attempts, 1);
    assert_eq!(run.risk_tier, Some(RiskTier::Low));
    assert_eq!(run.strategy, Some(Strategy::OneLineFix));
    assert_eq!(run.stage_results.len(), 5);

    let patch = run.final_patch.clone().unwrap();
    assert_eq!(patch.line_count, 3);
    assert_eq!(h.vcs.applied(), vec![patch.id]);

    let records = h.knowledge.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Outcome::Success);
    assert_eq!(records[0].strategy, Some(Strategy::OneLineFix));
    assert_eq!(records[0].risk_tier, Some(RiskTier::Low));
    assert_eq!(records[0].run_id, run.id);

    let stored = h.store.get_run(run.id).await.unwrap();
    assert_eq!(stored, run);
    assert_eq!(h.store.patches(run.id).await.unwrap().len(), 1);
    assert_eq!(
        transitions(&h.store, run.id).await,
        vec![
            (RunState::Admitted, RunState::Analyzing),
            (RunState::Analyzing, RunState::Planning),
            (RunState::Planning, RunState::Fixing),
            (RunState::Fixing, RunState::Testing),
            (RunState::Testing, RunState::Evaluating),
            (RunState::Evaluating, RunState::MergeCountdown),
            (RunState::MergeCountdown, RunState::AutoMerged),
        ]
    );
    assert_released_once(&h);
}

#[tokio::test(start_paused = true)]
async fn test_countdown_exposes_deadline_and_honours_approval() {
    let doubles = Doubles::happy();
    let h = harness(&doubles);

    let handle = h.orchestrator.submit(HealRequest::file("app/views.py")).unwrap();
    wait_for_state(&handle, RunState::MergeCountdown).await;

    let during = h.store.get_run(handle.run_id()).await.unwrap();
    assert_eq!(during.state, RunState::MergeCountdown);
    let deadline = during.merge_deadline.unwrap();
    assert!(deadline > Utc::now());
    assert_eq!(
        during.visible_decision(),
        Some(Decision::PendingApproval {
            expires_at: Some(deadline)
        })
    );
    let events = h.store.events(handle.run_id()).await.unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(e.kind, RunEventKind::CountdownStarted { .. })));

    assert!(handle.approve());
    let run = handle.join().await.unwrap();
    assert_eq!(run.decision, Some(Decision::AutoMerged));
    assert!(run.reason.as_deref().unwrap().contains("merged on approval"));
    assert!(run.merge_deadline.is_none());
    assert_eq!(h.vcs.applied().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_approval_before_countdown_is_honoured() {
    let doubles = Doubles::happy();
    let h = harness(&doubles);

    let handle = h.orchestrator.submit(HealRequest::file("app/views.py")).unwrap();
    assert!(handle.approve());
    let run = handle.join().await.unwrap();

    assert_eq!(run.decision, Some(Decision::AutoMerged));
    assert!(run.reason.as_deref().unwrap().contains("merged on approval"));
}

#[tokio::test(start_paused = true)]
async fn test_reject_during_countdown() {
    let doubles = Doubles::happy();
    let h = harness(&doubles);

    let handle = h.orchestrator.submit(HealRequest::file("app/views.py")).unwrap();
    wait_for_state(&handle, RunState::MergeCountdown).await;
    assert!(handle.reject());
    assert!(!handle.approve());
    let run = handle.join().await.unwrap();

    assert_eq!(run.state, RunState::Rejected);
    assert!(h.vcs.applied().is_empty());
    assert_eq!(h.knowledge.records()[0].outcome, Outcome::Failure);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_countdown_never_applies() {
    let doubles = Doubles::happy();
    let h = harness(&doubles);

    let handle = h.orchestrator.submit(HealRequest::file("app/views.py")).unwrap();
    wait_for_state(&handle, RunState::MergeCountdown).await;
    handle.cancel();
    let run = handle.join().await.unwrap();

    assert_eq!(run.decision, escalated(EscalationReason::Cancelled));
    assert!(h.vcs.applied().is_empty());
    assert_eq!(h.knowledge.records().len(), 1);
    assert_released_once(&h);
}

#[tokio::test(start_paused = true)]
async fn test_tests_failing_twice_exhausts_attempts() {
    let doubles = Doubles::happy().with(
        StageKind::Test,
        ScriptedStage::returning(StagePayload::TestOutcome(tests_passed(false))),
    );
    let h = build(
        &doubles,
        HealSettings::default().with_max_attempts(2),
        Arc::new(MemoryArtifactStore::new()),
        RecordingVcs::new(ApplyBehaviour::Apply),
    );

    let run = h
        .orchestrator
        .heal(HealRequest::file("app/views.py"), RunControls::new())
        .await
        .unwrap();

    assert_eq!(run.decision, escalated(EscalationReason::ExhaustedRetries));
    assert_eq!(run.attempts, 2);
    assert_eq!(
        transitions(&h.store, run.id).await,
        vec![
            (RunState::Admitted, RunState::Analyzing),
            (RunState::Analyzing, RunState::Planning),
            (RunState::Planning, RunState::Fixing),
            (RunState::Fixing, RunState::Testing),
            (RunState::Testing, RunState::Planning),
            (RunState::Planning, RunState::Fixing),
            (RunState::Fixing, RunState::Testing),
            (RunState::Testing, RunState::Escalated),
        ]
    );
    assert_eq!(doubles.analyze.calls(), 1);
    assert_eq!(doubles.plan.calls(), 2);
    assert_eq!(doubles.evaluate.calls(), 0);

    // The second plan sees why the first attempt failed.
    let (ctx, input) = doubles.plan.seen().pop().unwrap();
    assert_eq!(ctx.attempt, 2);
    match input {
        StageInput::Plan { failures, .. } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].kind, FailureKind::TestsFailed);
            assert_eq!(failures[0].strategy, Some(Strategy::OneLineFix));
        }
        other => panic!("unexpected input {:?}", other),
    }

    let records = h.knowledge.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Outcome::Failure);
    assert_eq!(records[0].strategy, Some(Strategy::OneLineFix));
    assert_eq!(records[0].risk_tier, None);
    assert_released_once(&h);
}

#[tokio::test(start_paused = true)]
async fn test_critic_escalate_is_immediate() {
    let doubles = Doubles::happy().with(
        StageKind::Evaluate,
        ScriptedStage::returning(StagePayload::CriticReport(critic(Verdict::Escalate, 0.9))),
    );
    let h = harness(&doubles);

    let run = h
        .orchestrator
        .heal(HealRequest::file("app/views.py"), RunControls::new())
        .await
        .unwrap();

    assert_eq!(run.decision, escalated(EscalationReason::CriticEscalated));
    assert_eq!(run.attempts, 1);
    assert_eq!(doubles.plan.calls(), 1);
    assert!(h.vcs.applied().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_critic_retry_counts_as_failure() {
    let doubles = Doubles::happy().with(
        StageKind::Evaluate,
        ScriptedStage::new([
            Step::Return(StagePayload::CriticReport(critic(Verdict::Retry, 0.4))),
            Step::Return(StagePayload::CriticReport(critic(Verdict::Pass, 0.95))),
        ]),
    );
    let h = harness(&doubles);

    let run = h
        .orchestrator
        .heal(HealRequest::file("app/views.py"), RunControls::new())
        .await
        .unwrap();

    assert_eq!(run.decision, Some(Decision::AutoMerged));
    assert_eq!(run.attempts, 2);
    let events = h.store.events(run.id).await.unwrap();
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        RunEventKind::AttemptFailed { note } if note.kind == FailureKind::CriticRetry
    )));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_patch_never_reaches_testing() {
    let doubles = Doubles::happy().with(
        StageKind::Fix,
        ScriptedStage::returning(StagePayload::Patch(invalid_patch())),
    );
    let h = build(
        &doubles,
        HealSettings::default().with_max_attempts(2),
        Arc::new(MemoryArtifactStore::new()),
        RecordingVcs::new(ApplyBehaviour::Apply),
    );

    let run = h
        .orchestrator
        .heal(HealRequest::file("app/views.py"), RunControls::new())
        .await
        .unwrap();

    assert_eq!(doubles.test.calls(), 0);
    assert_eq!(run.decision, escalated(EscalationReason::ExhaustedRetries));
    let fixes: Vec<_> = run.results_for(StageKind::Fix).collect();
    assert_eq!(fixes.len(), 2);
    for result in fixes {
        assert!(!result.success);
        assert_eq!(result.error.as_ref().unwrap().kind, StageErrorKind::SyntaxInvalid);
    }
    assert!(h.store.patches(run.id).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_no_defect_rejects_run() {
    let doubles = Doubles::happy().with(
        StageKind::Analyze,
        ScriptedStage::returning(StagePayload::NoDefect {
            summary: "all checks clean".into(),
        }),
    );
    let h = harness(&doubles);

    let run = h
        .orchestrator
        .heal(HealRequest::file("app/views.py"), RunControls::new())
        .await
        .unwrap();

    assert_eq!(run.state, RunState::Rejected);
    assert!(run.reason.as_deref().unwrap().starts_with("no defect detected"));
    assert_eq!(doubles.plan.calls(), 0);
    assert_eq!(h.knowledge.records()[0].strategy, None);
}

#[tokio::test(start_paused = true)]
async fn test_high_risk_requires_approval() {
    let doubles = Doubles::happy().with(
        StageKind::Plan,
        ScriptedStage::returning(StagePayload::RepairPlan(plan(Strategy::Refactor))),
    );
    let h = harness(&doubles);

    let run = h
        .orchestrator
        .heal(HealRequest::file("app/views.py"), RunControls::new())
        .await
        .unwrap();

    assert_eq!(run.decision, Some(Decision::PendingApproval { expires_at: None }));
    assert_eq!(run.risk_tier, Some(RiskTier::High));
    assert!(run.reason.as_deref().unwrap().contains("secondary review"));
    assert!(h.vcs.applied().is_empty());
    assert_eq!(h.knowledge.records()[0].outcome, Outcome::Success);
}

#[tokio::test(start_paused = true)]
async fn test_low_confidence_requires_approval() {
    let doubles = Doubles::happy().with(
        StageKind::Evaluate,
        ScriptedStage::returning(StagePayload::CriticReport(critic(Verdict::Pass, 0.6))),
    );
    let h = harness(&doubles);

    let run = h
        .orchestrator
        .heal(HealRequest::file("app/views.py"), RunControls::new())
        .await
        .unwrap();

    assert_eq!(run.risk_tier, Some(RiskTier::Medium));
    assert_eq!(run.state, RunState::PendingApproval);
}

#[tokio::test(start_paused = true)]
async fn test_merge_conflict_escalates() {
    let doubles = Doubles::happy();
    let h = build(
        &doubles,
        HealSettings::default(),
        Arc::new(MemoryArtifactStore::new()),
        RecordingVcs::new(ApplyBehaviour::Conflict),
    );

    let run = h
        .orchestrator
        .heal(HealRequest::file("app/views.py"), RunControls::new())
        .await
        .unwrap();

    assert_eq!(run.decision, escalated(EscalationReason::MergeConflict));
    assert!(run.reason.as_deref().unwrap().contains("hunk 1 failed"));
}

#[tokio::test(start_paused = true)]
async fn test_merge_error_escalates_as_merge_failed() {
    let doubles = Doubles::happy();
    let h = build(
        &doubles,
        HealSettings::default(),
        Arc::new(MemoryArtifactStore::new()),
        RecordingVcs::new(ApplyBehaviour::Fail),
    );

    let run = h
        .orchestrator
        .heal(HealRequest::file("app/views.py"), RunControls::new())
        .await
        .unwrap();

    assert_eq!(run.decision, escalated(EscalationReason::MergeFailed));
    assert_eq!(run.state, RunState::Escalated);
    assert!(run.reason.as_deref().unwrap().contains("index locked"));
    let patch = run.final_patch.as_ref().expect("patch recorded");
    assert_eq!(h.vcs.applied(), vec![patch.id]);
    assert!(h.vcs.rolled_back().is_empty());
    assert_eq!(h.store.patches(run.id).await.unwrap().len(), 1);
    assert_eq!(h.knowledge.records()[0].outcome, Outcome::Failure);
    assert_released_once(&h);
}

#[tokio::test(start_paused = true)]
async fn test_merge_timeout_escalates() {
    let doubles = Doubles::happy();
    let h = build(
        &doubles,
        HealSettings::default().with_vcs_timeout(Duration::from_secs(5)),
        Arc::new(MemoryArtifactStore::new()),
        RecordingVcs::new(ApplyBehaviour::Stall),
    );

    let run = h
        .orchestrator
        .heal(HealRequest::file("app/views.py"), RunControls::new())
        .await
        .unwrap();

    assert_eq!(run.decision, escalated(EscalationReason::MergeFailed));
    assert!(run.reason.as_deref().unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_stage_timeout_is_a_failure() {
    let doubles = Doubles::happy().with(
        StageKind::Plan,
        ScriptedStage::new([Step::Stall(Duration::from_secs(3600))]),
    );
    let h = build(
        &doubles,
        HealSettings::default()
            .with_max_attempts(1)
            .with_stage_timeout(StageKind::Plan, Duration::from_secs(10)),
        Arc::new(MemoryArtifactStore::new()),
        RecordingVcs::new(ApplyBehaviour::Apply),
    );

    let run = h
        .orchestrator
        .heal(HealRequest::file("app/views.py"), RunControls::new())
        .await
        .unwrap();

    assert_eq!(run.decision, escalated(EscalationReason::ExhaustedRetries));
    let plan_result = run.results_for(StageKind::Plan).next().unwrap();
    assert_eq!(
        plan_result.error.as_ref().unwrap().kind,
        StageErrorKind::StageTimeout
    );
}

#[tokio::test(start_paused = true)]
async fn test_analyze_failure_retries_analysis() {
    let doubles = Doubles::happy().with(
        StageKind::Analyze,
        ScriptedStage::new([
            Step::Panic("parser crashed".into()),
            Step::Return(StagePayload::BugReport(bug_report())),
        ]),
    );
    let h = harness(&doubles);

    let run = h
        .orchestrator
        .heal(HealRequest::file("app/views.py"), RunControls::new())
        .await
        .unwrap();

    assert_eq!(run.decision, Some(Decision::AutoMerged));
    assert_eq!(doubles.analyze.calls(), 2);
    let steps = transitions(&h.store, run.id).await;
    assert_eq!(steps[1], (RunState::Analyzing, RunState::Analyzing));
    let first = run.results_for(StageKind::Analyze).next().unwrap();
    assert!(first.error.as_ref().unwrap().message.contains("parser crashed"));
}

#[tokio::test(start_paused = true)]
async fn test_replan_policy_controls_reanalysis() {
    for (policy, analyses, back_to) in [
        (ReplanPolicy::ReuseReport, 1, RunState::Planning),
        (ReplanPolicy::Reanalyze, 2, RunState::Analyzing),
    ] {
        let doubles = Doubles::happy().with(
            StageKind::Test,
            ScriptedStage::new([
                Step::Return(StagePayload::TestOutcome(tests_passed(false))),
                Step::Return(StagePayload::TestOutcome(tests_passed(true))),
            ]),
        );
        let h = build(
            &doubles,
            HealSettings::default().with_replan_policy(policy),
            Arc::new(MemoryArtifactStore::new()),
            RecordingVcs::new(ApplyBehaviour::Apply),
        );

        let run = h
            .orchestrator
            .heal(HealRequest::file("app/views.py"), RunControls::new())
            .await
            .unwrap();

        assert_eq!(run.decision, Some(Decision::AutoMerged), "{policy}");
        assert_eq!(doubles.analyze.calls(), analyses, "{policy}");
        assert!(
            transitions(&h.store, run.id)
                .await
                .contains(&(RunState::Testing, back_to)),
            "{policy}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_knowledge_hints_reach_planner() {
    let doubles = Doubles::happy();
    let h = harness(&doubles);
    h.knowledge
        .append(crate::knowledge::KnowledgeRecord {
            fingerprint: HashingFingerprinter::default().fingerprint(&bug_report()),
            strategy: Some(Strategy::AddGuard),
            outcome: Outcome::Success,
            risk_tier: Some(RiskTier::Low),
            target: "file:app/other.py".into(),
            run_id: Uuid::new_v4(),
            recorded_at: Utc::now(),
        })
        .await
        .unwrap();

    h.orchestrator
        .heal(HealRequest::file("app/views.py"), RunControls::new())
        .await
        .unwrap();

    let (ctx, _) = doubles.plan.seen().pop().unwrap();
    assert_eq!(ctx.hints.len(), 1);
    assert_eq!(ctx.hints[0].strategy, Some(Strategy::AddGuard));
    let (analyze_ctx, _) = doubles.analyze.seen().pop().unwrap();
    assert!(analyze_ctx.hints.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_escalates_and_releases_once() {
    let doubles = Doubles::happy();
    let h = build(
        &doubles,
        HealSettings::default(),
        FlakyStore::unavailable(),
        RecordingVcs::new(ApplyBehaviour::Apply),
    );

    let run = h
        .orchestrator
        .heal(HealRequest::file("app/views.py"), RunControls::new())
        .await
        .unwrap();

    assert_eq!(run.decision, escalated(EscalationReason::InfrastructureFault));
    assert_eq!(doubles.analyze.calls(), 0);
    assert_eq!(h.knowledge.records().len(), 1);
    assert_released_once(&h);
}

#[tokio::test(start_paused = true)]
async fn test_failed_final_persist_rolls_back_merge() {
    let doubles = Doubles::happy();
    let h = build(
        &doubles,
        HealSettings::default(),
        FlakyStore::failing_when(|run| run.decision == Some(Decision::AutoMerged)),
        RecordingVcs::new(ApplyBehaviour::Apply),
    );

    let run = h
        .orchestrator
        .heal(HealRequest::file("app/views.py"), RunControls::new())
        .await
        .unwrap();

    assert_eq!(run.decision, escalated(EscalationReason::InfrastructureFault));
    assert!(run.reason.as_deref().unwrap().contains("rolled back"));
    assert_eq!(h.vcs.applied().len(), 1);
    assert_eq!(h.vcs.rolled_back(), h.vcs.applied());

    let stored = h.store.get_run(run.id).await.unwrap();
    assert_eq!(stored.state, RunState::Escalated);
    assert_eq!(h.knowledge.records()[0].outcome, Outcome::Failure);
    assert_released_once(&h);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_stage_waits_for_stage_and_records_it() {
    let doubles = Doubles::happy().with(
        StageKind::Analyze,
        ScriptedStage::new([Step::Slow(
            Duration::from_secs(5),
            StagePayload::BugReport(bug_report()),
        )]),
    );
    let h = harness(&doubles);
    let started = tokio::time::Instant::now();

    let handle = h.orchestrator.submit(HealRequest::file("app/views.py")).unwrap();
    wait_for_state(&handle, RunState::Analyzing).await;
    handle.cancel();
    let run = handle.join().await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(run.decision, escalated(EscalationReason::Cancelled));
    let analyzed: Vec<_> = run.results_for(StageKind::Analyze).collect();
    assert_eq!(analyzed.len(), 1);
    assert!(analyzed[0].success);
    assert_eq!(doubles.plan.calls(), 0);

    let stored = h.store.get_run(run.id).await.unwrap();
    assert_eq!(stored.results_for(StageKind::Analyze).count(), 1);
    assert_released_once(&h);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_stalled_stage_ends_at_stage_timeout() {
    let doubles = Doubles::happy().with(
        StageKind::Analyze,
        ScriptedStage::new([Step::Stall(Duration::from_secs(3600))]),
    );
    let h = build(
        &doubles,
        HealSettings::default().with_stage_timeout(StageKind::Analyze, Duration::from_secs(10)),
        Arc::new(MemoryArtifactStore::new()),
        RecordingVcs::new(ApplyBehaviour::Apply),
    );

    let handle = h.orchestrator.submit(HealRequest::file("app/views.py")).unwrap();
    wait_for_state(&handle, RunState::Analyzing).await;
    handle.cancel();
    let run = handle.join().await.unwrap();

    assert_eq!(run.decision, escalated(EscalationReason::Cancelled));
    let analyzed: Vec<_> = run.results_for(StageKind::Analyze).collect();
    assert_eq!(analyzed.len(), 1);
    assert_eq!(
        analyzed[0].error.as_ref().unwrap().kind,
        StageErrorKind::StageTimeout
    );
    assert_eq!(doubles.analyze.calls(), 1);
    assert_released_once(&h);
}

#[tokio::test(start_paused = true)]
async fn test_second_submit_for_active_target_is_refused() {
    let doubles = Doubles::happy();
    let h = harness(&doubles);

    let first = h.orchestrator.submit(HealRequest::file("app/views.py")).unwrap();
    let second = h.orchestrator.submit(HealRequest::file("app/views.py"));
    assert!(second.unwrap_err().is_already_running());
    let active = h
        .orchestrator
        .registry()
        .active_run(&TargetRef::file("app/views.py"));
    assert_eq!(active, Some(first.run_id()));

    first.join().await.unwrap();
    let again = h.orchestrator.submit(HealRequest::file("app/views.py")).unwrap();
    again.join().await.unwrap();
    assert_eq!(h.orchestrator.registry().released_total(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_submits_admit_exactly_one() {
    let doubles = Doubles::happy().with(
        StageKind::Analyze,
        ScriptedStage::new([Step::Stall(Duration::from_secs(30))]),
    );
    let h = harness(&doubles);
    let barrier = Arc::new(tokio::sync::Barrier::new(16));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let orchestrator = Arc::clone(&h.orchestrator);
        let barrier = Arc::clone(&barrier);
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            orchestrator.submit(HealRequest::trace("KeyError: 'user' in handler"))
        }));
    }

    let mut winners = Vec::new();
    let mut refused = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(handle) => winners.push(handle),
            Err(e) => {
                assert!(e.is_already_running());
                refused += 1;
            }
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(refused, 15);

    let winner = winners.pop().unwrap();
    winner.cancel();
    let run = winner.join().await.unwrap();
    assert_eq!(run.decision, escalated(EscalationReason::Cancelled));
    assert_released_once(&h);
}

#[tokio::test(start_paused = true)]
async fn test_rollback_reverts_auto_merged_run() {
    let doubles = Doubles::happy();
    let h = harness(&doubles);
    let run = h
        .orchestrator
        .heal(HealRequest::file("app/views.py"), RunControls::new())
        .await
        .unwrap();

    h.orchestrator.rollback(run.id).await.unwrap();
    assert_eq!(h.vcs.rolled_back(), vec![run.final_patch.unwrap().id]);
    let events = h.store.events(run.id).await.unwrap();
    assert!(matches!(
        events.last().unwrap().kind,
        RunEventKind::RolledBack { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_rollback_refuses_unmerged_run() {
    let doubles = Doubles::happy().with(
        StageKind::Plan,
        ScriptedStage::returning(StagePayload::RepairPlan(plan(Strategy::Refactor))),
    );
    let h = harness(&doubles);
    let run = h
        .orchestrator
        .heal(HealRequest::file("app/views.py"), RunControls::new())
        .await
        .unwrap();

    let err = h.orchestrator.rollback(run.id).await.unwrap_err();
    assert!(err.to_string().contains("not auto-merged"));
    assert!(h.vcs.rolled_back().is_empty());

    let missing = h.orchestrator.rollback(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(missing, HealError::Store(_)));
}

#[tokio::test(start_paused = true)]
async fn test_similar_excludes_the_run_itself() {
    let doubles = Doubles::happy();
    let h = harness(&doubles);
    let first = h
        .orchestrator
        .heal(HealRequest::file("app/views.py"), RunControls::new())
        .await
        .unwrap();
    let second = h
        .orchestrator
        .heal(HealRequest::file("app/models.py"), RunControls::new())
        .await
        .unwrap();

    let similar = h.orchestrator.similar(second.id, 5).await.unwrap();
    assert_eq!(similar.len(), 1);
    assert_eq!(similar[0].run_id, first.id);
    assert_eq!(bug_report_of(&second).category, "null_dereference");
}

fn bug_report_of(run: &RunRecord) -> &BugReport {
    super::bug_report(run).unwrap()
}
