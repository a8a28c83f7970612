//! Domain types shared by every part of the engine.
//!
//! A [`RunRecord`] is one healing attempt for one [`TargetRef`]. It moves
//! through [`RunState`]s, accumulates [`StageResult`]s and ends with exactly
//! one [`Decision`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub type RunId = Uuid;

/// Number of hex characters kept from a trace digest.
const TRACE_FINGERPRINT_LEN: usize = 16;

/// What a run heals: a source file, or a failure trace identified by its digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TargetRef {
    File { path: PathBuf },
    Trace { fingerprint: String },
}

impl TargetRef {
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::File {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Identify a trace by the digest of its whitespace-normalised text, so the
    /// same failure reported twice maps to the same registry key.
    pub fn from_trace(trace: &str) -> Self {
        let normalised = trace.split_whitespace().collect::<Vec<_>>().join(" ");
        let digest = hex::encode(Sha256::digest(normalised.as_bytes()));
        Self::Trace {
            fingerprint: digest[..TRACE_FINGERPRINT_LEN].to_string(),
        }
    }

    /// Registry identity for this target.
    pub fn key(&self) -> String {
        match self {
            Self::File { path } => format!("file:{}", path.display()),
            Self::Trace { fingerprint } => format!("trace:{}", fingerprint),
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Admitted,
    Analyzing,
    Planning,
    Fixing,
    Testing,
    Evaluating,
    /// Low-risk patch waiting out its grace period before it is merged.
    MergeCountdown,
    AutoMerged,
    PendingApproval,
    Escalated,
    Rejected,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admitted => "admitted",
            Self::Analyzing => "analyzing",
            Self::Planning => "planning",
            Self::Fixing => "fixing",
            Self::Testing => "testing",
            Self::Evaluating => "evaluating",
            Self::MergeCountdown => "merge_countdown",
            Self::AutoMerged => "auto_merged",
            Self::PendingApproval => "pending_approval",
            Self::Escalated => "escalated",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AutoMerged | Self::PendingApproval | Self::Escalated | Self::Rejected
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admitted" => Ok(Self::Admitted),
            "analyzing" => Ok(Self::Analyzing),
            "planning" => Ok(Self::Planning),
            "fixing" => Ok(Self::Fixing),
            "testing" => Ok(Self::Testing),
            "evaluating" => Ok(Self::Evaluating),
            "merge_countdown" => Ok(Self::MergeCountdown),
            "auto_merged" => Ok(Self::AutoMerged),
            "pending_approval" => Ok(Self::PendingApproval),
            "escalated" => Ok(Self::Escalated),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid run state: {}", s)),
        }
    }
}

/// Validate that a run state transition is allowed.
pub fn is_valid_transition(from: RunState, to: RunState) -> bool {
    use RunState::*;
    if from.is_terminal() {
        return false;
    }
    matches!(
        (from, to),
        (_, Escalated)
            | (Admitted, Analyzing)
            | (Analyzing | Planning | Fixing | Testing | Evaluating, Planning | Analyzing)
            | (Analyzing, Rejected)
            | (Planning, Fixing)
            | (Fixing, Testing)
            | (Testing, Evaluating)
            | (Evaluating, MergeCountdown | AutoMerged | PendingApproval)
            | (MergeCountdown, AutoMerged | Rejected)
    )
}

#[derive(Debug, Error, PartialEq)]
pub enum TransitionError {
    #[error("Invalid run state transition {from} -> {to}")]
    Invalid { from: RunState, to: RunState },

    #[error("Run already concluded with {existing}")]
    AlreadyConcluded { existing: String },
}

/// The pluggable stages, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Analyze,
    Plan,
    Fix,
    Test,
    Evaluate,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Analyze,
        StageKind::Plan,
        StageKind::Fix,
        StageKind::Test,
        StageKind::Evaluate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Plan => "plan",
            Self::Fix => "fix",
            Self::Test => "test",
            Self::Evaluate => "evaluate",
        }
    }

    /// The run state a run is in while this stage executes.
    pub fn state(&self) -> RunState {
        match self {
            Self::Analyze => RunState::Analyzing,
            Self::Plan => RunState::Planning,
            Self::Fix => RunState::Fixing,
            Self::Test => RunState::Testing,
            Self::Evaluate => RunState::Evaluating,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analyze" => Ok(Self::Analyze),
            "plan" => Ok(Self::Plan),
            "fix" => Ok(Self::Fix),
            "test" => Ok(Self::Test),
            "evaluate" => Ok(Self::Evaluate),
            _ => Err(format!("Invalid stage kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

/// Output of the Analyze stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BugReport {
    pub category: String,
    pub location: Location,
    #[serde(default)]
    pub severity: Severity,
    pub description: String,
}

/// Closed set of repair strategies a plan may choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    OneLineFix,
    AddGuard,
    FunctionReplace,
    AddTest,
    Refactor,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneLineFix => "one_line_fix",
            Self::AddGuard => "add_guard",
            Self::FunctionReplace => "function_replace",
            Self::AddTest => "add_test",
            Self::Refactor => "refactor",
        }
    }

    /// Baseline risk of the strategy in [0, 1], before looking at the patch.
    pub fn base_risk(&self) -> f64 {
        match self {
            Self::OneLineFix => 0.1,
            Self::AddTest => 0.1,
            Self::AddGuard => 0.2,
            Self::FunctionReplace => 0.5,
            Self::Refactor => 0.8,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one_line_fix" => Ok(Self::OneLineFix),
            "add_guard" => Ok(Self::AddGuard),
            "function_replace" => Ok(Self::FunctionReplace),
            "add_test" => Ok(Self::AddTest),
            "refactor" => Ok(Self::Refactor),
            _ => Err(format!("Invalid strategy: {}", s)),
        }
    }
}

/// Output of the Plan stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairPlan {
    pub strategy: Strategy,
    pub location: Location,
    /// Planner's estimate of the diff size.
    #[serde(default)]
    pub estimated_lines: u32,
    #[serde(default)]
    pub rationale: String,
}

impl RepairPlan {
    pub fn base_risk(&self) -> f64 {
        self.strategy.base_risk()
    }
}

/// Output of the Fix stage: a unified diff plus metadata.
///
/// Stages may send only `diff`; [`Patch::normalized`] fills in the counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub diff: String,
    #[serde(default)]
    pub line_count: u32,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default = "default_syntax_valid")]
    pub syntax_valid: bool,
    /// Strategy of the plan this patch was built from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
}

fn default_syntax_valid() -> bool {
    true
}

impl Patch {
    pub fn from_diff(diff: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            diff: diff.to_string(),
            line_count: 0,
            files_touched: Vec::new(),
            syntax_valid: true,
            strategy: None,
        }
        .normalized()
    }

    /// Fill in line count and touched files from the diff text when the
    /// producer left them empty.
    pub fn normalized(mut self) -> Self {
        let (lines, files) = diff_stats(&self.diff);
        if self.line_count == 0 {
            self.line_count = lines;
        }
        if self.files_touched.is_empty() {
            self.files_touched = files;
        }
        self
    }

    /// Stamp the plan this patch realises.
    pub fn bound_to(mut self, plan: &RepairPlan) -> Self {
        self.strategy = Some(plan.strategy);
        self
    }
}

/// Count changed lines and touched files in a unified diff.
///
/// Hunk headers are followed so that a removed line starting with `-- ` is
/// not mistaken for a file header.
pub fn diff_stats(diff: &str) -> (u32, Vec<String>) {
    let mut changed = 0u32;
    let mut files: Vec<String> = Vec::new();
    let mut pending_old: Option<String> = None;
    let mut hunk = HunkCursor::default();

    for line in diff.lines() {
        if hunk.is_open() {
            if hunk.consume(line) {
                changed += 1;
            }
        } else if hunk.start(line) {
            continue;
        } else if let Some(old) = line.strip_prefix("--- ") {
            pending_old = Some(strip_diff_prefix(old));
        } else if let Some(new) = line.strip_prefix("+++ ") {
            let new = strip_diff_prefix(new);
            let file = if new == "/dev/null" {
                pending_old.take().unwrap_or(new)
            } else {
                new
            };
            if !files.contains(&file) {
                files.push(file);
            }
        } else if line.starts_with('+') || line.starts_with('-') {
            // Past the declared hunk length; count it rather than under-report.
            changed += 1;
        }
    }
    (changed, files)
}

/// Position inside the current hunk while walking a unified diff.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HunkCursor {
    old: u32,
    new: u32,
}

impl HunkCursor {
    /// True while the open hunk still expects body lines.
    pub(crate) fn is_open(&self) -> bool {
        self.old > 0 || self.new > 0
    }

    /// Open a hunk if `line` is a `@@ -a,b +c,d @@` header.
    pub(crate) fn start(&mut self, line: &str) -> bool {
        match line.strip_prefix("@@ ").and_then(hunk_counts) {
            Some((old, new)) => {
                self.old = old;
                self.new = new;
                true
            }
            None => false,
        }
    }

    /// Account for one body line; returns whether it is a change.
    pub(crate) fn consume(&mut self, line: &str) -> bool {
        match line.as_bytes().first() {
            Some(b'-') => {
                self.old = self.old.saturating_sub(1);
                true
            }
            Some(b'+') => {
                self.new = self.new.saturating_sub(1);
                true
            }
            Some(b'\\') => false,
            _ => {
                self.old = self.old.saturating_sub(1);
                self.new = self.new.saturating_sub(1);
                false
            }
        }
    }
}

/// Old and new line counts from the body of a `@@ -a,b +c,d @@` header.
fn hunk_counts(header: &str) -> Option<(u32, u32)> {
    let mut ranges = header.split_whitespace();
    let old = ranges.next()?.strip_prefix('-')?;
    let new = ranges.next()?.strip_prefix('+')?;
    let count = |range: &str| match range.split_once(',') {
        Some((_, len)) => len.parse::<u32>().ok(),
        None => range.parse::<u32>().ok().map(|_| 1),
    };
    Some((count(old)?, count(new)?))
}

fn strip_diff_prefix(path: &str) -> String {
    let path = path.split('\t').next().unwrap_or(path).trim();
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
        .to_string()
}

/// Output of the Test stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub passed: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub generated_tests: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    #[serde(alias = "PASS")]
    Pass,
    #[serde(alias = "RETRY")]
    Retry,
    #[serde(alias = "ESCALATE")]
    Escalate,
}

/// Output of the Evaluate (critic) stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticReport {
    pub verdict: Verdict,
    #[serde(default)]
    pub notes: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

/// Structured payload produced by a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StagePayload {
    BugReport(BugReport),
    /// Analysis found nothing to repair.
    NoDefect { summary: String },
    RepairPlan(RepairPlan),
    Patch(Patch),
    TestOutcome(TestOutcome),
    CriticReport(CriticReport),
}

impl StagePayload {
    /// The stage kind allowed to produce this payload.
    pub fn stage(&self) -> StageKind {
        match self {
            Self::BugReport(_) | Self::NoDefect { .. } => StageKind::Analyze,
            Self::RepairPlan(_) => StageKind::Plan,
            Self::Patch(_) => StageKind::Fix,
            Self::TestOutcome(_) => StageKind::Test,
            Self::CriticReport(_) => StageKind::Evaluate,
        }
    }
}

/// Input handed to a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "stage")]
pub enum StageInput {
    Analyze {
        target: TargetRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace: Option<String>,
    },
    Plan {
        bug: BugReport,
        failures: Vec<FailureNote>,
    },
    Fix {
        bug: BugReport,
        plan: RepairPlan,
    },
    Test {
        bug: BugReport,
        plan: RepairPlan,
        patch: Patch,
    },
    Evaluate {
        bug: BugReport,
        plan: RepairPlan,
        patch: Patch,
        test: TestOutcome,
    },
}

impl StageInput {
    pub fn stage(&self) -> StageKind {
        match self {
            Self::Analyze { .. } => StageKind::Analyze,
            Self::Plan { .. } => StageKind::Plan,
            Self::Fix { .. } => StageKind::Fix,
            Self::Test { .. } => StageKind::Test,
            Self::Evaluate { .. } => StageKind::Evaluate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageErrorKind {
    StageTimeout,
    StageFailure,
    SyntaxInvalid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub kind: StageErrorKind,
    pub message: String,
}

/// Record of one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageKind,
    pub attempt: u32,
    /// Digest of the serialised stage input.
    pub input_ref: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<StagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl StageResult {
    /// Turn a successful result into a failure, keeping the payload for diagnostics.
    pub fn into_failure(mut self, kind: StageErrorKind, message: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(StageError {
            kind,
            message: message.into(),
        });
        self
    }
}

/// Why an attempt failed; fed back to the planner on the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    StageTimeout,
    StageFailure,
    SyntaxInvalid,
    TestsFailed,
    CriticRetry,
}

impl From<StageErrorKind> for FailureKind {
    fn from(kind: StageErrorKind) -> Self {
        match kind {
            StageErrorKind::StageTimeout => FailureKind::StageTimeout,
            StageErrorKind::StageFailure => FailureKind::StageFailure,
            StageErrorKind::SyntaxInvalid => FailureKind::SyntaxInvalid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureNote {
    pub attempt: u32,
    pub stage: StageKind,
    pub kind: FailureKind,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationReason {
    ExhaustedRetries,
    Cancelled,
    InfrastructureFault,
    CriticEscalated,
    MergeConflict,
    MergeFailed,
}

impl EscalationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExhaustedRetries => "EXHAUSTED_RETRIES",
            Self::Cancelled => "CANCELLED",
            Self::InfrastructureFault => "INFRASTRUCTURE_FAULT",
            Self::CriticEscalated => "CRITIC_ESCALATED",
            Self::MergeConflict => "MERGE_CONFLICT",
            Self::MergeFailed => "MERGE_FAILED",
        }
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Decision {
    AutoMerged,
    PendingApproval {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
    },
    Escalated {
        reason: EscalationReason,
    },
    Rejected,
}

impl Decision {
    pub fn escalated(reason: EscalationReason) -> Self {
        Self::Escalated { reason }
    }

    /// The terminal state this decision maps to.
    pub fn terminal_state(&self) -> RunState {
        match self {
            Self::AutoMerged => RunState::AutoMerged,
            Self::PendingApproval { .. } => RunState::PendingApproval,
            Self::Escalated { .. } => RunState::Escalated,
            Self::Rejected => RunState::Rejected,
        }
    }

    /// A verified patch came out of the run.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::AutoMerged | Self::PendingApproval { .. })
    }

    pub fn escalation_reason(&self) -> Option<EscalationReason> {
        match self {
            Self::Escalated { reason } => Some(*reason),
            _ => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutoMerged => write!(f, "AUTO_MERGED"),
            Self::PendingApproval { expires_at: None } => write!(f, "PENDING_APPROVAL"),
            Self::PendingApproval {
                expires_at: Some(at),
            } => write!(f, "PENDING_APPROVAL (auto-merge at {})", at.to_rfc3339()),
            Self::Escalated { reason } => write!(f, "ESCALATED ({})", reason),
            Self::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Persisted record of one healing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub target: TargetRef,
    pub state: RunState,
    pub attempts: u32,
    #[serde(default)]
    pub stage_results: Vec<StageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    /// Human-readable explanation of the decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_tier: Option<RiskTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_patch: Option<Patch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(id: RunId, target: TargetRef) -> Self {
        let now = Utc::now();
        Self {
            id,
            target,
            state: RunState::Admitted,
            attempts: 1,
            stage_results: Vec::new(),
            decision: None,
            reason: None,
            strategy: None,
            risk_tier: None,
            final_patch: None,
            merge_deadline: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to a non-terminal state. Terminal states go through [`RunRecord::conclude`].
    pub fn advance(&mut self, to: RunState) -> Result<RunState, TransitionError> {
        let from = self.state;
        if to.is_terminal() || !is_valid_transition(from, to) {
            return Err(TransitionError::Invalid { from, to });
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(from)
    }

    /// Set the decision and its terminal state. Succeeds at most once.
    pub fn conclude(
        &mut self,
        decision: Decision,
        reason: impl Into<String>,
    ) -> Result<RunState, TransitionError> {
        if let Some(existing) = &self.decision {
            return Err(TransitionError::AlreadyConcluded {
                existing: existing.to_string(),
            });
        }
        let from = self.state;
        let to = decision.terminal_state();
        if !is_valid_transition(from, to) {
            return Err(TransitionError::Invalid { from, to });
        }
        let now = Utc::now();
        self.state = to;
        self.decision = Some(decision);
        self.reason = Some(reason.into());
        self.merge_deadline = None;
        self.updated_at = now;
        self.finished_at = Some(now);
        Ok(from)
    }

    /// The decision as an outside observer should see it: the final decision
    /// once set, or a provisional pending approval with its deadline while a
    /// merge countdown is running.
    pub fn visible_decision(&self) -> Option<Decision> {
        if let Some(decision) = &self.decision {
            return Some(decision.clone());
        }
        match (self.state, self.merge_deadline) {
            (RunState::MergeCountdown, Some(deadline)) => Some(Decision::PendingApproval {
                expires_at: Some(deadline),
            }),
            _ => None,
        }
    }

    /// Results of the given stage, in append order.
    pub fn results_for(&self, stage: StageKind) -> impl Iterator<Item = &StageResult> {
        self.stage_results.iter().filter(move |r| r.stage == stage)
    }
}
