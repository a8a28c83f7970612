//! Outside control of a running heal: cancellation, countdown arbitration and
//! progress.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::model::RunState;

/// Contenders for the end of a merge countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeVerdict {
    TimerFired,
    Approved,
    Rejected,
    Cancelled,
}

/// Write-once cell deciding how a countdown ends. The first claim wins and
/// every later claim observes the winner.
#[derive(Debug, Clone)]
pub struct DecisionCell {
    slot: Arc<watch::Sender<Option<MergeVerdict>>>,
}

impl Default for DecisionCell {
    fn default() -> Self {
        Self::new()
    }
}

impl DecisionCell {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Returns true only for the claim that settled the cell.
    pub fn claim(&self, verdict: MergeVerdict) -> bool {
        self.slot.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(verdict);
            true
        })
    }

    /// Claim `verdict` and return whichever verdict holds the cell afterwards.
    pub fn resolve(&self, verdict: MergeVerdict) -> MergeVerdict {
        self.claim(verdict);
        self.winner().unwrap_or(verdict)
    }

    pub fn winner(&self) -> Option<MergeVerdict> {
        *self.slot.borrow()
    }

    /// Wait until some claim settles the cell.
    pub async fn settled(&self) -> MergeVerdict {
        let mut rx = self.slot.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(value) => value.unwrap_or(MergeVerdict::Cancelled),
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => MergeVerdict::Cancelled,
        }
    }
}

/// Where a run currently is, as published to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct RunProgress {
    pub state: RunState,
    pub attempt: u32,
    pub merge_deadline: Option<DateTime<Utc>>,
}

impl Default for RunProgress {
    fn default() -> Self {
        Self {
            state: RunState::Admitted,
            attempt: 1,
            merge_deadline: None,
        }
    }
}

/// Handles shared between a running heal and whoever started it.
#[derive(Debug, Clone)]
pub struct RunControls {
    cancel: CancellationToken,
    decision: DecisionCell,
    progress: Arc<watch::Sender<RunProgress>>,
}

impl Default for RunControls {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControls {
    pub fn new() -> Self {
        let (progress, _) = watch::channel(RunProgress::default());
        Self {
            cancel: CancellationToken::new(),
            decision: DecisionCell::new(),
            progress: Arc::new(progress),
        }
    }

    /// Controls that also stop when `parent` is cancelled.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            ..Self::new()
        }
    }

    /// Stop the run at its next checkpoint. During a countdown this wins the
    /// race unless the countdown is already decided.
    pub fn cancel(&self) {
        self.decision.claim(MergeVerdict::Cancelled);
        self.cancel.cancel();
    }

    /// Merge without waiting out the grace period. An approval given before
    /// the countdown starts is honoured when it does.
    pub fn approve(&self) -> bool {
        self.decision.claim(MergeVerdict::Approved)
    }

    /// Veto the pending merge.
    pub fn reject(&self) -> bool {
        self.decision.claim(MergeVerdict::Rejected)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn decision(&self) -> &DecisionCell {
        &self.decision
    }

    pub fn progress(&self) -> watch::Receiver<RunProgress> {
        self.progress.subscribe()
    }

    pub(crate) fn publish(&self, progress: RunProgress) {
        self.progress.send_replace(progress);
    }
}
