use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::model::{Decision, RunRecord, RunState};
use crate::orchestrator::RunProgress;
use crate::ui::icons::{BLOCKER, CHECK, CLOCK, CROSS, HOLD, PIVOT, REVIEW, RUNNING};

/// Terminal view of one heal run, rendered via `indicatif`.
///
/// A spinner shows the current state; during a merge countdown a second bar
/// fills up until the deadline.
pub struct HealUi {
    multi: MultiProgress,
    status: ProgressBar,
    countdown: Option<(ProgressBar, DateTime<Utc>)>,
    attempt: u32,
    verbose: bool,
}

impl HealUi {
    pub fn new(target: &str, verbose: bool) -> Result<Self> {
        let multi = MultiProgress::new();
        let status_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .context("Invalid status template")?;
        let status = multi.add(ProgressBar::new_spinner());
        status.set_style(status_style);
        status.set_prefix("mender");
        status.set_message(format!("healing {}", style(target).cyan()));
        status.enable_steady_tick(Duration::from_millis(100));

        Ok(Self {
            multi,
            status,
            countdown: None,
            attempt: 1,
            verbose,
        })
    }

    /// Print a line above the bars, falling back to stderr.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn update(&mut self, progress: &RunProgress) -> Result<()> {
        if progress.attempt > self.attempt {
            self.print_line(format!(
                "  {}{}",
                PIVOT,
                style(format!("retrying (attempt {})", progress.attempt)).yellow()
            ));
        }
        self.attempt = progress.attempt;

        match (progress.state, progress.merge_deadline) {
            (RunState::MergeCountdown, Some(deadline)) => self.start_countdown(deadline)?,
            (state, _) if state.is_terminal() => {}
            (state, _) => {
                self.clear_countdown();
                let label = state_label(state);
                self.status.set_message(format!(
                    "{} {}",
                    label,
                    style(format!("(attempt {})", progress.attempt)).dim()
                ));
                if self.verbose {
                    self.print_line(format!("  {}{}", RUNNING, style(label).dim()));
                }
            }
        }
        Ok(())
    }

    fn start_countdown(&mut self, deadline: DateTime<Utc>) -> Result<()> {
        let total = (deadline - Utc::now()).num_seconds().max(1) as u64;
        let bar_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.green/blue}] {msg}")
            .context("Invalid countdown template")?
            .progress_chars("█▓▒░");
        let bar = self.multi.add(ProgressBar::new(total));
        bar.set_style(bar_style);
        bar.set_prefix(" merge");

        self.status.set_message(format!(
            "{}low risk patch, merging after grace period {}",
            REVIEW,
            style("(Ctrl-C cancels)").dim()
        ));
        self.countdown = Some((bar, deadline));
        self.tick();
        Ok(())
    }

    /// Bring the countdown bar up to date.
    pub fn tick(&self) {
        if let Some((bar, deadline)) = &self.countdown {
            let remaining = (*deadline - Utc::now()).num_seconds().max(0) as u64;
            let length = bar.length().unwrap_or(remaining);
            bar.set_position(length.saturating_sub(remaining));
            bar.set_message(format!("{}{}s left", CLOCK, remaining));
        }
    }

    pub fn in_countdown(&self) -> bool {
        self.countdown.is_some()
    }

    fn clear_countdown(&mut self) {
        if let Some((bar, _)) = self.countdown.take() {
            bar.finish_and_clear();
        }
    }

    pub fn finish(&mut self, run: &RunRecord) {
        self.clear_countdown();
        self.status.finish_and_clear();
        println!("{}", outcome_line(run));
    }
}

pub fn state_label(state: RunState) -> &'static str {
    match state {
        RunState::Admitted => "Admitted",
        RunState::Analyzing => "Analyzing failure",
        RunState::Planning => "Planning repair",
        RunState::Fixing => "Generating patch",
        RunState::Testing => "Running tests",
        RunState::Evaluating => "Reviewing patch",
        RunState::MergeCountdown => "Waiting to merge",
        RunState::AutoMerged => "Merged",
        RunState::PendingApproval => "Awaiting approval",
        RunState::Escalated => "Escalated",
        RunState::Rejected => "Rejected",
    }
}

/// Decision text coloured by outcome.
pub fn styled_decision(decision: &Decision) -> String {
    let text = decision.to_string();
    match decision {
        Decision::AutoMerged => style(text).green().bold().to_string(),
        Decision::PendingApproval { .. } => style(text).yellow().bold().to_string(),
        Decision::Escalated { .. } => style(text).red().bold().to_string(),
        Decision::Rejected => style(text).dim().to_string(),
    }
}

/// One-line summary of a finished run.
pub fn outcome_line(run: &RunRecord) -> String {
    let Some(decision) = &run.decision else {
        return format!("{} {}", style(run.id).dim(), state_label(run.state));
    };
    let icon = match decision {
        Decision::AutoMerged => CHECK,
        Decision::PendingApproval { .. } => HOLD,
        Decision::Escalated { .. } => BLOCKER,
        Decision::Rejected => CROSS,
    };
    format!(
        "{}{} {}",
        icon,
        styled_decision(decision),
        style(run.reason.as_deref().unwrap_or("")).dim()
    )
}
