//! Risk policy: decides how a verified patch is handled.
//!
//! Classification is a pure function of four inputs:
//!
//! - **HIGH**: tests did not pass, the strategy is in the high-risk set, or the
//!   patch exceeds `max_patch_lines`
//! - **MEDIUM**: critic confidence below `confidence_threshold`
//! - **LOW**: everything else
//!
//! LOW patches are merged after a grace countdown (unless auto-merge is
//! disabled); MEDIUM and HIGH wait for approval, HIGH with a secondary review.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::RiskSection;
use crate::model::{RiskTier, Strategy};

/// What the orchestrator does with a classified patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum RiskAction {
    /// Merge once the grace period passes without a veto.
    AutoMerge { grace: Duration },
    /// Hold for a human decision.
    RequireApproval { secondary_review: bool },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskInputs {
    pub confidence: f64,
    pub patch_lines: u32,
    pub strategy: Strategy,
    pub tests_passed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskAssessment {
    pub tier: RiskTier,
    pub action: RiskAction,
}

impl RiskAssessment {
    /// Human-readable explanation for the run record.
    pub fn describe(&self) -> String {
        match self.action {
            RiskAction::AutoMerge { grace } => format!(
                "{} risk: auto-merge after {}s grace period",
                self.tier,
                grace.as_secs()
            ),
            RiskAction::RequireApproval {
                secondary_review: true,
            } => format!("{} risk: approval and secondary review required", self.tier),
            RiskAction::RequireApproval {
                secondary_review: false,
            } => format!("{} risk: approval required", self.tier),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskPolicy {
    pub max_patch_lines: u32,
    pub confidence_threshold: f64,
    pub high_risk_strategies: Vec<Strategy>,
    pub grace: Duration,
    pub auto_merge: bool,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self::from_config(&RiskSection::default())
    }
}

impl RiskPolicy {
    pub fn from_config(section: &RiskSection) -> Self {
        Self {
            max_patch_lines: section.max_patch_lines,
            confidence_threshold: section.confidence_threshold,
            high_risk_strategies: section.high_risk_strategies.clone(),
            grace: Duration::from_secs(section.grace_secs),
            auto_merge: section.auto_merge,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_auto_merge(mut self, auto_merge: bool) -> Self {
        self.auto_merge = auto_merge;
        self
    }

    pub fn tier(&self, inputs: &RiskInputs) -> RiskTier {
        if !inputs.tests_passed {
            return RiskTier::High;
        }
        if self.high_risk_strategies.contains(&inputs.strategy)
            || inputs.patch_lines > self.max_patch_lines
        {
            return RiskTier::High;
        }
        let confidence = clamp_confidence(inputs.confidence);
        if confidence < self.confidence_threshold {
            return RiskTier::Medium;
        }
        RiskTier::Low
    }

    pub fn classify(&self, inputs: &RiskInputs) -> RiskAssessment {
        let tier = self.tier(inputs);
        let action = match tier {
            RiskTier::Low if self.auto_merge => RiskAction::AutoMerge { grace: self.grace },
            RiskTier::Low | RiskTier::Medium => RiskAction::RequireApproval {
                secondary_review: false,
            },
            RiskTier::High => RiskAction::RequireApproval {
                secondary_review: true,
            },
        };
        RiskAssessment { tier, action }
    }
}

/// Clamp into [0, 1]; NaN counts as no confidence.
fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}
