//! Configuration for mender.
//!
//! Settings are read from `.mender/mender.toml` and layered
//! file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [healing]
//! max_attempts = 3
//! replan_policy = "reuse_report"
//! nearest_k = 5
//!
//! [timeouts]
//! analyze = 120
//! plan = 120
//! fix = 300
//! test = 600
//! evaluate = 120
//! vcs = 30
//!
//! [risk]
//! max_patch_lines = 25
//! confidence_threshold = 0.85
//! high_risk_strategies = ["refactor"]
//! grace_secs = 30
//! auto_merge = true
//!
//! [stages.analyze]
//! command = "./scripts/analyze.sh"
//!
//! [storage]
//! database = ".mender/runs.db"
//! knowledge = "~/.mender/knowledge.jsonl"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::{StageKind, Strategy};

pub const CONFIG_DIR: &str = ".mender";
pub const CONFIG_FILE: &str = "mender.toml";

/// What a retry goes back to after a failure past analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplanPolicy {
    /// Keep the bug report and return to planning.
    #[default]
    ReuseReport,
    /// Throw the report away and analyze again.
    Reanalyze,
}

impl std::fmt::Display for ReplanPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplanPolicy::ReuseReport => write!(f, "reuse_report"),
            ReplanPolicy::Reanalyze => write!(f, "reanalyze"),
        }
    }
}

impl std::str::FromStr for ReplanPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reuse_report" => Ok(ReplanPolicy::ReuseReport),
            "reanalyze" => Ok(ReplanPolicy::Reanalyze),
            _ => anyhow::bail!(
                "Invalid replan policy '{}'. Valid values: reuse_report, reanalyze",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingSection {
    /// Upper bound on attempts per run
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub replan_policy: ReplanPolicy,
    /// Knowledge records handed to the planner as hints
    #[serde(default = "default_nearest_k")]
    pub nearest_k: usize,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_nearest_k() -> usize {
    5
}

impl Default for HealingSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            replan_policy: ReplanPolicy::default(),
            nearest_k: default_nearest_k(),
        }
    }
}

/// Per-stage timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_analyze_secs")]
    pub analyze: u64,
    #[serde(default = "default_plan_secs")]
    pub plan: u64,
    #[serde(default = "default_fix_secs")]
    pub fix: u64,
    #[serde(default = "default_test_secs")]
    pub test: u64,
    #[serde(default = "default_evaluate_secs")]
    pub evaluate: u64,
    /// Bound on each version-control mutation
    #[serde(default = "default_vcs_secs")]
    pub vcs: u64,
}

fn default_analyze_secs() -> u64 {
    120
}

fn default_plan_secs() -> u64 {
    120
}

fn default_fix_secs() -> u64 {
    300
}

fn default_test_secs() -> u64 {
    600
}

fn default_evaluate_secs() -> u64 {
    120
}

fn default_vcs_secs() -> u64 {
    30
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            analyze: default_analyze_secs(),
            plan: default_plan_secs(),
            fix: default_fix_secs(),
            test: default_test_secs(),
            evaluate: default_evaluate_secs(),
            vcs: default_vcs_secs(),
        }
    }
}

impl TimeoutsSection {
    pub fn for_stage(&self, kind: StageKind) -> u64 {
        match kind {
            StageKind::Analyze => self.analyze,
            StageKind::Plan => self.plan,
            StageKind::Fix => self.fix,
            StageKind::Test => self.test,
            StageKind::Evaluate => self.evaluate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSection {
    #[serde(default = "default_max_patch_lines")]
    pub max_patch_lines: u32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_high_risk_strategies")]
    pub high_risk_strategies: Vec<Strategy>,
    /// Countdown before a low-risk patch is merged
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    /// When false, low-risk patches also wait for approval
    #[serde(default = "default_auto_merge")]
    pub auto_merge: bool,
}

fn default_max_patch_lines() -> u32 {
    25
}

fn default_confidence_threshold() -> f64 {
    0.85
}

fn default_high_risk_strategies() -> Vec<Strategy> {
    vec![Strategy::Refactor]
}

fn default_grace_secs() -> u64 {
    30
}

fn default_auto_merge() -> bool {
    true
}

impl Default for RiskSection {
    fn default() -> Self {
        Self {
            max_patch_lines: default_max_patch_lines(),
            confidence_threshold: default_confidence_threshold(),
            high_risk_strategies: default_high_risk_strategies(),
            grace_secs: default_grace_secs(),
            auto_merge: default_auto_merge(),
        }
    }
}

/// Command backing one stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageCommand {
    pub command: String,
    /// Working directory, relative to the project (defaults to the project root)
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default)]
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub knowledge: Option<PathBuf>,
}

/// Contents of `mender.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MenderToml {
    #[serde(default)]
    pub healing: HealingSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub risk: RiskSection,
    #[serde(default)]
    pub stages: BTreeMap<StageKind, StageCommand>,
    #[serde(default)]
    pub storage: StorageSection,
}

/// Outcome of [`MenderToml::validate`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl MenderToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse mender.toml")
    }

    /// Load `mender.toml` from the given directory, or defaults if it is absent.
    pub fn load_or_default(mender_dir: &Path) -> Result<Self> {
        let config_path = mender_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize mender.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `MENDER_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`. Unset keys leave the file value.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MENDER_MAX_ATTEMPTS") {
            self.healing.max_attempts = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid MENDER_MAX_ATTEMPTS '{}'", v))?;
        }
        if let Some(v) = lookup("MENDER_GRACE_SECS") {
            self.risk.grace_secs = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid MENDER_GRACE_SECS '{}'", v))?;
        }
        if let Some(v) = lookup("MENDER_CONFIDENCE_THRESHOLD") {
            self.risk.confidence_threshold = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid MENDER_CONFIDENCE_THRESHOLD '{}'", v))?;
        }
        if let Some(v) = lookup("MENDER_MAX_PATCH_LINES") {
            self.risk.max_patch_lines = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid MENDER_MAX_PATCH_LINES '{}'", v))?;
        }
        if let Some(v) = lookup("MENDER_AUTO_MERGE") {
            self.risk.auto_merge = !matches!(v.trim(), "false" | "0" | "no" | "off");
        }
        Ok(())
    }

    /// Check the configuration. Errors make it unusable; warnings do not.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.healing.max_attempts == 0 {
            report
                .errors
                .push("healing.max_attempts must be at least 1".to_string());
        }

        let threshold = self.risk.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) || threshold.is_nan() {
            report.errors.push(format!(
                "risk.confidence_threshold {} is outside [0, 1]",
                threshold
            ));
        }

        for kind in StageKind::ALL {
            if self.timeouts.for_stage(kind) == 0 {
                report
                    .errors
                    .push(format!("timeouts.{} must be greater than zero", kind));
            }
        }
        if self.timeouts.vcs == 0 {
            report
                .errors
                .push("timeouts.vcs must be greater than zero".to_string());
        }

        for kind in StageKind::ALL {
            match self.stages.get(&kind) {
                None => report
                    .warnings
                    .push(format!("No command configured for stage '{}'", kind)),
                Some(stage) if stage.command.trim().is_empty() => report
                    .warnings
                    .push(format!("Empty command for stage '{}'", kind)),
                Some(_) => {}
            }
        }

        if self.healing.nearest_k == 0 {
            report
                .warnings
                .push("healing.nearest_k is 0: planner gets no similar-fix hints".to_string());
        }

        report
    }

    /// Resolve the runtime settings the orchestrator uses.
    pub fn heal_settings(&self) -> HealSettings {
        HealSettings {
            max_attempts: self.healing.max_attempts,
            replan_policy: self.healing.replan_policy,
            nearest_k: self.healing.nearest_k,
            stage_timeouts: StageKind::ALL
                .into_iter()
                .map(|kind| (kind, Duration::from_secs(self.timeouts.for_stage(kind))))
                .collect(),
            vcs_timeout: Duration::from_secs(self.timeouts.vcs),
        }
    }
}

/// Orchestrator settings resolved from configuration.
#[derive(Debug, Clone)]
pub struct HealSettings {
    pub max_attempts: u32,
    pub replan_policy: ReplanPolicy,
    pub nearest_k: usize,
    pub stage_timeouts: BTreeMap<StageKind, Duration>,
    pub vcs_timeout: Duration,
}

impl Default for HealSettings {
    fn default() -> Self {
        MenderToml::default().heal_settings()
    }
}

impl HealSettings {
    pub fn stage_timeout(&self, kind: StageKind) -> Duration {
        self.stage_timeouts
            .get(&kind)
            .copied()
            .unwrap_or_else(|| Duration::from_secs(TimeoutsSection::default().for_stage(kind)))
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_replan_policy(mut self, policy: ReplanPolicy) -> Self {
        self.replan_policy = policy;
        self
    }

    pub fn with_stage_timeout(mut self, kind: StageKind, timeout: Duration) -> Self {
        self.stage_timeouts.insert(kind, timeout);
        self
    }

    pub fn with_vcs_timeout(mut self, timeout: Duration) -> Self {
        self.vcs_timeout = timeout;
        self
    }
}

/// Configuration merged from file, environment and CLI for one project.
#[derive(Debug, Clone)]
pub struct MenderConfig {
    pub project_dir: PathBuf,
    pub mender_dir: PathBuf,
    pub toml: MenderToml,
    pub verbose: bool,
}

impl MenderConfig {
    /// Load configuration for a project directory, applying environment overrides.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let mender_dir = project_dir.join(CONFIG_DIR);
        let mut toml = MenderToml::load_or_default(&mender_dir)?;
        toml.apply_env_overrides()?;

        Ok(Self {
            project_dir,
            mender_dir,
            toml,
            verbose: false,
        })
    }

    /// Load configuration and apply CLI overrides on top.
    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        max_attempts: Option<u32>,
        grace_secs: Option<u64>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        if let Some(max_attempts) = max_attempts {
            config.toml.healing.max_attempts = max_attempts;
        }
        if let Some(grace_secs) = grace_secs {
            config.toml.risk.grace_secs = grace_secs;
        }
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.mender_dir.join(CONFIG_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.mender_dir.join("logs")
    }

    /// Path of the run database; relative paths resolve against the project.
    pub fn database_path(&self) -> PathBuf {
        match &self.toml.storage.database {
            Some(path) => self.resolve(path),
            None => self.mender_dir.join("runs.db"),
        }
    }

    /// Path of the knowledge log. Defaults to the user's global mender directory
    /// so learning carries across projects.
    pub fn knowledge_path(&self) -> PathBuf {
        match &self.toml.storage.knowledge {
            Some(path) => self.resolve(path),
            None => dirs::home_dir()
                .map(|home| home.join(CONFIG_DIR).join("knowledge.jsonl"))
                .unwrap_or_else(|| self.mender_dir.join("knowledge.jsonl")),
        }
    }

    pub fn heal_settings(&self) -> HealSettings {
        self.toml.heal_settings()
    }

    pub fn validate(&self) -> ValidationReport {
        self.toml.validate()
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if let Ok(rest) = path.strip_prefix("~")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(rest);
        }
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }
}

/// Starter `mender.toml` written by `mender config init`.
pub fn default_config_template() -> String {
    r#"# mender configuration

[healing]
max_attempts = 3
# "reuse_report" keeps the bug report on retry, "reanalyze" starts over
replan_policy = "reuse_report"
nearest_k = 5

[timeouts]
analyze = 120
plan = 120
fix = 300
test = 600
evaluate = 120
vcs = 30

[risk]
max_patch_lines = 25
confidence_threshold = 0.85
high_risk_strategies = ["refactor"]
grace_secs = 30
auto_merge = true

# Each stage reads {"context": ..., "input": ...} on stdin and prints its JSON payload.
# [stages.analyze]
# command = "./scripts/analyze.sh"
# [stages.plan]
# command = "./scripts/plan.sh"
# [stages.fix]
# command = "./scripts/fix.sh"
# [stages.test]
# command = "./scripts/test.sh"
# [stages.evaluate]
# command = "./scripts/evaluate.sh"

[storage]
database = ".mender/runs.db"
"#
    .to_string()
}
