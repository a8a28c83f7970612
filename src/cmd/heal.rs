//! One healing attempt — `mender heal`.

use anyhow::{Context, Result};
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mender::config::MenderConfig;
use mender::knowledge::{JsonlKnowledgeStore, KnowledgeBase};
use mender::risk::RiskPolicy;
use mender::stage::{CommandStage, StageSet};
use mender::store::ArtifactStore;
use mender::ui::HealUi;
use mender::vcs::GitWorkspace;
use mender::{HealRequest, Orchestrator};

use super::{open_store, short_id};
use crate::Cli;

/// Settings key holding the configuration the last heal ran with.
const EFFECTIVE_CONFIG_KEY: &str = "last_heal_config";

pub enum HealTarget {
    File(PathBuf),
    /// Path to a file holding the failure trace.
    Trace(PathBuf),
}

pub async fn cmd_heal(
    project_dir: &Path,
    cli: &Cli,
    target: HealTarget,
    approve: bool,
    max_attempts: Option<u32>,
    grace_secs: Option<u64>,
) -> Result<()> {
    let config = MenderConfig::with_cli_args(
        project_dir.to_path_buf(),
        cli.verbose,
        max_attempts,
        grace_secs,
    )?;
    let report = config.validate();
    if !report.is_ok() {
        anyhow::bail!(
            "Invalid configuration in {}:\n  - {}",
            config.config_file().display(),
            report.errors.join("\n  - ")
        );
    }

    let request = match target {
        HealTarget::File(path) => HealRequest::file(path),
        HealTarget::Trace(path) => {
            let trace = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read trace file: {}", path.display()))?;
            HealRequest::trace(trace)
        }
    };

    let stages = build_stages(&config)?;
    let vcs = GitWorkspace::open(&config.project_dir)
        .context("mender heal must run inside a git work tree")?;
    let store = open_store(&config)?;
    let knowledge = KnowledgeBase::new(Arc::new(JsonlKnowledgeStore::new(
        config.knowledge_path(),
    )));

    let effective = toml::to_string(&config.toml).context("Failed to serialize configuration")?;
    store.set_setting(EFFECTIVE_CONFIG_KEY, &effective).await?;

    let orchestrator = Arc::new(
        Orchestrator::new(stages, store.clone(), knowledge, Arc::new(vcs))
            .with_settings(config.heal_settings())
            .with_risk_policy(RiskPolicy::from_config(&config.toml.risk)),
    );

    let target_label = request.target.to_string();
    let handle = match orchestrator.submit(request) {
        Ok(handle) => handle,
        Err(e) => {
            store.close().await?;
            return Err(e.into());
        }
    };
    if approve {
        handle.approve();
    }

    let mut ui = HealUi::new(&target_label, cli.verbose)?;
    let controls = handle.controls().clone();
    let mut progress = handle.progress();
    let mut finished = Box::pin(handle.join());
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    let run = loop {
        tokio::select! {
            result = &mut finished => break result?,
            changed = progress.changed() => {
                if changed.is_ok() {
                    let snapshot = progress.borrow_and_update().clone();
                    ui.update(&snapshot)?;
                }
            }
            _ = ticker.tick(), if ui.in_countdown() => ui.tick(),
            signal = &mut ctrl_c, if !interrupted => {
                signal.context("Failed to listen for Ctrl-C")?;
                interrupted = true;
                controls.cancel();
            }
        }
    };

    ui.finish(&run);
    println!(
        "Run {} ({} attempt{}). Details: {}",
        style(short_id(&run.id)).cyan(),
        run.attempts,
        if run.attempts == 1 { "" } else { "s" },
        style(format!("mender show {}", short_id(&run.id))).dim()
    );

    store.close().await?;
    Ok(())
}

/// One command stage per configured kind.
fn build_stages(config: &MenderConfig) -> Result<StageSet> {
    let mut builder = StageSet::builder();
    for (kind, command) in &config.toml.stages {
        builder = builder.with(
            *kind,
            Arc::new(CommandStage::from_config(*kind, command, &config.project_dir)),
        );
    }
    builder.build().with_context(|| {
        format!(
            "Every stage needs a command under [stages.<kind>] in {}",
            config.config_file().display()
        )
    })
}
