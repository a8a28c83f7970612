//! Configuration view and validation commands — `mender config`.

use anyhow::{Context, Result, bail};
use std::path::Path;

use mender::config::{MenderConfig, MenderToml, default_config_template};
use mender::model::StageKind;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config = MenderConfig::new(project_dir.to_path_buf())?;
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Mender Configuration");
            println!("====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No mender.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            // Env overrides are already applied by MenderConfig::new.
            print_sections(&config.toml);

            println!("Effective paths:");
            println!("  database = {}", config.database_path().display());
            println!("  knowledge = {}", config.knowledge_path().display());
            println!();

            if !config_path.exists() {
                println!("Run 'mender config init' to create a mender.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let report = config.validate();
            if !report.warnings.is_empty() {
                println!("Configuration warnings:");
                for warning in &report.warnings {
                    println!("  - {}", warning);
                }
                println!();
            }
            if !report.is_ok() {
                println!("Configuration errors:");
                for error in &report.errors {
                    println!("  - {}", error);
                }
                println!();
                bail!("{} configuration error(s)", report.errors.len());
            }
            println!("Configuration is valid.");
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                bail!(
                    "mender.toml already exists at {}. Delete it first if you want to recreate it.",
                    config_path.display()
                );
            }

            std::fs::create_dir_all(&config.mender_dir).with_context(|| {
                format!("Failed to create {}", config.mender_dir.display())
            })?;
            std::fs::write(&config_path, default_config_template())
                .with_context(|| format!("Failed to write {}", config_path.display()))?;

            println!("Created mender.toml at {}", config_path.display());
            println!();
            println!("Next, point each stage at a command:");
            println!("  - [stages.analyze] ... [stages.evaluate] command");
            println!("  - [risk] thresholds and grace_secs");
            println!();
        }
    }

    Ok(())
}

fn print_sections(toml: &MenderToml) {
    println!("[healing]");
    println!("  max_attempts = {}", toml.healing.max_attempts);
    println!("  replan_policy = \"{}\"", toml.healing.replan_policy);
    println!("  nearest_k = {}", toml.healing.nearest_k);
    println!();

    println!("[timeouts]");
    for kind in StageKind::ALL {
        println!("  {} = {}s", kind, toml.timeouts.for_stage(kind));
    }
    println!("  vcs = {}s", toml.timeouts.vcs);
    println!();

    println!("[risk]");
    println!("  max_patch_lines = {}", toml.risk.max_patch_lines);
    println!(
        "  confidence_threshold = {}",
        toml.risk.confidence_threshold
    );
    let strategies: Vec<String> = toml
        .risk
        .high_risk_strategies
        .iter()
        .map(|s| format!("\"{}\"", s))
        .collect();
    println!("  high_risk_strategies = [{}]", strategies.join(", "));
    println!("  grace_secs = {}", toml.risk.grace_secs);
    println!("  auto_merge = {}", toml.risk.auto_merge);
    println!();

    println!("[stages]");
    for kind in StageKind::ALL {
        match toml.stages.get(&kind) {
            Some(stage) => println!("  {} = \"{}\"", kind, stage.command),
            None => println!("  {} = (not configured)", kind),
        }
    }
    println!();
}
