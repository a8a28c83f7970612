//! One run in detail — `mender show`.

use anyhow::Result;
use console::style;
use std::path::Path;

use mender::model::{Decision, RunRecord};
use mender::store::ArtifactStore;
use mender::ui::{state_label, styled_decision};

use super::{load_config, open_store, resolve_run_id};

pub async fn cmd_show(project_dir: &Path, raw_id: &str, log: bool) -> Result<()> {
    let config = load_config(project_dir)?;
    let store = open_store(&config)?;
    let run_id = resolve_run_id(store.as_ref(), raw_id).await?;
    let run = store.get_run(run_id).await?;

    print_run(&run);

    if log {
        let events = store.events(run_id).await?;
        println!("{}", style("Events").bold());
        for event in events {
            println!(
                "  {:>4}  {}  {}",
                style(event.seq).dim(),
                event.recorded_at.format("%H:%M:%S%.3f"),
                event.kind.summary()
            );
        }
        println!();
    }

    store.close().await?;
    Ok(())
}

fn print_run(run: &RunRecord) {
    println!();
    println!("{} {}", style("Run").bold(), style(run.id).cyan());
    println!("  target    {}", run.target);
    println!("  state     {}", state_label(run.state));
    println!("  attempts  {}", run.attempts);
    if let Some(strategy) = run.strategy {
        println!("  strategy  {}", strategy);
    }
    if let Some(tier) = run.risk_tier {
        println!("  risk      {}", tier);
    }
    match run.visible_decision() {
        Some(Decision::PendingApproval {
            expires_at: Some(deadline),
        }) if run.decision.is_none() => {
            println!(
                "  decision  {} (merges at {})",
                style("PENDING_APPROVAL").yellow().bold(),
                deadline.with_timezone(&chrono::Local).format("%H:%M:%S")
            );
        }
        Some(decision) => println!("  decision  {}", styled_decision(&decision)),
        None => {}
    }
    if let Some(reason) = &run.reason {
        println!("  reason    {}", reason);
    }
    println!("  created   {}", run.created_at.to_rfc3339());
    if let Some(finished) = run.finished_at {
        println!("  finished  {}", finished.to_rfc3339());
    }
    println!();

    if !run.stage_results.is_empty() {
        println!("{}", style("Stages").bold());
        for result in &run.stage_results {
            let status = match &result.error {
                None if result.success => style("ok".to_string()).green(),
                Some(error) => style(format!("{:?}: {}", error.kind, first_line(&error.message))).red(),
                None => style("failed".to_string()).red(),
            };
            println!(
                "  #{} {:<9} {:>6}ms  {}",
                result.attempt, result.stage, result.duration_ms, status
            );
        }
        println!();
    }

    if let Some(patch) = &run.final_patch {
        println!(
            "{} {} line{} in {}",
            style("Patch").bold(),
            patch.line_count,
            if patch.line_count == 1 { "" } else { "s" },
            patch.files_touched.join(", ")
        );
        println!();
    }
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or("")
}
