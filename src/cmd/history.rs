//! Recent runs — `mender history`.

use anyhow::Result;
use console::style;
use std::path::Path;

use mender::store::ArtifactStore;
use mender::ui::{state_label, styled_decision};

use super::{load_config, open_store, short_id};

pub async fn cmd_history(project_dir: &Path, limit: usize) -> Result<()> {
    let config = load_config(project_dir)?;
    let store = open_store(&config)?;
    let runs = store.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs recorded yet.");
        store.close().await?;
        return Ok(());
    }

    println!();
    println!(
        "{:<10} {:<17} {:<9} {}",
        style("RUN").bold(),
        style("STARTED").bold(),
        style("ATTEMPTS").bold(),
        style("TARGET / OUTCOME").bold()
    );
    for run in &runs {
        let outcome = match run.visible_decision() {
            Some(decision) => styled_decision(&decision),
            None => style(state_label(run.state)).cyan().to_string(),
        };
        println!(
            "{:<10} {:<17} {:<9} {}",
            style(short_id(&run.id)).cyan(),
            run.created_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M"),
            run.attempts,
            run.target
        );
        println!("{:<38} {}", "", outcome);
    }
    println!();

    store.close().await?;
    Ok(())
}
