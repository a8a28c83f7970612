//! Revert an auto-merged patch — `mender rollback`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use mender::orchestrator::revert_run;
use mender::store::ArtifactStore;
use mender::vcs::GitWorkspace;

use super::{load_config, open_store, resolve_run_id, short_id};

pub async fn cmd_rollback(project_dir: &Path, raw_id: &str) -> Result<()> {
    let config = load_config(project_dir)?;
    let store = open_store(&config)?;
    let run_id = resolve_run_id(store.as_ref(), raw_id).await?;
    let vcs = GitWorkspace::open(&config.project_dir)
        .context("mender rollback must run inside a git work tree")?;

    let run = revert_run(
        store.as_ref(),
        &vcs,
        run_id,
        config.heal_settings().vcs_timeout,
    )
    .await?;

    let files = run
        .final_patch
        .as_ref()
        .map(|patch| patch.files_touched.join(", "))
        .unwrap_or_default();
    println!(
        "Rolled back run {} ({})",
        style(short_id(&run.id)).cyan(),
        files
    );

    store.close().await?;
    Ok(())
}
