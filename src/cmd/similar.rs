//! Nearest past outcomes — `mender similar`.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::sync::Arc;

use mender::knowledge::{JsonlKnowledgeStore, KnowledgeBase, Outcome};
use mender::orchestrator::similar_runs;
use mender::store::ArtifactStore;

use super::{load_config, open_store, resolve_run_id, short_id};

pub async fn cmd_similar(project_dir: &Path, raw_id: &str, k: usize) -> Result<()> {
    let config = load_config(project_dir)?;
    let store = open_store(&config)?;
    let run_id = resolve_run_id(store.as_ref(), raw_id).await?;
    let knowledge = KnowledgeBase::new(Arc::new(JsonlKnowledgeStore::new(
        config.knowledge_path(),
    )));

    let records = similar_runs(store.as_ref(), &knowledge, run_id, k).await?;
    if records.is_empty() {
        println!("No similar past runs in {}", config.knowledge_path().display());
    } else {
        println!();
        for record in &records {
            let outcome = match record.outcome {
                Outcome::Success => style(record.outcome.as_str()).green(),
                Outcome::Failure => style(record.outcome.as_str()).red(),
            };
            println!(
                "  {}  {:<8} {:<17} {:<7} {}",
                style(short_id(&record.run_id)).cyan(),
                outcome,
                record.strategy.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                record.risk_tier.map(|t| t.to_string()).unwrap_or_else(|| "-".into()),
                record.target
            );
        }
        println!();
    }

    store.close().await?;
    Ok(())
}
