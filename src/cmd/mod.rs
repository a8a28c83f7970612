//! CLI command implementations.
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `heal`     | `Heal`           |
//! | `history`  | `History`        |
//! | `show`     | `Show`           |
//! | `rollback` | `Rollback`       |
//! | `similar`  | `Similar`        |
//! | `config`   | `Config`         |

pub mod config;
pub mod heal;
pub mod history;
pub mod rollback;
pub mod show;
pub mod similar;

pub use config::cmd_config;
pub use heal::{HealTarget, cmd_heal};
pub use history::cmd_history;
pub use rollback::cmd_rollback;
pub use show::cmd_show;
pub use similar::cmd_similar;

use anyhow::{Context, Result, bail};
use std::path::Path;
use std::sync::Arc;

use mender::config::MenderConfig;
use mender::model::RunId;
use mender::store::{ArtifactStore, SqliteArtifactStore};

/// How many recent runs are searched when resolving an id prefix.
const PREFIX_SEARCH_LIMIT: usize = 1000;

pub(crate) fn load_config(project_dir: &Path) -> Result<MenderConfig> {
    MenderConfig::new(project_dir.to_path_buf())
}

pub(crate) fn open_store(config: &MenderConfig) -> Result<Arc<SqliteArtifactStore>> {
    let path = config.database_path();
    let store = SqliteArtifactStore::open(&path)
        .with_context(|| format!("Failed to open run database at {}", path.display()))?;
    Ok(Arc::new(store))
}

/// Accept a full run id or a unique prefix of one.
pub(crate) async fn resolve_run_id(store: &dyn ArtifactStore, raw: &str) -> Result<RunId> {
    if let Ok(id) = raw.parse::<RunId>() {
        return Ok(id);
    }
    let prefix = raw.to_lowercase();
    let matches: Vec<RunId> = store
        .list_runs(PREFIX_SEARCH_LIMIT)
        .await?
        .into_iter()
        .map(|run| run.id)
        .filter(|id| id.to_string().starts_with(&prefix))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => bail!("No run matches '{}'", raw),
        _ => bail!("Run id '{}' is ambiguous ({} matches)", raw, matches.len()),
    }
}

/// First eight characters of a run id.
pub(crate) fn short_id(id: &RunId) -> String {
    id.to_string()[..8].to_string()
}
