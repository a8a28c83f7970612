pub mod config;
pub mod errors;
pub mod knowledge;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod risk;
pub mod stage;
pub mod store;
pub mod ui;
pub mod vcs;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{HealError, RegistryError, StoreError};
pub use orchestrator::{HealRequest, Orchestrator, RunControls, RunHandle};
