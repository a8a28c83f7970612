pub mod icons;
pub mod progress;

pub use progress::{HealUi, outcome_line, state_label, styled_decision};
