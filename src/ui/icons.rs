//! Shared UI icons.
//!
//! Each icon falls back to a plain-text marker on terminals without emoji.

use console::Emoji;

// Outcomes
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static HOLD: Emoji<'_, '_> = Emoji("✋ ", "[HOLD]");
pub static BLOCKER: Emoji<'_, '_> = Emoji("🚧 ", "[ESC]");

// Pipeline
pub static REVIEW: Emoji<'_, '_> = Emoji("🔍 ", "[R]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static PIVOT: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
