//! Shared plain types used across the WristClaw crates.

pub mod types;

pub use types::{ChatKind, HistoryEntry, MediaBuffer};
