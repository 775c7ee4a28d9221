//! Inbound gateway core for the WristClaw messaging channel.
//!
//! One monitor per configured account holds a single authenticated WebSocket
//! to the WristClaw server, subscribes to every conversation the account
//! participates in, and turns inbound events into agent dispatches — applying
//! echo suppression, dedup, access gates, @mention gating, rate limiting,
//! media-group batching, and voice-transcription rendezvous along the way.

pub mod bounded;
pub mod catchup;
pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod fetch;
pub mod history;
pub mod media_group;
pub mod monitor;
pub mod pipeline;
pub mod plugin;
pub mod policy;
pub mod rate_limit;
pub mod rest;
pub mod state;
pub mod voice;

pub use {
    config::AccountConfig,
    error::{Error, Result},
    plugin::WristclawPlugin,
    state::{StatusSink, StatusSnapshot},
};

/// Channel identifier, fixed across agent routing changes so session keys
/// stay stable.
pub const CHANNEL_ID: &str = "wristclaw";
