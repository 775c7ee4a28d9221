//! Per-group buffering of non-mentioning messages.
//!
//! In `mention` policy, messages that don't address the bot are not
//! dispatched; they are buffered here and handed to the agent as context the
//! next time a mention triggers a reply, then cleared.

use std::collections::{HashMap, VecDeque};

use chrono::{Local, TimeZone};

use wristclaw_common::types::HistoryEntry;

/// Bounded per-channel history buffers.
#[derive(Debug)]
pub struct GroupHistory {
    limit: usize,
    channels: HashMap<String, VecDeque<HistoryEntry>>,
}

impl GroupHistory {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            channels: HashMap::new(),
        }
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Append an entry, evicting the oldest when the buffer is full.
    pub fn record(&mut self, channel_id: &str, entry: HistoryEntry) {
        if self.limit == 0 {
            return;
        }
        let buffer = self.channels.entry(channel_id.to_string()).or_default();
        while buffer.len() >= self.limit {
            buffer.pop_front();
        }
        buffer.push_back(entry);
    }

    /// Current entries for a channel, oldest first.
    #[must_use]
    pub fn snapshot(&self, channel_id: &str) -> Vec<HistoryEntry> {
        self.channels
            .get(channel_id)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a channel's buffer (after its contents were handed to the agent).
    pub fn clear(&mut self, channel_id: &str) {
        self.channels.remove(channel_id);
    }
}

/// Render history entries as the `[HH:MM] <sender>: <body>` block prepended
/// to a mention-triggered dispatch.
#[must_use]
pub fn render_history(entries: &[HistoryEntry]) -> String {
    entries
        .iter()
        .map(|entry| {
            let clock = Local
                .timestamp_opt(entry.timestamp, 0)
                .single()
                .map(|ts| ts.format("%H:%M").to_string())
                .unwrap_or_else(|| "--:--".into());
            format!("[{clock}] {}: {}", entry.sender, entry.body)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
