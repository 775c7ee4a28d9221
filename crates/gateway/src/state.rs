//! Per-account runtime state and the status surface the enclosing plugin
//! exposes.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
};

use serde::Serialize;

use crate::monitor::MonitorContext;

/// Shared account state map.
pub type AccountStateMap = Arc<RwLock<HashMap<String, AccountState>>>;

/// Per-account runtime state held by the plugin.
pub struct AccountState {
    pub account_id: String,
    pub ctx: Arc<MonitorContext>,
}

/// Liveness counters updated on every inbound/outbound event. Epoch-seconds
/// fields hold 0 while unset.
#[derive(Debug, Default)]
pub struct StatusSink {
    running: AtomicBool,
    last_error: Mutex<Option<String>>,
    last_start_at: AtomicI64,
    last_stop_at: AtomicI64,
    last_inbound_at: AtomicI64,
    last_outbound_at: AtomicI64,
}

/// Point-in-time copy of a [`StatusSink`].
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub last_error: Option<String>,
    pub last_start_at: Option<i64>,
    pub last_stop_at: Option<i64>,
    pub last_inbound_at: Option<i64>,
    pub last_outbound_at: Option<i64>,
}

impl StatusSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_started(&self) {
        self.running.store(true, Ordering::Relaxed);
        self.last_start_at.store(now(), Ordering::Relaxed);
    }

    pub fn mark_stopped(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.last_stop_at.store(now(), Ordering::Relaxed);
    }

    pub fn record_error(&self, error: impl std::fmt::Display) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error.to_string());
        }
    }

    pub fn note_inbound(&self) {
        self.last_inbound_at.store(now(), Ordering::Relaxed);
    }

    pub fn note_outbound(&self) {
        self.last_outbound_at.store(now(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let stamp = |atomic: &AtomicI64| {
            let v = atomic.load(Ordering::Relaxed);
            (v != 0).then_some(v)
        };
        StatusSnapshot {
            running: self.is_running(),
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
            last_start_at: stamp(&self.last_start_at),
            last_stop_at: stamp(&self.last_stop_at),
            last_inbound_at: stamp(&self.last_inbound_at),
            last_outbound_at: stamp(&self.last_outbound_at),
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
