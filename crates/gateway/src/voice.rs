//! Voice-transcription rendezvous.
//!
//! A voice `message:new` usually lands before its transcription. The
//! pipeline parks the message here and waits (bounded) for a later
//! `message:update` carrying the same message id. Each waiter resolves
//! exactly once: with the transcription, with an empty string on timeout or
//! cancellation, or empty when a newer waiter replaces it.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::oneshot;

/// How long a voice message waits for its transcription.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(15);

struct Waiter {
    tx: oneshot::Sender<String>,
    seq: u64,
}

#[derive(Clone)]
pub struct VoiceWaiters {
    timeout: Duration,
    waiters: Arc<Mutex<HashMap<String, Waiter>>>,
    seq: Arc<AtomicU64>,
}

impl VoiceWaiters {
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(WAIT_TIMEOUT)
    }

    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            waiters: Arc::new(Mutex::new(HashMap::new())),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wait for the transcription of `message_id`.
    ///
    /// Returns the transcription text, or an empty string on timeout or
    /// cancellation. A prior waiter for the same id is cancelled (resolved
    /// empty) first.
    pub async fn wait(&self, message_id: &str) -> String {
        let (tx, rx) = oneshot::channel();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let Ok(mut waiters) = self.waiters.lock() else {
                return String::new();
            };
            if let Some(prior) = waiters.insert(message_id.to_string(), Waiter { tx, seq }) {
                let _ = prior.tx.send(String::new());
            }
        }

        let text = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(text)) => text,
            // Timeout or dropped sender both resolve to empty.
            _ => String::new(),
        };

        // On timeout our entry is still registered; remove it so a late
        // `resolve` reports false. Guard on seq so a replacement waiter
        // is left alone.
        if let Ok(mut waiters) = self.waiters.lock()
            && waiters.get(message_id).is_some_and(|w| w.seq == seq)
        {
            waiters.remove(message_id);
        }

        text
    }

    /// Deliver a transcription. Returns whether a live waiter received it.
    pub fn resolve(&self, message_id: &str, text: &str) -> bool {
        let Ok(mut waiters) = self.waiters.lock() else {
            return false;
        };
        match waiters.remove(message_id) {
            Some(waiter) => waiter.tx.send(text.to_string()).is_ok(),
            None => false,
        }
    }

    /// Resolve a waiter to the empty string. Returns whether one existed.
    pub fn cancel(&self, message_id: &str) -> bool {
        let Ok(mut waiters) = self.waiters.lock() else {
            return false;
        };
        match waiters.remove(message_id) {
            Some(waiter) => {
                let _ = waiter.tx.send(String::new());
                true
            },
            None => false,
        }
    }

    /// Resolve every pending waiter to the empty string (shutdown).
    pub fn dispose(&self) {
        let Ok(mut waiters) = self.waiters.lock() else {
            return;
        };
        for (_, waiter) in waiters.drain() {
            let _ = waiter.tx.send(String::new());
        }
    }
}

impl Default for VoiceWaiters {
    fn default() -> Self {
        Self::new()
    }
}
