//! Message-id deduplication.
//!
//! Two layers: a per-account set owned by each monitor, and a process-wide
//! claim map shared by all monitors so the same message never reaches the
//! agent twice even when several accounts see it.

use std::sync::{Arc, Mutex, OnceLock};

use crate::bounded::{BoundedMap, BoundedSet};

/// Per-account capacity.
const ACCOUNT_CAPACITY: usize = 1000;

/// Per-account batch eviction: 20% of capacity at a time.
const ACCOUNT_EVICTION_BATCH: usize = ACCOUNT_CAPACITY / 5;

/// Cross-account capacity.
const CROSS_CAPACITY: usize = 2000;

/// Claims older than this are pruned once the map is full.
const CROSS_MAX_AGE_MS: i64 = 5 * 60 * 1000;

/// Message ids already processed by one account monitor.
#[derive(Debug)]
pub struct AccountDedup {
    seen: BoundedSet<String>,
}

impl AccountDedup {
    #[must_use]
    pub fn new() -> Self {
        Self {
            seen: BoundedSet::with_batch_eviction(ACCOUNT_CAPACITY, ACCOUNT_EVICTION_BATCH),
        }
    }

    /// Claim a message id for this account. `true` the first time.
    pub fn claim(&mut self, message_id: &str) -> bool {
        self.seen.add(message_id.to_string())
    }
}

impl Default for AccountDedup {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide claim map shared across every account monitor.
///
/// Values are claim timestamps (epoch milliseconds) so pruning needs no
/// second structure. Lives for the process; created lazily on first claim.
#[derive(Debug)]
pub struct CrossAccountDedup {
    claims: Mutex<BoundedMap<String, i64>>,
}

impl CrossAccountDedup {
    #[must_use]
    pub fn new() -> Self {
        Self {
            claims: Mutex::new(BoundedMap::new(CROSS_CAPACITY)),
        }
    }

    /// The process-wide instance, created lazily on first use.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<CrossAccountDedup>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Claim a message id. Returns `true` exactly once per id process-wide.
    pub fn claim(&self, message_id: &str) -> bool {
        self.claim_at(message_id, chrono::Utc::now().timestamp_millis())
    }

    fn claim_at(&self, message_id: &str, now_ms: i64) -> bool {
        let Ok(mut claims) = self.claims.lock() else {
            return false;
        };
        if claims.contains_key(&message_id.to_string()) {
            return false;
        }
        if claims.len() >= CROSS_CAPACITY {
            // Age-based pruning first; capacity eviction in BoundedMap::set
            // covers the case where everything is still fresh.
            while let Some((_, claimed_at)) = claims.peek_oldest() {
                if now_ms - *claimed_at > CROSS_MAX_AGE_MS {
                    claims.pop_oldest();
                } else {
                    break;
                }
            }
        }
        claims.set(message_id.to_string(), now_ms);
        true
    }
}

impl Default for CrossAccountDedup {
    fn default() -> Self {
        Self::new()
    }
}
