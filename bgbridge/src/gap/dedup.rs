//! Short-lived memory of recently seen advertisements.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::clock::Clock;

/// How long an advertisement suppresses identical copies.
pub const DEDUP_TTL: Duration = Duration::from_secs(5);

/// Minimum time between sweeps of expired entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Remembers advertisement fingerprints for [`DEDUP_TTL`].
///
/// Expired entries are harmless (lookups check the expiry), so they are only
/// swept at most once per [`SWEEP_INTERVAL`].
pub struct RepeatFilter {
    entries: HashMap<Vec<u8>, Instant>,
    ttl: Duration,
    next_sweep: Instant,
    clock: Arc<dyn Clock>,
}

impl RepeatFilter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(clock, DEDUP_TTL)
    }

    pub fn with_ttl(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        let next_sweep = clock.now() + SWEEP_INTERVAL;
        Self {
            entries: HashMap::new(),
            ttl,
            next_sweep,
            clock,
        }
    }

    /// Returns true if `fingerprint` was seen within the TTL. Otherwise
    /// records it and returns false.
    pub fn seen(&mut self, fingerprint: &[u8]) -> bool {
        let now = self.clock.now();
        if now >= self.next_sweep {
            self.entries.retain(|_, expiry| *expiry > now);
            self.next_sweep = now + SWEEP_INTERVAL;
        }

        if let Some(expiry) = self.entries.get(fingerprint) {
            if now < *expiry {
                return true;
            }
        }
        self.entries.insert(fingerprint.to_vec(), now + self.ttl);
        false
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
