//! Process-wide registry of requests currently being processed.
//!
//! Thread-safe via parking_lot::Mutex. Shared by every AMQP connection in the
//! process, since a redelivered message may land on any consumer.
//!
//! Capacity is bounded. When full, the least-recently-touched entry is
//! evicted, even if that request is still in flight. A duplicate of an
//! evicted request will be processed a second time. This keeps memory bounded
//! under sustained overload and is a known limitation, not a bug.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Default number of in-flight request ids remembered.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Snapshot of one in-flight request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupEntry {
    pub request_id: String,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Slot {
    accepted_at: DateTime<Utc>,
    touched: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Slot>,
    clock: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock = self.clock.wrapping_add(1);
        self.clock
    }
}

#[derive(Debug)]
pub struct DeduplicationRegistry {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl DeduplicationRegistry {
    /// Create a registry remembering at most `capacity` ids (clamped to at least 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Atomically accept `request_id` if it is not already in flight.
    ///
    /// Returns `true` when the id was inserted, `false` for a duplicate. A
    /// duplicate hit refreshes the entry's recency.
    pub fn try_accept(&self, request_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let touched = inner.tick();

        if let Some(slot) = inner.entries.get_mut(request_id) {
            slot.touched = touched;
            return false;
        }

        if inner.entries.len() >= self.capacity {
            if let Some(victim) = inner
                .entries
                .iter()
                .min_by_key(|(_, slot)| slot.touched)
                .map(|(id, _)| id.clone())
            {
                inner.entries.remove(&victim);
                tracing::warn!(
                    evicted = %victim,
                    capacity = self.capacity,
                    "Dedup registry full; evicted least-recent in-flight request"
                );
            }
        }

        inner.entries.insert(
            request_id.to_string(),
            Slot {
                accepted_at: Utc::now(),
                touched,
            },
        );
        true
    }

    /// Forget `request_id`. Called once by whoever finishes the request.
    pub fn release(&self, request_id: &str) {
        self.inner.lock().entries.remove(request_id);
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.inner.lock().entries.contains_key(request_id)
    }

    pub fn entry(&self, request_id: &str) -> Option<DedupEntry> {
        self.inner
            .lock()
            .entries
            .get(request_id)
            .map(|slot| DedupEntry {
                request_id: request_id.to_string(),
                accepted_at: slot.accepted_at,
            })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DeduplicationRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Releases an accepted request id when dropped, including on unwind.
pub struct InFlightGuard {
    registry: Arc<DeduplicationRegistry>,
    request_id: String,
}

impl InFlightGuard {
    pub fn new(registry: Arc<DeduplicationRegistry>, request_id: impl Into<String>) -> Self {
        Self {
            registry,
            request_id: request_id.into(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.release(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn accepts_once_until_released() {
        let registry = DeduplicationRegistry::new(8);
        assert!(registry.try_accept("r1"));
        assert!(!registry.try_accept("r1"));
        assert!(!registry.try_accept("r1"));

        registry.release("r1");
        assert!(registry.try_accept("r1"));
    }

    #[test]
    fn entry_records_acceptance_time() {
        let registry = DeduplicationRegistry::new(8);
        let before = Utc::now();
        registry.try_accept("r1");
        let entry = registry.entry("r1").unwrap();
        assert_eq!(entry.request_id, "r1");
        assert!(entry.accepted_at >= before);
        assert!(registry.entry("other").is_none());
    }

    #[test]
    fn release_of_unknown_id_is_noop() {
        let registry = DeduplicationRegistry::new(2);
        registry.release("ghost");
        assert!(registry.is_empty());
    }

    #[test]
    fn evicts_least_recently_touched_when_full() {
        let registry = DeduplicationRegistry::new(2);
        assert!(registry.try_accept("a"));
        assert!(registry.try_accept("b"));
        // Touch "a" so "b" becomes the eviction victim.
        assert!(!registry.try_accept("a"));

        assert!(registry.try_accept("c"));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("a"));
        assert!(!registry.contains("b"));
        assert!(registry.contains("c"));

        // The forgotten request can be accepted again.
        assert!(registry.try_accept("b"));
    }

    #[test]
    fn capacity_clamped_to_one() {
        let registry = DeduplicationRegistry::new(0);
        assert_eq!(registry.capacity(), 1);
        assert!(registry.try_accept("only"));
        assert!(registry.try_accept("next"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn guard_releases_on_drop() {
        let registry = Arc::new(DeduplicationRegistry::new(4));
        assert!(registry.try_accept("g1"));
        {
            let guard = InFlightGuard::new(Arc::clone(&registry), "g1");
            assert_eq!(guard.request_id(), "g1");
            assert!(registry.contains("g1"));
        }
        assert!(!registry.contains("g1"));
    }

    #[test]
    fn concurrent_accepts_admit_exactly_one() {
        let registry = Arc::new(DeduplicationRegistry::new(64));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.try_accept("shared"))
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|accepted| *accepted)
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(registry.len(), 1);
    }
}
