//! Memory Tier - RAM-based LRU Cache
//!
//! Bounded by the summed weight of its payloads. A put is always accepted;
//! room is made by evicting least-recently-used entries one at a time until
//! usage is back under capacity. A payload heavier than the whole tier is
//! therefore accepted and then evicted straight away.
//!
//! # Eviction
//!
//! Each evicted ticket leaves the tier immediately. Its serialized bytes are
//! handed to the overflow handler injected at construction, which is
//! expected to schedule persistence rather than perform it.

use bytes::Bytes;
use lru::LruCache;
use tracing::{debug, warn};

use super::ticket::{Payload, Ticket, TicketStatus};

/// Receives every evicted ticket with its serialized bytes
///
/// `None` bytes mean the payload could not be serialized.
pub type OverflowHandler<P> = Box<dyn Fn(Ticket<P>, Option<Bytes>) + Send + Sync>;

struct Slot<P> {
    ticket: Ticket<P>,
    size: u64,
}

/// Memory tier - bounded LRU store of tickets
pub struct MemoryTier<P> {
    /// Entries in recency order
    entries: LruCache<String, Slot<P>>,
    /// Maximum capacity in bytes
    capacity: u64,
    /// Current size in bytes
    usage: u64,
    /// Eviction callback
    on_overflow: OverflowHandler<P>,
}

impl<P: Payload> MemoryTier<P> {
    /// Create a memory tier that reports evictions to `on_overflow`
    pub fn new(capacity: u64, on_overflow: OverflowHandler<P>) -> Self {
        Self {
            entries: LruCache::unbounded(),
            capacity,
            usage: 0,
            on_overflow,
        }
    }

    /// Insert a ticket at the most-recently-used position
    ///
    /// Returns false only when the payload cannot be weighed.
    pub fn put(&mut self, mut ticket: Ticket<P>) -> bool {
        let size = match ticket.weight() {
            Ok(size) => size,
            Err(e) => {
                warn!(key = ticket.id(), error = %e, "Cannot weigh payload, rejecting");
                return false;
            }
        };

        ticket.set_status(TicketStatus::InMemory);
        let key = ticket.id().to_string();

        if let Some(old) = self.entries.put(key, Slot { ticket, size }) {
            self.usage -= old.size;
        }
        self.usage += size;

        self.evict_to_capacity();
        true
    }

    /// Remove and return a ticket
    pub fn pop(&mut self, id: &str) -> Option<Ticket<P>> {
        let slot = self.entries.pop(id)?;
        self.usage -= slot.size;
        Some(slot.ticket)
    }

    /// Check if the tier holds a key
    ///
    /// Does not touch recency.
    pub fn has_cached(&self, id: &str) -> bool {
        self.entries.contains(id)
    }

    /// Drop every entry without firing the overflow handler
    pub fn clear_all(&mut self) {
        self.entries.clear();
        self.usage = 0;
    }

    /// Evict least-recently-used entries until usage fits
    fn evict_to_capacity(&mut self) {
        while self.usage > self.capacity {
            let Some((key, slot)) = self.entries.pop_lru() else {
                break;
            };

            self.usage -= slot.size;

            let mut ticket = slot.ticket;
            ticket.set_status(TicketStatus::Caching);

            let bytes = match ticket.payload().to_bytes() {
                Ok(bytes) => Some(Bytes::from(bytes)),
                Err(e) => {
                    warn!(key = %key, error = %e, "Cannot serialize evicted payload");
                    None
                }
            };

            debug!(key = %key, bytes = slot.size, "Evicting from memory");
            (self.on_overflow)(ticket, bytes);
        }
    }

    /// Get current size in bytes
    pub fn usage(&self) -> u64 {
        self.usage
    }

    /// Get capacity
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if tier is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::Arc;

    type Evicted = Arc<Mutex<Vec<(String, TicketStatus, Option<Bytes>)>>>;

    fn recording_tier(capacity: u64) -> (MemoryTier<Vec<u8>>, Evicted) {
        let evicted: Evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let tier = MemoryTier::new(
            capacity,
            Box::new(move |ticket: Ticket<Vec<u8>>, bytes: Option<Bytes>| {
                sink.lock()
                    .push((ticket.id().to_string(), ticket.status(), bytes));
            }),
        );
        (tier, evicted)
    }

    fn ticket(id: &str, size: usize) -> Ticket<Vec<u8>> {
        Ticket::new(id.to_string(), vec![id.as_bytes()[0]; size])
    }

    /// Payload whose serialization always fails
    struct Unencodable;

    impl Payload for Unencodable {
        fn to_bytes(&self) -> Result<Vec<u8>> {
            Err(Error::Payload("unencodable".to_string()))
        }

        fn from_bytes(_bytes: &[u8]) -> Result<Self> {
            Ok(Unencodable)
        }
    }

    #[test]
    fn test_put_pop() {
        let (mut tier, evicted) = recording_tier(1024);

        assert!(tier.put(ticket("a", 100)));
        assert!(tier.has_cached("a"));
        assert_eq!(tier.usage(), 100);
        assert_eq!(tier.len(), 1);

        let popped = tier.pop("a").unwrap();
        assert_eq!(popped.status(), TicketStatus::InMemory);
        assert_eq!(popped.payload().len(), 100);
        assert_eq!(tier.usage(), 0);
        assert!(tier.is_empty());

        assert!(tier.pop("a").is_none());
        assert!(evicted.lock().is_empty());
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let (mut tier, evicted) = recording_tier(250);

        tier.put(ticket("a", 100));
        tier.put(ticket("b", 100));
        tier.put(ticket("c", 100));

        assert!(!tier.has_cached("a"));
        assert!(tier.has_cached("b"));
        assert!(tier.has_cached("c"));
        assert_eq!(tier.usage(), 200);

        let evicted = evicted.lock();
        assert_eq!(evicted.len(), 1);
        let (key, status, bytes) = &evicted[0];
        assert_eq!(key, "a");
        assert_eq!(*status, TicketStatus::Caching);
        assert_eq!(bytes.as_ref().unwrap().len(), 100);
    }

    #[test]
    fn test_oversized_entry_is_evicted_immediately() {
        let (mut tier, evicted) = recording_tier(1024);

        assert!(tier.put(ticket("big", 2000)));
        assert!(!tier.has_cached("big"));
        assert_eq!(tier.usage(), 0);
        assert_eq!(evicted.lock()[0].0, "big");
    }

    #[test]
    fn test_evicts_one_at_a_time_until_under_capacity() {
        let (mut tier, evicted) = recording_tier(300);

        for id in ["a", "b", "c"] {
            tier.put(ticket(id, 100));
        }
        tier.put(ticket("d", 250));

        let keys: Vec<String> = evicted.lock().iter().map(|e| e.0.clone()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert!(tier.has_cached("d"));
        assert_eq!(tier.usage(), 250);
    }

    #[test]
    fn test_clear_fires_no_evictions() {
        let (mut tier, evicted) = recording_tier(1000);

        for id in ["a", "b", "c"] {
            tier.put(ticket(id, 100));
        }
        tier.clear_all();

        assert!(tier.is_empty());
        assert_eq!(tier.usage(), 0);
        assert!(evicted.lock().is_empty());
    }

    #[test]
    fn test_unweighable_payload_rejected() {
        let mut tier: MemoryTier<Unencodable> = MemoryTier::new(
            1024,
            Box::new(|_: Ticket<Unencodable>, _: Option<Bytes>| {}),
        );
        assert!(!tier.put(Ticket::new("x".to_string(), Unencodable)));
        assert!(tier.is_empty());
    }

    proptest! {
        #[test]
        fn prop_usage_never_exceeds_capacity(
            capacity in 1u64..4096,
            sizes in proptest::collection::vec(0usize..2048, 1..64),
        ) {
            let (mut tier, evicted) = recording_tier(capacity);

            for (i, size) in sizes.iter().enumerate() {
                let id = format!("k{}", i);
                tier.put(Ticket::new(id, vec![0u8; *size]));
                prop_assert!(tier.usage() <= capacity);
            }

            let resident: u64 = sizes.iter().map(|s| *s as u64).sum::<u64>()
                - evicted.lock().iter().map(|e| e.2.as_ref().map_or(0, |b| b.len() as u64)).sum::<u64>();
            prop_assert_eq!(resident, tier.usage());
            prop_assert_eq!(tier.len() + evicted.lock().len(), sizes.len());
        }
    }
}
