//! Ticketstore - Two-Tier Ticket Cache
//!
//! An embeddable cache that stores payloads under generated single-use keys.
//! Payloads live in a byte-bounded in-memory LRU tier and spill to a
//! byte-bounded directory of files when memory runs out. Popping a key
//! returns its payload from whichever tier holds it and removes it.
//!
//! # Example
//!
//! ```no_run
//! use ticketstore::{CacheConfig, TicketCache};
//!
//! # fn main() -> ticketstore::Result<()> {
//! let cache: TicketCache<Vec<u8>> =
//!     TicketCache::new(CacheConfig::new(1024, "/tmp/tickets", 1 << 20))?;
//!
//! let key = cache.put(vec![0u8; 2000])?;
//! assert!(cache.has_cached(&key));
//!
//! let ticket = cache.pop(&key).expect("cached");
//! assert_eq!(ticket.payload().len(), 2000);
//! assert!(cache.pop(&key).is_none());
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, coordinator and worker pool
//! - [`error`] - Error types

pub mod cache;
pub mod error;

// Re-export commonly used types
pub use cache::{CacheConfig, Json, MetricsSnapshot, Payload, Ticket, TicketCache, TicketStatus};
pub use error::{Error, Result};
