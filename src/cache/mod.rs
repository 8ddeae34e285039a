//! Two-Tier Ticket Cache
//!
//! Caches opaque payloads under generated keys ("tickets"). Each ticket is
//! retrieved once: popping it removes it from the cache.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          TicketCache                             │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Memory Tier (RAM)              │  Disk Tier (local files)       │
//! │  ┌──────────────────────┐       │  ┌──────────────────────────┐  │
//! │  │ LRU, byte-weighted   │ evict │  │ <key>.ticket per entry   │  │
//! │  │ capacity: bytes      │──────▶│  │ + in-memory index        │  │
//! │  └──────────────────────┘       │  └──────────────────────────┘  │
//! │              │                  │              ▲                 │
//! │              └── PendingWrites ─┴── WorkerPool ┘                 │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Tickets enter memory on put. Overflow evicts least-recently-used tickets,
//! whose bytes are staged as pending writes and persisted by the worker pool.
//! A pop checks memory first, then disk.
//!
//! # Ticket lifecycle
//!
//! - `InMemory` after put
//! - `Caching` while an eviction write is queued
//! - `OnDisk` once written, `Lost` if the write failed
//! - `Resumed` when popped back from disk

mod config;
mod coordinator;
mod disk;
mod key;
mod memory;
mod metrics;
mod pool;
mod ticket;

// Tiers, pool and handoff are reachable only through TicketCache
pub use config::CacheConfig;
pub use coordinator::{PendingPop, TicketCache};
pub use key::KeyGenerator;
pub use metrics::MetricsSnapshot;
pub use ticket::{Json, Payload, Ticket, TicketStatus};

/// Default memory tier capacity (16MB)
pub const DEFAULT_MEMORY_CAPACITY: u64 = 16 * 1024 * 1024;

/// Default disk tier capacity (256MB)
pub const DEFAULT_DISK_CAPACITY: u64 = 256 * 1024 * 1024;

/// Default worker pool width
pub const DEFAULT_WORKER_THREADS: usize = 8;

/// File extension of persisted tickets
pub const TICKET_EXTENSION: &str = "ticket";

/// File extension of in-progress writes
pub const TEMP_EXTENSION: &str = "tmp";

// =============================================================================
// Tests
// =============================================================================
