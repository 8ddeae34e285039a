//! Ticket Cache - Two-Tier Coordinator
//!
//! Sole entry point to the cache. Owns the memory and disk tiers, routes
//! puts and pops between them and runs the worker pool that persists
//! evicted tickets.
//!
//! # Concurrency
//!
//! Every operation that changes which tier holds a key (put and its
//! evictions, pop, settling an eviction write, clear) runs under one
//! coordinator-wide lock. A key is therefore delivered by at most one pop,
//! no matter how many callers race for it. Eviction writes run on the pool,
//! outside the caller's `put`.
//!
//! # Async results
//!
//! [`TicketCache::pop_async`] results are queued and handed to the host by
//! [`TicketCache::dispatch_completions`], one callback at a time on the
//! host's own thread. [`TicketCache::pop_deferred`] returns an awaitable
//! receiver instead.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use super::config::CacheConfig;
use super::disk::{DiskTier, PendingWrites};
use super::key::KeyGenerator;
use super::memory::{MemoryTier, OverflowHandler};
use super::metrics::{CacheMetrics, MetricsSnapshot, TierUsage};
use super::pool::{Spawner, WorkerPool};
use super::ticket::{Payload, Ticket, TicketStatus};
use crate::error::{Error, Result};

type Completion = Box<dyn FnOnce() + Send + 'static>;

/// Receiver for a [`TicketCache::pop_deferred`] result
pub type PendingPop<P> = oneshot::Receiver<Option<Ticket<P>>>;

struct Tiers<P> {
    memory: MemoryTier<P>,
    disk: DiskTier,
}

struct Shared<P> {
    tiers: Mutex<Tiers<P>>,
    config: RwLock<CacheConfig>,
    keys: KeyGenerator,
    metrics: CacheMetrics,
    spawner: Spawner,
    completion_tx: Sender<Completion>,
    this: Weak<Shared<P>>,
}

/// Two-tier ticket cache
///
/// Dropping the cache waits for queued eviction writes and async pops to
/// finish.
pub struct TicketCache<P: Payload> {
    shared: Arc<Shared<P>>,
    pool: WorkerPool,
    completions: Mutex<Receiver<Completion>>,
}

impl<P: Payload> TicketCache<P> {
    /// Build a cache from `config`
    ///
    /// Unless `recover_on_open` is set, ticket files already present in the
    /// disk directory are deleted.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let pool = WorkerPool::new(config.worker_threads)?;
        let disk = DiskTier::open(
            &config.disk_directory,
            config.disk_capacity_bytes,
            config.recover_on_open,
        )?;
        let (completion_tx, completion_rx) = channel::unbounded();
        let spawner = pool.spawner();

        info!(
            memory_capacity = config.memory_capacity_bytes,
            disk_capacity = config.disk_capacity_bytes,
            disk_dir = %config.disk_directory.display(),
            workers = config.worker_threads,
            "Ticket cache initialized"
        );

        let shared = Arc::new_cyclic(|this: &Weak<Shared<P>>| {
            let memory = MemoryTier::new(
                config.memory_capacity_bytes,
                overflow_handler(disk.pending_writes(), spawner.clone(), this.clone()),
            );
            Shared {
                tiers: Mutex::new(Tiers { memory, disk }),
                config: RwLock::new(config),
                keys: KeyGenerator::new(),
                metrics: CacheMetrics::new(),
                spawner,
                completion_tx,
                this: this.clone(),
            }
        });

        Ok(Self {
            shared,
            pool,
            completions: Mutex::new(completion_rx),
        })
    }

    /// Destroy both tiers and rebuild them from `config`
    ///
    /// Destructive: waits for in-flight pool work, then drops every cached
    /// ticket and deletes the old tier's files, including when the new config
    /// points at a different directory. If the new directory cannot be
    /// opened the old tiers are left untouched. The worker pool keeps the
    /// width it was created with.
    #[instrument(skip(self, config), fields(disk_dir = %config.disk_directory.display()))]
    pub fn reinit(&self, config: CacheConfig) -> Result<()> {
        config.validate()?;
        self.pool.wait_idle();

        let mut tiers = self.shared.tiers.lock();

        // Same directory always comes back empty; the old files are ours
        let same_dir = tiers.disk.directory() == config.disk_directory.as_path();
        let disk = DiskTier::open(
            &config.disk_directory,
            config.disk_capacity_bytes,
            config.recover_on_open && !same_dir,
        )?;

        tiers.memory.clear_all();
        tiers.disk.clear_all();

        let memory = MemoryTier::new(
            config.memory_capacity_bytes,
            overflow_handler(
                disk.pending_writes(),
                self.shared.spawner.clone(),
                self.shared.this.clone(),
            ),
        );
        *tiers = Tiers { memory, disk };

        if config.worker_threads != self.pool.width() {
            warn!(
                requested = config.worker_threads,
                width = self.pool.width(),
                "Worker pool width is fixed; ignoring worker_threads"
            );
        }
        *self.shared.config.write() = config;

        info!("Ticket cache re-initialized");
        Ok(())
    }

    /// Cache a payload, returning its new key
    ///
    /// Fails only if the payload cannot be sized (serialized).
    pub fn put(&self, payload: P) -> Result<String> {
        self.shared.put(payload)
    }

    /// Remove and return the ticket for `key`
    ///
    /// Memory is checked first, then disk. A key is returned by at most one
    /// pop. `Lost` keys yield `None`.
    pub fn pop(&self, key: &str) -> Option<Ticket<P>> {
        self.shared.pop(key)
    }

    /// Pop on the worker pool and queue `on_complete` for
    /// [`TicketCache::dispatch_completions`]
    pub fn pop_async<F>(&self, key: impl Into<String>, on_complete: F)
    where
        F: FnOnce(Option<Ticket<P>>) + Send + 'static,
    {
        let key = key.into();
        let shared = Arc::clone(&self.shared);
        shared.metrics.record_async_pop();

        self.pool.spawn(move || {
            let ticket = shared.pop(&key);
            if shared
                .completion_tx
                .send(Box::new(move || on_complete(ticket)))
                .is_err()
            {
                warn!(key = %key, "Completion queue closed, dropping pop result");
            }
        });
    }

    /// Pop on the worker pool, returning a receiver for the result
    pub fn pop_deferred(&self, key: impl Into<String>) -> PendingPop<P> {
        let key = key.into();
        let shared = Arc::clone(&self.shared);
        let (tx, rx) = oneshot::channel();
        shared.metrics.record_async_pop();

        self.pool.spawn(move || {
            // Receiver may have been dropped; the pop still happened
            let _ = tx.send(shared.pop(&key));
        });
        rx
    }

    /// Run every queued `pop_async` callback on the calling thread
    ///
    /// Returns how many ran. Callers are serialized, so callbacks never run
    /// concurrently with each other. A callback must not dispatch
    /// completions itself.
    pub fn dispatch_completions(&self) -> usize {
        let completions = self.completions.lock();
        let mut ran = 0;
        while let Ok(completion) = completions.try_recv() {
            completion();
            ran += 1;
        }
        ran
    }

    /// Like [`TicketCache::dispatch_completions`], waiting up to `timeout`
    /// for the first callback
    pub fn dispatch_completions_timeout(&self, timeout: Duration) -> usize {
        let completions = self.completions.lock();
        let first = match completions.recv_timeout(timeout) {
            Ok(completion) => completion,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return 0,
        };
        first();

        let mut ran = 1;
        while let Ok(completion) = completions.try_recv() {
            completion();
            ran += 1;
        }
        ran
    }

    /// Clear both tiers on the worker pool
    ///
    /// Applies to whatever the tiers hold when the job runs; use
    /// [`TicketCache::wait_idle`] to wait for it.
    pub fn clear(&self) {
        let shared = Arc::clone(&self.shared);
        self.pool.spawn(move || shared.clear());
    }

    /// Check if either tier knows `key`
    pub fn has_cached(&self, key: &str) -> bool {
        let tiers = self.shared.tiers.lock();
        tiers.memory.has_cached(key) || tiers.disk.has_cached(key)
    }

    /// Current status of `key`, if any tier knows it
    pub fn status(&self, key: &str) -> Option<TicketStatus> {
        let tiers = self.shared.tiers.lock();
        if tiers.memory.has_cached(key) {
            return Some(TicketStatus::InMemory);
        }
        tiers.disk.status(key)
    }

    /// When the disk tier wrote or registered `key`
    ///
    /// `None` for keys held in memory, staged for writing, or unknown.
    pub fn stored_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.shared.tiers.lock().disk.entry(key).map(|e| e.stored_at)
    }

    /// Memory tier usage in bytes
    pub fn memory_usage(&self) -> u64 {
        self.shared.tiers.lock().memory.usage()
    }

    /// Persisted disk tier usage in bytes
    pub fn disk_usage(&self) -> u64 {
        self.shared.tiers.lock().disk.usage()
    }

    /// Counters and current usages
    pub fn stats(&self) -> MetricsSnapshot {
        let usage = {
            let tiers = self.shared.tiers.lock();
            TierUsage {
                memory_bytes: tiers.memory.usage(),
                memory_capacity: tiers.memory.capacity(),
                memory_entries: tiers.memory.len(),
                disk_bytes: tiers.disk.usage(),
                disk_capacity: tiers.disk.capacity(),
                disk_entries: tiers.disk.len(),
                queued_jobs: self.pool.in_flight(),
            }
        };
        self.shared.metrics.snapshot(usage)
    }

    /// Active configuration
    pub fn config(&self) -> CacheConfig {
        self.shared.config.read().clone()
    }

    /// Block until every scheduled eviction write, async pop and clear ran
    pub fn wait_idle(&self) {
        self.pool.wait_idle();
    }

    /// Like [`TicketCache::wait_idle`] with a deadline; true if the pool drained
    pub fn wait_idle_for(&self, timeout: Duration) -> bool {
        self.pool.wait_idle_for(timeout)
    }
}

impl<P: Payload> Drop for TicketCache<P> {
    fn drop(&mut self) {
        self.pool.wait_idle();
    }
}

impl<P: Payload> Shared<P> {
    #[instrument(level = "debug", skip(self, payload))]
    fn put(&self, payload: P) -> Result<String> {
        let id = self.keys.generate();
        let ticket = Ticket::new(id.clone(), payload);

        let accepted = self.tiers.lock().memory.put(ticket);
        if !accepted {
            self.metrics.record_put_rejection();
            return Err(Error::Payload(format!(
                "payload for ticket {} cannot be serialized",
                id
            )));
        }

        self.metrics.record_put();
        debug!(key = %id, "Cached ticket");
        Ok(id)
    }

    #[instrument(level = "debug", skip(self))]
    fn pop(&self, key: &str) -> Option<Ticket<P>> {
        let mut tiers = self.tiers.lock();

        if tiers.memory.has_cached(key) {
            self.metrics.record_memory_pop();
            return tiers.memory.pop(key);
        }

        if tiers.disk.has_cached(key) {
            if let Some(ticket) = tiers.disk.pop(key) {
                self.metrics.record_disk_pop();
                return Some(ticket);
            }
        }

        self.metrics.record_pop_miss();
        None
    }

    /// Persist an evicted ticket and settle its status
    fn persist_evicted(&self, mut ticket: Ticket<P>, bytes: Option<Bytes>) {
        let mut tiers = self.tiers.lock();

        if !tiers.disk.is_pending(ticket.id()) {
            // Popped from the pending bytes, or cleared, before the write ran
            self.metrics.record_superseded_write();
            debug!(key = ticket.id(), "Eviction write superseded");
            return;
        }

        let saved = match &bytes {
            Some(bytes) => tiers.disk.save(ticket.id(), bytes),
            None => false,
        };

        if saved {
            ticket.set_status(TicketStatus::OnDisk);
            self.metrics.record_eviction_write();
        } else {
            ticket.set_status(TicketStatus::Lost);
            self.metrics.record_eviction_loss();
            warn!(key = ticket.id(), "Evicted ticket lost");
        }

        tiers.disk.only_put(&ticket);
    }

    fn clear(&self) {
        let mut tiers = self.tiers.lock();
        tiers.memory.clear_all();
        tiers.disk.clear_all();
        self.metrics.record_clear();
        info!("Cleared both tiers");
    }
}

/// Overflow handler that stages evicted bytes and queues their disk write
fn overflow_handler<P: Payload>(
    pending: Arc<PendingWrites>,
    spawner: Spawner,
    shared: Weak<Shared<P>>,
) -> OverflowHandler<P> {
    Box::new(move |ticket: Ticket<P>, bytes: Option<Bytes>| {
        pending.stage(ticket.id(), bytes.clone());

        let shared = shared.clone();
        if let Some(live) = shared.upgrade() {
            live.metrics.record_eviction();
        }
        spawner.spawn(move || {
            if let Some(shared) = shared.upgrade() {
                shared.persist_evicted(ticket, bytes);
            }
        });
    })
}

// =============================================================================
// Tests
// =============================================================================
