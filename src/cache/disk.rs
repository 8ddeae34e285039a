//! Disk Tier - Local File Cache
//!
//! One file per ticket under the configured directory, plus an in-memory
//! index (key -> status, size) so membership checks never touch the
//! filesystem.
//!
//! # Design
//!
//! - Files are written to a temporary name and renamed into place
//! - Capacity is a hard limit: a write that does not fit fails, nothing on
//!   disk is evicted to make room
//! - A key whose eviction write failed stays in the index as `Lost`
//! - Evicted tickets whose write is still queued live in [`PendingWrites`],
//!   so the key never disappears from both tiers at once

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::key::KeyGenerator;
use super::ticket::{Payload, Ticket, TicketStatus};
use super::{TEMP_EXTENSION, TICKET_EXTENSION};
use crate::error::{Error, Result};

/// Evicted tickets waiting for their disk write
///
/// `None` bytes mark a ticket whose payload could not be serialized; it will
/// settle as `Lost`.
#[derive(Debug, Default)]
pub struct PendingWrites {
    inner: Mutex<HashMap<String, Option<Bytes>>>,
}

impl PendingWrites {
    /// Create an empty handoff area
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an evicted ticket's bytes
    pub fn stage(&self, id: &str, bytes: Option<Bytes>) {
        self.inner.lock().insert(id.to_string(), bytes);
    }

    /// Check if a key is staged
    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().contains_key(id)
    }

    /// Take staged bytes, leaving unserializable entries in place
    pub fn take_bytes(&self, id: &str) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        match inner.get(id) {
            Some(Some(_)) => inner.remove(id).flatten(),
            _ => None,
        }
    }

    /// Drop a staged key
    pub fn remove(&self, id: &str) -> bool {
        self.inner.lock().remove(id).is_some()
    }

    /// Drop every staged key
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Number of staged keys
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if nothing is staged
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Index entry for a key known to the disk tier
#[derive(Debug, Clone)]
pub struct IndexEntry {
    /// `OnDisk` or `Lost`
    pub status: TicketStatus,
    /// Bytes persisted for this key (0 when lost)
    pub size: u64,
    /// When the entry was written or registered
    pub stored_at: DateTime<Utc>,
}

/// Disk tier - persistent, capacity-bounded key/value store
#[derive(Debug)]
pub struct DiskTier {
    /// Directory holding ticket files
    dir: PathBuf,
    /// Maximum capacity in bytes
    capacity: u64,
    /// Persisted bytes
    usage: u64,
    /// Key index
    index: HashMap<String, IndexEntry>,
    /// Eviction handoff
    pending: Arc<PendingWrites>,
}

impl DiskTier {
    /// Open a disk tier rooted at `dir`
    ///
    /// With `recover` the index is rebuilt from ticket files already in the
    /// directory; otherwise those files are deleted.
    pub fn open(dir: impl Into<PathBuf>, capacity: u64, recover: bool) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::io_at(&dir, e))?;

        let mut tier = Self {
            dir,
            capacity,
            usage: 0,
            index: HashMap::new(),
            pending: Arc::new(PendingWrites::new()),
        };

        if recover {
            tier.rebuild_index()?;
            let oldest = tier.index.values().map(|e| e.stored_at).min();
            info!(
                dir = %tier.dir.display(),
                entries = tier.index.len(),
                bytes = tier.usage,
                oldest = ?oldest.map(|t| t.to_rfc3339()),
                "Recovered disk tier"
            );
        } else {
            let removed = tier.wipe_directory()?;
            debug!(dir = %tier.dir.display(), removed, "Opened empty disk tier");
        }

        Ok(tier)
    }

    /// Handoff area shared with the memory tier's overflow handler
    pub fn pending_writes(&self) -> Arc<PendingWrites> {
        Arc::clone(&self.pending)
    }

    /// Serialize and persist a ticket synchronously
    ///
    /// Fails on capacity exceeded or I/O error. Sets the ticket's status to
    /// `OnDisk` on success. The coordinator never writes directly; it only
    /// persists through evictions.
    #[allow(dead_code)]
    pub fn put<P: Payload>(&mut self, ticket: &mut Ticket<P>) -> bool {
        let bytes = match ticket.payload().to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = ticket.id(), error = %e, "Cannot serialize payload for disk");
                return false;
            }
        };

        if self.save(ticket.id(), &bytes) {
            ticket.set_status(TicketStatus::OnDisk);
            true
        } else {
            false
        }
    }

    /// Persist raw ticket bytes under `id`
    pub fn save(&mut self, id: &str, bytes: &[u8]) -> bool {
        match self.try_save(id, bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!(key = id, error = %e, "Disk write failed");
                false
            }
        }
    }

    fn try_save(&mut self, id: &str, bytes: &[u8]) -> Result<()> {
        if !KeyGenerator::is_well_formed(id) {
            return Err(Error::InvalidKey(id.to_string()));
        }

        let size = bytes.len() as u64;
        let replaced = self
            .index
            .get(id)
            .filter(|e| e.status == TicketStatus::OnDisk)
            .map_or(0, |e| e.size);

        let available = self.capacity.saturating_sub(self.usage - replaced);
        if size > available {
            return Err(Error::CapacityExceeded {
                needed: size,
                available,
            });
        }

        self.write_atomic(id, bytes)?;

        self.usage = self.usage - replaced + size;
        self.index.insert(
            id.to_string(),
            IndexEntry {
                status: TicketStatus::OnDisk,
                size,
                stored_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn write_atomic(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(id);
        let tmp = path.with_extension(TEMP_EXTENSION);

        if let Err(e) = fs::write(&tmp, bytes) {
            let _ = fs::remove_file(&tmp);
            return Err(Error::io_at(tmp, e));
        }
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::io_at(&path, e)
        })
    }

    /// Register a ticket's final status without writing bytes
    ///
    /// Settles a staged eviction: after this the key is discoverable through
    /// the index whether or not its write succeeded.
    pub fn only_put<P>(&mut self, ticket: &Ticket<P>) {
        if !KeyGenerator::is_well_formed(ticket.id()) {
            warn!(key = ticket.id(), "Refusing to index malformed key");
            self.pending.remove(ticket.id());
            return;
        }
        let entry = self
            .index
            .entry(ticket.id().to_string())
            .or_insert_with(|| IndexEntry {
                status: ticket.status(),
                size: 0,
                stored_at: Utc::now(),
            });
        entry.status = ticket.status();
        self.pending.remove(ticket.id());
    }

    /// Remove and return a ticket
    ///
    /// Staged (not yet written) tickets are served from their pending bytes.
    /// `Lost` keys yield `None` and stay in the index.
    pub fn pop<P: Payload>(&mut self, id: &str) -> Option<Ticket<P>> {
        if let Some(bytes) = self.pending.take_bytes(id) {
            debug!(key = id, "Serving pop from pending write");
            return match decode::<P>(id, &bytes) {
                Some(payload) => Some(Ticket::with_status(
                    id.to_string(),
                    TicketStatus::Resumed,
                    payload,
                )),
                None => {
                    // The queued write will see the key settled and skip it
                    self.index.insert(
                        id.to_string(),
                        IndexEntry {
                            status: TicketStatus::Lost,
                            size: 0,
                            stored_at: Utc::now(),
                        },
                    );
                    None
                }
            };
        }

        let status = self.index.get(id)?.status;
        if status == TicketStatus::Lost {
            debug!(key = id, "Pop of lost ticket");
            return None;
        }

        let path = self.path_for(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = id, path = %path.display(), error = %e, "Disk read failed");
                self.mark_lost(id);
                return None;
            }
        };

        match decode::<P>(id, &bytes) {
            Some(payload) => {
                self.remove_persisted(id);
                Some(Ticket::with_status(
                    id.to_string(),
                    TicketStatus::Resumed,
                    payload,
                ))
            }
            None => {
                self.mark_lost(id);
                None
            }
        }
    }

    /// Delete a key's file and index entry
    fn remove_persisted(&mut self, id: &str) {
        if let Some(entry) = self.index.remove(id) {
            self.usage -= entry.size;
        }
        remove_if_exists(&self.path_for(id));
    }

    /// Keep the key as `Lost`, releasing its bytes
    fn mark_lost(&mut self, id: &str) {
        remove_if_exists(&self.path_for(id));
        if let Some(entry) = self.index.get_mut(id) {
            self.usage -= entry.size;
            entry.size = 0;
            entry.status = TicketStatus::Lost;
        }
    }

    /// Check if the tier knows a key (persisted, lost, or pending)
    pub fn has_cached(&self, id: &str) -> bool {
        self.index.contains_key(id) || self.pending.contains(id)
    }

    /// Check if a key's eviction write is still pending
    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains(id)
    }

    /// Status of a key known to the tier
    pub fn status(&self, id: &str) -> Option<TicketStatus> {
        if self.pending.contains(id) {
            return Some(TicketStatus::Caching);
        }
        self.index.get(id).map(|e| e.status)
    }

    /// Index entry for a key
    pub fn entry(&self, id: &str) -> Option<&IndexEntry> {
        self.index.get(id)
    }

    /// Delete every persisted ticket and reset the index
    pub fn clear_all(&mut self) {
        self.pending.clear();
        self.index.clear();
        self.usage = 0;

        if let Err(e) = self.wipe_directory() {
            warn!(dir = %self.dir.display(), error = %e, "Failed to wipe disk tier");
        }
    }

    /// Rebuild the index from ticket files in the directory
    fn rebuild_index(&mut self) -> Result<()> {
        for entry in fs::read_dir(&self.dir).map_err(|e| Error::io_at(&self.dir, e))? {
            let path = entry?.path();

            if has_extension(&path, TEMP_EXTENSION) {
                remove_if_exists(&path);
                continue;
            }
            if !has_extension(&path, TICKET_EXTENSION) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !KeyGenerator::is_well_formed(id) {
                continue;
            }

            let metadata = fs::metadata(&path).map_err(|e| Error::io_at(&path, e))?;
            let stored_at = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            self.usage += metadata.len();
            self.index.insert(
                id.to_string(),
                IndexEntry {
                    status: TicketStatus::OnDisk,
                    size: metadata.len(),
                    stored_at,
                },
            );
        }
        Ok(())
    }

    /// Delete ticket and temporary files, returning how many were removed
    fn wipe_directory(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::io_at(&self.dir, e)),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if has_extension(&path, TICKET_EXTENSION) || has_extension(&path, TEMP_EXTENSION) {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::io_at(path, e)),
                }
            }
        }
        Ok(removed)
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, TICKET_EXTENSION))
    }

    /// Get persisted size in bytes
    pub fn usage(&self) -> u64 {
        self.usage
    }

    /// Get capacity
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of indexed keys (persisted or lost)
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Check if the index is empty and nothing is pending
    pub fn is_empty(&self) -> bool {
        self.index.is_empty() && self.pending.is_empty()
    }

    /// Directory holding ticket files
    pub fn directory(&self) -> &Path {
        &self.dir
    }
}

fn decode<P: Payload>(id: &str, bytes: &[u8]) -> Option<P> {
    match P::from_bytes(bytes) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(key = id, error = %e, "Cannot deserialize ticket bytes");
            None
        }
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove ticket file");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn key(n: u8) -> String {
        format!("{:032x}", n)
    }

    fn open(dir: &TempDir, capacity: u64) -> DiskTier {
        DiskTier::open(dir.path(), capacity, false).unwrap()
    }

    fn ticket(id: &str, data: &[u8]) -> Ticket<Vec<u8>> {
        Ticket::new(id.to_string(), data.to_vec())
    }

    #[test]
    fn test_put_pop() {
        let dir = TempDir::new().unwrap();
        let mut tier = open(&dir, 1 << 20);

        let mut t = ticket(&key(1), b"persisted payload");
        assert!(tier.put(&mut t));
        assert_eq!(t.status(), TicketStatus::OnDisk);
        assert!(tier.has_cached(&key(1)));
        assert_eq!(tier.usage(), 17);
        assert!(dir.path().join(format!("{}.ticket", key(1))).exists());

        let popped: Ticket<Vec<u8>> = tier.pop(&key(1)).unwrap();
        assert_eq!(popped.status(), TicketStatus::Resumed);
        assert_eq!(popped.payload().as_slice(), b"persisted payload");
        assert!(!tier.has_cached(&key(1)));
        assert_eq!(tier.usage(), 0);
        assert!(!dir.path().join(format!("{}.ticket", key(1))).exists());

        assert!(tier.pop::<Vec<u8>>(&key(1)).is_none());
    }

    #[test]
    fn test_capacity_is_a_hard_limit() {
        let dir = TempDir::new().unwrap();
        let mut tier = open(&dir, 100);

        assert!(tier.put(&mut ticket(&key(1), &[1u8; 60])));
        let mut second = ticket(&key(2), &[2u8; 60]);
        assert!(!tier.put(&mut second));
        assert_eq!(second.status(), TicketStatus::Caching);

        // Nothing was evicted to make room
        assert!(tier.has_cached(&key(1)));
        assert!(!tier.has_cached(&key(2)));
        assert_eq!(tier.usage(), 60);
    }

    #[test]
    fn test_save_then_only_put_settles_pending() {
        let dir = TempDir::new().unwrap();
        let mut tier = open(&dir, 1 << 20);
        let pending = tier.pending_writes();

        let id = key(3);
        pending.stage(&id, Some(Bytes::from_static(b"evicted")));
        assert!(tier.has_cached(&id));
        assert_eq!(tier.status(&id), Some(TicketStatus::Caching));

        assert!(tier.save(&id, b"evicted"));
        let mut t = ticket(&id, b"evicted");
        t.set_status(TicketStatus::OnDisk);
        tier.only_put(&t);

        assert!(!tier.is_pending(&id));
        assert_eq!(tier.status(&id), Some(TicketStatus::OnDisk));
        assert_eq!(tier.entry(&id).unwrap().size, 7);
    }

    #[test]
    fn test_lost_key_stays_queryable() {
        let dir = TempDir::new().unwrap();
        let mut tier = open(&dir, 4);

        let id = key(4);
        tier.pending_writes().stage(&id, Some(Bytes::from_static(b"too large")));
        assert!(!tier.save(&id, b"too large"));

        let mut t = ticket(&id, b"too large");
        t.set_status(TicketStatus::Lost);
        tier.only_put(&t);

        assert!(tier.has_cached(&id));
        assert_eq!(tier.status(&id), Some(TicketStatus::Lost));
        assert!(tier.pop::<Vec<u8>>(&id).is_none());
        assert!(tier.pop::<Vec<u8>>(&id).is_none());
        assert!(tier.has_cached(&id));
        assert_eq!(tier.usage(), 0);
    }

    #[test]
    fn test_pop_serves_pending_bytes() {
        let dir = TempDir::new().unwrap();
        let mut tier = open(&dir, 1 << 20);

        let id = key(5);
        tier.pending_writes().stage(&id, Some(Bytes::from_static(b"in flight")));

        let popped: Ticket<Vec<u8>> = tier.pop(&id).unwrap();
        assert_eq!(popped.payload().as_slice(), b"in flight");
        assert_eq!(popped.status(), TicketStatus::Resumed);
        assert!(!tier.has_cached(&id));
        assert!(!tier.is_pending(&id));
    }

    #[test]
    fn test_undecodable_pending_bytes_become_lost() {
        let dir = TempDir::new().unwrap();
        let mut tier = open(&dir, 1 << 20);

        let id = key(11);
        tier.pending_writes().stage(&id, Some(Bytes::from_static(&[0xff, 0xfe])));

        assert!(tier.pop::<String>(&id).is_none());
        assert!(!tier.is_pending(&id));
        assert!(tier.has_cached(&id));
        assert_eq!(tier.status(&id), Some(TicketStatus::Lost));
        assert!(tier.pop::<String>(&id).is_none());
        assert_eq!(tier.usage(), 0);
    }

    #[test]
    fn test_foreign_keys_never_touch_the_filesystem() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("tier");
        let mut tier = DiskTier::open(&root, 1 << 20, false).unwrap();

        assert!(!tier.save("../escaped", b"outside"));
        assert!(!dir.path().join("escaped.ticket").exists());
        assert!(!tier.has_cached("../escaped"));
        assert_matches!(
            tier.try_save("not-a-key", b"x"),
            Err(Error::InvalidKey(_))
        );

        let mut t = ticket("../escaped", b"outside");
        t.set_status(TicketStatus::Lost);
        tier.only_put(&t);
        assert!(!tier.has_cached("../escaped"));
        assert!(tier.pop::<Vec<u8>>("../escaped").is_none());
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    }

    #[test]
    fn test_unserializable_pending_is_not_popped() {
        let dir = TempDir::new().unwrap();
        let mut tier = open(&dir, 1 << 20);

        let id = key(6);
        tier.pending_writes().stage(&id, None);
        assert!(tier.pop::<Vec<u8>>(&id).is_none());
        assert!(tier.is_pending(&id));
    }

    #[test]
    fn test_io_failure_marks_write_failed() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("tier");
        let mut tier = DiskTier::open(&root, 1 << 20, false).unwrap();

        fs::remove_dir_all(&root).unwrap();
        assert!(!tier.save(&key(7), b"nowhere to go"));
        assert!(!tier.has_cached(&key(7)));
        assert_eq!(tier.usage(), 0);
    }

    #[test]
    fn test_missing_file_on_pop_becomes_lost() {
        let dir = TempDir::new().unwrap();
        let mut tier = open(&dir, 1 << 20);

        let id = key(8);
        assert!(tier.save(&id, b"vanishing"));
        fs::remove_file(dir.path().join(format!("{}.ticket", id))).unwrap();

        assert!(tier.pop::<Vec<u8>>(&id).is_none());
        assert_eq!(tier.status(&id), Some(TicketStatus::Lost));
        assert_eq!(tier.usage(), 0);
    }

    #[test]
    fn test_clear_all() {
        let dir = TempDir::new().unwrap();
        let mut tier = open(&dir, 1 << 20);

        for n in 0..5 {
            assert!(tier.save(&key(n), &[n; 32]));
        }
        tier.pending_writes().stage(&key(9), Some(Bytes::from_static(b"x")));
        assert_eq!(tier.len(), 5);

        tier.clear_all();
        assert!(tier.is_empty());
        assert_eq!(tier.usage(), 0);
        for n in 0..5 {
            assert!(!tier.has_cached(&key(n)));
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_open_wipes_or_recovers() {
        let dir = TempDir::new().unwrap();
        {
            let mut tier = open(&dir, 1 << 20);
            assert!(tier.save(&key(1), b"first"));
            assert!(tier.save(&key(2), b"second"));
        }
        fs::write(dir.path().join("notes.txt"), b"not ours").unwrap();
        fs::write(dir.path().join(format!("{}.tmp", key(3))), b"torn").unwrap();

        let mut recovered = DiskTier::open(dir.path(), 1 << 20, true).unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered.usage(), 11);
        assert_matches!(recovered.status(&key(1)), Some(TicketStatus::OnDisk));
        let popped: Ticket<Vec<u8>> = recovered.pop(&key(2)).unwrap();
        assert_eq!(popped.payload().as_slice(), b"second");
        assert!(!dir.path().join(format!("{}.tmp", key(3))).exists());

        let fresh = open(&dir, 1 << 20);
        assert!(fresh.is_empty());
        assert!(!fresh.has_cached(&key(1)));
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_pop_of_undecodable_bytes() {
        let dir = TempDir::new().unwrap();
        let mut tier = open(&dir, 1 << 20);

        let id = key(10);
        assert!(tier.save(&id, &[0xff, 0xfe, 0xfd]));
        assert!(tier.pop::<String>(&id).is_none());
        assert_eq!(tier.status(&id), Some(TicketStatus::Lost));
    }

    #[test]
    fn test_open_reports_bad_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain-file");
        fs::write(&file, b"").unwrap();

        let result = DiskTier::open(file.join("nested"), 1024, false);
        assert_matches!(result, Err(Error::IoAt { .. }));
    }
}
