//! Ticket Key Generation
//!
//! Keys are random (v4) UUIDs rendered as 32 lowercase hex digits. 122 bits
//! of randomness make a collision within one process lifetime negligible,
//! and the hex alphabet keeps keys safe to use as file names on disk.

use uuid::Uuid;

/// Produces process-unique ticket keys
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyGenerator;

impl KeyGenerator {
    /// Create a new key generator
    pub fn new() -> Self {
        Self
    }

    /// Generate a fresh key
    #[inline]
    pub fn generate(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Check whether a string has the shape of a generated key
    pub fn is_well_formed(key: &str) -> bool {
        key.len() == 32 && key.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

// =============================================================================
// Tests
// =============================================================================
