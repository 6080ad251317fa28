//! Guest memory pointers.
//!
//! A [`GuestPtr`] is a plain u32 offset into one instance's linear memory.
//! Pointers are only meaningful relative to their owning instance and must
//! never be reused across instances. The zero pointer is the guest's null.

use serde::{Deserialize, Serialize};

/// Offset into a guest instance's linear memory.
///
/// Semantically tagged by use (array-header pointer, string pointer,
/// opaque internref) at the call sites; the representation is identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GuestPtr(u32);

impl GuestPtr {
    /// The guest null pointer
    pub const NULL: Self = Self(0);

    /// Create from a raw offset
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw offset
    #[must_use]
    pub const fn as_raw(&self) -> u32 {
        self.0
    }

    /// Whether this is the guest null pointer
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Offset arithmetic, checked against u32 wrap-around
    #[must_use]
    pub const fn checked_add(&self, bytes: u32) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Offset arithmetic toward lower addresses
    #[must_use]
    pub const fn checked_sub(&self, bytes: u32) -> Option<Self> {
        match self.0.checked_sub(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl std::fmt::Display for GuestPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl From<u32> for GuestPtr {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}
