//! Cached entry roles and metadata.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Role bitmask of a cached resource.
///
/// A resource may hold several roles at once; adding an entry for a URL that is
/// already present merges the roles instead of creating a second entry.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryFlags(u32);

impl EntryFlags {
    pub const MASTER: Self = Self(1 << 0);
    pub const MANIFEST: Self = Self(1 << 1);
    pub const EXPLICIT: Self = Self(1 << 2);
    pub const FOREIGN: Self = Self(1 << 3);
    pub const FALLBACK: Self = Self(1 << 4);
    pub const INTERCEPT: Self = Self(1 << 5);
    pub const EXECUTABLE: Self = Self(1 << 6);

    const NAMES: [(Self, &'static str); 7] = [
        (Self::MASTER, "MASTER"),
        (Self::MANIFEST, "MANIFEST"),
        (Self::EXPLICIT, "EXPLICIT"),
        (Self::FOREIGN, "FOREIGN"),
        (Self::FALLBACK, "FALLBACK"),
        (Self::INTERCEPT, "INTERCEPT"),
        (Self::EXECUTABLE, "EXECUTABLE"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Rebuild flags from a stored integer, dropping unknown bits.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & 0x7f)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EntryFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EntryFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EntryFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "EntryFlags({})", names.join(" | "))
    }
}

/// One cached resource: its roles plus the blob holding the response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub flags: EntryFlags,
    pub response_id: i64,
    pub response_size: i64,
}

impl Entry {
    /// Sentinel for entries that have no stored response yet.
    pub const NO_RESPONSE_ID: i64 = 0;

    pub fn new(flags: EntryFlags, response_id: i64, response_size: i64) -> Self {
        Self {
            flags,
            response_id,
            response_size,
        }
    }

    pub fn has_response_id(&self) -> bool {
        self.response_id != Self::NO_RESPONSE_ID
    }

    pub fn is_master(&self) -> bool {
        self.flags.contains(EntryFlags::MASTER)
    }

    pub fn is_manifest(&self) -> bool {
        self.flags.contains(EntryFlags::MANIFEST)
    }

    pub fn is_explicit(&self) -> bool {
        self.flags.contains(EntryFlags::EXPLICIT)
    }

    pub fn is_foreign(&self) -> bool {
        self.flags.contains(EntryFlags::FOREIGN)
    }

    pub fn is_fallback(&self) -> bool {
        self.flags.contains(EntryFlags::FALLBACK)
    }

    pub fn is_intercept(&self) -> bool {
        self.flags.contains(EntryFlags::INTERCEPT)
    }

    /// Failure to fetch an entry with any of these roles fails the whole update.
    pub fn is_required(&self) -> bool {
        self.flags
            .intersects(EntryFlags::EXPLICIT | EntryFlags::FALLBACK | EntryFlags::INTERCEPT)
    }
}
