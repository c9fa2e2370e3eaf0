//! Dbuf state bits and the legal-combination table.
//!
//! States are bit-flags.  UNCACHED, NOFILL, CACHED, and EVICTING are
//! exclusive; PARTIAL, READ, and FILL combine: `PARTIAL|FILL`, `READ|FILL`,
//! `PARTIAL|READ`, and `PARTIAL|READ|FILL` are the only legal composites.

use std::fmt;

/// Bit-set of dbuf lifecycle states.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DbufState(u8);

impl DbufState {
    /// No data present.
    pub const UNCACHED: Self = Self(0x01);
    /// Frontend fully valid.
    pub const CACHED: Self = Self(0x02);
    /// A backing read is in flight to fill or resolve the frontend.
    pub const READ: Self = Self(0x04);
    /// A writer currently owns the right to modify the frontend.
    pub const FILL: Self = Self(0x08);
    /// Some bytes written by a client; the rest still needs RMW from disk.
    pub const PARTIAL: Self = Self(0x10);
    /// Dirty without user data (block-pointer-only update).
    pub const NOFILL: Self = Self(0x20);
    /// Being destroyed; no new holds admitted.
    pub const EVICTING: Self = Self(0x40);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// True when the bits in `mask` are either absent or, together with
    /// `exceptions`, the only bits set.  This is the exclusivity check the
    /// verifier applies to each state bit.
    #[must_use]
    fn exclusive_with(self, mask: Self, exceptions: Self) -> bool {
        self.0 & mask.0 == 0 || self.0 & !(mask.0 | exceptions.0) == 0
    }

    /// Whether this combination of bits is ever legal.
    #[must_use]
    pub fn is_legal(self) -> bool {
        self.0 != 0
            && self.exclusive_with(Self::UNCACHED, Self(0))
            && self.exclusive_with(Self::NOFILL, Self(0))
            && self.exclusive_with(Self::CACHED, Self(0))
            && self.exclusive_with(Self::EVICTING, Self(0))
            && self.exclusive_with(Self::PARTIAL, Self::READ.with(Self::FILL))
            && self.exclusive_with(Self::READ, Self::PARTIAL.with(Self::FILL))
            && self.exclusive_with(Self::FILL, Self::PARTIAL.with(Self::READ))
    }
}

impl fmt::Debug for DbufState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut put = |name: &str| -> fmt::Result {
            if !first {
                write!(f, "|")?;
            }
            first = false;
            write!(f, "{name}")
        };
        if self.contains(Self::UNCACHED) {
            put("UNCACHED")?;
        }
        if self.contains(Self::CACHED) {
            put("CACHED")?;
        }
        if self.contains(Self::READ) {
            put("READ")?;
        }
        if self.contains(Self::FILL) {
            put("FILL")?;
        }
        if self.contains(Self::PARTIAL) {
            put("PARTIAL")?;
        }
        if self.contains(Self::NOFILL) {
            put("NOFILL")?;
        }
        if self.contains(Self::EVICTING) {
            put("EVICTING")?;
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

impl fmt::Display for DbufState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
