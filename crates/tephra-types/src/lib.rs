#![forbid(unsafe_code)]
//! Core identifier types for the Tephra buffer cache.
//!
//! Defines the block-coordinate newtypes, the transaction-group window
//! constants, and the fixed-width block-pointer codec shared by the store
//! and buffer-cache layers.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Smallest addressable block quantum.
pub const MIN_BLOCK_SIZE: u32 = 512;
/// Largest supported block size.
pub const MAX_BLOCK_SIZE: u32 = 128 * 1024;

/// Number of transaction groups that may be open concurrently.
pub const TXG_CONCURRENT_STATES: usize = 3;
/// Size of the per-dnode TXG slot ring (power of two, > concurrent states).
pub const TXG_SIZE: usize = 4;
const TXG_MASK: u64 = (TXG_SIZE as u64) - 1;

/// A named, versioned container of objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub u64);

/// Object number within a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// The meta-object holding object descriptors themselves.  Buffers of
    /// this object are only modified in syncing context and are permitted
    /// to dirty older transaction groups.
    pub const META: Self = Self(0);

    #[must_use]
    pub fn is_meta(self) -> bool {
        self == Self::META
    }
}

/// Indirection level: 0 is a data (leaf) block, >0 an indirect block whose
/// payload is an array of block pointers to children at `level - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Level(pub u8);

impl Level {
    pub const LEAF: Self = Self(0);

    #[must_use]
    pub fn is_leaf(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn up(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Logical block address within an object.
///
/// Two ids are reserved: [`BlockId::BONUS`] names the fixed-size region
/// embedded in the object descriptor, and [`BlockId::SPILL`] the overflow
/// region attached to it.  Neither is a true block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl BlockId {
    pub const BONUS: Self = Self(u64::MAX);
    pub const SPILL: Self = Self(u64::MAX - 1);

    #[must_use]
    pub fn is_bonus(self) -> bool {
        self == Self::BONUS
    }

    #[must_use]
    pub fn is_spill(self) -> bool {
        self == Self::SPILL
    }

    /// True for addressable data/indirect blocks (not bonus, not spill).
    #[must_use]
    pub fn is_ordinary(self) -> bool {
        !self.is_bonus() && !self.is_spill()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bonus() {
            write!(f, "bonus")
        } else if self.is_spill() {
            write!(f, "spill")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Transaction group number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxgId(pub u64);

impl TxgId {
    /// Slot in a `TXG_SIZE`-wide per-object ring.
    #[must_use]
    pub fn slot(self) -> usize {
        (self.0 & TXG_MASK) as usize
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TxgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical byte address in the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockAddr(pub u64);

/// Validated block size (power of two in `MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be a power of two in 512..=131072",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Bit shift between byte offsets and block numbers.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }
}

/// Identity tuple of a cached block: `(dataset, object, level, block-id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DbufKey {
    pub dataset: DatasetId,
    pub object: ObjectId,
    pub level: Level,
    pub blkid: BlockId,
}

impl DbufKey {
    #[must_use]
    pub fn new(dataset: DatasetId, object: ObjectId, level: Level, blkid: BlockId) -> Self {
        Self {
            dataset,
            object,
            level,
            blkid,
        }
    }

    /// CRC64-folded hash over the identity tuple.
    ///
    /// Folds the low bytes of each field through the CRC table and mixes
    /// the high bits in afterwards, so keys differing only in high-order
    /// object or block bits still spread across stripes.
    #[must_use]
    pub fn hash64(&self) -> u64 {
        let ds = self.dataset.0;
        let obj = self.object.0;
        let blkid = self.blkid.0;
        let mut crc = u64::MAX;
        crc = (crc >> 8) ^ CRC64_TABLE[((crc ^ u64::from(self.level.0)) & 0xFF) as usize];
        crc = (crc >> 8) ^ CRC64_TABLE[((crc ^ (ds >> 6)) & 0xFF) as usize];
        crc = (crc >> 8) ^ CRC64_TABLE[((crc ^ obj) & 0xFF) as usize];
        crc = (crc >> 8) ^ CRC64_TABLE[((crc ^ (obj >> 8)) & 0xFF) as usize];
        crc = (crc >> 8) ^ CRC64_TABLE[((crc ^ blkid) & 0xFF) as usize];
        crc = (crc >> 8) ^ CRC64_TABLE[((crc ^ (blkid >> 8)) & 0xFF) as usize];
        crc ^ (ds >> 14) ^ (obj >> 16) ^ (blkid >> 16)
    }
}

impl fmt::Display for DbufKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ds={} obj={} lvl={} blk={}",
            self.dataset.0, self.object.0, self.level.0, self.blkid
        )
    }
}

const CRC64_POLY: u64 = 0xC96C_5795_D787_0F42;

const CRC64_TABLE: [u64; 256] = build_crc64_table();

const fn build_crc64_table() -> [u64; 256] {
    let mut table = [0_u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u64;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC64_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Width of the checksum stored in a block pointer.
pub const CHECKSUM_SIZE: usize = 32;
/// Encoded size of a block pointer.
pub const BLKPTR_SIZE: usize = 64;
/// log2 of [`BLKPTR_SIZE`]; indirect payload holds `blocksize >> BLKPTR_SHIFT` pointers.
pub const BLKPTR_SHIFT: u32 = 6;

const BP_FLAG_HOLE: u32 = 0x1;

/// On-"disk" locator for one block: address, birth TXG, logical size,
/// child fill count, and content checksum.
///
/// Stored either in the object descriptor or inside a parent indirect's
/// payload.  A hole pointer has no backing storage and reads as zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPtr {
    pub addr: BlockAddr,
    pub birth_txg: TxgId,
    /// Number of populated leaf blocks beneath this pointer (1 for a
    /// populated leaf, sum of child fills for an indirect).
    pub fill: u64,
    /// Logical size of the referenced block in bytes.
    pub lsize: u32,
    flags: u32,
    pub checksum: [u8; CHECKSUM_SIZE],
}

impl BlockPtr {
    #[must_use]
    pub fn new(addr: BlockAddr, birth_txg: TxgId, lsize: u32, checksum: [u8; CHECKSUM_SIZE]) -> Self {
        Self {
            addr,
            birth_txg,
            fill: 0,
            lsize,
            flags: 0,
            checksum,
        }
    }

    /// A pointer with no backing storage.
    #[must_use]
    pub fn hole() -> Self {
        Self {
            addr: BlockAddr(0),
            birth_txg: TxgId(0),
            fill: 0,
            lsize: 0,
            flags: BP_FLAG_HOLE,
            checksum: [0; CHECKSUM_SIZE],
        }
    }

    /// Address zero is never allocated, so an all-zero pointer (e.g. a slot
    /// in a freshly zeroed indirect payload) also reads as a hole.
    #[must_use]
    pub fn is_hole(&self) -> bool {
        self.flags & BP_FLAG_HOLE != 0 || self.addr.0 == 0
    }

    /// Serialize into `buf`, which must be exactly [`BLKPTR_SIZE`] bytes.
    pub fn write_to(&self, buf: &mut [u8]) {
        assert_eq!(buf.len(), BLKPTR_SIZE);
        buf[0..8].copy_from_slice(&self.addr.0.to_le_bytes());
        buf[8..16].copy_from_slice(&self.birth_txg.0.to_le_bytes());
        buf[16..24].copy_from_slice(&self.fill.to_le_bytes());
        buf[24..28].copy_from_slice(&self.lsize.to_le_bytes());
        buf[28..32].copy_from_slice(&self.flags.to_le_bytes());
        buf[32..64].copy_from_slice(&self.checksum);
    }

    /// Deserialize from `buf`; rejects short buffers and unknown flags.
    pub fn read_from(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < BLKPTR_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BLKPTR_SIZE,
                actual: buf.len(),
            });
        }
        let le8 = |range: std::ops::Range<usize>| {
            let mut b = [0_u8; 8];
            b.copy_from_slice(&buf[range]);
            u64::from_le_bytes(b)
        };
        let le4 = |range: std::ops::Range<usize>| {
            let mut b = [0_u8; 4];
            b.copy_from_slice(&buf[range]);
            u32::from_le_bytes(b)
        };
        let flags = le4(28..32);
        if flags & !BP_FLAG_HOLE != 0 {
            return Err(ParseError::InvalidField {
                field: "flags",
                reason: "unknown flag bits set",
            });
        }
        let mut checksum = [0_u8; CHECKSUM_SIZE];
        checksum.copy_from_slice(&buf[32..64]);
        Ok(Self {
            addr: BlockAddr(le8(0..8)),
            birth_txg: TxgId(le8(8..16)),
            fill: le8(16..24),
            lsize: le4(24..28),
            flags,
            checksum,
        })
    }
}

/// Decode failures for fixed-layout structures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes, got {actual}")]
    InsufficientData { needed: usize, actual: usize },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_block_ids_are_distinct() {
        assert!(BlockId::BONUS.is_bonus());
        assert!(BlockId::SPILL.is_spill());
        assert_ne!(BlockId::BONUS, BlockId::SPILL);
        assert!(!BlockId(7).is_bonus());
        assert!(BlockId(7).is_ordinary());
        assert!(!BlockId::SPILL.is_ordinary());
    }

    #[test]
    fn txg_slot_wraps_in_ring() {
        assert_eq!(TxgId(1).slot(), 1);
        assert_eq!(TxgId(4).slot(), 0);
        assert_eq!(TxgId(7).slot(), 3);
    }

    #[test]
    fn block_size_rejects_bad_values() {
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(0).is_err());
        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(256).is_err());
        assert!(BlockSize::new(MAX_BLOCK_SIZE * 2).is_err());
        assert_eq!(BlockSize::new(4096).unwrap().shift(), 12);
    }

    #[test]
    fn key_hash_spreads_high_bits() {
        let base = DbufKey::new(DatasetId(1), ObjectId(42), Level(0), BlockId(7));
        let high_obj = DbufKey::new(DatasetId(1), ObjectId(42 | (1 << 40)), Level(0), BlockId(7));
        let high_blk = DbufKey::new(DatasetId(1), ObjectId(42), Level(0), BlockId(7 | (1 << 40)));
        assert_ne!(base.hash64(), high_obj.hash64());
        assert_ne!(base.hash64(), high_blk.hash64());
        assert_eq!(base.hash64(), base.hash64());
    }

    #[test]
    fn blkptr_codec_round_trips() {
        let mut csum = [0_u8; CHECKSUM_SIZE];
        csum[0] = 0xAB;
        csum[31] = 0xCD;
        let bp = BlockPtr {
            fill: 3,
            ..BlockPtr::new(BlockAddr(0xDEAD_BEEF), TxgId(9), 4096, csum)
        };
        let mut buf = [0_u8; BLKPTR_SIZE];
        bp.write_to(&mut buf);
        let decoded = BlockPtr::read_from(&buf).unwrap();
        assert_eq!(decoded, bp);
        assert!(!decoded.is_hole());
    }

    #[test]
    fn blkptr_decode_rejects_garbage() {
        assert!(matches!(
            BlockPtr::read_from(&[0_u8; 10]),
            Err(ParseError::InsufficientData { .. })
        ));
        let mut buf = [0_u8; BLKPTR_SIZE];
        buf[28] = 0xFE; // undefined flag bits
        assert!(matches!(
            BlockPtr::read_from(&buf),
            Err(ParseError::InvalidField { .. })
        ));
    }

    #[test]
    fn hole_pointer_is_self_describing() {
        let hole = BlockPtr::hole();
        assert!(hole.is_hole());
        let mut buf = [0_u8; BLKPTR_SIZE];
        hole.write_to(&mut buf);
        assert!(BlockPtr::read_from(&buf).unwrap().is_hole());
        // A zeroed slot in an indirect payload is a hole too.
        assert!(BlockPtr::read_from(&[0_u8; BLKPTR_SIZE]).unwrap().is_hole());
    }
}
