// vim: tw=80
//! Deterministic, distinguishable data patterns
//!
//! A `Pattern` is only a descriptor.  Its content is generated on demand, so
//! the writer and the verifier can each produce identical bytes without ever
//! sharing a buffer.
//!
//! Every sector of generated content begins with a stamp identifying the
//! pattern that produced it.  The remainder of the sector is pseudo-random,
//! seeded by the pattern's identity and the sector's position within the
//! region.  So two patterns that differ in either volume or sequence number
//! always differ within the first sector, and stale data that happens to carry
//! a valid stamp can still be traced back to the write that produced it.

use byteorder::{ByteOrder, LittleEndian};
use metrohash::MetroHash128;
use rand::{RngCore, SeedableRng};
use rand_xorshift::XorShiftRng;
use serde_derive::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    hash::Hasher,
};

use crate::types::VolumeId;

/// Granularity of pattern stamps.
pub const SECTOR_SIZE: usize = 512;

/// Length of the identifying stamp at the start of each sector.  Regions
/// shorter than this are not guaranteed to be distinguishable.
pub const STAMP_LEN: usize = 16;

const MAGIC: u32 = 0x524f_5053;

/// The identity of a pattern.  Together with a length, it fully determines
/// the pattern's content.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub struct PatternId {
    pub volume: VolumeId,
    pub seq:    u64,
}

impl Display for PatternId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.volume, self.seq)
    }
}

#[derive(Debug, Eq, PartialEq)]
pub struct Pattern {
    id: PatternId,
}

impl Pattern {
    pub fn new(id: PatternId) -> Self {
        Pattern { id }
    }

    /// Fill `buf` with this pattern's content, as if `buf` were the entire
    /// region.
    pub fn fill(&self, buf: &mut [u8]) {
        let mut stamp = [0u8; STAMP_LEN];
        LittleEndian::write_u32(&mut stamp[0..4], MAGIC);
        LittleEndian::write_u32(&mut stamp[4..8], self.id.volume);
        LittleEndian::write_u64(&mut stamp[8..16], self.id.seq);
        for (i, sector) in buf.chunks_mut(SECTOR_SIZE).enumerate() {
            let n = STAMP_LEN.min(sector.len());
            sector[..n].copy_from_slice(&stamp[..n]);
            if sector.len() > STAMP_LEN {
                self.sector_rng(i as u64)
                    .fill_bytes(&mut sector[STAMP_LEN..]);
            }
        }
    }

    /// Generate `len` bytes of this pattern's content.
    pub fn generate(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.fill(&mut buf);
        buf
    }

    pub fn id(&self) -> PatternId {
        self.id
    }

    /// The generator for the body of sector number `sector`.  Volume, sequence
    /// and sector together don't fit in a 128-bit seed, so they are hashed.
    fn sector_rng(&self, sector: u64) -> XorShiftRng {
        let mut hasher = MetroHash128::new();
        hasher.write_u32(self.id.volume);
        hasher.write_u64(self.id.seq);
        hasher.write_u64(sector);
        let (lo, hi) = hasher.finish128();
        let mut seed = [0u8; 16];
        LittleEndian::write_u64(&mut seed[0..8], lo);
        LittleEndian::write_u64(&mut seed[8..16], hi);
        // XorShiftRng replaces an all-zero seed with a fixed nonzero one
        XorShiftRng::from_seed(seed)
    }
}

/// Recover the identity of the pattern that produced `buf`, judging by the
/// stamp in its first sector.
///
/// Returns `None` if `buf` doesn't begin with a stamp, for example because the
/// region was never written.
pub fn identify(buf: &[u8]) -> Option<PatternId> {
    if buf.len() < STAMP_LEN || LittleEndian::read_u32(&buf[0..4]) != MAGIC {
        return None;
    }
    Some(PatternId {
        volume: LittleEndian::read_u32(&buf[4..8]),
        seq:    LittleEndian::read_u64(&buf[8..16]),
    })
}
