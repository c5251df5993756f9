//! Signature files.
//!
//! A signature is a manifest of hash regions covering the allocated content
//! of a captured disk image. The next capture intersects it with the disk's
//! current allocation to find what actually changed.
//!
//! Three on-disk versions exist. V1 and V2 store 32-bit sector addresses
//! and a 20-byte digest field; V3 stores 64-bit addresses and a 32-byte
//! digest field. V1 additionally predates the stored hash block size. All
//! versions normalize to the same in-memory form on load.

pub mod codec;
pub mod verify;

use std::io::{self, Write};

use crate::hash::{hex_digest, DigestBytes, HashKind};
use crate::sector::Sector;

/// Magic bytes of a signature file.
pub const SIG_MAGIC: &[u8; 4] = b"imgh";

/// Fixed size of the signature file header in bytes.
pub const SIG_HEADER_SIZE: usize = 128;

/// Default hash block size in sectors (64 KiB). Also the implicit block
/// size of V1 files.
pub const DEFAULT_HASH_BLOCK: u32 = 128;

/// High bit of `chunk_no`: the region starts in the numbered chunk but
/// runs past its end.
const CHUNK_SPAN_BIT: u32 = 0x8000_0000;

/// On-disk signature format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigVersion {
    V1,
    V2,
    V3,
}

impl SigVersion {
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(SigVersion::V1),
            2 => Some(SigVersion::V2),
            3 => Some(SigVersion::V3),
            _ => None,
        }
    }

    pub const fn to_wire(self) -> u32 {
        match self {
            SigVersion::V1 => 1,
            SigVersion::V2 => 2,
            SigVersion::V3 => 3,
        }
    }

    /// Size of one packed region entry for this version.
    pub const fn region_entry_size(self) -> usize {
        match self {
            // start u32, size u32, chunk_no i32, digest[20]
            SigVersion::V1 | SigVersion::V2 => 32,
            // start u64, size u32, chunk_no i32, digest[32]
            SigVersion::V3 => 48,
        }
    }
}

/// One hash region: a sector range plus the digest of its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashRegion {
    pub start: Sector,
    pub size: u32,
    /// Image chunk holding this region's data; high bit flags a region
    /// that spans into the following chunk.
    pub chunk_no: i32,
    /// Zero-padded to [`crate::hash::MAX_DIGEST_LEN`].
    pub digest: DigestBytes,
}

impl HashRegion {
    /// First sector past the region.
    #[inline]
    pub fn end(&self) -> Sector {
        self.start + self.size as u64
    }

    /// Chunk number with the span flag masked off.
    pub fn chunk(&self) -> i32 {
        (self.chunk_no as u32 & !CHUNK_SPAN_BIT) as i32
    }

    /// Whether the region runs past the end of its chunk.
    pub fn spans_chunk(&self) -> bool {
        self.chunk_no as u32 & CHUNK_SPAN_BIT != 0
    }
}

/// An in-memory signature: always 64-bit, always in absolute disk
/// coordinates. The on-disk version and the partition-relative rebasing
/// are codec concerns, see [`codec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub hash_kind: HashKind,
    /// Maximum span of one hash region, in sectors.
    pub hash_block_size: u32,
    /// Sorted by start, non-overlapping.
    pub regions: Vec<HashRegion>,
}

impl Signature {
    /// Create an empty signature.
    pub fn new(hash_kind: HashKind, hash_block_size: u32) -> Self {
        assert!(hash_block_size > 0);
        Self {
            hash_kind,
            hash_block_size,
            regions: Vec::new(),
        }
    }

    /// Total sectors described by the signature.
    pub fn sector_count(&self) -> u64 {
        self.regions.iter().map(|r| r.size as u64).sum()
    }

    /// Largest region size present, used to size I/O buffers.
    pub fn max_region_size(&self) -> u32 {
        self.regions.iter().map(|r| r.size).max().unwrap_or(0)
    }

    /// Byte size of the read buffer implied by the hash block size.
    pub fn block_bytes(&self) -> usize {
        crate::sector::sectors_to_bytes(self.hash_block_size as u64) as usize
    }

    /// Fill in the chunk number for every region that starts inside
    /// `[first_sect, last_sect)`.
    ///
    /// A region that starts inside the window but ends past it gets the
    /// span flag; a region that starts below the window must have been
    /// marked by the call for the previous chunk.
    pub fn update_chunk(&mut self, chunk_no: i32, first_sect: Sector, last_sect: Sector) {
        assert!(chunk_no >= 0);
        for region in &mut self.regions {
            if region.end() <= first_sect {
                continue;
            }
            if region.start >= last_sect {
                break;
            }
            if region.start < first_sect {
                assert!(
                    region.spans_chunk(),
                    "region at sector {} entered chunk {chunk_no} unmarked",
                    region.start
                );
                continue;
            }
            if region.end() <= last_sect {
                region.chunk_no = chunk_no;
            } else {
                region.chunk_no = (chunk_no as u32 | CHUNK_SPAN_BIT) as i32;
            }
        }
    }

    /// Write a human-readable region listing for debugging.
    pub fn dump(&self, w: &mut impl Write) -> io::Result<()> {
        let hlen = self.hash_kind.digest_len();
        let mut total = 0u64;
        for region in &self.regions {
            writeln!(
                w,
                "[{}-{}]: hash {}",
                region.start,
                region.end() - 1,
                hex_digest(&region.digest, hlen)
            )?;
            total += region.size as u64;
        }
        writeln!(w, "TOTAL = {total}")
    }
}
