//! Byte-range fixups applied to disk data before hashing.
//!
//! Some filesystems keep partition-dependent structures (BSD disklabels,
//! boot loader maps) whose bytes differ between the captured image and the
//! disk they came from. Probes register fixups for those byte ranges; the
//! hasher patches its read buffer with them so digests match what was
//! captured.
//!
//! Applying a fixup consumes it from the active set. Hashing therefore
//! drains fixups that a later pass may still need, so the delta engine
//! snapshots the set with [`FixupSet::save`] before walking and reinstates
//! it with [`FixupSet::restore`] afterwards, on success and failure alike.

use crate::error::{Error, Result};
use crate::sector::{sectors_to_bytes, Sector, SECTOR_SIZE};

/// A byte-range patch. The payload replaces the disk bytes starting at
/// `byte_start`; a fixup never crosses a sector boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fixup {
    pub byte_start: u64,
    pub data: Vec<u8>,
}

impl Fixup {
    pub fn byte_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// First byte past the fixup.
    pub fn byte_end(&self) -> u64 {
        self.byte_start + self.data.len() as u64
    }
}

/// An ordered set of fixups with a one-level snapshot.
#[derive(Debug, Default)]
pub struct FixupSet {
    // Sorted by byte_start.
    fixups: Vec<Fixup>,
    saved: Option<Vec<Fixup>>,
    applied_total: u64,
    applied_since_save: u64,
}

impl FixupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fixup. Fails with `FixupViolation` if the payload would
    /// cross a sector boundary.
    pub fn insert(&mut self, byte_start: u64, data: Vec<u8>) -> Result<()> {
        let offset = byte_start % SECTOR_SIZE as u64;
        if offset + data.len() as u64 > SECTOR_SIZE as u64 {
            return Err(Error::FixupViolation {
                offset,
                size: data.len() as u64,
            });
        }
        let at = self
            .fixups
            .partition_point(|f| f.byte_start <= byte_start);
        self.fixups.insert(at, Fixup { byte_start, data });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.fixups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixups.is_empty()
    }

    pub fn fixups(&self) -> &[Fixup] {
        &self.fixups
    }

    /// Number of fixups applied so far.
    pub fn applied(&self) -> u64 {
        self.applied_total
    }

    /// Does any fixup overlap the given sector range?
    pub fn has_fixup(&self, start: Sector, size: u32) -> bool {
        let begin = sectors_to_bytes(start);
        let end = sectors_to_bytes(start + size as u64);
        for f in &self.fixups {
            if f.byte_start >= end {
                break;
            }
            if f.byte_end() > begin {
                return true;
            }
        }
        false
    }

    /// Patch `buf` (holding disk bytes `[byte_start, byte_start+byte_size)`)
    /// with every overlapping fixup. Fully covered fixups are consumed.
    pub fn apply(&mut self, byte_start: u64, byte_size: u64, buf: &mut [u8]) {
        debug_assert!(buf.len() as u64 >= byte_size);
        let end = byte_start + byte_size;
        let mut i = 0;
        while i < self.fixups.len() {
            let f = &self.fixups[i];
            if f.byte_start >= end {
                break;
            }
            if f.byte_end() <= byte_start {
                i += 1;
                continue;
            }
            // Copy the intersecting part of the payload.
            let from = f.byte_start.max(byte_start);
            let to = f.byte_end().min(end);
            let src = (from - f.byte_start) as usize;
            let dst = (from - byte_start) as usize;
            let n = (to - from) as usize;
            buf[dst..dst + n].copy_from_slice(&self.fixups[i].data[src..src + n]);

            if f.byte_start >= byte_start && f.byte_end() <= end {
                self.fixups.remove(i);
                self.applied_total += 1;
                self.applied_since_save += 1;
            } else {
                i += 1;
            }
        }
    }

    /// Snapshot the set. Only one level is supported.
    pub fn save(&mut self) {
        assert!(self.saved.is_none(), "fixup snapshot already taken");
        self.saved = Some(self.fixups.clone());
        self.applied_since_save = 0;
    }

    /// Reinstate the snapshot taken by [`save`](Self::save).
    ///
    /// With `keep_changes` false (the error path) applications performed
    /// since the snapshot are discarded from the accounting as well.
    pub fn restore(&mut self, keep_changes: bool) {
        let saved = self.saved.take().expect("no fixup snapshot to restore");
        if !keep_changes {
            self.applied_total -= self.applied_since_save;
        }
        self.applied_since_save = 0;
        self.fixups = saved;
    }
}
