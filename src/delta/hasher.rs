//! Reading and digesting hash-block ranges from the disk.

use std::io::{Read, Seek, SeekFrom};

use log::trace;

use crate::error::{Error, Result};
use crate::fixup::FixupSet;
use crate::hash::{DigestBytes, HashKind};
use crate::sector::{sectors_to_bytes, Sector};

/// Reads sector ranges from a disk, applies overlapping fixups, and
/// digests the result. Owns the single scratch buffer sized to the hash
/// block.
pub struct BlockHasher<'d, R: Read + Seek> {
    disk: &'d mut R,
    kind: HashKind,
    block_size: u32,
    buf: Vec<u8>,
}

impl<'d, R: Read + Seek> BlockHasher<'d, R> {
    pub fn new(disk: &'d mut R, kind: HashKind, block_size: u32) -> Self {
        assert!(block_size > 0);
        Self {
            disk,
            kind,
            block_size,
            buf: vec![0u8; sectors_to_bytes(block_size as u64) as usize],
        }
    }

    pub fn kind(&self) -> HashKind {
        self.kind
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Read `[start, start + size)` from the disk and digest it, patching
    /// the buffer with any overlapping fixups first. `size` must not
    /// exceed the hash block size.
    pub fn hash_range(
        &mut self,
        fixups: &mut FixupSet,
        start: Sector,
        size: u32,
    ) -> Result<DigestBytes> {
        assert!(size > 0 && size <= self.block_size);
        let byte_start = sectors_to_bytes(start);
        let byte_size = sectors_to_bytes(size as u64) as usize;

        self.disk
            .seek(SeekFrom::Start(byte_start))
            .map_err(|e| Error::io(format!("seeking disk to sector {start}"), e))?;

        let mut filled = 0;
        while filled < byte_size {
            match self.disk.read(&mut self.buf[filled..byte_size]) {
                Ok(0) => {
                    return Err(Error::ShortRead {
                        sector: start,
                        wanted: byte_size as u64,
                        got: filled as u64,
                    });
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io(format!("reading disk at sector {start}"), e)),
            }
        }

        if fixups.has_fixup(start, size) {
            trace!("[{}-{}] applying fixups before hashing", start, start + size as u64 - 1);
            fixups.apply(byte_start, byte_size as u64, &mut self.buf[..byte_size]);
        }

        Ok(self.kind.compute(&self.buf[..byte_size]))
    }
}
