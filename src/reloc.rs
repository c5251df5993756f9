//! Relocation tables.
//!
//! A relocation records where a structural fixup (disklabel, boot sector)
//! lives in the final image so the unzipper can redo it at lay-down time.
//! Relocations travel in chunk headers: each chunk carries the entries whose
//! sector falls inside its range, packed after the region descriptors.
//!
//! There are never very many of them and they are almost always in the
//! first chunk, so a plain sorted vector is enough.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::sector::{Sector, SectorWidth, SECTOR_SIZE};

/// What kind of structure a relocation points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocType {
    /// FreeBSD disklabel
    FbsdDisklabel,
    /// OpenBSD disklabel
    ObsdDisklabel,
    /// LILO sector address
    LiloSectorAddr,
    /// LILO map sector
    LiloMapSector,
    /// LILO descriptor block checksum
    LiloChecksum,
    /// Sector shorter than the sector size
    ShortSector,
    /// Add the partition offset to the location
    AddPartOffset,
    /// 16-bit XOR checksum
    Xor16Checksum,
    /// Range covered by the previous checksum entry
    ChecksumRange,
}

impl RelocType {
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(RelocType::FbsdDisklabel),
            2 => Some(RelocType::ObsdDisklabel),
            3 => Some(RelocType::LiloSectorAddr),
            4 => Some(RelocType::LiloMapSector),
            5 => Some(RelocType::LiloChecksum),
            6 => Some(RelocType::ShortSector),
            100 => Some(RelocType::AddPartOffset),
            101 => Some(RelocType::Xor16Checksum),
            102 => Some(RelocType::ChecksumRange),
            _ => None,
        }
    }

    pub const fn to_wire(self) -> u32 {
        match self {
            RelocType::FbsdDisklabel => 1,
            RelocType::ObsdDisklabel => 2,
            RelocType::LiloSectorAddr => 3,
            RelocType::LiloMapSector => 4,
            RelocType::LiloChecksum => 5,
            RelocType::ShortSector => 6,
            RelocType::AddPartOffset => 100,
            RelocType::Xor16Checksum => 101,
            RelocType::ChecksumRange => 102,
        }
    }
}

/// One relocation entry. `sect_off + size` never exceeds the sector size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub rtype: RelocType,
    pub sector: Sector,
    pub sect_off: u32,
    pub size: u64,
}

/// Packed entry sizes for the two wire widths.
///
/// 32-bit: `type u32, sector u32, sectoff u32, size u32` (16 bytes).
/// 64-bit: `type u32, sectoff u32, sector u64, size u64` (24 bytes; sector
/// and sectoff are swapped relative to the 32-bit layout to keep the 64-bit
/// fields aligned).
pub const fn reloc_entry_size(width: SectorWidth) -> usize {
    match width {
        SectorWidth::W32 => 16,
        SectorWidth::W64 => 24,
    }
}

/// The chunk-header fields the relocation table cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// First sector described by the chunk.
    pub first_sect: Sector,
    /// First sector past the chunk.
    pub last_sect: Sector,
    /// Number of relocation entries trailing the region descriptors.
    pub reloc_count: u32,
}

/// All relocations of an image, collected from its chunk headers.
#[derive(Debug, Clone, Default)]
pub struct RelocationTable {
    width: Option<SectorWidth>,
    entries: Vec<Relocation>,
}

impl RelocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Relocation] {
        &self.entries
    }

    /// Wire width the table is committed to, once anything has been added.
    pub fn width(&self) -> Option<SectorWidth> {
        self.width
    }

    fn lo(&self) -> Option<Sector> {
        self.entries.first().map(|r| r.sector)
    }

    fn hi(&self) -> Option<Sector> {
        self.entries.last().map(|r| r.sector)
    }

    /// Ingest the relocation entries trailing a chunk header.
    ///
    /// The width is fixed by the first chunk and must match afterwards.
    /// Entries arrive in non-decreasing sector order across chunks.
    pub fn add_from_chunk(
        &mut self,
        width: SectorWidth,
        hdr: &ChunkHeader,
        payload: &[u8],
    ) -> Result<()> {
        if hdr.reloc_count == 0 {
            return Ok(());
        }
        match self.width {
            None => self.width = Some(width),
            Some(w) => assert!(w == width, "relocation width changed mid-image"),
        }
        let need = hdr.reloc_count as usize * reloc_entry_size(width);
        assert!(payload.len() >= need, "chunk relocation payload too short");

        let mut rd = Cursor::new(&payload[..need]);
        for _ in 0..hdr.reloc_count {
            let reloc = read_reloc(&mut rd, width)?;
            if reloc.sect_off as u64 + reloc.size > SECTOR_SIZE as u64 {
                return Err(Error::FixupViolation {
                    offset: reloc.sect_off as u64,
                    size: reloc.size,
                });
            }
            if let Some(last) = self.entries.last() {
                assert!(
                    reloc.sector >= last.sector,
                    "relocation sectors out of order"
                );
            }
            self.entries.push(reloc);
        }
        Ok(())
    }

    /// Count the relocations whose sector falls in `[addr, addr + size)`.
    /// A zero `size` counts to the end of the table.
    pub fn in_range(&self, addr: Sector, size: u64) -> usize {
        let (Some(lo), Some(hi)) = (self.lo(), self.hi()) else {
            return 0;
        };
        let eaddr = if size == 0 {
            hi.max(addr)
        } else {
            addr + size - 1
        };
        if addr > hi || eaddr < lo {
            return 0;
        }
        let mut count = 0;
        for r in &self.entries {
            if r.sector > eaddr {
                break;
            }
            if r.sector >= addr {
                count += 1;
            }
        }
        count
    }

    /// Pack the entries belonging to a chunk into its trailing buffer.
    ///
    /// Serializes every relocation with `first_sect <= sector < last_sect`
    /// at the table's width, appending to `out`, and returns the entry
    /// count for the chunk header.
    pub fn extract_for_chunk(
        &self,
        first_sect: Sector,
        last_sect: Sector,
        out: &mut Vec<u8>,
    ) -> Result<u32> {
        let Some(width) = self.width else {
            return Ok(0);
        };
        let mut count = 0u32;
        for r in &self.entries {
            if r.sector >= last_sect {
                break;
            }
            if r.sector >= first_sect {
                write_reloc(out, width, r)?;
                count += 1;
            }
        }
        Ok(count)
    }
}

fn read_reloc(rd: &mut Cursor<&[u8]>, width: SectorWidth) -> Result<Relocation> {
    let ctx = "reading relocation entry";
    let raw_type = rd.read_u32::<LittleEndian>().map_err(|e| Error::io(ctx, e))?;
    let (sector, sect_off, size) = match width {
        SectorWidth::W32 => {
            let sector = rd.read_u32::<LittleEndian>().map_err(|e| Error::io(ctx, e))?;
            let sect_off = rd.read_u32::<LittleEndian>().map_err(|e| Error::io(ctx, e))?;
            let size = rd.read_u32::<LittleEndian>().map_err(|e| Error::io(ctx, e))?;
            (sector as u64, sect_off, size as u64)
        }
        SectorWidth::W64 => {
            let sect_off = rd.read_u32::<LittleEndian>().map_err(|e| Error::io(ctx, e))?;
            let sector = rd.read_u64::<LittleEndian>().map_err(|e| Error::io(ctx, e))?;
            let size = rd.read_u64::<LittleEndian>().map_err(|e| Error::io(ctx, e))?;
            (sector, sect_off, size)
        }
    };
    let rtype = RelocType::from_wire(raw_type).ok_or_else(|| {
        Error::io(
            ctx,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown relocation type {raw_type}"),
            ),
        )
    })?;
    Ok(Relocation {
        rtype,
        sector,
        sect_off,
        size,
    })
}

fn write_reloc(out: &mut Vec<u8>, width: SectorWidth, r: &Relocation) -> Result<()> {
    let ctx = "writing relocation entry";
    out.write_u32::<LittleEndian>(r.rtype.to_wire())
        .map_err(|e| Error::io(ctx, e))?;
    match width {
        SectorWidth::W32 => {
            if !width.fits(r.sector) {
                return Err(Error::WidthOverflow { value: r.sector });
            }
            out.write_u32::<LittleEndian>(r.sector as u32)
                .map_err(|e| Error::io(ctx, e))?;
            out.write_u32::<LittleEndian>(r.sect_off)
                .map_err(|e| Error::io(ctx, e))?;
            out.write_u32::<LittleEndian>(r.size as u32)
                .map_err(|e| Error::io(ctx, e))?;
        }
        SectorWidth::W64 => {
            out.write_u32::<LittleEndian>(r.sect_off)
                .map_err(|e| Error::io(ctx, e))?;
            out.write_u64::<LittleEndian>(r.sector)
                .map_err(|e| Error::io(ctx, e))?;
            out.write_u64::<LittleEndian>(r.size)
                .map_err(|e| Error::io(ctx, e))?;
        }
    }
    Ok(())
}
