//! Signature file reading and writing.
//!
//! The on-disk layout (little-endian) is a fixed 128-byte header followed
//! by a packed region array:
//!   header:
//!     magic[4]            b"imgh"
//!     version (u32)       1, 2 or 3
//!     hash_kind (u32)     1 = MD5, 2 = SHA1, 3 = SHA256
//!     nregions (u32)
//!     hash_block_size (u32)  in sectors; not meaningful in V1
//!     reserved            zero padding to 128 bytes
//!   region entry, V1/V2 (32 bytes):
//!     start (u32) + size (u32) + chunk_no (i32) + digest[20]
//!   region entry, V3 (48 bytes):
//!     start (u64) + size (u32) + chunk_no (i32) + digest[32]
//!
//! Region starts are stored relative to the partition base. Loading adds
//! the caller's partition offset so the in-memory signature is absolute;
//! writing subtracts it again, on a copy.

use std::fs::{File, FileTimes};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::hash::{HashKind, MAX_DIGEST_LEN};
use crate::sector::{Sector, SectorWidth};

use super::{HashRegion, SigVersion, Signature, DEFAULT_HASH_BLOCK, SIG_HEADER_SIZE, SIG_MAGIC};

/// Read a signature file, rebasing every region by `partition_offset` so
/// the result is in absolute disk coordinates.
pub fn read_signature(path: &Path, partition_offset: Sector) -> Result<Signature> {
    let file = File::open(path)
        .map_err(|e| Error::io(format!("opening signature {}", path.display()), e))?;
    let file_len = file
        .metadata()
        .map_err(|e| Error::io(format!("reading metadata of {}", path.display()), e))?
        .len();
    let mut reader = BufReader::new(file);

    if file_len < SIG_HEADER_SIZE as u64 {
        return Err(Error::bad_signature(path, "too short"));
    }

    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|e| Error::io("reading signature magic", e))?;
    if &magic != SIG_MAGIC {
        return Err(Error::bad_signature(path, "bad magic"));
    }

    let raw_version = read_u32(&mut reader)?;
    let version = SigVersion::from_wire(raw_version)
        .ok_or_else(|| Error::bad_signature(path, format!("unsupported version {raw_version}")))?;

    let raw_kind = read_u32(&mut reader)?;
    let hash_kind = HashKind::from_wire(raw_kind)
        .ok_or_else(|| Error::bad_signature(path, format!("unknown hash kind {raw_kind}")))?;
    match (version, hash_kind) {
        (SigVersion::V1 | SigVersion::V2, HashKind::Sha256) => {
            return Err(Error::bad_signature(path, "SHA256 requires the 64-bit format"));
        }
        (SigVersion::V3, HashKind::Md5) => {
            return Err(Error::bad_signature(path, "MD5 is not valid in the 64-bit format"));
        }
        _ => {}
    }

    let nregions = read_u32(&mut reader)?;
    let stored_block_size = read_u32(&mut reader)?;
    // V1 predates the block size field; its block size is always 64 KiB.
    let hash_block_size = match version {
        SigVersion::V1 => DEFAULT_HASH_BLOCK,
        _ => stored_block_size,
    };
    if hash_block_size == 0 {
        return Err(Error::bad_signature(path, "zero hash block size"));
    }

    let mut reserved = [0u8; SIG_HEADER_SIZE - 20];
    reader
        .read_exact(&mut reserved)
        .map_err(|e| Error::io("reading signature header", e))?;

    let table_bytes = nregions as u64 * version.region_entry_size() as u64;
    if file_len < SIG_HEADER_SIZE as u64 + table_bytes {
        return Err(Error::bad_signature(
            path,
            format!("region table truncated ({nregions} regions)"),
        ));
    }

    let mut regions: Vec<HashRegion> = Vec::with_capacity(nregions as usize);
    for _ in 0..nregions {
        let region = read_region(&mut reader, version)?;
        if region.size == 0 {
            return Err(Error::bad_signature(path, "zero-size region"));
        }
        if region.size > hash_block_size {
            return Err(Error::bad_signature(path, "region larger than hash block"));
        }
        if let Some(prev) = regions.last() {
            if region.start < prev.end() {
                return Err(Error::bad_signature(path, "regions out of order"));
            }
        }
        regions.push(region);
    }

    // Compensate for the partition offset.
    for region in &mut regions {
        region.start += partition_offset;
    }

    debug!(
        "{}: loaded {} hash regions (v{}, block size {} sectors)",
        path.display(),
        regions.len(),
        version.to_wire(),
        hash_block_size
    );

    Ok(Signature {
        hash_kind,
        hash_block_size,
        regions,
    })
}

/// Write a signature in the requested format version, subtracting
/// `partition_offset` from every region start on the way out.
///
/// The version actually written may be newer than requested: V2 cannot
/// represent SHA256 digests or 64-bit starts, and V1 cannot represent a
/// non-default block size. Returns the version written.
///
/// When `image_path` is given, the signature file's timestamps are set to
/// match the image file's. That pairing is how surrounding tooling
/// associates a signature with its image: fast, but defeated by anything
/// that touches the image's mtime.
pub fn write_signature(
    sig: &Signature,
    path: &Path,
    target: SigVersion,
    partition_offset: Sector,
    image_path: Option<&Path>,
) -> Result<SigVersion> {
    // Rebase onto the partition on a copy, leaving the caller's signature
    // in absolute coordinates.
    let mut regions = Vec::with_capacity(sig.regions.len());
    for region in &sig.regions {
        if region.start < partition_offset {
            return Err(Error::RegionUnderPartition {
                start: region.start,
                offset: partition_offset,
            });
        }
        let mut rebased = *region;
        rebased.start -= partition_offset;
        regions.push(rebased);
    }

    let version = effective_version(sig, &regions, target, path);

    let file = File::create(path)
        .map_err(|e| Error::io(format!("creating signature {}", path.display()), e))?;
    let mut writer = BufWriter::new(&file);

    writer
        .write_all(SIG_MAGIC)
        .map_err(|e| Error::io("writing signature magic", e))?;
    write_u32(&mut writer, version.to_wire())?;
    write_u32(&mut writer, sig.hash_kind.to_wire())?;
    write_u32(&mut writer, regions.len() as u32)?;
    write_u32(&mut writer, sig.hash_block_size)?;
    writer
        .write_all(&[0u8; SIG_HEADER_SIZE - 20])
        .map_err(|e| Error::io("writing signature header", e))?;

    for region in &regions {
        write_region(&mut writer, version, region)?;
    }
    writer
        .flush()
        .map_err(|e| Error::io(format!("flushing signature {}", path.display()), e))?;
    drop(writer);

    if let Some(image) = image_path {
        if let Err(e) = pair_times(&file, image) {
            warn!(
                "{}: could not pair timestamps with {}: {e}",
                path.display(),
                image.display()
            );
        }
    }

    Ok(version)
}

/// Resolve the version that can actually hold this signature, warning on
/// every forced upgrade.
fn effective_version(
    sig: &Signature,
    rebased: &[HashRegion],
    target: SigVersion,
    path: &Path,
) -> SigVersion {
    let mut version = target;

    if version == SigVersion::V1 && sig.hash_block_size != DEFAULT_HASH_BLOCK {
        warn!(
            "{}: V1 cannot store a {}-sector hash block, writing V2 instead",
            path.display(),
            sig.hash_block_size
        );
        version = SigVersion::V2;
    }

    if version != SigVersion::V3 {
        if sig.hash_kind == HashKind::Sha256 {
            warn!(
                "{}: incompatible hash type for V2, writing V3 instead",
                path.display()
            );
            version = SigVersion::V3;
        } else if let Some(region) = rebased
            .iter()
            .find(|r| !SectorWidth::W32.fits(r.start))
        {
            warn!(
                "{}: start sector {} needs more than 32 bits, writing V3 instead",
                path.display(),
                region.start
            );
            version = SigVersion::V3;
        }
    } else if sig.hash_kind == HashKind::Md5 {
        // The 64-bit format never carries MD5; fall back to the legacy one.
        warn!(
            "{}: MD5 signatures use the 32-bit format, writing V2 instead",
            path.display()
        );
        version = SigVersion::V2;
    }

    version
}

fn read_region(reader: &mut impl Read, version: SigVersion) -> Result<HashRegion> {
    let ctx = "reading signature region";
    let mut digest = [0u8; MAX_DIGEST_LEN];
    match version {
        SigVersion::V1 | SigVersion::V2 => {
            let start = reader
                .read_u32::<LittleEndian>()
                .map_err(|e| Error::io(ctx, e))?;
            let size = reader
                .read_u32::<LittleEndian>()
                .map_err(|e| Error::io(ctx, e))?;
            let chunk_no = reader
                .read_i32::<LittleEndian>()
                .map_err(|e| Error::io(ctx, e))?;
            reader
                .read_exact(&mut digest[..20])
                .map_err(|e| Error::io(ctx, e))?;
            Ok(HashRegion {
                start: start as u64,
                size,
                chunk_no,
                digest,
            })
        }
        SigVersion::V3 => {
            let start = reader
                .read_u64::<LittleEndian>()
                .map_err(|e| Error::io(ctx, e))?;
            let size = reader
                .read_u32::<LittleEndian>()
                .map_err(|e| Error::io(ctx, e))?;
            let chunk_no = reader
                .read_i32::<LittleEndian>()
                .map_err(|e| Error::io(ctx, e))?;
            reader
                .read_exact(&mut digest)
                .map_err(|e| Error::io(ctx, e))?;
            Ok(HashRegion {
                start,
                size,
                chunk_no,
                digest,
            })
        }
    }
}

fn write_region(writer: &mut impl Write, version: SigVersion, region: &HashRegion) -> Result<()> {
    let ctx = "writing signature region";
    match version {
        SigVersion::V1 | SigVersion::V2 => {
            // effective_version already upgraded anything that can't narrow
            debug_assert!(SectorWidth::W32.fits(region.start));
            writer
                .write_u32::<LittleEndian>(region.start as u32)
                .map_err(|e| Error::io(ctx, e))?;
            writer
                .write_u32::<LittleEndian>(region.size)
                .map_err(|e| Error::io(ctx, e))?;
            writer
                .write_i32::<LittleEndian>(region.chunk_no)
                .map_err(|e| Error::io(ctx, e))?;
            writer
                .write_all(&region.digest[..20])
                .map_err(|e| Error::io(ctx, e))?;
        }
        SigVersion::V3 => {
            writer
                .write_u64::<LittleEndian>(region.start)
                .map_err(|e| Error::io(ctx, e))?;
            writer
                .write_u32::<LittleEndian>(region.size)
                .map_err(|e| Error::io(ctx, e))?;
            writer
                .write_i32::<LittleEndian>(region.chunk_no)
                .map_err(|e| Error::io(ctx, e))?;
            writer
                .write_all(&region.digest)
                .map_err(|e| Error::io(ctx, e))?;
        }
    }
    Ok(())
}

fn read_u32(reader: &mut impl Read) -> Result<u32> {
    reader
        .read_u32::<LittleEndian>()
        .map_err(|e| Error::io("reading signature header", e))
}

fn write_u32(writer: &mut impl Write, value: u32) -> Result<()> {
    writer
        .write_u32::<LittleEndian>(value)
        .map_err(|e| Error::io("writing signature header", e))
}

/// Give the signature file the image file's timestamps.
fn pair_times(sig_file: &File, image: &Path) -> std::io::Result<()> {
    let md = std::fs::metadata(image)?;
    let mut times = FileTimes::new().set_modified(md.modified()?);
    if let Ok(accessed) = md.accessed() {
        times = times.set_accessed(accessed);
    }
    sig_file.set_times(times)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashKind;
    use tempfile::TempDir;

    fn region(start: Sector, size: u32, fill: u8) -> HashRegion {
        let mut digest = [0u8; MAX_DIGEST_LEN];
        digest[..20].fill(fill);
        HashRegion {
            start,
            size,
            chunk_no: 0,
            digest,
        }
    }

    fn sample_sig() -> Signature {
        Signature {
            hash_kind: HashKind::Sha1,
            hash_block_size: 8,
            regions: vec![region(0, 8, 0x11), region(8, 4, 0x22)],
        }
    }

    #[test]
    fn test_v3_roundtrip_is_byte_identical() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image.sig");
        let sig = sample_sig();

        write_signature(&sig, &path, SigVersion::V3, 0, None).unwrap();
        let first = std::fs::read(&path).unwrap();
        assert_eq!(first.len(), SIG_HEADER_SIZE + 2 * 48);

        let loaded = read_signature(&path, 0).unwrap();
        assert_eq!(loaded, sig);

        let path2 = tmp.path().join("image2.sig");
        write_signature(&loaded, &path2, SigVersion::V3, 0, None).unwrap();
        assert_eq!(std::fs::read(&path2).unwrap(), first);
    }

    #[test]
    fn test_v2_roundtrip_through_normalization() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image.sig");
        let sig = sample_sig();

        let written = write_signature(&sig, &path, SigVersion::V2, 0, None).unwrap();
        assert_eq!(written, SigVersion::V2);
        assert_eq!(
            std::fs::read(&path).unwrap().len(),
            SIG_HEADER_SIZE + 2 * 32
        );
        assert_eq!(read_signature(&path, 0).unwrap(), sig);
    }

    #[test]
    fn test_v1_synthesizes_block_size() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image.sig");
        let mut sig = sample_sig();
        sig.hash_block_size = DEFAULT_HASH_BLOCK;

        let written = write_signature(&sig, &path, SigVersion::V1, 0, None).unwrap();
        assert_eq!(written, SigVersion::V1);

        // Clobber the stored block size field; V1 readers must not look at it.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[16..20].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let loaded = read_signature(&path, 0).unwrap();
        assert_eq!(loaded.hash_block_size, DEFAULT_HASH_BLOCK);
    }

    #[test]
    fn test_v1_with_odd_block_size_upgrades() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image.sig");
        let sig = sample_sig(); // block size 8, not the V1 default
        let written = write_signature(&sig, &path, SigVersion::V1, 0, None).unwrap();
        assert_eq!(written, SigVersion::V2);
    }

    #[test]
    fn test_sha256_downgrade_to_v3() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image.sig");
        let mut sig = sample_sig();
        sig.hash_kind = HashKind::Sha256;

        let written = write_signature(&sig, &path, SigVersion::V2, 0, None).unwrap();
        assert_eq!(written, SigVersion::V3);
        let loaded = read_signature(&path, 0).unwrap();
        assert_eq!(loaded.hash_kind, HashKind::Sha256);
    }

    #[test]
    fn test_wide_start_upgrades_to_v3() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image.sig");
        let mut sig = sample_sig();
        sig.regions[1].start = u32::MAX as u64 + 8;

        let written = write_signature(&sig, &path, SigVersion::V2, 0, None).unwrap();
        assert_eq!(written, SigVersion::V3);
        assert_eq!(read_signature(&path, 0).unwrap(), sig);
    }

    #[test]
    fn test_partition_rebase_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image.sig");
        let offset = 63u64;

        // Build a signature whose regions are absolute (offset already added).
        let sig = Signature {
            hash_kind: HashKind::Sha1,
            hash_block_size: 8,
            regions: vec![region(offset, 8, 0x11), region(offset + 8, 8, 0x22)],
        };
        write_signature(&sig, &path, SigVersion::V3, offset, None).unwrap();
        let bytes = std::fs::read(&path).unwrap();

        let loaded = read_signature(&path, offset).unwrap();
        assert_eq!(loaded, sig);

        write_signature(&loaded, &path, SigVersion::V3, offset, None).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn test_region_under_partition() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image.sig");
        let sig = sample_sig(); // regions start at 0
        let err = write_signature(&sig, &path, SigVersion::V3, 100, None).unwrap_err();
        assert!(matches!(
            err,
            Error::RegionUnderPartition { start: 0, offset: 100 }
        ));
    }

    #[test]
    fn test_bad_magic() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image.sig");
        let mut bytes = vec![0u8; SIG_HEADER_SIZE];
        bytes[..4].copy_from_slice(b"nope");
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            read_signature(&path, 0),
            Err(Error::BadSignature { .. })
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image.sig");
        let mut bytes = vec![0u8; SIG_HEADER_SIZE];
        bytes[..4].copy_from_slice(SIG_MAGIC);
        bytes[4..8].copy_from_slice(&9u32.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            read_signature(&path, 0),
            Err(Error::BadSignature { .. })
        ));
    }

    #[test]
    fn test_truncated_region_table() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image.sig");
        let sig = sample_sig();
        write_signature(&sig, &path, SigVersion::V3, 0, None).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();
        assert!(matches!(
            read_signature(&path, 0),
            Err(Error::BadSignature { .. })
        ));
    }

    #[test]
    fn test_mtime_pairing() {
        let tmp = TempDir::new().unwrap();
        let image = tmp.path().join("disk.img");
        std::fs::write(&image, b"image data").unwrap();
        let path = tmp.path().join("disk.img.sig");

        write_signature(&sample_sig(), &path, SigVersion::V3, 0, Some(&image)).unwrap();

        let image_mtime = std::fs::metadata(&image).unwrap().modified().unwrap();
        let sig_mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(sig_mtime, image_mtime);
    }

    #[test]
    fn test_missing_image_is_only_a_warning() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image.sig");
        let missing = tmp.path().join("nonexistent.img");
        // Pairing failure must not fail the write.
        write_signature(&sample_sig(), &path, SigVersion::V3, 0, Some(&missing)).unwrap();
        assert!(path.exists());
    }
}
