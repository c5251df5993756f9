//! End-to-end delta computation tests.
//!
//! All scenarios run over in-memory disks with partition offset 0, an
//! 8-sector hash block, and SHA1 signatures, exercising the full path:
//! allocated ranges + old signature -> delta + new signature -> codec.

use std::io::Cursor;
use std::sync::atomic::AtomicBool;

use imgdelta::delta::{compute_delta, DeltaConfig, DeltaEngine};
use imgdelta::hash::hex_digest;
use imgdelta::sigfile::{codec, verify::verify_signature, HashRegion, SigVersion, Signature};
use imgdelta::{FixupSet, HashKind, Range, RangeList};

const BLOCK: u32 = 8;

/// A disk whose content varies per sector but is fully deterministic.
fn make_disk(sectors: u64) -> Vec<u8> {
    (0..sectors * 512)
        .map(|i| ((i / 512) * 7 + i * 13) as u8)
        .collect()
}

fn digest_of(disk: &[u8], start: u64, size: u32) -> [u8; 32] {
    let begin = start as usize * 512;
    HashKind::Sha1.compute(&disk[begin..begin + size as usize * 512])
}

/// Build a SHA1 signature whose regions match `disk` exactly.
fn sig_for(disk: &[u8], regions: &[(u64, u32)]) -> Signature {
    let mut sig = Signature::new(HashKind::Sha1, BLOCK);
    for &(start, size) in regions {
        sig.regions.push(HashRegion {
            start,
            size,
            chunk_no: 0,
            digest: digest_of(disk, start, size),
        });
    }
    sig
}

fn ranges(pairs: &[(u64, u32)]) -> RangeList {
    pairs.iter().copied().collect()
}

fn emit_config() -> DeltaConfig {
    DeltaConfig {
        emit_signature: true,
        ..Default::default()
    }
}

fn starts_and_sizes(sig: &Signature) -> Vec<(u64, u32)> {
    sig.regions.iter().map(|r| (r.start, r.size)).collect()
}

// ============================================================================
// The six canonical scenarios
// ============================================================================

#[test]
fn scenario_1_empty_signature_full_delta() {
    let disk = make_disk(32);
    let old = Signature::new(HashKind::Sha1, BLOCK);
    let cur = ranges(&[(0, 16)]);
    let mut cursor = Cursor::new(disk.clone());
    let mut fixups = FixupSet::new();

    let out = compute_delta(&mut cursor, &cur, Some(&old), &mut fixups, emit_config()).unwrap();

    assert_eq!(out.delta.as_slice(), &[Range { start: 0, size: 16 }]);
    let new_sig = out.signature.unwrap();
    assert_eq!(starts_and_sizes(&new_sig), vec![(0, 8), (8, 8)]);
    assert_eq!(new_sig.regions[0].digest, digest_of(&disk, 0, 8));
    assert_eq!(new_sig.regions[1].digest, digest_of(&disk, 8, 8));
}

#[test]
fn scenario_2_matching_signature_empty_delta() {
    let disk = make_disk(32);
    let old = sig_for(&disk, &[(0, 8), (8, 8)]);
    let cur = ranges(&[(0, 16)]);
    let mut cursor = Cursor::new(disk);
    let mut fixups = FixupSet::new();

    let out = compute_delta(&mut cursor, &cur, Some(&old), &mut fixups, emit_config()).unwrap();

    assert!(out.delta.is_empty());
    let new_sig = out.signature.unwrap();
    assert_eq!(new_sig.regions, old.regions);
    assert_eq!(out.stats.unchanged, 16);
}

#[test]
fn scenario_3_one_stale_region() {
    let disk = make_disk(32);
    let mut old = sig_for(&disk, &[(0, 8), (8, 8)]);
    // The second region's digest describes content that is gone.
    old.regions[1].digest = HashKind::Sha1.compute(b"previous contents");
    let cur = ranges(&[(0, 16)]);
    let mut cursor = Cursor::new(disk.clone());
    let mut fixups = FixupSet::new();

    let out = compute_delta(&mut cursor, &cur, Some(&old), &mut fixups, emit_config()).unwrap();

    assert_eq!(out.delta.as_slice(), &[Range { start: 8, size: 8 }]);
    let new_sig = out.signature.unwrap();
    assert_eq!(starts_and_sizes(&new_sig), vec![(0, 8), (8, 8)]);
    assert_eq!(new_sig.regions[0].digest, old.regions[0].digest);
    // The stale region's digest was recomputed from the current disk.
    assert_eq!(new_sig.regions[1].digest, digest_of(&disk, 8, 8));
    assert_eq!(out.stats.modified(), 8);
}

#[test]
fn scenario_4_gap_with_hash_free_proves_subrange_unchanged() {
    let disk = make_disk(32);
    let old = sig_for(&disk, &[(0, 8)]);
    // Only sectors 4..8 are still allocated; 0..4 is now free but its
    // content is untouched, so the whole-block hash still matches.
    let cur = ranges(&[(4, 4)]);
    let mut cursor = Cursor::new(disk.clone());
    let mut fixups = FixupSet::new();

    let out = compute_delta(&mut cursor, &cur, Some(&old), &mut fixups, emit_config()).unwrap();

    assert!(out.delta.is_empty());
    let new_sig = out.signature.unwrap();
    assert_eq!(starts_and_sizes(&new_sig), vec![(0, 8)]);
    assert_eq!(new_sig.regions[0].digest, digest_of(&disk, 0, 8));
    assert_eq!(new_sig.regions[0].chunk_no, 0);
    assert_eq!(out.stats.gap_sectors, 4);
    assert_eq!(out.stats.gap_unchanged, 4);
}

#[test]
fn scenario_5_gap_without_hash_free_goes_to_delta() {
    let disk = make_disk(32);
    let old = sig_for(&disk, &[(0, 8)]);
    let cur = ranges(&[(4, 4)]);
    let mut cursor = Cursor::new(disk.clone());
    let mut fixups = FixupSet::new();
    let config = DeltaConfig {
        hash_free: false,
        emit_signature: true,
        ..Default::default()
    };

    let out = compute_delta(&mut cursor, &cur, Some(&old), &mut fixups, config).unwrap();

    assert_eq!(out.delta.as_slice(), &[Range { start: 4, size: 4 }]);
    let new_sig = out.signature.unwrap();
    assert_eq!(starts_and_sizes(&new_sig), vec![(4, 4)]);
    assert_eq!(new_sig.regions[0].digest, digest_of(&disk, 4, 4));
    assert_eq!(out.stats.nocompare, 4);
    assert_eq!(out.stats.hash_compares, 0);
}

#[test]
fn scenario_6_fixup_forces_inclusion() {
    let disk = make_disk(32);
    let old = sig_for(&disk, &[(0, 8)]);
    let cur = ranges(&[(0, 8)]);
    let mut cursor = Cursor::new(disk.clone());

    let mut fixups = FixupSet::new();
    fixups.insert(256, vec![0xDE, 0xAD, 0xBE, 0xEF]).unwrap();

    let out = compute_delta(&mut cursor, &cur, Some(&old), &mut fixups, emit_config()).unwrap();

    // Even though the content would compare equal, the fixup means the
    // range must be present in the image for the fixup to apply to.
    assert_eq!(out.delta.as_slice(), &[Range { start: 0, size: 8 }]);
    assert_eq!(out.stats.fixup_forced, 8);
    assert_eq!(out.stats.hash_compares, 0);

    let new_sig = out.signature.unwrap();
    assert_eq!(starts_and_sizes(&new_sig), vec![(0, 8)]);
    // The new digest is of the patched content, not the raw disk.
    let mut patched = disk.clone();
    patched[256..260].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(new_sig.regions[0].digest, digest_of(&patched, 0, 8));
    assert_ne!(new_sig.regions[0].digest, old.regions[0].digest);

    // The fixup set is back to its pre-run contents.
    assert_eq!(fixups.len(), 1);
    assert_eq!(fixups.fixups()[0].byte_start, 256);
}

// ============================================================================
// Properties
// ============================================================================

#[test]
fn test_new_signature_is_block_aligned() {
    let disk = make_disk(64);
    let old = Signature::new(HashKind::Sha1, BLOCK);
    // Starts mid-block at sector 3.
    let cur = ranges(&[(3, 13)]);
    let mut cursor = Cursor::new(disk);
    let mut fixups = FixupSet::new();

    let out = compute_delta(&mut cursor, &cur, Some(&old), &mut fixups, emit_config()).unwrap();
    let new_sig = out.signature.unwrap();
    // Short leading entry up to the block boundary, then full blocks.
    assert_eq!(starts_and_sizes(&new_sig), vec![(3, 5), (8, 8)]);
}

#[test]
fn test_alignment_is_relative_to_partition() {
    let disk = make_disk(64);
    let old = Signature::new(HashKind::Sha1, BLOCK);
    let cur = ranges(&[(63, 16)]);
    let mut cursor = Cursor::new(disk);
    let mut fixups = FixupSet::new();
    let config = DeltaConfig {
        partition_offset: 63,
        emit_signature: true,
        ..Default::default()
    };

    let out = compute_delta(&mut cursor, &cur, Some(&old), &mut fixups, config).unwrap();
    let new_sig = out.signature.unwrap();
    // Sector 63 is the partition base, so blocks start there.
    assert_eq!(starts_and_sizes(&new_sig), vec![(63, 8), (71, 8)]);
}

#[test]
fn test_delta_is_coalesced() {
    let disk = make_disk(64);
    // Two stale adjacent regions produce one delta range.
    let mut old = sig_for(&disk, &[(0, 8), (8, 8)]);
    old.regions[0].digest = HashKind::Sha1.compute(b"stale a");
    old.regions[1].digest = HashKind::Sha1.compute(b"stale b");
    let cur = ranges(&[(0, 16)]);
    let mut cursor = Cursor::new(disk);
    let mut fixups = FixupSet::new();

    let out = compute_delta(
        &mut cursor,
        &cur,
        Some(&old),
        &mut fixups,
        DeltaConfig::default(),
    )
    .unwrap();
    assert_eq!(out.delta.as_slice(), &[Range { start: 0, size: 16 }]);
}

#[test]
fn test_fixup_snapshot_restored_on_cancellation() {
    let disk = make_disk(32);
    let old = sig_for(&disk, &[(0, 8)]);
    let cur = ranges(&[(0, 8)]);
    let mut cursor = Cursor::new(disk);

    let mut fixups = FixupSet::new();
    fixups.insert(64, vec![1, 2, 3]).unwrap();
    let flag = AtomicBool::new(true);

    let err = DeltaEngine::new(&mut cursor, &mut fixups, emit_config())
        .with_cancel(&flag)
        .compute(&cur, Some(&old))
        .unwrap_err();
    assert!(matches!(err, imgdelta::Error::Cancelled));
    assert_eq!(fixups.len(), 1);
    assert_eq!(fixups.applied(), 0);
}

#[test]
fn test_sectors_past_last_region_are_always_delta() {
    let disk = make_disk(64);
    let old = sig_for(&disk, &[(0, 8)]);
    // The allocation extends past everything the signature describes.
    let cur = ranges(&[(0, 24)]);
    let mut cursor = Cursor::new(disk);
    let mut fixups = FixupSet::new();

    let out = compute_delta(
        &mut cursor,
        &cur,
        Some(&old),
        &mut fixups,
        DeltaConfig::default(),
    )
    .unwrap();
    assert_eq!(out.delta.as_slice(), &[Range { start: 8, size: 16 }]);
    assert_eq!(out.stats.cur_only, 16);
}

// ============================================================================
// Full pipeline: delta -> new signature -> codec -> verify
// ============================================================================

#[test]
fn test_signature_chains_across_captures() -> anyhow::Result<()> {
    let tmp = tempfile::TempDir::new()?;
    let sig_path = tmp.path().join("image.sig");

    // First capture: no previous signature.
    let disk_v1 = make_disk(32);
    let old = Signature::new(HashKind::Sha1, BLOCK);
    let cur = ranges(&[(0, 24)]);
    let mut cursor = Cursor::new(disk_v1.clone());
    let mut fixups = FixupSet::new();
    let out = compute_delta(&mut cursor, &cur, Some(&old), &mut fixups, emit_config())?;
    assert_eq!(out.delta.sector_count(), 24);
    codec::write_signature(&out.signature.unwrap(), &sig_path, SigVersion::V3, 0, None)?;

    // Second capture: one block changed on disk.
    let mut disk_v2 = disk_v1;
    for byte in &mut disk_v2[8 * 512..16 * 512] {
        *byte = byte.wrapping_add(1);
    }
    let loaded = codec::read_signature(&sig_path, 0)?;
    let mut cursor = Cursor::new(disk_v2.clone());
    let out = compute_delta(&mut cursor, &cur, Some(&loaded), &mut fixups, emit_config())?;
    assert_eq!(out.delta.as_slice(), &[Range { start: 8, size: 8 }]);

    // The refreshed signature describes the new disk exactly.
    let new_sig = out.signature.unwrap();
    let mut cursor = Cursor::new(disk_v2);
    let report = verify_signature(&mut cursor, &new_sig, None)?;
    assert!(report.is_clean());
    assert_eq!(report.sectors_checked, 24);

    Ok(())
}

#[test]
fn test_chunk_annotation_after_delta() {
    let disk = make_disk(64);
    let old = Signature::new(HashKind::Sha1, BLOCK);
    let cur = ranges(&[(0, 24)]);
    let mut cursor = Cursor::new(disk);
    let mut fixups = FixupSet::new();

    let out = compute_delta(&mut cursor, &cur, Some(&old), &mut fixups, emit_config()).unwrap();
    let mut sig = out.signature.unwrap();
    assert_eq!(sig.regions.len(), 3);

    // Chunk 0 holds sectors [0, 12): the region at 8 spans out of it.
    sig.update_chunk(0, 0, 12);
    sig.update_chunk(1, 12, 24);
    assert_eq!(sig.regions[0].chunk(), 0);
    assert!(!sig.regions[0].spans_chunk());
    assert_eq!(sig.regions[1].chunk(), 0);
    assert!(sig.regions[1].spans_chunk());
    assert_eq!(sig.regions[2].chunk(), 1);
    assert!(!sig.regions[2].spans_chunk());
}

#[test]
fn test_stats_report_mentions_hex_digests_nowhere() {
    // The report is counters only; digests stay in the dump output.
    let disk = make_disk(32);
    let old = sig_for(&disk, &[(0, 8)]);
    let cur = ranges(&[(0, 8)]);
    let mut cursor = Cursor::new(disk);
    let mut fixups = FixupSet::new();

    let out = compute_delta(
        &mut cursor,
        &cur,
        Some(&old),
        &mut fixups,
        DeltaConfig::default(),
    )
    .unwrap();

    let mut report = Vec::new();
    out.stats.report(&mut report).unwrap();
    let text = String::from_utf8(report).unwrap();
    assert!(text.contains("Common sectors:"));

    let mut dump = Vec::new();
    old.dump(&mut dump).unwrap();
    let dump_text = String::from_utf8(dump).unwrap();
    assert!(dump_text.contains(&hex_digest(&old.regions[0].digest, 20)));
}
