//! Checking a signature against disk contents.
//!
//! Walks every hash region of a signature, digests the corresponding disk
//! range, and reports the ranges that no longer match. Useful for checking
//! that a signature still describes an image, without computing a delta.

use std::io::{Read, Seek};
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;

use crate::delta::hasher::BlockHasher;
use crate::error::{Error, Result};
use crate::fixup::FixupSet;
use crate::range::RangeList;

use super::Signature;

/// Outcome of a signature verification pass.
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub regions_checked: u64,
    pub regions_mismatched: u64,
    pub sectors_checked: u64,
    pub sectors_mismatched: u64,
    /// Coalesced ranges whose digests no longer match.
    pub bad: RangeList,
}

impl VerifyReport {
    /// True when every region still matches.
    pub fn is_clean(&self) -> bool {
        self.regions_mismatched == 0
    }
}

/// Hash every region of `sig` against `disk` and report mismatches.
///
/// The disk is read as-is; fixups do not participate here.
pub fn verify_signature<R: Read + Seek>(
    disk: &mut R,
    sig: &Signature,
    cancel: Option<&AtomicBool>,
) -> Result<VerifyReport> {
    let block_size = sig.hash_block_size.max(sig.max_region_size());
    let mut hasher = BlockHasher::new(disk, sig.hash_kind, block_size);
    let mut fixups = FixupSet::new();
    let hlen = sig.hash_kind.digest_len();

    let mut report = VerifyReport::default();
    for region in &sig.regions {
        if let Some(flag) = cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
        }
        let digest = hasher.hash_range(&mut fixups, region.start, region.size)?;
        report.regions_checked += 1;
        report.sectors_checked += region.size as u64;
        if digest[..hlen] != region.digest[..hlen] {
            report.regions_mismatched += 1;
            report.sectors_mismatched += region.size as u64;
            report.bad.append(region.start, region.size);
        }
    }

    debug!(
        "verify: {}/{} regions match",
        report.regions_checked - report.regions_mismatched,
        report.regions_checked
    );
    Ok(report)
}
