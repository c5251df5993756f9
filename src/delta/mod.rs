//! The delta computer.
//!
//! Intersects the currently allocated disk ranges with the hash regions of
//! a previous capture's signature. Sectors whose containing hash block
//! still matches are dropped; everything else lands in the delta range
//! list. Optionally a new signature covering exactly the current
//! allocation is produced along the way, reusing digests that were just
//! computed wherever possible.

pub mod hasher;
pub mod stats;

use std::io::{Read, Seek};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::fixup::FixupSet;
use crate::hash::HashKind;
use crate::range::{Range, RangeList};
use crate::sector::Sector;
use crate::sigfile::{HashRegion, Signature, DEFAULT_HASH_BLOCK};

use hasher::BlockHasher;
use stats::{DeltaStats, StatsSink};

/// Knobs of one delta computation.
#[derive(Debug, Clone, Copy)]
pub struct DeltaConfig {
    /// Absolute sector where the partition begins. Hash block boundaries
    /// are measured from here; whole-disk callers pass 0.
    pub partition_offset: Sector,
    /// When the current allocation only partially covers a hash region,
    /// still read and compare the whole region. A match proves the
    /// still-allocated pieces unchanged at the cost of the extra read;
    /// without it they go straight into the delta.
    pub hash_free: bool,
    /// Build a new signature covering the current allocation.
    pub emit_signature: bool,
    /// With no old signature to inherit from, start the new one as SHA256
    /// rather than the legacy SHA1.
    pub prefer_new_format: bool,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            partition_offset: 0,
            hash_free: true,
            emit_signature: false,
            prefer_new_format: true,
        }
    }
}

/// What a completed delta computation hands back.
#[derive(Debug)]
pub struct DeltaOutcome {
    /// Sorted, coalesced ranges that must be captured.
    pub delta: RangeList,
    /// New signature, when requested.
    pub signature: Option<Signature>,
    pub stats: DeltaStats,
}

/// Verdict for the sectors described by one hash region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Changed {
    /// Compared identical.
    Unchanged,
    /// Compared different.
    Differs,
    /// Coverage gaps ruled out a comparison.
    NoCompare,
    /// A fixup overlap forced inclusion without a comparison.
    FixupForced,
}

impl Changed {
    fn is_changed(self) -> bool {
        self != Changed::Unchanged
    }

    /// Whether the new signature still needs digests for the covered
    /// ranges. After a comparison the whole-region digest is already in.
    fn needs_new_hashes(self) -> bool {
        matches!(self, Changed::NoCompare | Changed::FixupForced)
    }
}

/// One delta computation over a caller-owned disk reader and fixup set.
pub struct DeltaEngine<'a, R: Read + Seek> {
    disk: &'a mut R,
    fixups: &'a mut FixupSet,
    config: DeltaConfig,
    cancel: Option<&'a AtomicBool>,
    sink: Option<&'a mut dyn StatsSink>,
}

impl<'a, R: Read + Seek> DeltaEngine<'a, R> {
    pub fn new(disk: &'a mut R, fixups: &'a mut FixupSet, config: DeltaConfig) -> Self {
        Self {
            disk,
            fixups,
            config,
            cancel: None,
            sink: None,
        }
    }

    /// Cooperative cancellation flag, polled once per hash region.
    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Publish statistics here when the computation succeeds.
    pub fn with_sink(mut self, sink: &'a mut dyn StatsSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Run the delta computation.
    ///
    /// `cur_ranges` is the current allocation in absolute sectors and must
    /// not be empty. `old_sig` is the previous capture's signature; `None`
    /// means there is no previous capture, which makes every current range
    /// part of the delta and seeds a fresh signature from the default
    /// policy.
    pub fn compute(self, cur_ranges: &RangeList, old_sig: Option<&Signature>) -> Result<DeltaOutcome> {
        assert!(!cur_ranges.is_empty(), "no allocated ranges to compare");

        let default_sig;
        let sig = match old_sig {
            Some(s) => s,
            None => {
                let kind = if self.config.prefer_new_format {
                    HashKind::Sha256
                } else {
                    HashKind::Sha1
                };
                default_sig = Signature::new(kind, DEFAULT_HASH_BLOCK);
                &default_sig
            }
        };

        let DeltaEngine {
            disk,
            fixups,
            config,
            cancel,
            sink,
        } = self;

        let stats = DeltaStats {
            orig_allocated: sig.sector_count(),
            ..Default::default()
        };

        let mut walk = Walk {
            hasher: BlockHasher::new(disk, sig.hash_kind, sig.hash_block_size),
            fixups,
            config: &config,
            cancel,
            stats,
            delta: RangeList::new(),
            new_sig: config
                .emit_signature
                .then(|| Signature::new(sig.hash_kind, sig.hash_block_size)),
        };

        // Hashing for the new signature consumes fixups; snapshot them so
        // the set is intact for whoever applies them next.
        if config.emit_signature {
            walk.fixups.save();
        }

        match walk.run(cur_ranges.as_slice(), sig) {
            Ok(()) => {
                if config.emit_signature {
                    walk.fixups.restore(true);
                }
                debug!(
                    "delta: {} ranges, {} of {} current sectors",
                    walk.delta.len(),
                    walk.delta.sector_count(),
                    walk.stats.cur_allocated
                );
                if let Some(sink) = sink {
                    sink.publish(&walk.stats);
                }
                Ok(DeltaOutcome {
                    delta: walk.delta,
                    signature: walk.new_sig,
                    stats: walk.stats,
                })
            }
            Err(e) => {
                // Never hand out partial results: drop them and put the
                // fixup set back the way it was.
                if config.emit_signature {
                    walk.fixups.restore(false);
                }
                Err(e)
            }
        }
    }
}

/// Compute a delta with default wiring (no cancellation, no sink).
pub fn compute_delta<R: Read + Seek>(
    disk: &mut R,
    cur_ranges: &RangeList,
    old_sig: Option<&Signature>,
    fixups: &mut FixupSet,
    config: DeltaConfig,
) -> Result<DeltaOutcome> {
    DeltaEngine::new(disk, fixups, config).compute(cur_ranges, old_sig)
}

struct Walk<'w, R: Read + Seek> {
    hasher: BlockHasher<'w, R>,
    fixups: &'w mut FixupSet,
    config: &'w DeltaConfig,
    cancel: Option<&'w AtomicBool>,
    stats: DeltaStats,
    delta: RangeList,
    new_sig: Option<Signature>,
}

impl<R: Read + Seek> Walk<'_, R> {
    fn check_cancel(&self) -> Result<()> {
        match self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }

    fn next_drange(it: &mut std::slice::Iter<'_, Range>) -> Option<Range> {
        let d = it.next().copied();
        if let Some(d) = d {
            assert!(d.size > 0, "zero-size range at sector {}", d.start);
        }
        d
    }

    fn run(&mut self, cur: &[Range], sig: &Signature) -> Result<()> {
        let mut it = cur.iter();
        let mut drange = Self::next_drange(&mut it);
        let mut last_drange_end: Sector = 0;

        let regions = &sig.regions;
        let mut hidx = 0;

        'regions: while hidx < regions.len() {
            self.check_cancel()?;
            let hreg = &regions[hidx];
            trace!("H: [{}-{}] start", hreg.start, hreg.end() - 1);

            // Allocated ranges wholly before this hash region are new data.
            while let Some(d) = drange {
                if d.end() > hreg.start {
                    break;
                }
                trace!("  D: [{}-{}] before hash region, new data", d.start, d.end() - 1);
                self.stats.cur_allocated += d.size as u64;
                self.stats.cur_only += d.size as u64;
                self.delta.append(d.start, d.size);
                self.add_hash_entries(d.start, d.size)?;
                last_drange_end = d.end();
                drange = Self::next_drange(&mut it);
            }
            let Some(mut d) = drange else { break 'regions };
            assert!(hreg.start < d.end());

            // A hash region wholly before the allocation describes
            // sectors that have since been deallocated.
            if hreg.end() <= d.start {
                self.stats.orig_only += hreg.size as u64;
                hidx += 1;
                continue;
            }

            // Overlap. Carve off the part of the range before the hash
            // region: it is new data, and removing it aligns the rest
            // with the hash boundary.
            if d.start < hreg.start {
                let before = (hreg.start - d.start) as u32;
                trace!(
                    "  D: [{}-{}]/[{}-{}] head split",
                    d.start,
                    hreg.start - 1,
                    hreg.start,
                    d.end() - 1
                );
                self.stats.cur_allocated += before as u64;
                self.stats.cur_only += before as u64;
                self.delta.append(d.start, before);
                self.add_hash_entries(d.start, before)?;
                d.start = hreg.start;
                d.size -= before;
                drange = Some(d);
            }
            assert!(d.start >= hreg.start && d.start < hreg.end());

            let changed = self.classify(hreg, &d)?;

            self.stats.shared += hreg.size as u64;
            match changed {
                Changed::Unchanged => self.stats.unchanged += hreg.size as u64,
                Changed::NoCompare => self.stats.nocompare += hreg.size as u64,
                Changed::FixupForced => {
                    self.stats.nocompare += hreg.size as u64;
                    self.stats.fixup_forced += hreg.size as u64;
                }
                Changed::Differs => {}
            }

            // Emit every range covered by the hash region, tracking the
            // free gaps between them.
            let mut gap_start = hreg.start;
            let mut gap_sectors = 0u64;
            let mut gap_count = 0u64;

            while let Some(mut d2) = drange {
                if d2.start >= hreg.end() {
                    break;
                }
                let cur_start = d2.start;
                let mut cur_end = d2.end();
                let mut split_tail = false;

                // A final range crossing the region end is split; its tail
                // is handled under the next hash region.
                if cur_end > hreg.end() {
                    trace!(
                        "    D: [{}-{}]/[{}-{}] tail split",
                        cur_start,
                        hreg.end() - 1,
                        hreg.end(),
                        cur_end - 1
                    );
                    d2.size = (cur_end - hreg.end()) as u32;
                    d2.start = hreg.end();
                    drange = Some(d2);
                    cur_end = hreg.end();
                    split_tail = true;
                }
                assert!(cur_start >= hreg.start && cur_end <= hreg.end());

                if gap_start < cur_start {
                    gap_sectors += cur_start - gap_start;
                    gap_count += 1;
                }
                gap_start = cur_end;

                let covered = (cur_end - cur_start) as u32;
                self.stats.cur_allocated += covered as u64;
                if changed.is_changed() {
                    trace!("    D: [{}-{}] covered, changed", cur_start, cur_end - 1);
                    self.delta.append(cur_start, covered);
                    if changed.needs_new_hashes() {
                        self.add_hash_entries(cur_start, covered)?;
                    }
                }

                if !split_tail {
                    last_drange_end = cur_end;
                    drange = Self::next_drange(&mut it);
                }
            }

            // Trailing gap inside the hash region.
            if gap_start < hreg.end() {
                gap_sectors += hreg.end() - gap_start;
                gap_count += 1;
            }
            if gap_count > 0 {
                // The gap sectors were counted into the shared totals
                // above; move them into the gap totals.
                self.stats.gap_regions += 1;
                self.stats.shared -= gap_sectors;
                self.stats.gap_sectors += gap_sectors;
                match changed {
                    Changed::Unchanged => {
                        self.stats.unchanged -= gap_sectors;
                        self.stats.unchanged_gap_regions += 1;
                        self.stats.gap_unchanged += gap_sectors;
                    }
                    Changed::NoCompare | Changed::FixupForced => {
                        self.stats.nocompare -= gap_sectors;
                        if changed == Changed::FixupForced {
                            self.stats.fixup_forced -= gap_sectors;
                        }
                        self.stats.gap_nocompare += gap_sectors;
                    }
                    Changed::Differs => {}
                }
            }

            match drange {
                None => break 'regions,
                Some(d) => assert!(d.start >= hreg.end()),
            }
            hidx += 1;
        }

        // Hash regions past the last allocated range describe deallocated
        // sectors. If the allocation ran out inside a region, only the
        // unconsumed tail counts.
        while hidx < regions.len() {
            let hreg = &regions[hidx];
            let size = if last_drange_end > 0 && last_drange_end <= hreg.end() {
                hreg.end() - last_drange_end.max(hreg.start)
            } else {
                hreg.size as u64
            };
            trace!("H: [{}-{}] skipped, deallocated", hreg.start, hreg.end() - 1);
            self.stats.orig_only += size;
            last_drange_end = 0;
            hidx += 1;
        }

        // Allocated ranges past the last hash region are new data.
        while let Some(d) = drange {
            self.check_cancel()?;
            trace!("  D: [{}-{}] past hash regions, new data", d.start, d.end() - 1);
            self.stats.cur_allocated += d.size as u64;
            self.stats.cur_only += d.size as u64;
            self.delta.append(d.start, d.size);
            self.add_hash_entries(d.start, d.size)?;
            drange = Self::next_drange(&mut it);
        }

        Ok(())
    }

    /// Decide whether the sectors described by `hreg` changed. `d` is the
    /// first allocated range overlapping it, already aligned to start at
    /// or after the region start.
    fn classify(&mut self, hreg: &HashRegion, d: &Range) -> Result<Changed> {
        let exact_cover = d.start == hreg.start && d.size >= hreg.size;
        if !self.config.hash_free && !exact_cover {
            // Free gaps in the coverage and not allowed to hash across
            // them: every covered range is assumed changed.
            trace!("  H: [{}-{}] no compare", hreg.start, hreg.end() - 1);
            return Ok(Changed::NoCompare);
        }

        // A fixup means the underlying range must be in the image even if
        // it would compare equal: there has to be something on disk to
        // apply the fixup to.
        if self.fixups.has_fixup(hreg.start, hreg.size) {
            trace!("  H: [{}-{}] fixup overlap", hreg.start, hreg.end() - 1);
            return Ok(Changed::FixupForced);
        }

        let digest = self.hasher.hash_range(self.fixups, hreg.start, hreg.size)?;
        let hlen = self.hasher.kind().digest_len();
        let identical = digest[..hlen] == hreg.digest[..hlen];

        self.stats.hash_compares += 1;
        self.stats.hash_sectors_compared += hreg.size as u64;
        if identical {
            self.stats.hash_identical += 1;
            self.stats.hash_sectors_identical += hreg.size as u64;
        }
        trace!(
            "  H: [{}-{}] hash {}",
            hreg.start,
            hreg.end() - 1,
            if identical { "matches" } else { "differs" }
        );

        // The digest describes the region's current content whether or
        // not it matched, so it goes into the new signature as is.
        if let Some(sig) = self.new_sig.as_mut() {
            sig.regions.push(HashRegion {
                start: hreg.start,
                size: hreg.size,
                chunk_no: 0,
                digest,
            });
        }

        Ok(if identical {
            Changed::Unchanged
        } else {
            Changed::Differs
        })
    }

    /// Add new-signature entries for a range, hashing one block-aligned
    /// piece at a time. Alignment is relative to the partition base, so a
    /// range starting mid-block gets a short leading entry.
    fn add_hash_entries(&mut self, start: Sector, size: u32) -> Result<()> {
        if self.new_sig.is_none() {
            return Ok(());
        }
        let block = self.hasher.block_size();
        let mut offset = ((start - self.config.partition_offset) % block as u64) as u32;
        let mut start = start;
        let mut size = size;
        while size > 0 {
            let hsize = if offset != 0 {
                let h = (block - offset).min(size);
                offset = 0;
                h
            } else {
                size.min(block)
            };
            let digest = self.hasher.hash_range(self.fixups, start, hsize)?;
            if let Some(sig) = self.new_sig.as_mut() {
                trace!("    A: [{}-{}]", start, start + hsize as u64 - 1);
                sig.regions.push(HashRegion {
                    start,
                    size: hsize,
                    chunk_no: 0,
                    digest,
                });
            }
            start += hsize as u64;
            size -= hsize;
        }
        Ok(())
    }
}
