//! Delta computation statistics.
//!
//! All counters are in sectors unless the name says otherwise. Gap
//! counters track hash regions that cover now-free sectors: when the
//! allocation has holes inside a hash region, the holed sectors are moved
//! out of the shared totals into the gap totals.

use std::io::{self, Write};

use serde::Serialize;

/// Counter snapshot of one delta computation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeltaStats {
    /// Sectors allocated on the current disk.
    pub cur_allocated: u64,
    /// Sectors described by the old signature.
    pub orig_allocated: u64,
    /// Sectors allocated only on the current disk.
    pub cur_only: u64,
    /// Sectors described only by the old signature.
    pub orig_only: u64,
    /// Sectors allocated in both.
    pub shared: u64,
    /// Shared sectors whose hash block compared identical.
    pub unchanged: u64,
    /// Sectors assumed changed without a comparison.
    pub nocompare: u64,
    /// Of those, sectors forced by a fixup overlap.
    pub fixup_forced: u64,
    /// Hash blocks compared.
    pub hash_compares: u64,
    /// Sectors covered by those comparisons.
    pub hash_sectors_compared: u64,
    /// Hash blocks that compared identical.
    pub hash_identical: u64,
    /// Sectors covered by identical comparisons.
    pub hash_sectors_identical: u64,
    /// Hash regions with free gaps inside them.
    pub gap_regions: u64,
    /// Free sectors inside those regions.
    pub gap_sectors: u64,
    /// Gapped hash regions that still compared identical.
    pub unchanged_gap_regions: u64,
    /// Free gap sectors proven unchanged by those comparisons.
    pub gap_unchanged: u64,
    /// Free gap sectors that went uncompared.
    pub gap_nocompare: u64,
}

fn pct(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

impl DeltaStats {
    /// Shared sectors that did not compare identical.
    pub fn modified(&self) -> u64 {
        self.shared - self.unchanged
    }

    /// Write the human-readable report.
    pub fn report(&self, w: &mut impl Write) -> io::Result<()> {
        writeln!(w, "HASH STATS:")?;
        if self.orig_allocated > 0 {
            writeln!(w, "Hash blocks compared:   {:10}", self.hash_compares)?;
            writeln!(
                w,
                "  Identical:            {:10} ({:.1}%)",
                self.hash_identical,
                pct(self.hash_identical, self.hash_compares)
            )?;
            writeln!(w, "Total sectors compared: {:10}", self.hash_sectors_compared)?;
            writeln!(
                w,
                "  Identical:            {:10} ({:.1}%)",
                self.hash_sectors_identical,
                pct(self.hash_sectors_identical, self.hash_sectors_compared)
            )?;
        }
        writeln!(w, "Original sectors:       {:10}", self.orig_allocated)?;
        writeln!(w, "Current sectors:        {:10}", self.cur_allocated)?;
        if self.orig_allocated > 0 {
            writeln!(w, "Common sectors:         {:10}", self.shared)?;
            let deleted = self.orig_only + self.gap_sectors;
            writeln!(
                w,
                "Deleted from original:  {:10} ({:.1}%)",
                deleted,
                pct(deleted, self.orig_allocated)
            )?;
            writeln!(
                w,
                "Added to original:      {:10} ({:.1}%)",
                self.cur_only,
                pct(self.cur_only, self.orig_allocated)
            )?;
            writeln!(
                w,
                "Modified from original: {:10} ({:.1}%)",
                self.modified(),
                pct(self.modified(), self.orig_allocated)
            )?;
            writeln!(
                w,
                "Hash blocks covering free sectors:   {}",
                self.gap_regions
            )?;
            writeln!(
                w,
                "  Total free sectors covered:        {}",
                self.gap_sectors
            )?;
            writeln!(
                w,
                "  Hash blocks compared identical:    {}",
                self.unchanged_gap_regions
            )?;
            writeln!(
                w,
                "  Free sectors compared identical:   {}",
                self.gap_unchanged
            )?;
            writeln!(
                w,
                "  Allocated sectors assumed changed: {}",
                self.nocompare
            )?;
            writeln!(
                w,
                "    Assumed changed due to fixups:   {}",
                self.fixup_forced
            )?;
        }
        writeln!(w, "END HASH STATS")
    }
}

/// Where a finished delta computation publishes its statistics.
pub trait StatsSink {
    fn publish(&mut self, stats: &DeltaStats);
}

/// Discards statistics.
pub struct NullSink;

impl StatsSink for NullSink {
    fn publish(&mut self, _stats: &DeltaStats) {}
}

/// Routes the formatted report to the logger, one line per record.
pub struct LogSink;

impl StatsSink for LogSink {
    fn publish(&mut self, stats: &DeltaStats) {
        let mut buf = Vec::new();
        if stats.report(&mut buf).is_ok() {
            for line in String::from_utf8_lossy(&buf).lines() {
                log::info!("{line}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_smoke() {
        let stats = DeltaStats {
            cur_allocated: 100,
            orig_allocated: 80,
            shared: 60,
            unchanged: 40,
            cur_only: 40,
            orig_only: 20,
            hash_compares: 10,
            hash_identical: 5,
            ..Default::default()
        };
        let mut out = Vec::new();
        stats.report(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Modified from original:"));
        assert!(text.contains("(50.0%)")); // identical hash blocks
        assert!(text.contains("(25.0%)")); // modified sectors
        assert!(text.contains("Current sectors:"));
    }

    #[test]
    fn test_empty_original_skips_comparisons() {
        let stats = DeltaStats {
            cur_allocated: 16,
            ..Default::default()
        };
        let mut out = Vec::new();
        stats.report(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("Hash blocks compared"));
    }

    #[test]
    fn test_serializes_to_json() {
        let stats = DeltaStats::default();
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["cur_allocated"], 0);
        assert_eq!(json["gap_sectors"], 0);
    }
}
