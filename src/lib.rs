//! imgdelta - incremental disk image capture support
//!
//! Computes the minimal delta between a disk's current allocated content
//! and a previously captured image, using a signature file of per-block
//! content hashes. The delta is what a downstream compressor writes into a
//! chunked image file; the new signature is what the next capture computes
//! its delta against.
//!
//! The crate also carries the signature file codec (three on-disk
//! versions at two integer widths) and the relocation tables that record
//! where partition-dependent structures live in an image.

pub mod delta;
pub mod error;
pub mod fixup;
pub mod hash;
pub mod range;
pub mod reloc;
pub mod sector;
pub mod sigfile;

pub use delta::{compute_delta, DeltaConfig, DeltaEngine, DeltaOutcome};
pub use error::{Error, Result};
pub use fixup::{Fixup, FixupSet};
pub use hash::HashKind;
pub use range::{Range, RangeList};
pub use sector::{Sector, SectorWidth, SECTOR_SIZE};
pub use sigfile::{HashRegion, SigVersion, Signature};
