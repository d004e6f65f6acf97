//! # Stage 1: envelope parsing
//!
//! Walks the chained region layout of an archive, decrypts the metadata
//! regions with the version's key set, and persists every region to the
//! scratch directory:
//!
//! | Region type | Scratch file |
//! |-------------|--------------|
//! | 1 Metadata | `Metadata.xml` |
//! | 2 Patch | `Patch.xml` |
//! | 3 RawProgram | `RawProgram.xml` |
//! | 4 KeyMap | `KeyMap.bin` |
//! | 5 FileIndex | `FileIndex.xml` |
//! | 6 bulk | `region6block.bin` (stored encrypted, decoded in Stage 2) |
//!
//! The on-disk chain is singly linked with in-band termination: each
//! decrypted region carries the header of the next one, a zero `region_size`
//! ends the walk, and the bulk region always terminates it. [`RegionChain`]
//! models the walk as an iterator. Any decode failure aborts Stage 1 with
//! the region type and offset attached.

use std::fs;
use std::path::{Path, PathBuf};

use crate::crypto;
use crate::error::NtpiError;
use crate::format::{
    self, RegionHeader, FILE_HEADER_LEN, REGION_BLOCK_HEADER_LEN, REGION_BULK,
};
use crate::keys::{self, RegionKeySet};

/// Scratch file holding the raw bulk region.
pub const REGION6_FILE: &str = "region6block.bin";
/// Scratch file holding the KeyMap table.
pub const KEYMAP_FILE: &str = "KeyMap.bin";
/// Scratch file holding the file index manifest.
pub const FILE_INDEX_FILE: &str = "FileIndex.xml";

/// Scratch file name for a metadata region type.
fn scratch_file_name(region_type: u64) -> Option<&'static str> {
    match region_type {
        format::REGION_METADATA => Some("Metadata.xml"),
        format::REGION_PATCH => Some("Patch.xml"),
        format::REGION_RAW_PROGRAM => Some("RawProgram.xml"),
        format::REGION_KEYMAP => Some(KEYMAP_FILE),
        format::REGION_FILE_INDEX => Some(FILE_INDEX_FILE),
        _ => None,
    }
}

/// Outcome of a successful Stage 1 run.
pub struct EnvelopeReport {
    pub version: (u64, u64, u64),
    /// The archive version was unknown and the default key set was used.
    pub used_default_keys: bool,
    /// `(region_type, scratch path)` in walk order.
    pub regions: Vec<(u64, PathBuf)>,
}

/// A region yielded by the chain walk.
pub enum DecodedRegion {
    /// A decrypted metadata region payload (header and padding removed).
    Metadata { region_type: u64, payload: Vec<u8> },
    /// The bulk region, left encrypted; `offset..offset + size` within the
    /// archive. Always the last region of a chain.
    Bulk { offset: u64, size: u64 },
}

/// Iterator over the region chain, decrypting metadata regions in flight.
pub struct RegionChain<'a> {
    archive: &'a [u8],
    keyset: &'static RegionKeySet,
    next: Option<(RegionHeader, u64)>,
}

impl<'a> RegionChain<'a> {
    /// Start a walk at the first region of a parsed archive header.
    pub fn new(
        archive: &'a [u8],
        keyset: &'static RegionKeySet,
        first: RegionHeader,
    ) -> Self {
        RegionChain {
            archive,
            keyset,
            next: Some((first, FILE_HEADER_LEN as u64)),
        }
    }

    fn decode(&mut self, region: RegionHeader, offset: u64) -> Result<DecodedRegion, NtpiError> {
        let wrap = |source: NtpiError| NtpiError::Region {
            region_type: region.region_type,
            offset,
            source: Box::new(source),
        };

        let start = offset as usize;
        let end = start
            .checked_add(region.region_size as usize)
            .filter(|&e| e <= self.archive.len())
            .ok_or_else(|| {
                wrap(NtpiError::ShortBuffer {
                    what: "region data",
                    need: start.saturating_add(region.region_size as usize),
                    have: self.archive.len(),
                })
            })?;

        if region.region_type == REGION_BULK {
            return Ok(DecodedRegion::Bulk {
                offset,
                size: region.region_size,
            });
        }

        let (key, iv) = self
            .keyset
            .for_region(region.region_type)
            .ok_or_else(|| wrap(NtpiError::InvalidRegionType(region.region_type)))?;

        let decrypted = crypto::decrypt_cbc(&self.archive[start..end], key, iv).map_err(wrap)?;
        let block = format::parse_region_block_header(&decrypted).map_err(wrap)?;

        let payload_end = REGION_BLOCK_HEADER_LEN
            .checked_add(block.real_size as usize)
            .filter(|&e| e <= decrypted.len())
            .ok_or_else(|| {
                wrap(NtpiError::Malformed(format!(
                    "declared payload size {} exceeds decrypted region of {} bytes",
                    block.real_size,
                    decrypted.len()
                )))
            })?;
        let payload = decrypted[REGION_BLOCK_HEADER_LEN..payload_end].to_vec();

        if block.next_header.region_size > 0 {
            self.next = Some((block.next_header, offset + region.region_size));
        }

        Ok(DecodedRegion::Metadata {
            region_type: region.region_type,
            payload,
        })
    }
}

impl<'a> Iterator for RegionChain<'a> {
    type Item = Result<DecodedRegion, NtpiError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (region, offset) = self.next.take()?;
        Some(self.decode(region, offset))
    }
}

/// Run Stage 1: parse the archive header, walk the region chain, and write
/// every region into `scratch`.
pub fn unpack(archive: &[u8], scratch: &Path) -> Result<EnvelopeReport, NtpiError> {
    let header = format::parse_file_header(archive)?;
    let (major, minor, patch) = header.version();
    let (keyset, used_default_keys) = keys::lookup(major, minor, patch);

    fs::create_dir_all(scratch).map_err(NtpiError::io_at(scratch))?;

    let mut regions = Vec::new();
    for item in RegionChain::new(archive, keyset, header.first_region) {
        match item? {
            DecodedRegion::Metadata { region_type, payload } => {
                // for_region already rejected anything outside 1..=5
                let name = scratch_file_name(region_type)
                    .ok_or(NtpiError::InvalidRegionType(region_type))?;
                let path = scratch.join(name);
                fs::write(&path, &payload).map_err(NtpiError::io_at(&path))?;
                regions.push((region_type, path));
            }
            DecodedRegion::Bulk { offset, size } => {
                let path = scratch.join(REGION6_FILE);
                let start = offset as usize;
                fs::write(&path, &archive[start..start + size as usize])
                    .map_err(NtpiError::io_at(&path))?;
                regions.push((REGION_BULK, path));
            }
        }
    }

    Ok(EnvelopeReport {
        version: (major, minor, patch),
        used_default_keys,
        regions,
    })
}
