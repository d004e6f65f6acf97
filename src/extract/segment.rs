//! Large-file segmentation.
//!
//! Blocks vary in both compressed and decompressed size, so a byte-even
//! split of the bulk slice would give workers uneven CPU load. Instead the
//! block boundaries are scanned first (headers only, no decryption), then
//! partitioned into segments of roughly equal *decompressed* size. Workers
//! decode whole blocks only, so segment edges always fall on block
//! boundaries and outputs concatenate in segment order.

use crate::error::NtpiError;
use crate::format::{self, ENCODE_HEADER_LEN};
use crate::index::FileEntry;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Files below this decompressed size always take the sequential path.
pub const SEQUENTIAL_LIMIT: u64 = 500 * MIB;

/// Segment count policy by final decompressed size.
pub fn segment_count(partition_length: u64) -> usize {
    match partition_length {
        l if l < SEQUENTIAL_LIMIT => 1,
        l if l < GIB => 4,
        l if l < 2 * GIB => 8,
        l if l < 4 * GIB => 12,
        _ => 16,
    }
}

/// One block boundary found by the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    /// Byte offset of the block's encode header in the bulk region.
    pub offset: u64,
    /// Block index within the file, starting at 0.
    pub block_index: usize,
    /// Decompressed bytes of all blocks before this one.
    pub cumulative: u64,
}

/// All block boundaries of one file's slice of the bulk region.
pub struct BlockMap {
    pub boundaries: Vec<Boundary>,
    /// Total decompressed size over all scanned blocks.
    pub total_processed: u64,
    /// End of the file's slice, `entry.offset + entry.length`.
    pub end_offset: u64,
}

/// A contiguous run of blocks assigned to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start_offset: u64,
    /// Next segment's `start_offset`, or the slice end for the last segment.
    pub end_offset: u64,
    /// Index of the segment's first block within the file.
    pub start_block: usize,
    pub num_blocks: usize,
}

/// Scan encode headers from `entry.offset` without decrypting anything.
///
/// Stops at the end of the entry's slice or at the first header that fails
/// to parse. A slice with no decodable blocks is malformed.
pub fn scan_boundaries(region6: &[u8], entry: &FileEntry) -> Result<BlockMap, NtpiError> {
    let end_offset = entry.offset + entry.length;
    let mut cur = entry.offset;
    let mut block_index = 0usize;
    let mut cumulative = 0u64;
    let mut boundaries = Vec::new();

    while cur < end_offset {
        let start = cur as usize;
        if start + ENCODE_HEADER_LEN > region6.len() {
            break;
        }
        let header = match format::parse_encode_header(&region6[start..]) {
            Ok(h) => h,
            Err(_) => break,
        };
        boundaries.push(Boundary {
            offset: cur,
            block_index,
            cumulative,
        });
        cur += ENCODE_HEADER_LEN as u64 + header.original_size;
        cumulative += header.processed_size;
        block_index += 1;
    }

    if boundaries.is_empty() {
        return Err(NtpiError::Malformed(format!(
            "no decodable blocks in slice {}..{}",
            entry.offset, end_offset
        )));
    }

    Ok(BlockMap {
        boundaries,
        total_processed: cumulative,
        end_offset,
    })
}

/// Partition a block map into at most `requested` segments of roughly equal
/// decompressed size. Fewer blocks than segments yields one segment per
/// block; every block lands in exactly one segment, in order.
pub fn split_segments(map: &BlockMap, requested: usize) -> Vec<Segment> {
    let target_count = requested.max(1);
    let total_blocks = map.boundaries.len();
    let target_size = map.total_processed / target_count as u64;

    let mut segments = Vec::with_capacity(target_count.min(total_blocks));
    let mut start = 0usize;

    for i in 0..total_blocks {
        let end_cumulative = if i + 1 < total_blocks {
            map.boundaries[i + 1].cumulative
        } else {
            map.total_processed
        };
        let accumulated = end_cumulative - map.boundaries[start].cumulative;
        let last = i == total_blocks - 1;

        if (accumulated >= target_size && segments.len() < target_count - 1) || last {
            let end_offset = if last {
                map.end_offset
            } else {
                map.boundaries[i + 1].offset
            };
            segments.push(Segment {
                start_offset: map.boundaries[start].offset,
                end_offset,
                start_block: map.boundaries[start].block_index,
                num_blocks: i - start + 1,
            });
            start = i + 1;
        }
    }

    segments
}
