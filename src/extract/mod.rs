//! # Stage 2: block engine and scheduler
//!
//! Consumes the scratch artefacts produced by Stage 1 (`FileIndex.xml`,
//! `KeyMap.bin`, `region6block.bin`) and reassembles every partition image:
//! per block, decrypt with the KeyMap key for `key_index + block_index`,
//! validate the inner header, decompress the raw LZMA2 stream, and append.
//! The concatenation is hashed against the manifest before anything is
//! written to disk.
//!
//! Files are dispatched to a bounded pool of worker threads over a channel;
//! each task is self-contained and a failing task never stops its siblings.
//! Large files are split into balanced segments (see [`segment`]) that run
//! on their own scoped threads inside the task.

pub mod segment;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::unbounded;
use sha2::{Digest, Sha256};

use crate::crypto;
use crate::envelope::{FILE_INDEX_FILE, KEYMAP_FILE, REGION6_FILE};
use crate::error::NtpiError;
use crate::format::{self, ENCODE_HEADER_LEN};
use crate::index::{self, FileEntry};
use crate::lzma2::Lzma2Decoder;
use crate::progress::{FileProgress, ProgressSink};
use segment::{scan_boundaries, segment_count, split_segments, Segment};

/// Manifests copied from the scratch directory into the output directory
/// after a fully successful run.
const MANIFEST_FILES: [&str; 2] = ["Patch.xml", "RawProgram.xml"];

/// Configuration for a Stage 2 run.
pub struct ExtractOptions {
    pub scratch_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Worker threads for file tasks; 0 selects `min(NumCPU, 4)`.
    pub workers: usize,
}

/// Outcome of a Stage 2 run. Per-file failures land here rather than
/// aborting the run; stage-level failures are returned as `Err`.
pub struct ExtractSummary {
    pub extracted: Vec<String>,
    pub failed: Vec<(String, NtpiError)>,
    pub manifests_moved: bool,
}

/// Load and validate the file index from the scratch directory.
///
/// A missing `FileIndex.xml` means the archive carried no file index region
/// at all and is treated as an empty list.
pub fn load_file_index(scratch_dir: &Path) -> Result<Vec<FileEntry>, NtpiError> {
    let path = scratch_dir.join(FILE_INDEX_FILE);
    let xml = match fs::read_to_string(&path) {
        Ok(xml) => xml,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(NtpiError::Io { source: e, path }),
    };
    index::parse_file_index(&xml)
}

fn effective_workers(requested: usize) -> usize {
    if requested == 0 {
        num_cpus::get().clamp(1, 4)
    } else {
        requested
    }
}

/// Run Stage 2 against a scratch directory.
///
/// Dispatches one task per file entry to a pool of `workers` threads. Tasks
/// that fail are collected into the summary; the remaining tasks keep
/// running. Manifests move into the output directory only when every task
/// succeeded, so a failed run leaves the scratch directory intact for
/// diagnosis.
pub fn extract_archive<D: Lzma2Decoder>(
    opts: &ExtractOptions,
    decoder: &D,
    sink: &dyn ProgressSink,
    cancel: &AtomicBool,
) -> Result<ExtractSummary, NtpiError> {
    let entries = load_file_index(&opts.scratch_dir)?;

    fs::create_dir_all(&opts.output_dir).map_err(NtpiError::io_at(&opts.output_dir))?;

    if entries.is_empty() {
        let manifests_moved = move_manifests(&opts.scratch_dir, &opts.output_dir)?;
        return Ok(ExtractSummary {
            extracted: Vec::new(),
            failed: Vec::new(),
            manifests_moved,
        });
    }

    let region6_path = opts.scratch_dir.join(REGION6_FILE);
    let region6 = fs::read(&region6_path).map_err(NtpiError::io_at(&region6_path))?;
    let keymap_path = opts.scratch_dir.join(KEYMAP_FILE);
    let keymap = fs::read(&keymap_path).map_err(NtpiError::io_at(&keymap_path))?;

    let engine = BlockEngine::new(&region6, &keymap, decoder, sink, cancel);
    let workers = effective_workers(opts.workers);

    let (task_tx, task_rx) = unbounded::<&FileEntry>();
    let (result_tx, result_rx) = unbounded::<(String, Result<(), NtpiError>)>();
    for entry in &entries {
        task_tx.send(entry).expect("task channel");
    }
    drop(task_tx);

    thread::scope(|scope| {
        for _ in 0..workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let engine = &engine;
            let output_dir = opts.output_dir.as_path();
            scope.spawn(move || {
                for entry in task_rx.iter() {
                    if engine.cancelled() {
                        break;
                    }
                    let result = engine.process_file(entry, output_dir);
                    let _ = result_tx.send((entry.name.clone(), result));
                }
            });
        }
    });
    drop(result_tx);

    let mut extracted = Vec::new();
    let mut failed = Vec::new();
    for (name, result) in result_rx.iter() {
        match result {
            Ok(()) => extracted.push(name),
            Err(e) => failed.push((name, e)),
        }
    }

    let manifests_moved = if failed.is_empty() && !cancel.load(Ordering::Acquire) {
        move_manifests(&opts.scratch_dir, &opts.output_dir)?
    } else {
        false
    };

    Ok(ExtractSummary {
        extracted,
        failed,
        manifests_moved,
    })
}

/// Per-file block pipeline over the shared, read-only Stage 1 artefacts.
pub struct BlockEngine<'a, D: Lzma2Decoder> {
    region6: &'a [u8],
    keymap: &'a [u8],
    decoder: &'a D,
    sink: &'a dyn ProgressSink,
    cancel: &'a AtomicBool,
}

impl<'a, D: Lzma2Decoder> BlockEngine<'a, D> {
    pub fn new(
        region6: &'a [u8],
        keymap: &'a [u8],
        decoder: &'a D,
        sink: &'a dyn ProgressSink,
        cancel: &'a AtomicBool,
    ) -> Self {
        BlockEngine {
            region6,
            keymap,
            decoder,
            sink,
            cancel,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Reassemble one file entry, verify its SHA-256, and write it below
    /// `output_dir`, creating parent directories as needed.
    pub fn process_file(&self, entry: &FileEntry, output_dir: &Path) -> Result<(), NtpiError> {
        index::validate_entry_name(&entry.name)?;
        let out_path = output_dir.join(&entry.name);
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(NtpiError::io_at(parent))?;
        }

        let progress = FileProgress::new(self.sink, &entry.name, entry.partition_length);
        let segments = segment_count(entry.partition_length);
        let data = if segments > 1 {
            self.process_segmented(entry, segments, &progress)?
        } else {
            self.process_sequential(entry, &progress)?
        };

        verify_sha256(&data, &entry.file_sha256)?;
        fs::write(&out_path, &data).map_err(NtpiError::io_at(&out_path))?;
        Ok(())
    }

    /// Decode the entry's blocks in order on the calling thread.
    pub fn process_sequential(
        &self,
        entry: &FileEntry,
        progress: &FileProgress<'_>,
    ) -> Result<Vec<u8>, NtpiError> {
        let end = entry.offset + entry.length;
        let mut out = Vec::with_capacity(entry.partition_length as usize);
        let mut cur = entry.offset;
        let mut block_index = 0u64;

        while cur < end {
            if self.cancelled() {
                return Err(NtpiError::Cancelled);
            }
            let (next, chunk) = self
                .decode_block_at(cur, entry.key_index + block_index)
                .map_err(|e| block_err(block_index, cur, e))?;
            progress.add(chunk.len() as u64);
            out.extend_from_slice(&chunk);
            cur = next;
            block_index += 1;
        }

        Ok(out)
    }

    /// Decode the entry with `requested` parallel segments and concatenate
    /// the per-segment buffers in order. Byte-identical to the sequential
    /// path for any segment count.
    pub fn process_segmented(
        &self,
        entry: &FileEntry,
        requested: usize,
        progress: &FileProgress<'_>,
    ) -> Result<Vec<u8>, NtpiError> {
        let map = scan_boundaries(self.region6, entry)?;
        let segments = split_segments(&map, requested);

        let parts = thread::scope(|scope| -> Result<Vec<Vec<u8>>, NtpiError> {
            let handles: Vec<_> = segments
                .iter()
                .map(|seg| scope.spawn(move || self.process_segment(entry, seg, progress)))
                .collect();
            let mut parts = Vec::with_capacity(handles.len());
            for handle in handles {
                match handle.join() {
                    Ok(result) => parts.push(result?),
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
            Ok(parts)
        })?;

        let total: usize = parts.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(total);
        for part in parts {
            out.extend_from_slice(&part);
        }
        Ok(out)
    }

    fn process_segment(
        &self,
        entry: &FileEntry,
        seg: &Segment,
        progress: &FileProgress<'_>,
    ) -> Result<Vec<u8>, NtpiError> {
        let mut out = Vec::new();
        let mut cur = seg.start_offset;
        let mut done = 0usize;

        while cur < seg.end_offset && done < seg.num_blocks {
            if self.cancelled() {
                return Err(NtpiError::Cancelled);
            }
            let block_index = (seg.start_block + done) as u64;
            let (next, chunk) = self
                .decode_block_at(cur, entry.key_index + block_index)
                .map_err(|e| block_err(block_index, cur, e))?;
            progress.add(chunk.len() as u64);
            out.extend_from_slice(&chunk);
            cur = next;
            done += 1;
        }

        Ok(out)
    }

    /// Decrypt and decompress the block at `offset`, returning the offset of
    /// the following block and the decompressed chunk.
    fn decode_block_at(&self, offset: u64, key_index: u64) -> Result<(u64, Vec<u8>), NtpiError> {
        let key = crypto::extract_key(self.keymap, key_index)?;
        let (next, plaintext) = self.decrypt_block(offset, &key)?;
        let chunk = self.decompress_block(&plaintext)?;
        Ok((next, chunk))
    }

    /// Parse the encode header at `offset` and AES-CBC decrypt the
    /// ciphertext that follows it with `key` and the header's IV.
    pub fn decrypt_block(&self, offset: u64, key: &[u8; 32]) -> Result<(u64, Vec<u8>), NtpiError> {
        let start = offset as usize;
        if start + ENCODE_HEADER_LEN > self.region6.len() {
            return Err(NtpiError::ShortBuffer {
                what: "encode header",
                need: start + ENCODE_HEADER_LEN,
                have: self.region6.len(),
            });
        }
        let header = format::parse_encode_header(&self.region6[start..])?;

        let ct_start = start + ENCODE_HEADER_LEN;
        let ct_end = ct_start
            .checked_add(header.original_size as usize)
            .filter(|&e| e <= self.region6.len())
            .ok_or(NtpiError::ShortBuffer {
                what: "block ciphertext",
                need: ct_start.saturating_add(header.original_size as usize),
                have: self.region6.len(),
            })?;

        let plaintext = crypto::decrypt_cbc(&self.region6[ct_start..ct_end], key, header.iv16())?;
        Ok((ct_end as u64, plaintext))
    }

    /// Validate the inner decompress header and inflate the LZMA2 stream
    /// that follows it.
    fn decompress_block(&self, plaintext: &[u8]) -> Result<Vec<u8>, NtpiError> {
        // Sizes in the inner header are advisory; the raw stream carries its
        // own end marker.
        format::parse_decompress_header(plaintext)?;
        self.decoder.decompress(&plaintext[ENCODE_HEADER_LEN..])
    }
}

fn block_err(index: u64, offset: u64, source: NtpiError) -> NtpiError {
    NtpiError::Block {
        index,
        offset,
        source: Box::new(source),
    }
}

fn verify_sha256(data: &[u8], expected: &str) -> Result<(), NtpiError> {
    let actual = hex::encode(Sha256::digest(data));
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(NtpiError::HashMismatch {
            expected: expected.to_ascii_lowercase(),
            actual,
        })
    }
}

/// Move the manifest XMLs that exist in the scratch directory into the
/// output directory. Falls back to copy + remove across filesystems.
fn move_manifests(scratch_dir: &Path, output_dir: &Path) -> Result<bool, NtpiError> {
    let mut moved = false;
    for name in MANIFEST_FILES {
        let src = scratch_dir.join(name);
        if !src.exists() {
            continue;
        }
        let dst = output_dir.join(name);
        if fs::rename(&src, &dst).is_err() {
            fs::copy(&src, &dst).map_err(NtpiError::io_at(&dst))?;
            fs::remove_file(&src).map_err(NtpiError::io_at(&src))?;
        }
        moved = true;
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lzma2::BufferDecoder;
    use crate::progress::NullSink;

    use aes::Aes256;
    use cbc::cipher::block_padding::Pkcs7;
    use cbc::cipher::{BlockEncryptMut, KeyIvInit};
    use xz2::stream::{Filters, LzmaOptions, Stream};

    type Aes256CbcEnc = cbc::Encryptor<Aes256>;

    fn lzma2_compress(data: &[u8]) -> Vec<u8> {
        use std::io::Read;
        let mut opts = LzmaOptions::new_preset(6).unwrap();
        opts.dict_size(1 << 23);
        let mut filters = Filters::new();
        filters.lzma2(&opts);
        let stream = Stream::new_raw_encoder(&filters).unwrap();
        let mut encoder = xz2::read::XzEncoder::new_stream(data, stream);
        let mut out = Vec::new();
        encoder.read_to_end(&mut out).unwrap();
        out
    }

    fn build_block(chunk: &[u8], key: &[u8; 32], iv: &[u8; 16]) -> Vec<u8> {
        let compressed = lzma2_compress(chunk);

        let mut inner = vec![0u8; ENCODE_HEADER_LEN];
        inner[..8].copy_from_slice(format::ENCODE_MAGIC);
        inner[24..32].copy_from_slice(&(chunk.len() as u64).to_le_bytes());
        inner[32..40].copy_from_slice(&(compressed.len() as u64).to_le_bytes());
        inner.extend_from_slice(&compressed);

        let ciphertext = Aes256CbcEnc::new_from_slices(key, iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(&inner);

        let mut block = vec![0u8; ENCODE_HEADER_LEN];
        block[..8].copy_from_slice(format::ENCODE_MAGIC);
        block[24..32].copy_from_slice(&(chunk.len() as u64).to_le_bytes());
        block[32..40].copy_from_slice(&(ciphertext.len() as u64).to_le_bytes());
        block[72..88].copy_from_slice(iv);
        block[104..108].copy_from_slice(&32u32.to_le_bytes());
        block[108..112].copy_from_slice(&16u32.to_le_bytes());
        block.extend_from_slice(&ciphertext);
        block
    }

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| seed.wrapping_add((i % 251) as u8).wrapping_mul(31))
            .collect()
    }

    /// Build an in-memory bulk region for one file split into uneven chunks.
    fn build_region6(
        content: &[u8],
        chunk_sizes: &[usize],
        keymap: &[u8],
        key_index: u64,
    ) -> (Vec<u8>, FileEntry) {
        let mut region6 = Vec::new();
        let mut consumed = 0usize;
        let mut block_index = 0u64;
        for &size in chunk_sizes {
            let chunk = &content[consumed..consumed + size];
            let key = crypto::extract_key(keymap, key_index + block_index).unwrap();
            let iv = [block_index as u8 + 1; 16];
            region6.extend_from_slice(&build_block(chunk, &key, &iv));
            consumed += size;
            block_index += 1;
        }
        assert_eq!(consumed, content.len());

        let entry = FileEntry {
            name: "system.img".into(),
            file_sha256: hex::encode(Sha256::digest(content)),
            partition_sha256: String::new(),
            key_index,
            sparse: false,
            encrypted: true,
            compressed: true,
            partition_length: content.len() as u64,
            original_length: content.len() as u64,
            offset: 0,
            length: region6.len() as u64,
        };
        (region6, entry)
    }

    #[test]
    fn segmented_output_matches_sequential() {
        let content = patterned(700_000, 3);
        let keymap = patterned(16 * 32, 9);
        let chunks = [120_000, 40_000, 200_000, 90_000, 150_000, 100_000];
        let (region6, entry) = build_region6(&content, &chunks, &keymap, 5);

        let sink = NullSink;
        let cancel = AtomicBool::new(false);
        let decoder = BufferDecoder;
        let engine = BlockEngine::new(&region6, &keymap, &decoder, &sink, &cancel);

        let progress = FileProgress::new(&sink, &entry.name, entry.partition_length);
        let sequential = engine.process_sequential(&entry, &progress).unwrap();
        assert_eq!(sequential, content);

        for requested in [1usize, 2, 4, 16] {
            let progress = FileProgress::new(&sink, &entry.name, entry.partition_length);
            let segmented = engine
                .process_segmented(&entry, requested, &progress)
                .unwrap();
            assert_eq!(segmented, sequential, "segment count {}", requested);
        }
    }

    #[test]
    fn key_index_advances_per_block_with_wrap() {
        // A keymap shorter than key_index * 32 forces the modular reduction
        // on the first block and a wrap across the table end on the second.
        let content = patterned(64_000, 7);
        let keymap = patterned(3 * 32 + 8, 1);
        let (region6, entry) = build_region6(&content, &[30_000, 34_000], &keymap, 41);

        let sink = NullSink;
        let cancel = AtomicBool::new(false);
        let decoder = BufferDecoder;
        let engine = BlockEngine::new(&region6, &keymap, &decoder, &sink, &cancel);
        let progress = FileProgress::new(&sink, &entry.name, entry.partition_length);
        assert_eq!(engine.process_sequential(&entry, &progress).unwrap(), content);
    }

    #[test]
    fn block_errors_carry_index_and_offset() {
        let content = patterned(50_000, 2);
        let keymap = patterned(8 * 32, 4);
        let (mut region6, entry) = build_region6(&content, &[25_000, 25_000], &keymap, 0);

        // Corrupt the second block's magic.
        let second = scan_boundaries(&region6, &entry).unwrap().boundaries[1].offset as usize;
        region6[second] ^= 0xFF;

        let sink = NullSink;
        let cancel = AtomicBool::new(false);
        let decoder = BufferDecoder;
        let engine = BlockEngine::new(&region6, &keymap, &decoder, &sink, &cancel);
        let progress = FileProgress::new(&sink, &entry.name, entry.partition_length);
        match engine.process_sequential(&entry, &progress) {
            Err(NtpiError::Block { index: 1, offset, .. }) => {
                assert_eq!(offset as usize, second);
            }
            other => panic!("expected block error, got {:?}", other),
        }
    }

    #[test]
    fn hash_verification() {
        let data = b"partition image bytes";
        let good = hex::encode(Sha256::digest(data));
        assert!(verify_sha256(data, &good).is_ok());
        assert!(verify_sha256(data, &good.to_uppercase()).is_ok());
        assert!(matches!(
            verify_sha256(data, &"0".repeat(64)),
            Err(NtpiError::HashMismatch { .. })
        ));
    }

    #[test]
    fn worker_default_is_capped() {
        assert!(effective_workers(0) >= 1);
        assert!(effective_workers(0) <= 4);
        assert_eq!(effective_workers(9), 9);
    }
}
