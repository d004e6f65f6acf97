//! # ntpidump core library
//!
//! This crate provides the core functionality for the `ntpidump` command-line
//! tool: unpacking NTPI phone-firmware archives into their partition images
//! and manifests.
//!
//! Extraction is a two-stage pipeline:
//!
//! 1. **Envelope parsing** ([`envelope`]): walk the chained region layout,
//!    decrypt the metadata regions (manifests, KeyMap, file index) and
//!    persist them plus the opaque bulk region to a scratch directory.
//! 2. **Block decoding** ([`extract`]): for every file in the index, decrypt
//!    and decompress its run of blocks from the bulk region, verify the
//!    SHA-256 of the concatenation, and write the partition image.
//!
//! ## Key modules
//!
//! - [`format`]: fixed-layout binary records and their parsers.
//! - [`keys`]: compiled-in per-version AES key material for metadata regions.
//! - [`crypto`]: AES-CBC decryption with tolerant PKCS#7 handling, and the
//!   KeyMap block-key accessor.
//! - [`lzma2`]: raw LZMA2 decoding behind a swappable capability.
//! - [`extract`]: the parallel block engine, scheduler and segmenter.
//! - [`progress`]: the progress sink interface hosts wire to their UI.

pub mod cli;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod extract;
pub mod format;
pub mod index;
pub mod keys;
pub mod lzma2;
pub mod progress;

pub use error::NtpiError;
