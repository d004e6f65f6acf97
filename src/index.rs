//! `FileIndex.xml` parsing and validation.
//!
//! The file index is an attribute-only document: a `fileinfo` root with one
//! `file` element per partition image. Unknown attributes are ignored;
//! missing required attributes, a zero partition length, or an entry name
//! that would escape the output directory are fatal.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::NtpiError;

#[derive(Debug, Deserialize)]
struct FileIndexDoc {
    #[serde(rename = "file", default)]
    files: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(rename = "@Name")]
    name: String,
    #[serde(rename = "@FileSha256Hash")]
    file_sha256: String,
    #[serde(rename = "@PartitionSha256Hash")]
    partition_sha256: String,
    #[serde(rename = "@KeyIndex")]
    key_index: u64,
    #[serde(rename = "@IsSparse")]
    is_sparse: String,
    #[serde(rename = "@IsEncrypted")]
    is_encrypted: String,
    #[serde(rename = "@IsCompressed")]
    is_compressed: String,
    #[serde(rename = "@PartitionLength")]
    partition_length: u64,
    #[serde(rename = "@OriginalLength")]
    original_length: u64,
    #[serde(rename = "@Offset")]
    offset: u64,
    #[serde(rename = "@Length")]
    length: u64,
}

/// One partition image described by the file index.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Output name; may contain path separators.
    pub name: String,
    /// Expected SHA-256 of the reassembled image, lowercase-insensitive hex.
    pub file_sha256: String,
    /// SHA-256 of the post-processed (sparse-expanded) image. Preserved for
    /// downstream tools, never interpreted here.
    pub partition_sha256: String,
    /// Starting index into the KeyMap; block `k` uses `key_index + k`.
    pub key_index: u64,
    pub sparse: bool,
    pub encrypted: bool,
    pub compressed: bool,
    /// Final decompressed size of the image.
    pub partition_length: u64,
    pub original_length: u64,
    /// Byte offset of the first block inside the bulk region.
    pub offset: u64,
    /// Bytes of the bulk region owned by this entry.
    pub length: u64,
}

impl FileEntry {
    fn from_raw(raw: RawEntry) -> Result<Self, NtpiError> {
        if raw.partition_length == 0 {
            return Err(NtpiError::Index(format!(
                "entry '{}': PartitionLength must be non-zero",
                raw.name
            )));
        }
        validate_entry_name(&raw.name)?;
        Ok(FileEntry {
            sparse: parse_flag(&raw.is_sparse),
            encrypted: parse_flag(&raw.is_encrypted),
            compressed: parse_flag(&raw.is_compressed),
            name: raw.name,
            file_sha256: raw.file_sha256,
            partition_sha256: raw.partition_sha256,
            key_index: raw.key_index,
            partition_length: raw.partition_length,
            original_length: raw.original_length,
            offset: raw.offset,
            length: raw.length,
        })
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "true" | "True" | "TRUE" | "1")
}

/// Reject names that are empty, absolute, or contain `..` components.
pub fn validate_entry_name(name: &str) -> Result<(), NtpiError> {
    if name.is_empty() {
        return Err(NtpiError::Index("entry with empty Name".into()));
    }
    let path = Path::new(name);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(NtpiError::UnsafePath(PathBuf::from(name))),
        }
    }
    Ok(())
}

/// Parse and validate a `FileIndex.xml` document.
pub fn parse_file_index(xml: &str) -> Result<Vec<FileEntry>, NtpiError> {
    let doc: FileIndexDoc =
        quick_xml::de::from_str(xml).map_err(|e| NtpiError::Index(e.to_string()))?;
    doc.files.into_iter().map(FileEntry::from_raw).collect()
}
