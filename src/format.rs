//! # On-disk structures
//!
//! Fixed-layout little-endian records that make up an NTPI archive, together
//! with their parsers. All parsers are pure slice readers: they check the
//! minimum length, verify magic fields where the format defines one, and
//! allocate nothing beyond the returned record.
//!
//! | Record | Size | Where it appears |
//! |--------|------|------------------|
//! | [`FileHeader`] | 48 | offset 0 of the archive |
//! | [`RegionHeader`] | 16 | inline in [`FileHeader`] / [`RegionBlockHeader`] |
//! | [`RegionBlockHeader`] | 40 | start of each *decrypted* metadata region |
//! | [`EncodeHeader`] | 112 | before every ciphertext block in the bulk region |
//! | [`DecompressHeader`] | 112 | start of every *decrypted* block |

use crate::error::NtpiError;

pub const NTPI_MAGIC: &[u8; 4] = b"NTPI";
pub const ENCODE_MAGIC: &[u8; 8] = b"NTENCODE";

pub const FILE_HEADER_LEN: usize = 48;
pub const REGION_HEADER_LEN: usize = 16;
pub const REGION_BLOCK_HEADER_LEN: usize = 40;
pub const ENCODE_HEADER_LEN: usize = 112;

/// Metadata region types. Type 6 is the bulk payload region.
pub const REGION_METADATA: u64 = 1;
pub const REGION_PATCH: u64 = 2;
pub const REGION_RAW_PROGRAM: u64 = 3;
pub const REGION_KEYMAP: u64 = 4;
pub const REGION_FILE_INDEX: u64 = 5;
pub const REGION_BULK: u64 = 6;

/// Header for each region: type identifier and ciphertext length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHeader {
    pub region_type: u64,
    pub region_size: u64,
}

/// The main archive header at offset 0.
#[derive(Debug, Clone, Copy)]
pub struct FileHeader {
    pub version_major: u64,
    pub version_minor: u64,
    pub version_patch: u64,
    pub first_region: RegionHeader,
}

impl FileHeader {
    pub fn version(&self) -> (u64, u64, u64) {
        (self.version_major, self.version_minor, self.version_patch)
    }
}

/// Header at the start of a decrypted metadata region: the region's own
/// header, the header of the next region in the chain (all-zero when the
/// chain ends), and the payload length before padding.
#[derive(Debug, Clone, Copy)]
pub struct RegionBlockHeader {
    pub this_header: RegionHeader,
    pub next_header: RegionHeader,
    pub real_size: u64,
}

/// Header preceding every ciphertext block inside the bulk region.
///
/// The embedded key field is carried by the format but unused in practice;
/// block keys come from the KeyMap. Only the first 16 bytes of the IV field
/// are the AES-CBC IV.
#[derive(Debug, Clone)]
pub struct EncodeHeader {
    pub primary_type: u32,
    pub compress_subtype: u32,
    pub encrypt_subtype: u32,
    /// Decompressed byte count of this block.
    pub processed_size: u64,
    /// Ciphertext byte count following this header.
    pub original_size: u64,
    pub key: [u8; 32],
    pub iv: [u8; 32],
    pub key_size: u32,
    pub iv_size: u32,
}

impl EncodeHeader {
    /// The AES-CBC IV: the first 16 bytes of the IV field.
    pub fn iv16(&self) -> &[u8] {
        &self.iv[..16]
    }
}

/// Header at the start of a decrypted block, before the LZMA2 stream.
#[derive(Debug, Clone, Copy)]
pub struct DecompressHeader {
    pub primary_type: u32,
    pub decompress_subtype: u32,
    pub processed_size: u64,
    pub original_size: u64,
}

fn ensure_len(data: &[u8], need: usize, what: &'static str) -> Result<(), NtpiError> {
    if data.len() < need {
        return Err(NtpiError::ShortBuffer {
            what,
            need,
            have: data.len(),
        });
    }
    Ok(())
}

fn le_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

fn le_u64(data: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(data[off..off + 8].try_into().unwrap())
}

fn check_magic(data: &[u8], expected: &'static [u8], name: &'static str) -> Result<(), NtpiError> {
    if &data[..expected.len()] != expected {
        return Err(NtpiError::BadMagic {
            expected: name,
            found: String::from_utf8_lossy(&data[..expected.len()]).into_owned(),
        });
    }
    Ok(())
}

/// Parse the 48-byte archive header at the start of `data`.
pub fn parse_file_header(data: &[u8]) -> Result<FileHeader, NtpiError> {
    ensure_len(data, FILE_HEADER_LEN, "file header")?;
    check_magic(data, NTPI_MAGIC, "NTPI")?;
    // 4 bytes of padding follow the magic
    Ok(FileHeader {
        version_major: le_u64(data, 8),
        version_minor: le_u64(data, 16),
        version_patch: le_u64(data, 24),
        first_region: RegionHeader {
            region_type: le_u64(data, 32),
            region_size: le_u64(data, 40),
        },
    })
}

/// Parse a 16-byte region header at the start of `data`.
pub fn parse_region_header(data: &[u8]) -> Result<RegionHeader, NtpiError> {
    ensure_len(data, REGION_HEADER_LEN, "region header")?;
    Ok(RegionHeader {
        region_type: le_u64(data, 0),
        region_size: le_u64(data, 8),
    })
}

/// Parse the 40-byte header at the start of a decrypted metadata region.
pub fn parse_region_block_header(data: &[u8]) -> Result<RegionBlockHeader, NtpiError> {
    ensure_len(data, REGION_BLOCK_HEADER_LEN, "region block header")?;
    Ok(RegionBlockHeader {
        this_header: RegionHeader {
            region_type: le_u64(data, 0),
            region_size: le_u64(data, 8),
        },
        next_header: RegionHeader {
            region_type: le_u64(data, 16),
            region_size: le_u64(data, 24),
        },
        real_size: le_u64(data, 32),
    })
}

/// Parse the 112-byte block header at the start of `data`.
pub fn parse_encode_header(data: &[u8]) -> Result<EncodeHeader, NtpiError> {
    ensure_len(data, ENCODE_HEADER_LEN, "encode header")?;
    check_magic(data, ENCODE_MAGIC, "NTENCODE")?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&data[40..72]);
    let mut iv = [0u8; 32];
    iv.copy_from_slice(&data[72..104]);
    Ok(EncodeHeader {
        primary_type: le_u32(data, 8),
        compress_subtype: le_u32(data, 12),
        encrypt_subtype: le_u32(data, 16),
        // 4 padding bytes at offset 20
        processed_size: le_u64(data, 24),
        original_size: le_u64(data, 32),
        key,
        iv,
        key_size: le_u32(data, 104),
        iv_size: le_u32(data, 108),
    })
}

/// Parse the 112-byte header at the start of a decrypted block.
pub fn parse_decompress_header(data: &[u8]) -> Result<DecompressHeader, NtpiError> {
    ensure_len(data, ENCODE_HEADER_LEN, "decompress header")?;
    check_magic(data, ENCODE_MAGIC, "NTENCODE")?;
    Ok(DecompressHeader {
        primary_type: le_u32(data, 8),
        decompress_subtype: le_u32(data, 12),
        // 8 padding bytes at offset 16
        processed_size: le_u64(data, 24),
        original_size: le_u64(data, 32),
        // 72 trailing padding bytes
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file_header() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"NTPI");
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&3u64.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&6u64.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf
    }

    #[test]
    fn file_header_roundtrip() {
        let header = parse_file_header(&sample_file_header()).unwrap();
        assert_eq!(header.version(), (1, 3, 0));
        assert_eq!(header.first_region.region_type, REGION_BULK);
        assert_eq!(header.first_region.region_size, 0);
    }

    #[test]
    fn file_header_rejects_wrong_magic() {
        let mut buf = sample_file_header();
        buf[3] = b'X';
        match parse_file_header(&buf) {
            Err(NtpiError::BadMagic { expected, found }) => {
                assert_eq!(expected, "NTPI");
                assert_eq!(found, "NTPX");
            }
            other => panic!("expected BadMagic, got {:?}", other),
        }
    }

    #[test]
    fn file_header_rejects_short_buffer() {
        assert!(matches!(
            parse_file_header(&[0u8; 47]),
            Err(NtpiError::ShortBuffer { need: 48, have: 47, .. })
        ));
    }

    #[test]
    fn region_block_header_fields() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&4096u64.to_le_bytes());
        buf.extend_from_slice(&2u64.to_le_bytes());
        buf.extend_from_slice(&8192u64.to_le_bytes());
        buf.extend_from_slice(&100u64.to_le_bytes());
        let header = parse_region_block_header(&buf).unwrap();
        assert_eq!(header.this_header.region_type, 1);
        assert_eq!(header.next_header.region_size, 8192);
        assert_eq!(header.real_size, 100);
    }

    #[test]
    fn encode_header_layout() {
        let mut buf = vec![0u8; ENCODE_HEADER_LEN];
        buf[..8].copy_from_slice(ENCODE_MAGIC);
        buf[24..32].copy_from_slice(&1048576u64.to_le_bytes());
        buf[32..40].copy_from_slice(&524288u64.to_le_bytes());
        buf[72] = 0xAB; // first IV byte
        buf[104..108].copy_from_slice(&32u32.to_le_bytes());
        buf[108..112].copy_from_slice(&16u32.to_le_bytes());
        let header = parse_encode_header(&buf).unwrap();
        assert_eq!(header.processed_size, 1048576);
        assert_eq!(header.original_size, 524288);
        assert_eq!(header.iv16()[0], 0xAB);
        assert_eq!(header.iv16().len(), 16);
        assert_eq!(header.key_size, 32);
        assert_eq!(header.iv_size, 16);
    }

    #[test]
    fn decompress_header_shares_size_offsets() {
        let mut buf = vec![0u8; ENCODE_HEADER_LEN];
        buf[..8].copy_from_slice(ENCODE_MAGIC);
        buf[24..32].copy_from_slice(&777u64.to_le_bytes());
        buf[32..40].copy_from_slice(&333u64.to_le_bytes());
        let header = parse_decompress_header(&buf).unwrap();
        assert_eq!(header.processed_size, 777);
        assert_eq!(header.original_size, 333);
    }

    #[test]
    fn decompress_header_rejects_wrong_magic() {
        let buf = vec![0u8; ENCODE_HEADER_LEN];
        assert!(matches!(
            parse_decompress_header(&buf),
            Err(NtpiError::BadMagic { .. })
        ));
    }
}
