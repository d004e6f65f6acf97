use std::fmt;
use std::io;
use std::path::PathBuf;

/// The primary error type for all operations in the `ntpidump` crate.
#[derive(Debug)]
pub enum NtpiError {
    /// An I/O error occurred, typically while reading or writing a file.
    /// Includes the path where the error happened.
    Io { source: io::Error, path: PathBuf },

    /// A buffer was too short to hold the structure being parsed.
    ShortBuffer {
        what: &'static str,
        need: usize,
        have: usize,
    },

    /// A magic field did not match its expected value.
    BadMagic {
        expected: &'static str,
        found: String,
    },

    /// A region declared a type outside the known `1..=6` range.
    InvalidRegionType(u64),

    /// Key, IV or ciphertext failed a size requirement, or the cipher
    /// reported a failure.
    Crypto(String),

    /// The LZMA2 stream could not be decoded.
    Lzma(String),

    /// The LZMA2 stream ended before its end-of-stream marker.
    LzmaTruncated,

    /// `FileIndex.xml` could not be parsed or failed validation.
    Index(String),

    /// A structural inconsistency in the archive layout.
    Malformed(String),

    /// An entry name would escape the output directory.
    UnsafePath(PathBuf),

    /// The SHA-256 of a reassembled file did not match the manifest.
    HashMismatch { expected: String, actual: String },

    /// A Stage-1 failure, annotated with the region it occurred in.
    Region {
        region_type: u64,
        offset: u64,
        source: Box<NtpiError>,
    },

    /// A Stage-2 failure, annotated with the block it occurred in.
    Block {
        index: u64,
        offset: u64,
        source: Box<NtpiError>,
    },

    /// The host asked the engine to stop.
    Cancelled,
}

impl NtpiError {
    /// Helper for attaching a path to an I/O error in `map_err` position.
    pub(crate) fn io_at(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> NtpiError {
        let path = path.into();
        move |source| NtpiError::Io { source, path }
    }
}

impl fmt::Display for NtpiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NtpiError::Io { source, path } => {
                if path.as_os_str().is_empty() {
                    write!(f, "I/O error: {}", source)
                } else {
                    write!(f, "I/O error on path '{}': {}", path.display(), source)
                }
            }
            NtpiError::ShortBuffer { what, need, have } => {
                write!(f, "data too small for {}: need {} bytes, have {}", what, need, have)
            }
            NtpiError::BadMagic { expected, found } => {
                write!(f, "bad magic: expected \"{}\", found \"{}\"", expected, found)
            }
            NtpiError::InvalidRegionType(t) => write!(f, "invalid region type {}", t),
            NtpiError::Crypto(msg) => write!(f, "crypto error: {}", msg),
            NtpiError::Lzma(msg) => write!(f, "LZMA2 decoding failed: {}", msg),
            NtpiError::LzmaTruncated => write!(f, "LZMA2 stream is truncated"),
            NtpiError::Index(msg) => write!(f, "file index error: {}", msg),
            NtpiError::Malformed(msg) => write!(f, "malformed archive: {}", msg),
            NtpiError::UnsafePath(p) => {
                write!(f, "entry name '{}' escapes the output directory", p.display())
            }
            NtpiError::HashMismatch { expected, actual } => {
                write!(f, "SHA-256 mismatch: expected {}, got {}", expected, actual)
            }
            NtpiError::Region { region_type, offset, source } => {
                write!(f, "region type {} at offset {}: {}", region_type, offset, source)
            }
            NtpiError::Block { index, offset, source } => {
                write!(f, "block {} at offset {}: {}", index, offset, source)
            }
            NtpiError::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for NtpiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NtpiError::Io { source, .. } => Some(source),
            NtpiError::Region { source, .. } | NtpiError::Block { source, .. } => {
                Some(source.as_ref())
            }
            _ => None,
        }
    }
}

// Generic IO error conversion that doesn't carry a path.
impl From<io::Error> for NtpiError {
    fn from(err: io::Error) -> Self {
        NtpiError::Io {
            source: err,
            path: PathBuf::new(),
        }
    }
}
