//! # Raw LZMA2 decoding
//!
//! Block payloads are raw LZMA2 streams — no XZ container, no stream header.
//! liblzma (via `xz2`) decodes them through a single-filter raw chain with
//! the default 8 MiB dictionary.
//!
//! Two implementations satisfy the [`Lzma2Decoder`] capability and the block
//! engine is parametric over it:
//!
//! * [`BufferDecoder`] (default) drives `Stream::process_vec` directly over
//!   the whole input, growing the output buffer geometrically. This is the
//!   hot path.
//! * [`StreamDecoder`] (`stream-decoder` feature) wraps the same raw stream
//!   in the `XzDecoder` reader adapter.
//!
//! Selection happens at build time through [`default_decoder`].

use std::io::Read;

use xz2::read::XzDecoder;
use xz2::stream::{Action, Filters, LzmaOptions, Status, Stream};

use crate::error::NtpiError;

/// liblzma's default LZMA2 dictionary size (8 MiB).
const DICT_SIZE_DEFAULT: u32 = 1 << 23;

/// Floor for output buffer allocations.
const MIN_OUT_CAPACITY: usize = 64 * 1024;

/// Capability to decompress one raw LZMA2 buffer into a byte vector.
pub trait Lzma2Decoder: Sync {
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, NtpiError>;
}

fn raw_decoder() -> Result<Stream, NtpiError> {
    let mut opts =
        LzmaOptions::new_preset(6).map_err(|e| NtpiError::Lzma(e.to_string()))?;
    opts.dict_size(DICT_SIZE_DEFAULT);
    let mut filters = Filters::new();
    filters.lzma2(&opts);
    Stream::new_raw_decoder(&filters).map_err(|e| NtpiError::Lzma(e.to_string()))
}

/// Buffer-at-once decoder built directly on the raw liblzma stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct BufferDecoder;

impl Lzma2Decoder for BufferDecoder {
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, NtpiError> {
        let mut stream = raw_decoder()?;
        let mut out =
            Vec::with_capacity(data.len().saturating_mul(3).max(MIN_OUT_CAPACITY));
        loop {
            let consumed = stream.total_in() as usize;
            let status = stream
                .process_vec(&data[consumed..], &mut out, Action::Finish)
                .map_err(|e| NtpiError::Lzma(e.to_string()))?;
            if let Status::StreamEnd = status {
                return Ok(out);
            }
            if out.len() == out.capacity() {
                // Output buffer exhausted: grow by at least 2x and continue.
                out.reserve(out.capacity().max(MIN_OUT_CAPACITY));
            } else if stream.total_in() as usize == data.len() {
                // Input fully consumed, output space left, no end marker seen.
                return Err(NtpiError::LzmaTruncated);
            }
        }
    }
}

/// Streaming decoder routed through the `XzDecoder` reader adapter.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamDecoder;

impl Lzma2Decoder for StreamDecoder {
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, NtpiError> {
        let stream = raw_decoder()?;
        let mut reader = XzDecoder::new_stream(data, stream);
        let mut out =
            Vec::with_capacity(data.len().saturating_mul(3).max(MIN_OUT_CAPACITY));
        match reader.read_to_end(&mut out) {
            Ok(_) => Ok(out),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(NtpiError::LzmaTruncated)
            }
            Err(e) => Err(NtpiError::Lzma(e.to_string())),
        }
    }
}

#[cfg(not(feature = "stream-decoder"))]
pub type DefaultDecoder = BufferDecoder;
#[cfg(feature = "stream-decoder")]
pub type DefaultDecoder = StreamDecoder;

/// The build-time-selected decoder implementation.
pub fn default_decoder() -> DefaultDecoder {
    DefaultDecoder::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compress(data: &[u8]) -> Vec<u8> {
        let mut opts = LzmaOptions::new_preset(6).unwrap();
        opts.dict_size(DICT_SIZE_DEFAULT);
        let mut filters = Filters::new();
        filters.lzma2(&opts);
        let stream = Stream::new_raw_encoder(&filters).unwrap();
        let mut encoder = xz2::read::XzEncoder::new_stream(data, stream);
        let mut out = Vec::new();
        encoder.read_to_end(&mut out).unwrap();
        out
    }

    fn sample_payload() -> Vec<u8> {
        // Compressible but not trivial: repeating phrase with a counter.
        let mut data = Vec::new();
        for i in 0..20_000u32 {
            data.extend_from_slice(b"partition-bytes-");
            data.extend_from_slice(&i.to_le_bytes());
        }
        data
    }

    #[test]
    fn buffer_decoder_roundtrip() {
        let payload = sample_payload();
        let compressed = compress(&payload);
        let decoded = BufferDecoder.decompress(&compressed).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn stream_decoder_roundtrip() {
        let payload = sample_payload();
        let compressed = compress(&payload);
        let decoded = StreamDecoder.decompress(&compressed).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn buffer_decoder_grows_past_initial_capacity() {
        // Highly compressible input: output is far more than 3x the input.
        let payload = vec![0u8; 4 * 1024 * 1024];
        let compressed = compress(&payload);
        assert!(compressed.len() * 3 < payload.len());
        let decoded = BufferDecoder.decompress(&compressed).unwrap();
        assert_eq!(decoded.len(), payload.len());
    }

    #[test]
    fn truncated_stream_is_reported() {
        let payload = sample_payload();
        let compressed = compress(&payload);
        let cut = &compressed[..compressed.len() / 2];
        assert!(BufferDecoder.decompress(cut).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        let garbage = vec![0xFFu8; 256];
        assert!(BufferDecoder.decompress(&garbage).is_err());
    }
}
