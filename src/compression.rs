//! Compression utilities for crash log attachments.
//!
//! Large crash logs are gzip-compressed before they are attached to an
//! issue; small ones are sent as plain text.

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};
use thiserror::Error;

/// Default compression threshold in bytes (16KB).
pub const DEFAULT_THRESHOLD: usize = 16 * 1024;

/// Compression errors.
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("Compression failed: {0}")]
    CompressionFailed(#[from] std::io::Error),

    #[error("UTF-8 decode failed: {0}")]
    Utf8Failed(#[from] std::string::FromUtf8Error),
}

/// Gzip-compresses `data`.
///
/// # Example
///
/// ```
/// use jmc::{compress_bytes, decompress_bytes};
///
/// let compressed = compress_bytes(b"crash log...").unwrap();
/// assert_eq!(decompress_bytes(&compressed).unwrap(), b"crash log...");
/// ```
pub fn compress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Reverses [`compress_bytes`].
pub fn decompress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// Decompresses gzip data that is expected to hold UTF-8 text.
pub fn decompress_text(data: &[u8]) -> Result<String, CompressionError> {
    Ok(String::from_utf8(decompress_bytes(data)?)?)
}

/// Checks if a payload should be compressed based on size.
pub fn should_compress(data: &[u8], threshold: usize) -> bool {
    data.len() >= threshold
}

/// Compresses only above the threshold. The flag tells whether the returned
/// bytes are gzip data.
pub fn maybe_compress(data: &[u8], threshold: usize) -> Result<(Vec<u8>, bool), CompressionError> {
    if should_compress(data, threshold) {
        Ok((compress_bytes(data)?, true))
    } else {
        Ok((data.to_vec(), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decompress_round_trips_text() {
        let log = "Thread 0 Crashed:\n0   libsystem_kernel.dylib  __pthread_kill + 8";
        let compressed = compress_bytes(log.as_bytes()).unwrap();
        assert_eq!(decompress_text(&compressed).unwrap(), log);
    }

    #[test]
    fn decompress_rejects_plain_bytes() {
        assert!(decompress_bytes(b"not gzip").is_err());
    }

    #[test]
    fn maybe_compress_skips_small() {
        let (data, compressed) = maybe_compress(b"tiny", DEFAULT_THRESHOLD).unwrap();
        assert!(!compressed);
        assert_eq!(data, b"tiny");
    }

    #[test]
    fn maybe_compress_compresses_large() {
        let large = "x".repeat(DEFAULT_THRESHOLD + 1);
        let (data, compressed) = maybe_compress(large.as_bytes(), DEFAULT_THRESHOLD).unwrap();
        assert!(compressed);
        assert_eq!(decompress_text(&data).unwrap(), large);
    }

    #[test]
    fn compression_achieves_significant_reduction() {
        let stack_trace: String = (0..200)
            .map(|i| format!("{i}   MyApp  0x0000000100{i:04x} -[ViewController load] + 42"))
            .collect::<Vec<_>>()
            .join("\n");

        let compressed = compress_bytes(stack_trace.as_bytes()).unwrap();

        assert!(
            compressed.len() < stack_trace.len() / 2,
            "Expected compression ratio < 0.5, got {}",
            compressed.len() as f64 / stack_trace.len() as f64
        );
    }
}
