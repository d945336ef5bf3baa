//! zlib+Mcoded7: deflate a PE body before Mcoded7-encoding it, when doing so
//! is actually smaller than plain Mcoded7.
use flate2::write::ZlibEncoder;
use flate2::read::ZlibDecoder;
use flate2::Compression;
use std::io::{Read, Write};

use super::mcoded7;

/// Errors from zlib (de)compression.
#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    /// The deflate stream could not be inflated.
    #[error("zlib inflate failed: {0}")]
    Inflate(#[from] std::io::Error),
    /// The inflated bytes were not valid Mcoded7.
    #[error("Mcoded7 decode failed: {0}")]
    Mcoded7(#[from] mcoded7::Mcoded7Error),
}

/// Compress `data` for the wire, choosing between plain Mcoded7 and
/// zlib+Mcoded7.
///
/// Compression is only attempted when `data.len() >= threshold`, and even
/// then only used if it comes out smaller than plain Mcoded7. Returns the
/// encoded bytes and whether compression was actually used
/// (`was_compressed`), so callers can set `mutualEncoding` accordingly.
pub fn compress(data: &[u8], threshold: usize) -> (Vec<u8>, bool) {
    let plain = mcoded7::encode(data);
    if data.len() < threshold {
        return (plain, false);
    }
    let deflated = deflate(data);
    let compressed = mcoded7::encode(&deflated);
    if compressed.len() < plain.len() {
        (compressed, true)
    } else {
        (plain, false)
    }
}

/// Reverse [`compress`]: `was_compressed` must match what the sender
/// reported via `mutualEncoding`.
pub fn decompress(encoded: &[u8], was_compressed: bool) -> Result<Vec<u8>, CompressError> {
    let mcoded = mcoded7::decode(encoded)?;
    if was_compressed {
        Ok(inflate(&mcoded)?)
    } else {
        Ok(mcoded)
    }
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("in-memory write cannot fail");
    encoder.finish().expect("in-memory finish cannot fail")
}

fn inflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
