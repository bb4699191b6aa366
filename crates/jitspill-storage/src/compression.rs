//! Gzip compression for spilled frames

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use jitspill_core::error::{CoreError, CoreResult};
use std::io::{Read, Write};

use crate::spill::Codec;

/// Frames smaller than this are never worth compressing.
const MIN_COMPRESS_SIZE: usize = 1024;

/// Compress a frame with gzip if that makes it smaller.
///
/// Returns the codec that was applied alongside the (possibly unchanged) frame.
pub fn maybe_compress(frame: &Bytes) -> CoreResult<(Option<Codec>, Bytes)> {
    if frame.len() < MIN_COMPRESS_SIZE {
        return Ok((None, frame.clone()));
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(frame)
        .map_err(|e| CoreError::SerializationError(format!("Gzip compression failed: {}", e)))?;

    let compressed = encoder
        .finish()
        .map_err(|e| CoreError::SerializationError(format!("Gzip finish failed: {}", e)))?;

    if compressed.len() < frame.len() {
        Ok((Some(Codec::Gzip), Bytes::from(compressed)))
    } else {
        Ok((None, frame.clone()))
    }
}

/// Undo [`maybe_compress`].
pub fn decompress(codec: Option<Codec>, frame: Bytes) -> CoreResult<Bytes> {
    match codec {
        None => Ok(frame),
        Some(Codec::Gzip) => {
            let mut decoder = GzDecoder::new(frame.as_ref());
            let mut decompressed = Vec::new();

            decoder.read_to_end(&mut decompressed).map_err(|e| {
                CoreError::DeserializationError(format!("Gzip decompression failed: {}", e))
            })?;

            Ok(Bytes::from(decompressed))
        }
    }
}
