//! Chunk byte format and codec.
//!
//! A chunk serializes to `[S*S pixel bytes][u32 LE modification-time delta]`
//! and is stored zlib-compressed, one file per chunk. The modification time
//! is a delta from [`EPOCH_BASE`] so it fits a `u32` with decades of margin.
//!
//! Files written before the trailer was added contain only the pixel bytes;
//! they decode with an "unknown" modification time supplied by the caller
//! (in practice, load time).

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use thiserror::Error;

/// Base for on-disk modification timestamps, in epoch seconds.
///
/// Changing this invalidates every persisted chunk file.
pub const EPOCH_BASE: i64 = 1_649_000_000;

/// Size of the modification-time trailer in bytes.
pub const MOD_FIELD_SIZE: usize = 4;

/// Errors raised while decoding a persisted chunk.
#[derive(Debug, Error)]
pub enum ChunkCodecError {
    /// The compressed stream failed to inflate.
    #[error("chunk data failed to inflate: {0}")]
    Inflate(#[from] std::io::Error),

    /// The inflated payload is shorter than one full pixel grid.
    #[error("chunk payload is {len} bytes, expected at least {expected}")]
    Truncated { len: usize, expected: usize },

    /// A pixel byte addresses a color outside the palette.
    #[error("pixel at offset {offset} has color index {index}, palette size {palette_len}")]
    ColorOutOfRange {
        offset: usize,
        index: u8,
        palette_len: usize,
    },
}

/// Serializes and compresses a chunk's pixel grid and modification time.
///
/// # Errors
///
/// Returns an error if compression fails.
pub fn encode(pixels: &[u8], last_modified: i64) -> std::io::Result<Vec<u8>> {
    let delta = last_modified
        .saturating_sub(EPOCH_BASE)
        .clamp(0, i64::from(u32::MAX)) as u32;

    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(pixels.len() / 4),
        Compression::default(),
    );
    encoder.write_all(pixels)?;
    encoder.write_all(&delta.to_le_bytes())?;
    encoder.finish()
}

/// Decompresses and validates a persisted chunk.
///
/// Returns the pixel grid and the modification time in epoch seconds.
/// A payload of exactly `chunk_size * chunk_size` bytes is a legacy file
/// without the time trailer; its modification time is `fallback_modified`.
///
/// # Errors
///
/// Returns an error if the stream does not inflate, the payload is shorter
/// than the pixel grid, or any pixel byte is outside the palette. Callers
/// treat all of these as a corrupt chunk and substitute a blank one.
pub fn decode(
    compressed: &[u8],
    chunk_size: u32,
    palette_len: usize,
    fallback_modified: i64,
) -> Result<(Box<[u8]>, i64), ChunkCodecError> {
    let area = (chunk_size * chunk_size) as usize;

    let mut payload = Vec::with_capacity(area + MOD_FIELD_SIZE);
    ZlibDecoder::new(compressed).read_to_end(&mut payload)?;

    if payload.len() < area {
        return Err(ChunkCodecError::Truncated {
            len: payload.len(),
            expected: area,
        });
    }

    for (offset, &index) in payload[..area].iter().enumerate() {
        if (index as usize) >= palette_len {
            return Err(ChunkCodecError::ColorOutOfRange {
                offset,
                index,
                palette_len,
            });
        }
    }

    let last_modified = if payload.len() >= area + MOD_FIELD_SIZE {
        let mut raw = [0u8; MOD_FIELD_SIZE];
        raw.copy_from_slice(&payload[area..area + MOD_FIELD_SIZE]);
        EPOCH_BASE + i64::from(u32::from_le_bytes(raw))
    } else {
        fallback_modified
    };

    payload.truncate(area);
    Ok((payload.into_boxed_slice(), last_modified))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: u32 = 8;
    const AREA: usize = (SIZE * SIZE) as usize;

    #[test]
    fn round_trip_preserves_pixels_and_time() {
        let mut pixels = vec![0u8; AREA];
        pixels[0] = 3;
        pixels[AREA - 1] = 7;
        let modified = EPOCH_BASE + 12_345;

        let compressed = encode(&pixels, modified).unwrap();
        let (decoded, decoded_time) = decode(&compressed, SIZE, 32, 0).unwrap();

        assert_eq!(&*decoded, &pixels[..]);
        assert_eq!(decoded_time, modified);
    }

    #[test]
    fn legacy_payload_without_trailer_uses_fallback_time() {
        // Hand-build a compressed payload of bare pixels, as files written
        // before the trailer existed.
        let pixels = vec![1u8; AREA];
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&pixels).unwrap();
        let compressed = encoder.finish().unwrap();

        let fallback = EPOCH_BASE + 999;
        let (decoded, decoded_time) = decode(&compressed, SIZE, 32, fallback).unwrap();
        assert_eq!(&*decoded, &pixels[..]);
        assert_eq!(decoded_time, fallback);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[0u8; AREA - 1]).unwrap();
        let compressed = encoder.finish().unwrap();

        assert!(matches!(
            decode(&compressed, SIZE, 32, 0),
            Err(ChunkCodecError::Truncated { .. })
        ));
    }

    #[test]
    fn out_of_palette_pixel_is_rejected() {
        let mut pixels = vec![0u8; AREA];
        pixels[5] = 32;
        let compressed = encode(&pixels, EPOCH_BASE).unwrap();

        assert!(matches!(
            decode(&compressed, SIZE, 32, 0),
            Err(ChunkCodecError::ColorOutOfRange {
                offset: 5,
                index: 32,
                ..
            })
        ));
    }

    #[test]
    fn garbage_bytes_fail_to_inflate() {
        assert!(matches!(
            decode(b"not a zlib stream", SIZE, 32, 0),
            Err(ChunkCodecError::Inflate(_))
        ));
    }

    #[test]
    fn pre_epoch_time_clamps_to_base() {
        let pixels = vec![0u8; AREA];
        let compressed = encode(&pixels, EPOCH_BASE - 100).unwrap();
        let (_, decoded_time) = decode(&compressed, SIZE, 32, 0).unwrap();
        assert_eq!(decoded_time, EPOCH_BASE);
    }
}
