//! Reversible byte-stream compression for backups and payload transport.
//!
//! Every compressed artifact starts with a 1-byte tag naming the codec
//! that produced it, so decompression always dispatches to the path that
//! encoded the data. Zstd is the primary codec; lz4 is the fallback where
//! zstd is not wanted. The two formats never interoperate.

use std::io::Read;

use serde::{Deserialize, Serialize};

use fieldsync_common::{Error, Result};

const TAG_NONE: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;

/// Upper bound on decompressed output. A full-store snapshot stays far
/// below this; anything larger is treated as corrupt input.
const MAX_DECOMPRESS_SIZE: u64 = 512 * 1024 * 1024;

/// Compression effort, 0 (fastest) through 9 (smallest output).
///
/// The level affects output size and time, never correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub const MAX: u8 = 9;

    pub fn new(level: u8) -> Result<Self> {
        if level > Self::MAX {
            return Err(Error::InvalidInput(format!(
                "compression level must be 0-{}, got {level}",
                Self::MAX
            )));
        }
        Ok(Self(level))
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

/// Codec selection for [`compress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Store bytes untouched (tag only).
    None,
    /// Fallback codec: lz4 with a size-prepended frame.
    Lz4,
    /// Primary codec.
    #[default]
    Zstd,
}

/// Compress `data` with the given codec and effort level, prepending the
/// codec tag byte.
pub fn compress(codec: Codec, level: CompressionLevel, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Codec::None => {
            let mut out = Vec::with_capacity(1 + data.len());
            out.push(TAG_NONE);
            out.extend_from_slice(data);
            Ok(out)
        }
        Codec::Lz4 => {
            let compressed = lz4_flex::compress_prepend_size(data);
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(TAG_LZ4);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
        Codec::Zstd => {
            let compressed = zstd::bulk::compress(data, i32::from(level.get()))
                .map_err(|e| Error::Compression(format!("zstd: {e}")))?;
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(TAG_ZSTD);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
    }
}

/// Decompress data produced by [`compress`], dispatching on the tag byte.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let Some((&tag, payload)) = data.split_first() else {
        return Err(Error::Decompression("empty data".into()));
    };
    match tag {
        TAG_NONE => Ok(payload.to_vec()),
        TAG_LZ4 => {
            if payload.len() < 4 {
                return Err(Error::Decompression("lz4: payload too short".into()));
            }
            let uncompressed_size = u64::from(u32::from_le_bytes([
                payload[0], payload[1], payload[2], payload[3],
            ]));
            if uncompressed_size > MAX_DECOMPRESS_SIZE {
                return Err(Error::Decompression(format!(
                    "lz4: decompressed size ({uncompressed_size}) exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| Error::Decompression(format!("lz4: {e}")))
        }
        TAG_ZSTD => {
            let mut decoder = zstd::stream::Decoder::new(std::io::Cursor::new(payload))
                .map_err(|e| Error::Decompression(format!("zstd init: {e}")))?;
            let mut output = Vec::new();
            decoder
                .by_ref()
                .take(MAX_DECOMPRESS_SIZE + 1)
                .read_to_end(&mut output)
                .map_err(|e| Error::Decompression(format!("zstd: {e}")))?;
            if output.len() as u64 > MAX_DECOMPRESS_SIZE {
                return Err(Error::Decompression(format!(
                    "zstd: decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            Ok(output)
        }
        other => Err(Error::UnknownCompressionTag(other)),
    }
}
