//! Page compression.
//!
//! Compressed payloads start with one tag byte naming the codec, so readers
//! decompress without being told which codec the writer used.

use std::io::{Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use spillway_common::{CompressionCodec, Result, SpillwayError};

const ZSTD_LEVEL: i32 = 1;

fn codec_tag(codec: CompressionCodec) -> u8 {
    match codec {
        CompressionCodec::None => 0,
        CompressionCodec::Gzip => 1,
        CompressionCodec::Zlib => 2,
        CompressionCodec::Lz4 => 3,
        CompressionCodec::Snappy => 4,
        CompressionCodec::Zstd => 5,
        CompressionCodec::Lzo => 6,
    }
}

fn codec_from_tag(tag: u8) -> Result<CompressionCodec> {
    match tag {
        1 => Ok(CompressionCodec::Gzip),
        2 => Ok(CompressionCodec::Zlib),
        3 => Ok(CompressionCodec::Lz4),
        4 => Ok(CompressionCodec::Snappy),
        5 => Ok(CompressionCodec::Zstd),
        6 => Ok(CompressionCodec::Lzo),
        other => Err(SpillwayError::Corruption(format!(
            "unknown compression tag {other}"
        ))),
    }
}

/// Compress `data`, prefixing the codec tag.
pub fn compress(codec: CompressionCodec, data: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![codec_tag(codec)];
    match codec {
        CompressionCodec::None => {
            return Err(SpillwayError::Execution(
                "compress called without a compression codec".to_string(),
            ));
        }
        CompressionCodec::Gzip => {
            let mut encoder = GzEncoder::new(out, Compression::default());
            encoder.write_all(data)?;
            out = encoder.finish()?;
        }
        CompressionCodec::Zlib => {
            let mut encoder = ZlibEncoder::new(out, Compression::default());
            encoder.write_all(data)?;
            out = encoder.finish()?;
        }
        CompressionCodec::Lz4 => out.extend_from_slice(&lz4_flex::block::compress(data)),
        CompressionCodec::Snappy => {
            let compressed = snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| SpillwayError::Execution(format!("snappy compress failed: {e}")))?;
            out.extend_from_slice(&compressed);
        }
        CompressionCodec::Zstd => {
            let compressed = zstd::bulk::compress(data, ZSTD_LEVEL)?;
            out.extend_from_slice(&compressed);
        }
        // An empty page is stored as the bare tag.
        CompressionCodec::Lzo if data.is_empty() => {}
        CompressionCodec::Lzo => {
            let compressed = lzokay_native::compress(data)
                .map_err(|e| SpillwayError::Execution(format!("lzo compress failed: {e:?}")))?;
            out.extend_from_slice(&compressed);
        }
    }
    Ok(out)
}

/// Inverse of [`compress`]. The result must be exactly `uncompressed_size` bytes.
pub fn decompress(data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
    let (&tag, body) = data
        .split_first()
        .ok_or_else(|| SpillwayError::Corruption("empty compressed payload".to_string()))?;
    let codec = codec_from_tag(tag)?;
    let out = match codec {
        CompressionCodec::None => {
            return Err(SpillwayError::Corruption(
                "compressed page carries the uncompressed tag".to_string(),
            ));
        }
        CompressionCodec::Gzip => {
            let mut out = Vec::with_capacity(uncompressed_size);
            GzDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|e| corrupt(codec, e))?;
            out
        }
        CompressionCodec::Zlib => {
            let mut out = Vec::with_capacity(uncompressed_size);
            ZlibDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|e| corrupt(codec, e))?;
            out
        }
        CompressionCodec::Lz4 => {
            lz4_flex::block::decompress(body, uncompressed_size).map_err(|e| corrupt(codec, e))?
        }
        CompressionCodec::Snappy => snap::raw::Decoder::new()
            .decompress_vec(body)
            .map_err(|e| corrupt(codec, e))?,
        CompressionCodec::Zstd => {
            zstd::bulk::decompress(body, uncompressed_size.max(1)).map_err(|e| corrupt(codec, e))?
        }
        CompressionCodec::Lzo if body.is_empty() => Vec::new(),
        CompressionCodec::Lzo => lzokay_native::decompress_all(body, Some(uncompressed_size))
            .map_err(|e| corrupt(codec, format!("{e:?}")))?,
    };
    if out.len() != uncompressed_size {
        return Err(SpillwayError::Corruption(format!(
            "{codec} page decompressed to {} bytes, header declares {uncompressed_size}",
            out.len()
        )));
    }
    Ok(out)
}

fn corrupt(codec: CompressionCodec, e: impl std::fmt::Display) -> SpillwayError {
    SpillwayError::Corruption(format!("{codec} decompress failed: {e}"))
}
