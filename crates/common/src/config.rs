//! Spill engine configuration.
//!
//! A [`SpillConfig`] is built once (defaults, JSON file, environment or
//! key/value pairs) and handed to a spiller factory, which treats it as
//! immutable for the lifetime of every spiller it creates.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpillwayError};

/// Default cap on bytes held in spill files across one process.
pub const DEFAULT_MAX_SPILL_BYTES_PER_NODE: u64 = 100 * 1024 * 1024 * 1024;

/// Prefix of every environment variable read by [`SpillConfig::from_env`].
pub const ENV_PREFIX: &str = "SPILLWAY_";

/// Compression applied to serialized pages before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    /// Pages are stored uncompressed.
    #[default]
    None,
    /// DEFLATE with a gzip header.
    Gzip,
    /// DEFLATE with a zlib header.
    Zlib,
    /// LZ4 block format.
    Lz4,
    /// Snappy raw format.
    Snappy,
    /// Zstandard.
    Zstd,
    /// LZO1X.
    Lzo,
}

impl CompressionCodec {
    /// Every codec, in declaration order.
    pub const ALL: [CompressionCodec; 7] = [
        CompressionCodec::None,
        CompressionCodec::Gzip,
        CompressionCodec::Zlib,
        CompressionCodec::Lz4,
        CompressionCodec::Snappy,
        CompressionCodec::Zstd,
        CompressionCodec::Lzo,
    ];

    /// Lowercase name used in config files and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionCodec::None => "none",
            CompressionCodec::Gzip => "gzip",
            CompressionCodec::Zlib => "zlib",
            CompressionCodec::Lz4 => "lz4",
            CompressionCodec::Snappy => "snappy",
            CompressionCodec::Zstd => "zstd",
            CompressionCodec::Lzo => "lzo",
        }
    }

    /// `true` for every codec except [`CompressionCodec::None`].
    pub fn is_compressing(&self) -> bool {
        !matches!(self, CompressionCodec::None)
    }
}

impl fmt::Display for CompressionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionCodec {
    type Err = SpillwayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(CompressionCodec::None),
            "gzip" => Ok(CompressionCodec::Gzip),
            "zlib" => Ok(CompressionCodec::Zlib),
            "lz4" => Ok(CompressionCodec::Lz4),
            "snappy" => Ok(CompressionCodec::Snappy),
            "zstd" => Ok(CompressionCodec::Zstd),
            "lzo" => Ok(CompressionCodec::Lzo),
            other => Err(SpillwayError::InvalidConfig(format!(
                "invalid compression_codec '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpillConfig {
    /// Candidate spill roots. Spillers are spread across them round-robin.
    pub spill_paths: Vec<PathBuf>,
    /// A root is skipped once its filesystem is fuller than this fraction.
    pub max_used_space_threshold: f64,
    pub compression_codec: CompressionCodec,
    pub spill_encryption_enabled: bool,
    pub spill_checksum_enabled: bool,
    /// Upper bound on spill reads/writes running at once on the worker pool.
    pub spill_io_threads: usize,
    pub max_spill_bytes_per_node: u64,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            spill_paths: vec![PathBuf::from(".spillway_spill")],
            max_used_space_threshold: 0.9,
            compression_codec: CompressionCodec::None,
            spill_encryption_enabled: false,
            spill_checksum_enabled: true,
            spill_io_threads: 4,
            max_spill_bytes_per_node: DEFAULT_MAX_SPILL_BYTES_PER_NODE,
        }
    }
}

impl SpillConfig {
    /// Load a JSON config file. Missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let config: SpillConfig = serde_json::from_slice(&bytes).map_err(|e| {
            SpillwayError::InvalidConfig(format!(
                "failed to parse spill config '{}': {e}",
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by any `SPILLWAY_<KEY>` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = SpillConfig::default();
        for key in [
            "spill_paths",
            "max_used_space_threshold",
            "compression_codec",
            "spill_encryption_enabled",
            "spill_checksum_enabled",
            "spill_io_threads",
            "max_spill_bytes_per_node",
        ] {
            let var = format!("{ENV_PREFIX}{}", key.to_ascii_uppercase());
            if let Ok(value) = std::env::var(&var) {
                config.set(key, &value)?;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Apply one `key = value` override.
    ///
    /// `spill_paths` takes a comma-separated list.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "spill_paths" => {
                self.spill_paths = value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from)
                    .collect();
            }
            "max_used_space_threshold" => {
                self.max_used_space_threshold = value.parse().map_err(|e| {
                    SpillwayError::InvalidConfig(format!(
                        "invalid max_used_space_threshold '{value}': {e}"
                    ))
                })?
            }
            "compression_codec" => self.compression_codec = value.parse()?,
            "spill_encryption_enabled" => self.spill_encryption_enabled = parse_bool(value)?,
            "spill_checksum_enabled" => self.spill_checksum_enabled = parse_bool(value)?,
            "spill_io_threads" => {
                self.spill_io_threads = value.parse().map_err(|e| {
                    SpillwayError::InvalidConfig(format!("invalid spill_io_threads '{value}': {e}"))
                })?
            }
            "max_spill_bytes_per_node" => {
                self.max_spill_bytes_per_node = value.parse().map_err(|e| {
                    SpillwayError::InvalidConfig(format!(
                        "invalid max_spill_bytes_per_node '{value}': {e}"
                    ))
                })?
            }
            other => {
                return Err(SpillwayError::InvalidConfig(format!(
                    "unknown spill config key '{other}'"
                )));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.spill_paths.is_empty() {
            return Err(SpillwayError::InvalidConfig(
                "spill_paths must contain at least one directory".to_string(),
            ));
        }
        if !(self.max_used_space_threshold > 0.0 && self.max_used_space_threshold <= 1.0) {
            return Err(SpillwayError::InvalidConfig(format!(
                "max_used_space_threshold must be in (0, 1], got {}",
                self.max_used_space_threshold
            )));
        }
        if self.spill_io_threads == 0 {
            return Err(SpillwayError::InvalidConfig(
                "spill_io_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => Err(SpillwayError::InvalidConfig(format!(
            "invalid boolean '{other}'"
        ))),
    }
}
