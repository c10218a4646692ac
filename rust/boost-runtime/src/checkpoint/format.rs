// rust/boost-runtime/src/checkpoint/format.rs

//! On-disk framing of a model checkpoint.
//!
//! ```text
//! +------------------------+
//! | Header Length (4 bytes)|  <- u32 little-endian
//! +------------------------+
//! | Header (bincode)       |  <- CheckpointHeader
//! +------------------------+
//! | Compressed Payload     |  <- booster bytes, compressed per header
//! +------------------------+
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;
use std::str::FromStr;

use twox_hash::XxHash64;

use crate::error::{BoostError, Result};

/// Metadata key holding the number of completed rounds.
pub const META_ROUND: &str = "round";

/// Metadata key holding the RFC 3339 creation time.
pub const META_CREATED_AT: &str = "created_at";

/// Prefix of the metadata keys holding per-round metric values, one key per
/// dataset name, values comma separated.
pub const META_METRIC_PREFIX: &str = "metric.";

/// Payload compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Lz4,
    Zstd,
}

impl FromStr for Compression {
    type Err = BoostError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            other => Err(BoostError::checkpoint(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

impl Compression {
    pub fn compress(self, data: &[u8], level: i32) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Self::Zstd => zstd::encode_all(data, level)
                .map_err(|e| BoostError::checkpoint_with_source("zstd compression failed", e)),
        }
    }

    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| BoostError::checkpoint_with_source("lz4 decompression failed", e)),
            Self::Zstd => zstd::decode_all(data)
                .map_err(|e| BoostError::checkpoint_with_source("zstd decompression failed", e)),
        }
    }
}

/// Header preceding every checkpoint payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub compression: Compression,
    pub uncompressed_size: u64,
    /// XXHash64 of the uncompressed payload.
    pub checksum: u64,
    pub metadata: BTreeMap<String, String>,
}

impl CheckpointHeader {
    pub const MAGIC: [u8; 4] = *b"DBRC";
    pub const VERSION: u32 = 1;

    pub fn for_payload(
        payload: &[u8],
        compression: Compression,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            compression,
            uncompressed_size: payload.len() as u64,
            checksum: checksum(payload),
            metadata,
        }
    }

    /// The completed-round count recorded in the metadata, if any.
    pub fn round(&self) -> Option<u32> {
        self.metadata.get(META_ROUND).and_then(|r| r.parse().ok())
    }

    /// Records the per-round metric history under [`META_METRIC_PREFIX`].
    pub fn insert_metrics(
        metadata: &mut BTreeMap<String, String>,
        metrics: &BTreeMap<String, Vec<f32>>,
    ) {
        for (name, values) in metrics {
            let joined = values
                .iter()
                .map(f32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            metadata.insert(format!("{META_METRIC_PREFIX}{name}"), joined);
        }
    }

    /// The per-round metric history recorded in the metadata.
    pub fn metrics(&self) -> Result<BTreeMap<String, Vec<f32>>> {
        let mut metrics = BTreeMap::new();
        for (key, joined) in &self.metadata {
            let Some(name) = key.strip_prefix(META_METRIC_PREFIX) else {
                continue;
            };
            let values = if joined.is_empty() {
                Vec::new()
            } else {
                joined
                    .split(',')
                    .map(|v| {
                        v.parse::<f32>().map_err(|e| {
                            BoostError::checkpoint(format!(
                                "invalid metric value '{v}' for '{name}': {e}"
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?
            };
            metrics.insert(name.to_string(), values);
        }
        Ok(metrics)
    }

    fn validate(&self) -> Result<()> {
        if self.magic != Self::MAGIC {
            return Err(BoostError::checkpoint(format!(
                "invalid magic bytes: expected {:?}, got {:?}",
                Self::MAGIC,
                self.magic
            )));
        }
        if self.version != Self::VERSION {
            return Err(BoostError::checkpoint(format!(
                "unsupported version: expected {}, got {}",
                Self::VERSION,
                self.version
            )));
        }
        Ok(())
    }
}

/// XXHash64 (seed 0) of `data`.
pub fn checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

/// Frames `header` and an already-compressed payload into one buffer.
pub fn encode(header: &CheckpointHeader, compressed: &[u8]) -> Result<Vec<u8>> {
    let header_bytes = bincode::serialize(header)
        .map_err(|e| BoostError::checkpoint_with_source("failed to serialize header", e))?;
    let header_len = u32::try_from(header_bytes.len())
        .map_err(|_| BoostError::checkpoint("checkpoint header too large"))?;

    let mut out = Vec::with_capacity(4 + header_bytes.len() + compressed.len());
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(compressed);
    Ok(out)
}

/// Splits a framed buffer into its validated header and compressed payload.
pub fn decode(bytes: &[u8]) -> Result<(CheckpointHeader, &[u8])> {
    let len_bytes: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| BoostError::checkpoint("checkpoint file too small"))?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;

    let header_end = 4usize
        .checked_add(header_len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| BoostError::checkpoint("checkpoint file truncated: header incomplete"))?;

    let header: CheckpointHeader = bincode::deserialize(&bytes[4..header_end])
        .map_err(|e| BoostError::checkpoint_with_source("failed to deserialize header", e))?;
    header.validate()?;

    Ok((header, &bytes[header_end..]))
}
