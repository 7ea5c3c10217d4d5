//! High-level encode / decode API, the primary embedding surface.
//!
//! ```no_run
//! use mendec::pipeline::{decode, encode, EncodeOptions};
//!
//! let data = b"hello hello hello hello".repeat(1000);
//! let container = encode(&data, &EncodeOptions::default())?;
//! let bytes = container.to_bytes();
//!
//! let restored = mendec::Container::from_bytes(&bytes)?;
//! let (out, report) = decode(&restored)?;
//! assert_eq!(out, data);
//! assert_eq!(report.unrecoverable_blocks, 0);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::{self, CancelFlag};
use crate::codec::{get_codec, select, CodecId, CodecProfileRegistry, Compressed, ContentHint};
use crate::container::{Container, ContainerHeader, FORMAT_VERSION};
use crate::ecc::{assemble_payload, ecc_encode, BlockStatus, EccLayout, DEFAULT_GROUP_SIZE};
use crate::error::{EncodeError, FatalError};
use crate::merkle::{self, MerkleTree};
use crate::pattern::entropy::trial_sample;
use crate::pattern::{detect_content, scan, EntropyEstimate, ScanConfig};
use crate::repair::{self, repair_budget, LostBlockPolicy, RepairReport};

pub const DEFAULT_DAMAGE_TOLERANCE_PERCENT: u8 = 10;
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeOptions {
    /// Share of leaves that may be lost outright, `0..=100`.
    pub damage_tolerance_percent: u8,
    /// `None` detects the content type from the input.
    pub content_hint:             Option<ContentHint>,
    pub block_size:               usize,
    /// Data blocks per outer XOR parity block.
    pub group_size:               u8,
    pub compression_level:        i32,
    pub scan:                     ScanConfig,
    #[serde(skip)]
    pub cancel:                   Option<CancelFlag>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            damage_tolerance_percent: DEFAULT_DAMAGE_TOLERANCE_PERCENT,
            content_hint:             None,
            block_size:               DEFAULT_BLOCK_SIZE,
            group_size:               DEFAULT_GROUP_SIZE,
            compression_level:        DEFAULT_COMPRESSION_LEVEL,
            scan:                     ScanConfig::default(),
            cancel:                   None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeOptions {
    pub lost_blocks: LostBlockPolicy,
    #[serde(skip)]
    pub cancel:      Option<CancelFlag>,
}

// ── Encode ────────────────────────────────────────────────────────────────────

pub fn encode(input: &[u8], options: &EncodeOptions) -> Result<Container, EncodeError> {
    encode_with_registry(input, options, CodecProfileRegistry::builtin())
}

/// Like [`encode`] with caller-supplied codec baselines.
pub fn encode_with_registry(
    input: &[u8],
    options: &EncodeOptions,
    registry: &CodecProfileRegistry,
) -> Result<Container, EncodeError> {
    let layout = EccLayout::for_tolerance(
        options.block_size,
        options.damage_tolerance_percent,
        options.group_size,
    )
    .map_err(|e| EncodeError::InvalidOptions(e.to_string()))?;
    if options.scan.top_k == 0 {
        return Err(EncodeError::InvalidOptions("scan.top_k must be at least 1".into()));
    }
    let cancel = options.cancel.as_ref();
    if cancel::is_cancelled(cancel) {
        return Err(EncodeError::Cancelled);
    }

    let table = scan(input, &options.scan);
    let compressed = if input.is_empty() {
        Compressed { codec: CodecId::Store, payload: Vec::new(), attempts: Vec::new() }
    } else {
        let sample = trial_sample(input);
        let entropy = EntropyEstimate::measure(&sample);
        let hint = match options.content_hint {
            Some(hint) => hint,
            None => {
                let detected = detect_content(input);
                debug!(hint = ?detected, "detected content type");
                detected
            }
        };
        let choice = select(&table, hint, registry, &entropy, input.len());
        choice.compress(input, &sample, &entropy, options.compression_level)
    };
    if cancel::is_cancelled(cancel) {
        return Err(EncodeError::Cancelled);
    }

    let blocks = ecc_encode(&compressed.payload, &layout, cancel)?;
    let tree = MerkleTree::build(&blocks);
    let data_block_count = layout.data_block_count(compressed.payload.len() as u64);

    let header = ContainerHeader {
        format_version:           FORMAT_VERSION,
        original_size:            input.len() as u64,
        codec_id:                 compressed.codec,
        ecc_mode:                 layout.mode,
        damage_tolerance_percent: options.damage_tolerance_percent,
        leaf_size:                layout.leaf_size() as u32,
        leaf_count:               blocks.len() as u32,
        merkle_root:              tree.root(),
        pattern_summary_checksum: table.summary_checksum(),
        block_size:               layout.block_size as u32,
        payload_len:              compressed.payload.len() as u64,
        data_block_count:         data_block_count as u32,
    };

    info!(
        codec = %compressed.codec,
        original_size = input.len(),
        payload_len = compressed.payload.len(),
        leaves = blocks.len(),
        inner_symbols = layout.mode.inner_symbols,
        "encoded container"
    );
    Ok(Container::from_parts(header, blocks, tree))
}

// ── Decode ────────────────────────────────────────────────────────────────────

/// Decode with the default policy (lost data leaves are fatal).
pub fn decode(container: &Container) -> Result<(Vec<u8>, RepairReport), FatalError> {
    decode_with(container, &DecodeOptions::default())
}

pub fn decode_with(
    container: &Container,
    options: &DecodeOptions,
) -> Result<(Vec<u8>, RepairReport), FatalError> {
    let layout = container.validate()?;
    let cancel = options.cancel.as_ref();
    if cancel::is_cancelled(cancel) {
        return Err(FatalError::Cancelled);
    }

    let header = container.header();
    let (blocks, report) = repair::heal(container, &layout, options.lost_blocks, cancel)?;
    let payload = assemble_payload(&blocks, &layout, header.payload_len);

    let codec_id = header.codec_id;
    let limit = usize::try_from(header.original_size).unwrap_or(usize::MAX);
    let restored = get_codec(codec_id).decompress_bounded(&payload, limit);
    let failure = match restored {
        Ok(out) if out.len() as u64 == header.original_size => return Ok((out, report)),
        Ok(out) => format!("restored {} bytes, header declares {}", out.len(), header.original_size),
        Err(e) => e.to_string(),
    };

    if !report.is_exact() {
        // Zero-filled holes broke the stream.
        warn!(codec = %codec_id, detail = %failure, "decompression failed over zero-filled leaves");
        let unrecoverable = report
            .outcomes
            .iter()
            .filter(|o| o.status == BlockStatus::Unrecoverable)
            .map(|o| o.index)
            .collect();
        return Err(FatalError::DamageExceedsTolerance {
            unrecoverable,
            budget: repair_budget(blocks.len(), header.damage_tolerance_percent),
        });
    }
    Err(FatalError::Codec { codec: codec_id.name(), detail: failure })
}

// ── Verify ────────────────────────────────────────────────────────────────────

/// Structural validation plus the set of leaves whose hash no longer
/// matches.  Read-only; calling it twice gives the same answer.
pub fn verify(container: &Container) -> Result<BTreeSet<u32>, FatalError> {
    container.validate()?;
    Ok(merkle::verify(container.tree(), container.blocks()))
}
