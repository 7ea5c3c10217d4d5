//! Codec backends and their frozen wire identities.
//!
//! # Identity rules
//! Every backend has a `u16` wire id written into the container header.
//! Ids are permanent and never reused.  A reader that meets an id outside
//! [`CodecId`] rejects the container as malformed before touching the body.
//!
//! Dispatch is a closed `match` over [`CodecId`]; there is no runtime
//! registration.

pub mod profile;
pub mod select;

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use profile::{CodecProfile, CodecProfileRegistry, ContentAffinity, ContentHint, RegistryError};
pub use select::{select, CodecChoice, Compressed, RankedCandidate, TrialOutcome, TrialVerdict};

// ── Wire ids ─────────────────────────────────────────────────────────────────

pub const WIRE_STORE:          u16 = 0;
pub const WIRE_ZSTD:           u16 = 1;
pub const WIRE_LZ4:            u16 = 2;
pub const WIRE_BROTLI:         u16 = 3;
pub const WIRE_LZMA:           u16 = 4;
pub const WIRE_BYTEPLANE_ZSTD: u16 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecId {
    /// Payload stored verbatim.  Always available as the last fallback.
    Store,
    Zstd,
    Lz4,
    Brotli,
    Lzma,
    /// Byte-plane split with per-plane delta, then zstd.  For f32-like data.
    #[serde(rename = "byteplane-zstd")]
    BytePlaneZstd,
}

impl CodecId {
    pub const ALL: [CodecId; 6] = [
        CodecId::Store,
        CodecId::Zstd,
        CodecId::Lz4,
        CodecId::Brotli,
        CodecId::Lzma,
        CodecId::BytePlaneZstd,
    ];

    #[inline]
    pub fn wire_id(self) -> u16 {
        match self {
            CodecId::Store         => WIRE_STORE,
            CodecId::Zstd          => WIRE_ZSTD,
            CodecId::Lz4           => WIRE_LZ4,
            CodecId::Brotli        => WIRE_BROTLI,
            CodecId::Lzma          => WIRE_LZMA,
            CodecId::BytePlaneZstd => WIRE_BYTEPLANE_ZSTD,
        }
    }

    /// `None` if the id is not known to this build.
    pub fn from_wire(id: u16) -> Option<Self> {
        match id {
            WIRE_STORE          => Some(CodecId::Store),
            WIRE_ZSTD           => Some(CodecId::Zstd),
            WIRE_LZ4            => Some(CodecId::Lz4),
            WIRE_BROTLI         => Some(CodecId::Brotli),
            WIRE_LZMA           => Some(CodecId::Lzma),
            WIRE_BYTEPLANE_ZSTD => Some(CodecId::BytePlaneZstd),
            _                   => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CodecId::Store         => "store",
            CodecId::Zstd          => "zstd",
            CodecId::Lz4           => "lz4",
            CodecId::Brotli        => "brotli",
            CodecId::Lzma          => "lzma",
            CodecId::BytePlaneZstd => "byteplane-zstd",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        let s = s.to_lowercase();
        CodecId::ALL.into_iter().find(|id| id.name() == s)
    }
}

impl std::fmt::Display for CodecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Decompressed output exceeds {limit} bytes")]
    OutputLimit { limit: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Decompress, failing with [`CodecError::OutputLimit`] as soon as the
    /// output would grow past `limit` bytes.  The built-in backends never
    /// buffer more than `limit` bytes; the default only checks afterwards.
    fn decompress_bounded(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        let out = self.decompress(data)?;
        if out.len() > limit {
            return Err(CodecError::OutputLimit { limit });
        }
        Ok(out)
    }
}

/// Sink that refuses to hold more than `limit` bytes.
struct LimitedWriter {
    buf:      Vec<u8>,
    limit:    usize,
    overflow: bool,
}

impl LimitedWriter {
    fn new(limit: usize) -> Self {
        Self { buf: Vec::new(), limit, overflow: false }
    }

    fn finish(self, res: io::Result<()>) -> Result<Vec<u8>, CodecError> {
        if self.overflow {
            return Err(CodecError::OutputLimit { limit: self.limit });
        }
        res.map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(self.buf)
    }
}

impl Write for LimitedWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.len() > self.limit - self.buf.len() {
            self.overflow = true;
            return Err(io::Error::new(io::ErrorKind::Other, "output limit reached"));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

fn read_bounded<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>, CodecError> {
    let mut sink = LimitedWriter::new(limit);
    let res = io::copy(&mut reader, &mut sink).map(drop);
    sink.finish(res)
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct StoreCodec;
impl Codec for StoreCodec {
    fn codec_id(&self) -> CodecId { CodecId::Store }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8])        -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress_bounded(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        if data.len() > limit {
            return Err(CodecError::OutputLimit { limit });
        }
        Ok(data.to_vec())
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn codec_id(&self) -> CodecId { CodecId::Zstd }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level).map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::decode_all(data).map_err(|e| CodecError::Decompression(e.to_string()))
    }
    fn decompress_bounded(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        let decoder = zstd::stream::read::Decoder::new(data)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        read_bounded(decoder, limit)
    }
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn codec_id(&self) -> CodecId { CodecId::Lz4 }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CodecError::Decompression(e.to_string()))
    }
    fn decompress_bounded(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        // The prepended size drives the allocation; check it first.
        let declared = data
            .get(..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u64)
            .ok_or_else(|| CodecError::Decompression("lz4 size prefix truncated".into()))?;
        if declared > limit as u64 {
            return Err(CodecError::OutputLimit { limit });
        }
        self.decompress(data)
    }
}

pub struct BrotliCodec;
impl Codec for BrotliCodec {
    fn codec_id(&self) -> CodecId { CodecId::Brotli }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let quality = level.clamp(0, 11) as u32;
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, quality, 22);
            w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        }
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        brotli::Decompressor::new(data, 4096)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
    fn decompress_bounded(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        read_bounded(brotli::Decompressor::new(data, 4096), limit)
    }
}

/// lzma-rs only emits literal-only streams; its profile ratio reflects that.
pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn codec_id(&self) -> CodecId { CodecId::Lzma }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_decompress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
    fn decompress_bounded(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        // The dictionary buffer grows with the output; cap it as well.
        let options = lzma_rs::decompress::Options {
            memlimit: Some(limit.saturating_add(1)),
            ..Default::default()
        };
        let mut sink = LimitedWriter::new(limit);
        let res = lzma_rs::lzma_decompress_with_options(&mut io::Cursor::new(data), &mut sink, &options)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()));
        sink.finish(res)
    }
}

/// Byte-plane separation for 4-byte numeric lanes.
///
/// Byte `p` of every lane goes to plane `p`; each plane is delta-coded
/// (wrapping), planes are concatenated lowest first, and the `len % 4` tail
/// bytes follow raw.  The transform preserves length, so the zstd frame
/// alone is enough to invert it.
pub struct BytePlaneZstdCodec;

pub const LANE_WIDTH: usize = 4;

impl BytePlaneZstdCodec {
    fn split_planes(data: &[u8]) -> Vec<u8> {
        let lanes = data.len() / LANE_WIDTH;
        let mut out = Vec::with_capacity(data.len());
        for p in 0..LANE_WIDTH {
            let mut prev = 0u8;
            for lane in data[..lanes * LANE_WIDTH].chunks_exact(LANE_WIDTH) {
                out.push(lane[p].wrapping_sub(prev));
                prev = lane[p];
            }
        }
        out.extend_from_slice(&data[lanes * LANE_WIDTH..]);
        out
    }

    fn merge_planes(planes: &[u8]) -> Vec<u8> {
        let lanes = planes.len() / LANE_WIDTH;
        let mut out = vec![0u8; planes.len()];
        for p in 0..LANE_WIDTH {
            let mut acc = 0u8;
            for (i, &d) in planes[p * lanes..(p + 1) * lanes].iter().enumerate() {
                acc = acc.wrapping_add(d);
                out[i * LANE_WIDTH + p] = acc;
            }
        }
        out[lanes * LANE_WIDTH..].copy_from_slice(&planes[lanes * LANE_WIDTH..]);
        out
    }
}

impl Codec for BytePlaneZstdCodec {
    fn codec_id(&self) -> CodecId { CodecId::BytePlaneZstd }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        ZstdCodec.compress(&Self::split_planes(data), level)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(Self::merge_planes(&ZstdCodec.decompress(data)?))
    }
    fn decompress_bounded(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        Ok(Self::merge_planes(&ZstdCodec.decompress_bounded(data, limit)?))
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve a `CodecId` to its built-in backend.
pub fn get_codec(id: CodecId) -> &'static dyn Codec {
    match id {
        CodecId::Store         => &StoreCodec,
        CodecId::Zstd          => &ZstdCodec,
        CodecId::Lz4           => &Lz4Codec,
        CodecId::Brotli        => &BrotliCodec,
        CodecId::Lzma          => &LzmaCodec,
        CodecId::BytePlaneZstd => &BytePlaneZstdCodec,
    }
}
