//! The `.mndc` container: header, ECC body, Merkle tree.
//!
//! # Wire layout (all integers little-endian)
//! ```text
//! Offset  Size  Field
//!      0     4  magic "MNDC"
//!      4     2  format_version
//!      6     8  original_size
//!     14     2  codec_id
//!     16     2  ecc_mode            (group_size << 8 | inner_symbols)
//!     18     1  damage_tolerance_percent
//!     19     4  leaf_size
//!     23     4  leaf_count
//!     27    32  merkle_root
//!     59    32  pattern_summary_checksum
//!     91     4  block_size
//!     95     8  payload_len
//!    103     4  data_block_count
//!    107     4  header_crc32        (CRC-32 of bytes 0..107)
//!    111        body: leaf_count × (payload ‖ inner_parity)
//!               tree: node_count(leaf_count) × 32-byte hashes, level order
//! ```
//! The file must end exactly after the tree.
//!
//! Bytes `91..111` are a format-v1 extension over the base header: they let
//! a reader size the body and reject damage to the header itself before
//! touching any leaf.  The tree pairs an odd last node with itself, so it
//! holds `node_count(n) = Σ ceil(n / 2^i)` hashes over levels `i = 0..=⌈log2 n⌉`.
//! That equals `2n - 1` only when `n` is a power of two.
//!
//! `damage_tolerance_percent` and `ecc_mode` are stored separately but are
//! not independent: the inner code must carry at least the symbols
//! [`EccMode::for_tolerance`] derives from the tolerance.  A stronger inner
//! code is accepted.
//!
//! # Trust
//! The header and tree are trusted metadata: any inconsistency there is a
//! [`FatalError::MalformedContainer`] and no repair is attempted.  Only
//! body leaves are expected to rot, and only body leaves are repaired.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::codec::CodecId;
use crate::ecc::{BlockKind, EccBlock, EccLayout, EccMode};
use crate::error::FatalError;
use crate::merkle::{node_count, Hash, MerkleTree};

pub const MAGIC: &[u8; 4] = b"MNDC";
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 111;

/// Byte offset of `leaf_count` within the header.
pub const LEAF_COUNT_OFFSET: usize = 23;
const CRC_OFFSET: usize = HEADER_SIZE - 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub format_version:           u16,
    pub original_size:            u64,
    pub codec_id:                 CodecId,
    pub ecc_mode:                 EccMode,
    pub damage_tolerance_percent: u8,
    pub leaf_size:                u32,
    pub leaf_count:               u32,
    pub merkle_root:              Hash,
    pub pattern_summary_checksum: [u8; 32],
    pub block_size:               u32,
    /// Compressed payload length before block padding.
    pub payload_len:              u64,
    pub data_block_count:         u32,
}

impl ContainerHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&self.format_version.to_le_bytes());
        buf.extend_from_slice(&self.original_size.to_le_bytes());
        buf.extend_from_slice(&self.codec_id.wire_id().to_le_bytes());
        buf.extend_from_slice(&self.ecc_mode.pack().to_le_bytes());
        buf.push(self.damage_tolerance_percent);
        buf.extend_from_slice(&self.leaf_size.to_le_bytes());
        buf.extend_from_slice(&self.leaf_count.to_le_bytes());
        buf.extend_from_slice(&self.merkle_root);
        buf.extend_from_slice(&self.pattern_summary_checksum);
        buf.extend_from_slice(&self.block_size.to_le_bytes());
        buf.extend_from_slice(&self.payload_len.to_le_bytes());
        buf.extend_from_slice(&self.data_block_count.to_le_bytes());
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FatalError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FatalError::malformed(format!(
                "header truncated: {} of {HEADER_SIZE} bytes",
                bytes.len()
            )));
        }
        let raw = RawHeader::read(&mut Cursor::new(&bytes[..HEADER_SIZE]))
            .map_err(|e| FatalError::malformed(format!("header unreadable: {e}")))?;

        let actual_crc = crc32fast::hash(&bytes[..CRC_OFFSET]);
        if raw.header_crc32 != actual_crc {
            return Err(FatalError::malformed(format!(
                "header CRC mismatch: stored {:#010x}, computed {actual_crc:#010x}",
                raw.header_crc32
            )));
        }
        if &raw.magic != MAGIC {
            return Err(FatalError::malformed("invalid magic"));
        }
        if raw.format_version != FORMAT_VERSION {
            return Err(FatalError::malformed(format!(
                "unsupported format version {}",
                raw.format_version
            )));
        }
        let codec_id = CodecId::from_wire(raw.codec_id)
            .ok_or_else(|| FatalError::malformed(format!("unknown codec id {}", raw.codec_id)))?;
        let ecc_mode = EccMode::unpack(raw.ecc_mode)
            .map_err(|e| FatalError::malformed(format!("ecc_mode {:#06x}: {e}", raw.ecc_mode)))?;

        Ok(Self {
            format_version:           raw.format_version,
            original_size:            raw.original_size,
            codec_id,
            ecc_mode,
            damage_tolerance_percent: raw.damage_tolerance_percent,
            leaf_size:                raw.leaf_size,
            leaf_count:               raw.leaf_count,
            merkle_root:              raw.merkle_root,
            pattern_summary_checksum: raw.pattern_summary_checksum,
            block_size:               raw.block_size,
            payload_len:              raw.payload_len,
            data_block_count:         raw.data_block_count,
        })
    }

    /// Byte length of a complete container with this header.
    fn expected_len(&self) -> Option<u64> {
        let body = (self.leaf_count as u64).checked_mul(self.leaf_size as u64)?;
        let tree = (node_count(self.leaf_count as usize) as u64).checked_mul(32)?;
        (HEADER_SIZE as u64).checked_add(body)?.checked_add(tree)
    }
}

/// Header fields exactly as stored, before interpretation.
struct RawHeader {
    magic:                    [u8; 4],
    format_version:           u16,
    original_size:            u64,
    codec_id:                 u16,
    ecc_mode:                 u16,
    damage_tolerance_percent: u8,
    leaf_size:                u32,
    leaf_count:               u32,
    merkle_root:              [u8; 32],
    pattern_summary_checksum: [u8; 32],
    block_size:               u32,
    payload_len:              u64,
    data_block_count:         u32,
    header_crc32:             u32,
}

impl RawHeader {
    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        let format_version = r.read_u16::<LittleEndian>()?;
        let original_size = r.read_u64::<LittleEndian>()?;
        let codec_id = r.read_u16::<LittleEndian>()?;
        let ecc_mode = r.read_u16::<LittleEndian>()?;
        let damage_tolerance_percent = r.read_u8()?;
        let leaf_size = r.read_u32::<LittleEndian>()?;
        let leaf_count = r.read_u32::<LittleEndian>()?;
        let mut merkle_root = [0u8; 32];
        r.read_exact(&mut merkle_root)?;
        let mut pattern_summary_checksum = [0u8; 32];
        r.read_exact(&mut pattern_summary_checksum)?;
        Ok(Self {
            magic,
            format_version,
            original_size,
            codec_id,
            ecc_mode,
            damage_tolerance_percent,
            leaf_size,
            leaf_count,
            merkle_root,
            pattern_summary_checksum,
            block_size:       r.read_u32::<LittleEndian>()?,
            payload_len:      r.read_u64::<LittleEndian>()?,
            data_block_count: r.read_u32::<LittleEndian>()?,
            header_crc32:     r.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    header: ContainerHeader,
    blocks: Vec<EccBlock>,
    tree:   MerkleTree,
}

impl Container {
    /// Assemble a container without checking it.  `decode` and `verify`
    /// validate structure before using it.
    pub fn from_parts(header: ContainerHeader, blocks: Vec<EccBlock>, tree: MerkleTree) -> Self {
        Self { header, blocks, tree }
    }

    pub fn into_parts(self) -> (ContainerHeader, Vec<EccBlock>, MerkleTree) {
        (self.header, self.blocks, self.tree)
    }

    pub fn header(&self) -> &ContainerHeader { &self.header }

    pub fn blocks(&self) -> &[EccBlock] { &self.blocks }

    pub fn tree(&self) -> &MerkleTree { &self.tree }

    /// Check every structural invariant between header, blocks and tree.
    /// Leaf contents are not hashed here.
    pub fn validate(&self) -> Result<EccLayout, FatalError> {
        let h = &self.header;
        if h.format_version != FORMAT_VERSION {
            return Err(FatalError::malformed(format!("unsupported format version {}", h.format_version)));
        }
        if h.damage_tolerance_percent > 100 {
            return Err(FatalError::malformed(format!(
                "damage tolerance {}% exceeds 100%",
                h.damage_tolerance_percent
            )));
        }
        let layout = EccLayout::new(h.block_size as usize, h.ecc_mode)
            .map_err(|e| FatalError::malformed(format!("ecc layout: {e}")))?;
        // Inner code at least as strong as the declared tolerance demands.
        let required = EccMode::for_tolerance(h.damage_tolerance_percent, h.ecc_mode.group_size)
            .map_err(|e| FatalError::malformed(format!("ecc layout: {e}")))?
            .inner_symbols;
        if h.ecc_mode.inner_symbols < required {
            return Err(FatalError::malformed(format!(
                "tolerance {}% needs at least {required} inner symbols, header has {}",
                h.damage_tolerance_percent, h.ecc_mode.inner_symbols
            )));
        }

        if h.leaf_size as usize != layout.leaf_size() {
            return Err(FatalError::malformed(format!(
                "leaf_size {} does not match layout ({})",
                h.leaf_size,
                layout.leaf_size()
            )));
        }
        let data_blocks = layout.data_block_count(h.payload_len);
        if h.data_block_count as usize != data_blocks {
            return Err(FatalError::malformed(format!(
                "data_block_count {} does not match payload_len {} ({data_blocks})",
                h.data_block_count, h.payload_len
            )));
        }
        let leaves = layout.block_count(data_blocks);
        if h.leaf_count as usize != leaves {
            return Err(FatalError::malformed(format!(
                "leaf_count {} does not match layout ({leaves})",
                h.leaf_count
            )));
        }
        if self.blocks.len() != leaves {
            return Err(FatalError::malformed(format!(
                "{} blocks present, header declares {}",
                self.blocks.len(),
                h.leaf_count
            )));
        }
        if h.codec_id == CodecId::Store && h.payload_len != h.original_size {
            return Err(FatalError::malformed("stored payload length differs from original size"));
        }

        for (i, b) in self.blocks.iter().enumerate() {
            let (kind, group) = if i < data_blocks {
                (BlockKind::Data, i / layout.group_size())
            } else {
                (BlockKind::OuterParity, i - data_blocks)
            };
            if b.index as usize != i || b.kind != kind || b.outer_parity_group as usize != group {
                return Err(FatalError::malformed(format!("block {i} out of place")));
            }
            if b.payload.len() != layout.block_size || b.inner_parity.len() != layout.inner_parity_len() {
                return Err(FatalError::malformed(format!("block {i} has wrong size")));
            }
        }

        if self.tree.leaf_count() != leaves {
            return Err(FatalError::malformed(format!(
                "tree has {} leaves, header declares {}",
                self.tree.leaf_count(),
                h.leaf_count
            )));
        }
        if self.tree.root() != h.merkle_root {
            return Err(FatalError::malformed("merkle root does not match header"));
        }
        self.tree
            .check_consistency()
            .map_err(|e| FatalError::malformed(format!("merkle tree: {e}")))?;

        Ok(layout)
    }

    // ── Serialization ────────────────────────────────────────────────────────

    pub fn write_to<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_all(&self.header.to_bytes())?;
        for b in &self.blocks {
            w.write_all(&b.payload)?;
            w.write_all(&b.inner_parity)?;
        }
        for hash in self.tree.hashes() {
            w.write_all(hash)?;
        }
        w.flush()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let leaf_size = self.header.leaf_size as usize;
        let mut out = Vec::with_capacity(
            HEADER_SIZE + self.blocks.len() * leaf_size + self.tree.nodes().len() * 32,
        );
        out.extend_from_slice(&self.header.to_bytes());
        for b in &self.blocks {
            out.extend_from_slice(&b.payload);
            out.extend_from_slice(&b.inner_parity);
        }
        for hash in self.tree.hashes() {
            out.extend_from_slice(hash);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FatalError> {
        let header = ContainerHeader::from_bytes(bytes)?;
        let expected = header
            .expected_len()
            .ok_or_else(|| FatalError::malformed("declared sizes overflow"))?;
        if bytes.len() as u64 != expected {
            return Err(FatalError::malformed(format!(
                "container is {} bytes, header implies {expected}",
                bytes.len()
            )));
        }

        let leaf_size = header.leaf_size as usize;
        let block_size = header.block_size as usize;
        if block_size > leaf_size {
            return Err(FatalError::malformed("block_size exceeds leaf_size"));
        }
        let data_blocks = header.data_block_count as usize;
        let group_size = header.ecc_mode.group_size as usize;
        let leaf_count = header.leaf_count as usize;

        let body_end = HEADER_SIZE + leaf_count * leaf_size;
        let blocks: Vec<EccBlock> = bytes[HEADER_SIZE..body_end]
            .chunks_exact(leaf_size.max(1))
            .take(leaf_count)
            .enumerate()
            .map(|(i, leaf)| {
                let (kind, group) = if i < data_blocks {
                    (BlockKind::Data, i / group_size)
                } else {
                    (BlockKind::OuterParity, i - data_blocks)
                };
                EccBlock {
                    index:              i as u32,
                    kind,
                    outer_parity_group: group as u32,
                    payload:            leaf[..block_size].to_vec(),
                    inner_parity:       leaf[block_size..].to_vec(),
                }
            })
            .collect();

        let hashes: Vec<Hash> = bytes[body_end..]
            .chunks_exact(32)
            .map(|c| {
                let mut h = [0u8; 32];
                h.copy_from_slice(c);
                h
            })
            .collect();
        let tree = MerkleTree::from_hashes(hashes, leaf_count)
            .map_err(|e| FatalError::malformed(format!("merkle tree: {e}")))?;

        let container = Self { header, blocks, tree };
        container.validate()?;
        Ok(container)
    }

    pub fn read_from<R: Read>(mut r: R) -> Result<Self, FatalError> {
        let mut bytes = Vec::new();
        r.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }

    pub fn write_to_path(&self, path: impl AsRef<Path>) -> Result<(), FatalError> {
        let file = File::create(path)?;
        self.write_to(BufWriter::new(file))?;
        Ok(())
    }

    pub fn read_from_path(path: impl AsRef<Path>) -> Result<Self, FatalError> {
        Self::read_from(BufReader::new(File::open(path)?))
    }
}
