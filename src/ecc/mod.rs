//! Two-level error correction over fixed-size blocks.
//!
//! # Layout
//! The compressed payload is cut into `D` data blocks of `block_size` bytes
//! (last one zero-padded).  Every `group_size` consecutive data blocks form an
//! outer group protected by one XOR parity block; parity blocks follow all
//! data blocks, group `g` at index `D + g`.  Every block, data or parity,
//! then carries its own interleaved Reed-Solomon inner parity.
//!
//! ```text
//!  index:  0 .. D-1                     D .. D+ceil(D/G)-1
//!          [data │ rs] [data │ rs] ...  [xor │ rs] [xor │ rs] ...
//!           └── group 0 (G blocks) ──┘   group 0    group 1
//! ```
//!
//! # Repair
//! [`repair_blocks`] runs in two stages with a barrier between them:
//! 1. **Inner**: every damaged block is RS-decoded independently (parallel).
//!    A correction only counts once the caller's leaf-hash check passes.
//! 2. **Outer**: a group with exactly one block still bad rebuilds it as the
//!    XOR of the other members.  Two or more bad members in one group are
//!    beyond the outer code and are reported unrecoverable.

pub mod gf256;
pub mod rs;

use std::collections::BTreeSet;
use std::ops::Range;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::{self, CancelFlag};
use crate::error::{EncodeError, FatalError};
use crate::perf::try_map_ordered;

pub use rs::{InnerCode, ReedSolomon, RsError};

pub const MIN_BLOCK_SIZE: usize = 16;
pub const MAX_BLOCK_SIZE: usize = 16 * 1024 * 1024;
pub const MAX_INNER_SYMBOLS: u8 = 128;
pub const DEFAULT_GROUP_SIZE: u8 = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("block size {0} outside {MIN_BLOCK_SIZE}..={MAX_BLOCK_SIZE}")]
    BlockSize(usize),
    #[error("inner parity symbols {0} must be even and within 2..={MAX_INNER_SYMBOLS}")]
    InnerSymbols(u8),
    #[error("outer group size must be at least 1")]
    GroupSize,
    #[error("damage tolerance {0}% exceeds 100%")]
    Tolerance(u8),
}

// ── Mode ─────────────────────────────────────────────────────────────────────

/// ECC parameters as recorded in the header's `ecc_mode` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EccMode {
    /// RS parity symbols per codeword.
    pub inner_symbols: u8,
    /// Data blocks per outer XOR group.
    pub group_size:    u8,
}

impl EccMode {
    /// Inner strength needed to absorb `percent`% byte damage per codeword:
    /// `2 * ceil(255 * p / 200)`, clamped to `2..=128`.
    pub fn for_tolerance(percent: u8, group_size: u8) -> Result<Self, LayoutError> {
        if percent > 100 {
            return Err(LayoutError::Tolerance(percent));
        }
        let half = (255 * percent as usize).div_ceil(200);
        let inner_symbols = (2 * half).clamp(2, MAX_INNER_SYMBOLS as usize) as u8;
        let mode = Self { inner_symbols, group_size };
        mode.validate()?;
        Ok(mode)
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.inner_symbols < 2
            || self.inner_symbols > MAX_INNER_SYMBOLS
            || self.inner_symbols % 2 != 0
        {
            return Err(LayoutError::InnerSymbols(self.inner_symbols));
        }
        if self.group_size == 0 {
            return Err(LayoutError::GroupSize);
        }
        Ok(())
    }

    pub fn pack(self) -> u16 {
        (self.group_size as u16) << 8 | self.inner_symbols as u16
    }

    pub fn unpack(raw: u16) -> Result<Self, LayoutError> {
        let mode = Self { inner_symbols: (raw & 0xFF) as u8, group_size: (raw >> 8) as u8 };
        mode.validate()?;
        Ok(mode)
    }
}

// ── Layout ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EccLayout {
    pub block_size: usize,
    pub mode:       EccMode,
    inner:          InnerCode,
}

impl EccLayout {
    pub fn new(block_size: usize, mode: EccMode) -> Result<Self, LayoutError> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
            return Err(LayoutError::BlockSize(block_size));
        }
        mode.validate()?;
        let inner = InnerCode::new(block_size, mode.inner_symbols as usize);
        Ok(Self { block_size, mode, inner })
    }

    pub fn for_tolerance(
        block_size: usize,
        damage_tolerance_percent: u8,
        group_size: u8,
    ) -> Result<Self, LayoutError> {
        Self::new(block_size, EccMode::for_tolerance(damage_tolerance_percent, group_size)?)
    }

    pub fn inner_code(&self) -> &InnerCode { &self.inner }

    pub fn inner_parity_len(&self) -> usize { self.inner.parity_len() }

    /// Serialized size of one block: payload then inner parity.
    pub fn leaf_size(&self) -> usize { self.block_size + self.inner_parity_len() }

    pub fn group_size(&self) -> usize { self.mode.group_size as usize }

    /// `max(1, ceil(payload_len / block_size))`.
    pub fn data_block_count(&self, payload_len: u64) -> usize {
        (payload_len.div_ceil(self.block_size as u64) as usize).max(1)
    }

    pub fn group_count(&self, data_blocks: usize) -> usize {
        data_blocks.div_ceil(self.group_size())
    }

    /// Total leaves for `data_blocks` data blocks.
    pub fn block_count(&self, data_blocks: usize) -> usize {
        data_blocks + self.group_count(data_blocks)
    }

    /// Data block indices belonging to group `g`.
    pub fn group_members(&self, g: usize, data_blocks: usize) -> Range<usize> {
        let start = g * self.group_size();
        start.min(data_blocks)..((g + 1) * self.group_size()).min(data_blocks)
    }

    pub fn parity_index(&self, g: usize, data_blocks: usize) -> usize { data_blocks + g }

    /// Compressed-payload byte range held by data block `index`.
    pub fn payload_range(&self, index: usize, payload_len: u64) -> Range<u64> {
        let bs = self.block_size as u64;
        let start = (index as u64 * bs).min(payload_len);
        start..((index as u64 + 1) * bs).min(payload_len)
    }
}

// ── Blocks ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Data,
    OuterParity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EccBlock {
    pub index:              u32,
    pub kind:               BlockKind,
    pub outer_parity_group: u32,
    pub payload:            Vec<u8>,
    pub inner_parity:       Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum BlockStatus {
    Healthy,
    RepairedInner { corrected_bytes: usize },
    RepairedOuter,
    Unrecoverable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockOutcome {
    pub index:  u32,
    pub kind:   BlockKind,
    #[serde(flatten)]
    pub status: BlockStatus,
}

/// Split `payload` into data blocks, derive outer parity, then attach inner
/// parity to every block.
pub fn ecc_encode(
    payload: &[u8],
    layout: &EccLayout,
    cancel: Option<&CancelFlag>,
) -> Result<Vec<EccBlock>, EncodeError> {
    let bs = layout.block_size;
    let data_blocks = layout.data_block_count(payload.len() as u64);
    let groups = layout.group_count(data_blocks);

    let mut payloads: Vec<Vec<u8>> = Vec::with_capacity(data_blocks + groups);
    for i in 0..data_blocks {
        let mut block = vec![0u8; bs];
        let start = (i * bs).min(payload.len());
        let end = ((i + 1) * bs).min(payload.len());
        block[..end - start].copy_from_slice(&payload[start..end]);
        payloads.push(block);
    }
    for g in 0..groups {
        let mut parity = vec![0u8; bs];
        for m in layout.group_members(g, data_blocks) {
            gf256::xor_slice(&mut parity, &payloads[m]);
        }
        payloads.push(parity);
    }

    let inner = layout.inner_code();
    let parities = try_map_ordered(&payloads, |_, p| {
        if cancel::is_cancelled(cancel) {
            return Err(EncodeError::Cancelled);
        }
        Ok(inner.encode(p))
    })?;

    let blocks: Vec<EccBlock> = payloads
        .into_iter()
        .zip(parities)
        .enumerate()
        .map(|(i, (payload, inner_parity))| {
            let (kind, group) = if i < data_blocks {
                (BlockKind::Data, i / layout.group_size())
            } else {
                (BlockKind::OuterParity, i - data_blocks)
            };
            EccBlock {
                index: i as u32,
                kind,
                outer_parity_group: group as u32,
                payload,
                inner_parity,
            }
        })
        .collect();

    debug!(
        data_blocks,
        parity_blocks = groups,
        block_size = bs,
        inner_symbols = layout.mode.inner_symbols,
        "ecc encoded"
    );
    Ok(blocks)
}

enum GroupRepair {
    Rebuilt(EccBlock),
    Lost(Vec<u32>),
}

/// Repair the blocks listed in `damaged` in place.
///
/// `verify` must return `true` only for a block whose leaf hash matches the
/// trusted tree.  Blocks left unrecoverable have payload and parity zeroed.
/// One outcome is returned per block, in index order.
pub fn repair_blocks<V>(
    blocks: &mut [EccBlock],
    damaged: &BTreeSet<u32>,
    layout: &EccLayout,
    verify: V,
    cancel: Option<&CancelFlag>,
) -> Result<Vec<BlockOutcome>, FatalError>
where
    V: Fn(&EccBlock) -> bool + Sync,
{
    let mut status = vec![BlockStatus::Healthy; blocks.len()];
    let targets: Vec<u32> = damaged
        .iter()
        .copied()
        .filter(|&i| (i as usize) < blocks.len())
        .collect();

    // ── Stage 1: inner RS, block-parallel ────────────────────────────────────
    let inner = layout.inner_code();
    let attempts = {
        let view: &[EccBlock] = blocks;
        try_map_ordered(&targets, |_, &idx| {
            if cancel::is_cancelled(cancel) {
                return Err(FatalError::Cancelled);
            }
            let mut candidate = view[idx as usize].clone();
            let fixed = inner.correct(&mut candidate.payload, &mut candidate.inner_parity);
            Ok(match fixed {
                Ok(n) if n > 0 && verify(&candidate) => Some((candidate, n)),
                _ => None,
            })
        })?
    };

    let mut still_bad = BTreeSet::new();
    for (&idx, attempt) in targets.iter().zip(attempts) {
        match attempt {
            Some((block, corrected_bytes)) => {
                debug!(block = idx, corrected_bytes, "inner repair");
                blocks[idx as usize] = block;
                status[idx as usize] = BlockStatus::RepairedInner { corrected_bytes };
            }
            None => {
                still_bad.insert(idx);
            }
        }
    }

    if cancel::is_cancelled(cancel) {
        return Err(FatalError::Cancelled);
    }

    // ── Stage 2: outer XOR, group-parallel ───────────────────────────────────
    let data_blocks = blocks.iter().filter(|b| b.kind == BlockKind::Data).count();
    let groups: Vec<usize> = still_bad
        .iter()
        .map(|&i| blocks[i as usize].outer_parity_group as usize)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let repairs = {
        let view: &[EccBlock] = blocks;
        let still_bad = &still_bad;
        try_map_ordered(&groups, |_, &g| {
            if cancel::is_cancelled(cancel) {
                return Err(FatalError::Cancelled);
            }
            let mut members: Vec<usize> = layout.group_members(g, data_blocks).collect();
            members.push(layout.parity_index(g, data_blocks));
            members.retain(|&m| m < view.len());

            let bad: Vec<u32> = members
                .iter()
                .map(|&m| m as u32)
                .filter(|m| still_bad.contains(m))
                .collect();
            if bad.len() != 1 {
                return Ok(GroupRepair::Lost(bad));
            }

            let target = bad[0] as usize;
            let rebuilt = rebuild_member(view, &members, target, layout);
            Ok(if verify(&rebuilt) {
                GroupRepair::Rebuilt(rebuilt)
            } else {
                GroupRepair::Lost(bad)
            })
        })?
    };
    if cancel::is_cancelled(cancel) {
        return Err(FatalError::Cancelled);
    }

    for (&g, repair) in groups.iter().zip(repairs) {
        match repair {
            GroupRepair::Rebuilt(block) => {
                let idx = block.index as usize;
                info!(block = idx, group = g, "outer repair");
                blocks[idx] = block;
                status[idx] = BlockStatus::RepairedOuter;
            }
            GroupRepair::Lost(lost) => {
                warn!(group = g, lost = ?lost, "group beyond outer parity");
                for idx in lost {
                    let b = &mut blocks[idx as usize];
                    b.payload.fill(0);
                    b.inner_parity.fill(0);
                    status[idx as usize] = BlockStatus::Unrecoverable;
                }
            }
        }
    }

    Ok(blocks
        .iter()
        .zip(status)
        .map(|(b, status)| BlockOutcome { index: b.index, kind: b.kind, status })
        .collect())
}

fn rebuild_member(
    blocks: &[EccBlock],
    members: &[usize],
    target: usize,
    layout: &EccLayout,
) -> EccBlock {
    let mut payload = vec![0u8; layout.block_size];
    for &m in members.iter().filter(|&&m| m != target) {
        gf256::xor_slice(&mut payload, &blocks[m].payload);
    }
    let src = &blocks[target];
    EccBlock {
        index:              src.index,
        kind:               src.kind,
        outer_parity_group: src.outer_parity_group,
        inner_parity:       layout.inner_code().encode(&payload),
        payload,
    }
}

/// Concatenate data payloads in index order and drop the final padding.
pub fn assemble_payload(blocks: &[EccBlock], layout: &EccLayout, payload_len: u64) -> Vec<u8> {
    let data: Vec<&EccBlock> = blocks.iter().filter(|b| b.kind == BlockKind::Data).collect();
    let mut out = Vec::with_capacity(data.len() * layout.block_size);
    for b in data {
        out.extend_from_slice(&b.payload);
    }
    out.truncate(payload_len as usize);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len as u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8).collect()
    }

    fn hashes(blocks: &[EccBlock]) -> Vec<[u8; 32]> {
        blocks
            .iter()
            .map(|b| {
                let mut h = blake3::Hasher::new();
                h.update(&b.payload);
                h.update(&b.inner_parity);
                *h.finalize().as_bytes()
            })
            .collect()
    }

    fn checker(expected: Vec<[u8; 32]>) -> impl Fn(&EccBlock) -> bool + Sync {
        move |b| hashes(std::slice::from_ref(b))[0] == expected[b.index as usize]
    }

    #[test]
    fn inner_symbols_follow_tolerance() {
        assert_eq!(EccMode::for_tolerance(0, 16).unwrap().inner_symbols, 2);
        assert_eq!(EccMode::for_tolerance(10, 16).unwrap().inner_symbols, 26);
        assert_eq!(EccMode::for_tolerance(20, 16).unwrap().inner_symbols, 52);
        assert_eq!(EccMode::for_tolerance(100, 16).unwrap().inner_symbols, 128);
        assert_eq!(EccMode::for_tolerance(101, 16), Err(LayoutError::Tolerance(101)));
    }

    #[test]
    fn mode_packing() {
        let mode = EccMode { inner_symbols: 26, group_size: 16 };
        assert_eq!(mode.pack(), 0x101A);
        assert_eq!(EccMode::unpack(0x101A), Ok(mode));
        assert_eq!(EccMode::unpack(0x1019), Err(LayoutError::InnerSymbols(25)));
        assert_eq!(EccMode::unpack(0x001A), Err(LayoutError::GroupSize));
    }

    #[test]
    fn layout_counts() {
        let layout = EccLayout::for_tolerance(64, 10, 4).unwrap();
        assert_eq!(layout.data_block_count(0), 1);
        assert_eq!(layout.data_block_count(64), 1);
        assert_eq!(layout.data_block_count(65), 2);
        assert_eq!(layout.group_count(9), 3);
        assert_eq!(layout.block_count(9), 12);
        assert_eq!(layout.group_members(2, 9), 8..9);
        assert_eq!(layout.payload_range(1, 100), 64..100);
        assert!(EccLayout::for_tolerance(8, 10, 4).is_err());
    }

    #[test]
    fn encode_places_parity_after_data() {
        let layout = EccLayout::for_tolerance(32, 10, 3).unwrap();
        let payload = sample(32 * 7 + 5);
        let blocks = ecc_encode(&payload, &layout, None).unwrap();

        assert_eq!(blocks.len(), 8 + 3);
        assert!(blocks[..8].iter().all(|b| b.kind == BlockKind::Data));
        assert!(blocks[8..].iter().all(|b| b.kind == BlockKind::OuterParity));
        assert_eq!(blocks[7].outer_parity_group, 2);
        assert_eq!(blocks[10].outer_parity_group, 2);

        let mut xor = vec![0u8; 32];
        for b in &blocks[3..6] {
            gf256::xor_slice(&mut xor, &b.payload);
        }
        assert_eq!(xor, blocks[9].payload);
        assert_eq!(assemble_payload(&blocks, &layout, payload.len() as u64), payload);
    }

    #[test]
    fn inner_stage_fixes_light_damage() {
        let layout = EccLayout::for_tolerance(128, 20, 4).unwrap();
        let payload = sample(128 * 5);
        let clean = ecc_encode(&payload, &layout, None).unwrap();
        let verify = checker(hashes(&clean));

        let mut blocks = clean.clone();
        blocks[1].payload[10] ^= 0xFF;
        blocks[1].payload[90] ^= 0x01;
        blocks[6].inner_parity[0] ^= 0x80;
        let damaged = BTreeSet::from([1, 6]);

        let outcomes = repair_blocks(&mut blocks, &damaged, &layout, verify, None).unwrap();
        assert_eq!(blocks, clean);
        assert_eq!(outcomes[1].status, BlockStatus::RepairedInner { corrected_bytes: 2 });
        assert_eq!(outcomes[6].status, BlockStatus::RepairedInner { corrected_bytes: 1 });
        assert_eq!(outcomes[0].status, BlockStatus::Healthy);
    }

    #[test]
    fn cancel_raised_mid_repair_aborts() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let layout = EccLayout::for_tolerance(128, 20, 4).unwrap();
        let clean = ecc_encode(&sample(128 * 8), &layout, None).unwrap();
        let expected = hashes(&clean);

        // Inner stage: the first verified candidate raises the flag.
        let mut blocks = clean.clone();
        for i in [0, 3, 5, 7] {
            blocks[i].payload[i * 3] ^= 0x5A;
        }
        let damaged = BTreeSet::from([0, 3, 5, 7]);
        let flag = CancelFlag::new();
        let raise = {
            let flag = flag.clone();
            let inner = checker(expected.clone());
            move |b: &EccBlock| {
                flag.cancel();
                inner(b)
            }
        };
        let res = repair_blocks(&mut blocks, &damaged, &layout, raise, Some(&flag));
        assert!(matches!(res, Err(FatalError::Cancelled)));

        // Outer stage: a wiped block reaches XOR rebuild before the flag rises.
        let mut blocks = clean.clone();
        blocks[2].payload.iter_mut().for_each(|b| *b = !*b);
        blocks[2].inner_parity.iter_mut().for_each(|b| *b = !*b);
        let flag = CancelFlag::new();
        let calls = AtomicUsize::new(0);
        let raise = {
            let flag = flag.clone();
            let inner = checker(expected);
            let calls = &calls;
            move |b: &EccBlock| {
                calls.fetch_add(1, Ordering::SeqCst);
                flag.cancel();
                inner(b)
            }
        };
        let res = repair_blocks(&mut blocks, &BTreeSet::from([2]), &layout, raise, Some(&flag));
        assert!(matches!(res, Err(FatalError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn outer_stage_rebuilds_wiped_block() {
        let layout = EccLayout::for_tolerance(64, 5, 4).unwrap();
        let payload = sample(64 * 6);
        let clean = ecc_encode(&payload, &layout, None).unwrap();
        let verify = checker(hashes(&clean));

        let mut blocks = clean.clone();
        blocks[2].payload.iter_mut().for_each(|b| *b = !*b);
        let damaged = BTreeSet::from([2]);

        let outcomes = repair_blocks(&mut blocks, &damaged, &layout, verify, None).unwrap();
        assert_eq!(outcomes[2].status, BlockStatus::RepairedOuter);
        assert_eq!(blocks, clean);
    }

    #[test]
    fn outer_stage_rebuilds_parity_block() {
        let layout = EccLayout::for_tolerance(64, 5, 4).unwrap();
        let clean = ecc_encode(&sample(64 * 4), &layout, None).unwrap();
        let verify = checker(hashes(&clean));

        let mut blocks = clean.clone();
        blocks[4].payload.fill(0x33);
        blocks[4].inner_parity.fill(0x33);
        let outcomes =
            repair_blocks(&mut blocks, &BTreeSet::from([4]), &layout, verify, None).unwrap();
        assert_eq!(outcomes[4].kind, BlockKind::OuterParity);
        assert_eq!(outcomes[4].status, BlockStatus::RepairedOuter);
        assert_eq!(blocks, clean);
    }

    #[test]
    fn two_losses_in_one_group_are_unrecoverable() {
        let layout = EccLayout::for_tolerance(64, 5, 4).unwrap();
        let clean = ecc_encode(&sample(64 * 8), &layout, None).unwrap();
        let verify = checker(hashes(&clean));

        let mut blocks = clean.clone();
        for i in [0usize, 3, 5] {
            blocks[i].payload.iter_mut().for_each(|b| *b ^= 0x5C);
        }
        let damaged = BTreeSet::from([0, 3, 5]);
        let outcomes = repair_blocks(&mut blocks, &damaged, &layout, verify, None).unwrap();

        assert_eq!(outcomes[0].status, BlockStatus::Unrecoverable);
        assert_eq!(outcomes[3].status, BlockStatus::Unrecoverable);
        assert!(blocks[0].payload.iter().all(|&b| b == 0));
        // Group 1 lost a single member and is rebuilt.
        assert_eq!(outcomes[5].status, BlockStatus::RepairedOuter);
        assert_eq!(blocks[5], clean[5]);
    }

    #[test]
    fn cancelled_encode_returns_error() {
        let layout = EccLayout::for_tolerance(64, 10, 4).unwrap();
        let flag = CancelFlag::new();
        flag.cancel();
        assert!(matches!(
            ecc_encode(&sample(1024), &layout, Some(&flag)),
            Err(EncodeError::Cancelled)
        ));
    }
}
