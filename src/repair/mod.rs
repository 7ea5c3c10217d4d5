//! Self-healing repair orchestrator.
//!
//! # States
//!
//! | State | Meaning |
//! |-------|---------|
//! | `Verifying` | Merkle leaves are being re-hashed |
//! | `AllHealthy` | No leaf changed; nothing to do |
//! | `Repairing` | Inner and outer ECC are rebuilding damaged leaves |
//! | `FullyRepaired` | Every damaged leaf was rebuilt and re-verified |
//! | `PartiallyRepaired` | Some leaves stayed lost but the payload is usable |
//! | `Unrecoverable` | Loss beyond the budget; decode fails |
//!
//! Only the terminal states reachable on success appear in
//! [`RepairReport::state`]; `Unrecoverable` surfaces as
//! [`FatalError::DamageExceedsTolerance`].
//!
//! ## Budget
//! A container encoded at `p`% tolerance allows
//! `floor(leaf_count * p / 100)` unrecoverable leaves.  Lost *data* leaves
//! additionally require [`LostBlockPolicy::ZeroFill`], since the payload
//! would otherwise come back inexact.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelFlag;
use crate::container::Container;
use crate::ecc::{repair_blocks, BlockKind, BlockOutcome, BlockStatus, EccBlock, EccLayout};
use crate::error::FatalError;
use crate::merkle::{self, block_hash};

// ── Types ─────────────────────────────────────────────────────────────────────

/// What to do with data leaves that could not be rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LostBlockPolicy {
    /// Fail with `DamageExceedsTolerance`.
    #[default]
    Reject,
    /// Zero the lost ranges and report them.  The codec may still fail on
    /// the holes.
    ZeroFill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairState {
    AllHealthy,
    FullyRepaired,
    PartiallyRepaired,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairReport {
    /// Leaves that verified without any repair.
    pub healthy_blocks:        usize,
    /// Leaves rebuilt by inner or outer ECC.
    pub repaired_blocks:       usize,
    /// Leaves that stayed lost.
    pub unrecoverable_blocks:  usize,
    /// Damaged leaves over total leaves, before repair.
    pub damage_ratio_observed: f64,
    pub state:                 RepairState,
    /// One entry per leaf, in index order.
    pub outcomes:              Vec<BlockOutcome>,
    /// Compressed-payload byte ranges zero-filled under `ZeroFill`.
    pub lost_payload_ranges:   Vec<Range<u64>>,
}

impl RepairReport {
    pub fn is_exact(&self) -> bool {
        self.lost_payload_ranges.is_empty()
    }

    pub fn damaged_blocks(&self) -> usize {
        self.repaired_blocks + self.unrecoverable_blocks
    }
}

/// `floor(leaf_count * percent / 100)`.
pub fn repair_budget(leaf_count: usize, damage_tolerance_percent: u8) -> usize {
    leaf_count * damage_tolerance_percent as usize / 100
}

// ── Orchestration ─────────────────────────────────────────────────────────────

/// Verify every leaf of an already validated container and repair what
/// changed.  Returns the healed blocks and the report.
pub(crate) fn heal<'c>(
    container: &'c Container,
    layout: &EccLayout,
    policy: LostBlockPolicy,
    cancel: Option<&CancelFlag>,
) -> Result<(Cow<'c, [EccBlock]>, RepairReport), FatalError> {
    let header = container.header();
    let tree = container.tree();
    let leaf_count = container.blocks().len();

    debug!(state = "verifying", leaf_count, "repair state");
    let damaged = merkle::verify(tree, container.blocks());
    let damage_ratio_observed = damaged.len() as f64 / leaf_count.max(1) as f64;

    if damaged.is_empty() {
        debug!(state = "all_healthy", "repair state");
        let outcomes = container
            .blocks()
            .iter()
            .map(|b| BlockOutcome { index: b.index, kind: b.kind, status: BlockStatus::Healthy })
            .collect();
        let report = RepairReport {
            healthy_blocks: leaf_count,
            repaired_blocks: 0,
            unrecoverable_blocks: 0,
            damage_ratio_observed,
            state: RepairState::AllHealthy,
            outcomes,
            lost_payload_ranges: Vec::new(),
        };
        return Ok((Cow::Borrowed(container.blocks()), report));
    }

    debug!(state = "repairing", damaged = damaged.len(), "repair state");
    let mut blocks = container.blocks().to_vec();
    let verify = |b: &EccBlock| tree.leaf(b.index as usize) == Some(&block_hash(b));
    let outcomes = repair_blocks(&mut blocks, &damaged, layout, verify, cancel)?;

    let unrecoverable: Vec<u32> = outcomes
        .iter()
        .filter(|o| o.status == BlockStatus::Unrecoverable)
        .map(|o| o.index)
        .collect();
    let lost_data: BTreeSet<u32> = outcomes
        .iter()
        .filter(|o| o.status == BlockStatus::Unrecoverable && o.kind == BlockKind::Data)
        .map(|o| o.index)
        .collect();
    let budget = repair_budget(leaf_count, header.damage_tolerance_percent);

    if unrecoverable.len() > budget || (!lost_data.is_empty() && policy == LostBlockPolicy::Reject) {
        error!(
            state = "unrecoverable",
            unrecoverable = unrecoverable.len(),
            lost_data = lost_data.len(),
            budget,
            "damage exceeds tolerance"
        );
        return Err(FatalError::DamageExceedsTolerance { unrecoverable, budget });
    }

    let lost_payload_ranges: Vec<Range<u64>> = lost_data
        .iter()
        .map(|&i| layout.payload_range(i as usize, header.payload_len))
        .filter(|r| !r.is_empty())
        .collect();

    let healthy_blocks = outcomes.iter().filter(|o| o.status == BlockStatus::Healthy).count();
    let repaired_blocks = outcomes
        .iter()
        .filter(|o| matches!(o.status, BlockStatus::RepairedInner { .. } | BlockStatus::RepairedOuter))
        .count();

    let state = if unrecoverable.is_empty() {
        info!(repaired_blocks, "container fully repaired");
        RepairState::FullyRepaired
    } else {
        warn!(
            repaired_blocks,
            unrecoverable = ?unrecoverable,
            zero_filled = lost_payload_ranges.len(),
            "container partially repaired"
        );
        RepairState::PartiallyRepaired
    };
    debug!(state = ?state, "repair state");

    let report = RepairReport {
        healthy_blocks,
        repaired_blocks,
        unrecoverable_blocks: unrecoverable.len(),
        damage_ratio_observed,
        state,
        outcomes,
        lost_payload_ranges,
    };
    Ok((Cow::Owned(blocks), report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_floors() {
        assert_eq!(repair_budget(18, 10), 1);
        assert_eq!(repair_budget(19, 10), 1);
        assert_eq!(repair_budget(20, 10), 2);
        assert_eq!(repair_budget(3, 20), 0);
        assert_eq!(repair_budget(7, 100), 7);
        assert_eq!(repair_budget(50, 0), 0);
    }

    #[test]
    fn reject_is_default_policy() {
        assert_eq!(LostBlockPolicy::default(), LostBlockPolicy::Reject);
        let p: LostBlockPolicy = serde_json::from_str("\"zero_fill\"").unwrap();
        assert_eq!(p, LostBlockPolicy::ZeroFill);
    }
}
