//! BLAKE3 Merkle tree over ECC leaves.
//!
//! Leaves hash `0x00 ‖ payload ‖ inner_parity`, internal nodes hash
//! `0x01 ‖ left ‖ right`; the domain prefixes keep a leaf from ever
//! colliding with an internal node.  When a level has an odd number of
//! nodes the last one is paired with itself, so its parent has a `left`
//! child and no `right`.
//!
//! Nodes live in one level-order arena: all leaves first, then each parent
//! level, root last.  This is also the on-disk order.

use std::collections::BTreeSet;
use std::ops::Range;

use thiserror::Error;

use crate::ecc::EccBlock;
use crate::perf::map_ordered;

pub type Hash = [u8; 32];

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    #[error("tree has no leaves")]
    Empty,
    #[error("expected {expected} nodes for {leaves} leaves, found {found}")]
    NodeCount { leaves: usize, expected: usize, found: usize },
    #[error("node {0} does not match its children")]
    Inconsistent(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeRef(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleNode {
    pub hash:  Hash,
    pub left:  Option<NodeRef>,
    pub right: Option<NodeRef>,
}

pub fn leaf_hash(payload: &[u8], inner_parity: &[u8]) -> Hash {
    let mut h = blake3::Hasher::new();
    h.update(&[LEAF_PREFIX]);
    h.update(payload);
    h.update(inner_parity);
    *h.finalize().as_bytes()
}

pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut h = blake3::Hasher::new();
    h.update(&[NODE_PREFIX]);
    h.update(left);
    h.update(right);
    *h.finalize().as_bytes()
}

pub fn block_hash(block: &EccBlock) -> Hash {
    leaf_hash(&block.payload, &block.inner_parity)
}

/// Nodes in a tree of `leaves` leaves: `Σ ceil(n / 2^i)` over all levels.
pub fn node_count(leaves: usize) -> usize {
    level_ranges(leaves).last().map_or(0, |r| r.end)
}

/// Arena range of every level, leaves first.
fn level_ranges(leaves: usize) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    if leaves == 0 {
        return ranges;
    }
    let mut start = 0;
    let mut width = leaves;
    loop {
        ranges.push(start..start + width);
        if width == 1 {
            break;
        }
        start += width;
        width = width.div_ceil(2);
    }
    ranges
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    nodes:      Vec<MerkleNode>,
    leaf_count: usize,
}

impl MerkleTree {
    /// An empty block list gives an empty tree with an all-zero root.
    pub fn build(blocks: &[EccBlock]) -> Self {
        let leaves = map_ordered(blocks, |_, b| block_hash(b));
        Self::from_leaf_hashes(leaves)
    }

    pub fn from_leaf_hashes(leaves: Vec<Hash>) -> Self {
        let leaf_count = leaves.len();
        let mut hashes = leaves;
        let levels = level_ranges(leaf_count);
        for level in levels.windows(2) {
            let pairs: Vec<&[Hash]> = hashes[level[0].clone()].chunks(2).collect();
            let parents = map_ordered(&pairs, |_, pair| match pair {
                [l, r] => node_hash(l, r),
                [l] => node_hash(l, l),
                _ => unreachable!("chunks(2) yields one or two items"),
            });
            hashes.extend(parents);
        }
        Self::link(hashes, leaf_count)
    }

    /// Rebuild the arena from serialized level-order hashes.  Only the node
    /// count is checked here; see [`check_consistency`](Self::check_consistency).
    pub fn from_hashes(hashes: Vec<Hash>, leaf_count: usize) -> Result<Self, MerkleError> {
        if leaf_count == 0 {
            return Err(MerkleError::Empty);
        }
        let expected = node_count(leaf_count);
        if hashes.len() != expected {
            return Err(MerkleError::NodeCount { leaves: leaf_count, expected, found: hashes.len() });
        }
        Ok(Self::link(hashes, leaf_count))
    }

    fn link(hashes: Vec<Hash>, leaf_count: usize) -> Self {
        let levels = level_ranges(leaf_count);
        let mut nodes: Vec<MerkleNode> = hashes
            .into_iter()
            .map(|hash| MerkleNode { hash, left: None, right: None })
            .collect();
        for level in levels.windows(2) {
            let (child, parent) = (&level[0], &level[1]);
            for (j, p) in parent.clone().enumerate() {
                let l = child.start + 2 * j;
                nodes[p].left = Some(NodeRef(l as u32));
                nodes[p].right = (l + 1 < child.end).then(|| NodeRef(l as u32 + 1));
            }
        }
        Self { nodes, leaf_count }
    }

    pub fn leaf_count(&self) -> usize { self.leaf_count }

    pub fn nodes(&self) -> &[MerkleNode] { &self.nodes }

    pub fn root(&self) -> Hash {
        self.nodes.last().map_or([0u8; 32], |n| n.hash)
    }

    pub fn leaf(&self, index: usize) -> Option<&Hash> {
        (index < self.leaf_count).then(|| &self.nodes[index].hash)
    }

    pub fn node(&self, r: NodeRef) -> Option<&MerkleNode> {
        self.nodes.get(r.0 as usize)
    }

    /// Level-order hashes, as written to disk.
    pub fn hashes(&self) -> impl Iterator<Item = &Hash> + '_ {
        self.nodes.iter().map(|n| &n.hash)
    }

    /// Recompute every internal node from its stored children.
    pub fn check_consistency(&self) -> Result<(), MerkleError> {
        for (i, node) in self.nodes.iter().enumerate().skip(self.leaf_count) {
            let left = node
                .left
                .and_then(|r| self.node(r))
                .ok_or(MerkleError::Inconsistent(i as u32))?;
            let right = match node.right {
                Some(r) => self.node(r).ok_or(MerkleError::Inconsistent(i as u32))?,
                None => left,
            };
            if node_hash(&left.hash, &right.hash) != node.hash {
                return Err(MerkleError::Inconsistent(i as u32));
            }
        }
        Ok(())
    }

    /// Inclusion proof for `leaf`, bottom-up.
    pub fn proof(&self, leaf: u32) -> Option<MerkleProof> {
        let leaf_idx = leaf as usize;
        if leaf_idx >= self.leaf_count {
            return None;
        }
        let levels = level_ranges(self.leaf_count);
        let mut steps = Vec::with_capacity(levels.len().saturating_sub(1));
        let mut pos = leaf_idx;
        for level in &levels[..levels.len() - 1] {
            let sibling = pos ^ 1;
            let step = if pos % 2 == 0 {
                // Lone last node pairs with itself.
                let s = if level.start + sibling < level.end { sibling } else { pos };
                ProofStep { sibling: self.nodes[level.start + s].hash, sibling_is_left: false }
            } else {
                ProofStep { sibling: self.nodes[level.start + sibling].hash, sibling_is_left: true }
            };
            steps.push(step);
            pos /= 2;
        }
        Some(MerkleProof { leaf, steps })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling:         Hash,
    pub sibling_is_left: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub leaf:  u32,
    pub steps: Vec<ProofStep>,
}

impl MerkleProof {
    pub fn verify(&self, root: &Hash, leaf_hash: &Hash) -> bool {
        let computed = self.steps.iter().fold(*leaf_hash, |acc, step| {
            if step.sibling_is_left {
                node_hash(&step.sibling, &acc)
            } else {
                node_hash(&acc, &step.sibling)
            }
        });
        &computed == root
    }
}

/// Leaves whose stored block no longer hashes to the tree's leaf.  A block
/// without a leaf (or a leaf without a block) counts as damaged.
pub fn verify(tree: &MerkleTree, blocks: &[EccBlock]) -> BTreeSet<u32> {
    let current = map_ordered(blocks, |_, b| block_hash(b));
    let mut damaged: BTreeSet<u32> = current
        .iter()
        .enumerate()
        .filter(|(i, h)| tree.leaf(*i) != Some(*h))
        .map(|(i, _)| i as u32)
        .collect();
    damaged.extend((blocks.len()..tree.leaf_count()).map(|i| i as u32));
    damaged
}
