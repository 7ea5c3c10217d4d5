//! Content-type detection for encodes without a caller hint.
//!
//! Fixed-width numeric arrays (f32, i32, packed tensors) show a strong
//! byte-plane asymmetry: exponent and high bytes repeat while mantissa bytes
//! churn.  Text and opaque binary look the same from every lane offset.
//! Detection reads an aligned prefix so lane boundaries line up with the
//! data.

use crate::codec::ContentHint;

use super::entropy::TRIAL_SAMPLE_BYTES;

/// Lane width examined for plane asymmetry.
pub const LANE_WIDTH: usize = 4;

/// Inputs shorter than this are always generic.
pub const MIN_DETECT_BYTES: usize = 1024;

/// Minimum spread, in bits, between the most and least predictable planes.
pub const PLANE_SPREAD_BITS: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaneProfile {
    /// Order-0 entropy of byte `p` across all lanes, bits.
    pub plane_entropy: [f64; LANE_WIDTH],
    /// Max minus min of `plane_entropy`.
    pub spread:        f64,
}

impl LaneProfile {
    pub fn measure(data: &[u8]) -> Self {
        let mut counts = [[0u32; 256]; LANE_WIDTH];
        let lanes = data.len() / LANE_WIDTH;
        for lane in data[..lanes * LANE_WIDTH].chunks_exact(LANE_WIDTH) {
            for (p, &b) in lane.iter().enumerate() {
                counts[p][b as usize] += 1;
            }
        }
        let mut plane_entropy = [0f64; LANE_WIDTH];
        for (p, plane) in counts.iter().enumerate() {
            plane_entropy[p] = order0_entropy(plane, lanes);
        }
        let max = plane_entropy.iter().copied().fold(f64::MIN, f64::max);
        let min = plane_entropy.iter().copied().fold(f64::MAX, f64::min);
        Self { plane_entropy, spread: (max - min).max(0.0) }
    }
}

fn order0_entropy(counts: &[u32; 256], total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let n = total as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / n;
            -p * p.log2()
        })
        .sum()
}

/// Classify `input` from the plane profile of its first
/// [`TRIAL_SAMPLE_BYTES`].
pub fn detect_content(input: &[u8]) -> ContentHint {
    if input.len() < MIN_DETECT_BYTES {
        return ContentHint::Generic;
    }
    let prefix = &input[..input.len().min(TRIAL_SAMPLE_BYTES)];
    if LaneProfile::measure(prefix).spread >= PLANE_SPREAD_BITS {
        ContentHint::NumericTensor
    } else {
        ContentHint::Generic
    }
}
