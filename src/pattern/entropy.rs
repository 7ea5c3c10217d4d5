//! Empirical entropy rate and the compression-ratio sanity bound derived
//! from it.
//!
//! Two estimators run on the sample and the lower rate wins:
//!
//! * block entropies `H_k` on non-overlapping k-byte windows.  An order is
//!   only trusted while the sample holds at least four windows per distinct
//!   value; past that the estimate is saturated by sample size, not by the
//!   data.  This yields the smallest `H_k / k` among trusted orders.
//! * a greedy LZ parse costing literals at 8 bits and matches at a flat
//!   [`MATCH_TOKEN_BITS`].  This catches long-period repetition that no
//!   short window order can see.

use std::borrow::Cow;
use std::collections::HashMap;

pub const ORDERS: [usize; 5] = [1, 2, 4, 8, 16];

/// Size of the sampled trial fed to candidate codecs.
pub const TRIAL_SAMPLE_BYTES: usize = 64 * 1024;

const TRIAL_REGIONS: usize = 16;

/// Context modelling beyond the measured orders.
const CONTEXT_SLACK: f64 = 2.5;

/// No real encoder emits fewer bytes than this.
const MIN_OUTPUT_BYTES: usize = 8;

const MIN_WINDOWS_PER_DISTINCT: usize = 4;

/// Lower bound on what any LZ-family encoder spends per match.
pub const MATCH_TOKEN_BITS: f64 = 12.0;

const MIN_MATCH: usize = 4;
const HASH_BITS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntropyEstimate {
    /// Estimated entropy rate in bits per byte, `0.0..=8.0`.
    pub bits_per_byte:       f64,
    /// Best trusted k-gram rate, 8.0 when no order was trusted.
    pub kgram_bits_per_byte: f64,
    /// Window order behind `kgram_bits_per_byte`, 0 when none was trusted.
    pub order:               usize,
    pub lz_bits_per_byte:    f64,
    pub sample_len:          usize,
}

impl EntropyEstimate {
    pub fn measure(sample: &[u8]) -> Self {
        if sample.is_empty() {
            return Self {
                bits_per_byte:       0.0,
                kgram_bits_per_byte: 0.0,
                order:               0,
                lz_bits_per_byte:    0.0,
                sample_len:          0,
            };
        }
        let (kgram_bits_per_byte, order) = kgram_rate(sample);
        let lz_bits_per_byte = lz_parse_rate(sample);
        Self {
            bits_per_byte: kgram_bits_per_byte.min(lz_bits_per_byte),
            kgram_bits_per_byte,
            order,
            lz_bits_per_byte,
            sample_len: sample.len(),
        }
    }
}

/// `(rate, order)`; `(8.0, 0)` when no order is trusted.
fn kgram_rate(sample: &[u8]) -> (f64, usize) {
    let mut best = (8.0, 0);
    for k in ORDERS {
        let windows = sample.len() / k;
        if windows == 0 {
            break;
        }
        let mut counts: HashMap<&[u8], u64> = HashMap::new();
        for w in sample.chunks_exact(k) {
            *counts.entry(w).or_insert(0) += 1;
        }
        if windows < MIN_WINDOWS_PER_DISTINCT * counts.len() {
            continue;
        }
        let n = windows as f64;
        let h: f64 = counts
            .values()
            .map(|&c| {
                let p = c as f64 / n;
                -p * p.log2()
            })
            .sum();
        let rate = (h / k as f64).max(0.0);
        if best.1 == 0 || rate < best.0 {
            best = (rate, k);
        }
    }
    best
}

fn lz_parse_rate(sample: &[u8]) -> f64 {
    let n = sample.len();
    if n < MIN_MATCH {
        return 8.0;
    }
    let mut table = vec![u32::MAX; 1 << HASH_BITS];
    let mut bits = 0f64;
    let mut i = 0;
    while i < n {
        if i + MIN_MATCH <= n {
            let key = u32::from_le_bytes([sample[i], sample[i + 1], sample[i + 2], sample[i + 3]]);
            let slot = (key.wrapping_mul(2_654_435_761) >> (32 - HASH_BITS)) as usize;
            let cand = table[slot];
            table[slot] = i as u32;
            if cand != u32::MAX {
                let len = sample[cand as usize..]
                    .iter()
                    .zip(&sample[i..])
                    .take_while(|(a, b)| a == b)
                    .count();
                if len >= MIN_MATCH {
                    bits += MATCH_TOKEN_BITS;
                    i += len;
                    continue;
                }
            }
        }
        bits += 8.0;
        i += 1;
    }
    (bits / n as f64).min(8.0)
}

impl EntropyEstimate {
    /// Largest compression ratio an honest codec could reach on `len` bytes
    /// of data with this entropy rate.
    pub fn ratio_bound(&self, len: usize) -> f64 {
        let size_bound = (len / MIN_OUTPUT_BYTES).max(1) as f64;
        if self.bits_per_byte <= 1e-9 {
            return size_bound;
        }
        (8.0 / self.bits_per_byte * CONTEXT_SLACK).clamp(1.0, size_bound)
    }
}

/// Up to [`TRIAL_SAMPLE_BYTES`] of `input`: the whole input when it fits,
/// otherwise evenly spaced regions concatenated.
pub fn trial_sample(input: &[u8]) -> Cow<'_, [u8]> {
    if input.len() <= TRIAL_SAMPLE_BYTES {
        return Cow::Borrowed(input);
    }
    let region = TRIAL_SAMPLE_BYTES / TRIAL_REGIONS;
    let span = input.len() - region;
    let mut out = Vec::with_capacity(TRIAL_SAMPLE_BYTES);
    for i in 0..TRIAL_REGIONS {
        let start = i * span / (TRIAL_REGIONS - 1);
        out.extend_from_slice(&input[start..start + region]);
    }
    Cow::Owned(out)
}
