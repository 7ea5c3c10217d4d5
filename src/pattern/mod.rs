//! Multi-granularity pattern scanner.
//!
//! For each window width in [`GRANULARITIES`] the input is read as a bit
//! stream (MSB first) and the most frequent windows are tallied.  The
//! resulting [`PatternTable`] drives codec scoring through
//! [`PatternTable::redundancy`].
//!
//! # Bounded memory
//! Counting uses a Misra-Gries heavy-hitter summary with batched decrements:
//! the map grows to `2 * capacity` entries, then every counter is lowered by
//! the `(capacity + 1)`-th largest count and non-positive ones are dropped.
//! Reported frequencies are therefore lower bounds, and exact whenever a
//! granularity has at most `2 * capacity` distinct windows.  Survivors are
//! chosen by count alone, so the result never depends on hash order.
//!
//! Inputs above `max_scan_bytes` are sampled as [`SAMPLE_REGIONS`] evenly
//! spaced regions; windows never straddle two regions.

pub mod detect;
pub mod entropy;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::perf::map_ordered;

pub use detect::detect_content;
pub use entropy::EntropyEstimate;

/// Window widths in bits.
pub const GRANULARITIES: [u16; 7] = [4, 8, 16, 32, 64, 128, 251];

pub const SAMPLE_REGIONS: usize = 16;

pub const DEFAULT_TOP_K: usize = 256;
pub const DEFAULT_MAX_SCAN_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stride {
    /// Each window starts where the previous one ended.
    #[default]
    NonOverlapping,
    /// Fixed step, in bits, for every granularity.
    Bits(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub top_k:          usize,
    pub stride:         Stride,
    pub max_scan_bytes: Option<usize>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            top_k:          DEFAULT_TOP_K,
            stride:         Stride::NonOverlapping,
            max_scan_bytes: Some(DEFAULT_MAX_SCAN_BYTES),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternEntry {
    pub window_bits:   u16,
    /// `ceil(window_bits / 8)` bytes; unused low bits of the last byte are 0.
    pub pattern_bytes: Vec<u8>,
    pub frequency:     u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GranularityTable {
    pub window_bits:   u16,
    pub total_windows: u64,
    /// Frequency descending, then pattern bytes ascending.
    pub entries:       Vec<PatternEntry>,
}

impl GranularityTable {
    /// Share of all windows covered by the reported entries.
    pub fn top_mass(&self) -> f64 {
        if self.total_windows == 0 {
            return 0.0;
        }
        let covered: u64 = self.entries.iter().map(|e| e.frequency).sum();
        covered as f64 / self.total_windows as f64
    }

    /// Excess of the top-K mass over what uniformly random data would show,
    /// normalised to `[0, 1]`.  `None` when the granularity carries no signal
    /// (too few possible or observed windows).
    pub fn redundancy(&self, top_k: usize) -> Option<f64> {
        if self.total_windows == 0 {
            return None;
        }
        let space = 2f64.powi(self.window_bits as i32).min(self.total_windows as f64);
        let expected = (top_k as f64 / space).min(1.0);
        if expected >= 1.0 {
            return None;
        }
        Some(((self.top_mass() - expected) / (1.0 - expected)).clamp(0.0, 1.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternTable {
    /// Ascending granularity order.
    pub tables:        Vec<GranularityTable>,
    pub scanned_bytes: u64,
    pub top_k:         usize,
}

impl PatternTable {
    pub fn redundancy(&self) -> f64 {
        self.tables
            .iter()
            .filter_map(|t| t.redundancy(self.top_k))
            .fold(0.0, f64::max)
    }

    pub fn table(&self, window_bits: u16) -> Option<&GranularityTable> {
        self.tables.iter().find(|t| t.window_bits == window_bits)
    }

    /// BLAKE3 over a canonical little-endian encoding of the table.
    pub fn summary_checksum(&self) -> [u8; 32] {
        let mut h = blake3::Hasher::new();
        h.update(b"mendec-patterns-v1");
        h.update(&(self.top_k as u64).to_le_bytes());
        h.update(&self.scanned_bytes.to_le_bytes());
        for t in &self.tables {
            h.update(&t.window_bits.to_le_bytes());
            h.update(&t.total_windows.to_le_bytes());
            h.update(&(t.entries.len() as u32).to_le_bytes());
            for e in &t.entries {
                h.update(&e.frequency.to_le_bytes());
                h.update(&e.pattern_bytes);
            }
        }
        *h.finalize().as_bytes()
    }
}

// ── Scanning ─────────────────────────────────────────────────────────────────

pub fn scan(buffer: &[u8], config: &ScanConfig) -> PatternTable {
    let regions = sample_regions(buffer, config.max_scan_bytes);
    let scanned_bytes = regions.iter().map(|r| r.len() as u64).sum();
    let top_k = config.top_k.max(1);

    let tables = map_ordered(&GRANULARITIES, |_, &bits| {
        scan_granularity(&regions, bits, config.stride, top_k)
    });

    let table = PatternTable { tables, scanned_bytes, top_k };
    debug!(
        input_len = buffer.len(),
        scanned_bytes,
        regions = regions.len(),
        redundancy = table.redundancy(),
        "pattern scan"
    );
    table
}

fn sample_regions(buffer: &[u8], max: Option<usize>) -> Vec<&[u8]> {
    let max = match max {
        Some(m) if buffer.len() > m => m,
        _ => return vec![buffer],
    };
    let region_len = (max / SAMPLE_REGIONS).max(1);
    let span = buffer.len() - region_len;
    (0..SAMPLE_REGIONS)
        .map(|i| {
            let start = i * span / (SAMPLE_REGIONS - 1);
            &buffer[start..start + region_len]
        })
        .collect()
}

fn scan_granularity(regions: &[&[u8]], bits: u16, stride: Stride, top_k: usize) -> GranularityTable {
    let width = bits as usize;
    let step = match stride {
        Stride::NonOverlapping => width,
        Stride::Bits(n) => (n as usize).max(1),
    };

    let mut summary = HeavyHitters::new(4 * top_k);
    let mut total_windows = 0u64;
    let mut window = Vec::with_capacity(width.div_ceil(8));

    for region in regions {
        let region_bits = region.len() * 8;
        if region_bits < width {
            continue;
        }
        let mut off = 0;
        while off + width <= region_bits {
            extract_window(region, off, width, &mut window);
            summary.offer(&window);
            total_windows += 1;
            off += step;
        }
    }

    let mut entries: Vec<PatternEntry> = summary
        .into_counts()
        .into_iter()
        .map(|(pattern_bytes, frequency)| PatternEntry { window_bits: bits, pattern_bytes, frequency })
        .collect();
    entries.sort_by(|a, b| {
        b.frequency.cmp(&a.frequency).then_with(|| a.pattern_bytes.cmp(&b.pattern_bytes))
    });
    entries.truncate(top_k);

    GranularityTable { window_bits: bits, total_windows, entries }
}

/// Copy `bits` bits starting at bit `off` (MSB first) into `out`.
fn extract_window(data: &[u8], off: usize, bits: usize, out: &mut Vec<u8>) {
    out.clear();
    let base = off / 8;
    let shift = off % 8;
    for k in 0..bits.div_ceil(8) {
        let hi = data[base + k];
        let byte = if shift == 0 {
            hi
        } else {
            let lo = data.get(base + k + 1).copied().unwrap_or(0);
            (hi << shift) | (lo >> (8 - shift))
        };
        out.push(byte);
    }
    let rem = bits % 8;
    if rem != 0 {
        if let Some(last) = out.last_mut() {
            *last &= 0xFFu8 << (8 - rem);
        }
    }
}

struct HeavyHitters {
    capacity: usize,
    counts:   HashMap<Vec<u8>, u64>,
}

impl HeavyHitters {
    fn new(capacity: usize) -> Self {
        Self { capacity, counts: HashMap::with_capacity(2 * capacity + 1) }
    }

    fn offer(&mut self, key: &[u8]) {
        if let Some(c) = self.counts.get_mut(key) {
            *c += 1;
            return;
        }
        self.counts.insert(key.to_vec(), 1);
        if self.counts.len() > 2 * self.capacity {
            self.decrement();
        }
    }

    fn decrement(&mut self) {
        let mut values: Vec<u64> = self.counts.values().copied().collect();
        let idx = values.len() - self.capacity - 1;
        let (_, pivot, _) = values.select_nth_unstable(idx);
        let pivot = *pivot;
        self.counts.retain(|_, c| {
            if *c > pivot {
                *c -= pivot;
                true
            } else {
                false
            }
        });
    }

    fn into_counts(self) -> HashMap<Vec<u8>, u64> {
        self.counts
    }
}
