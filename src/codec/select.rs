//! Codec ranking and the sampled-trial fallback walk.
//!
//! [`select`] turns a [`PatternTable`] into a ranked candidate list;
//! [`CodecChoice::compress`] walks it, keeping the first backend whose
//! output is real (round-trips on the sample, strictly smaller, and within
//! the entropy bound).  Store is always the implicit last entry and cannot
//! fail, so compression never errors.

use serde::Serialize;
use tracing::{debug, warn};

use super::profile::{CodecProfileRegistry, ContentAffinity, ContentHint};
use super::{get_codec, Codec, CodecId};
use crate::pattern::{EntropyEstimate, PatternTable};

const TIE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedCandidate {
    pub codec:           CodecId,
    pub predicted_ratio: f64,
    pub throughput:      f64,
    /// The raw prediction exceeded the entropy bound and was clamped.
    pub downgraded:      bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStage {
    Sample,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialVerdict {
    Accepted,
    /// The backend returned an error.
    Failed,
    /// Decompressing the trial did not give back the sample.
    Mismatch,
    NotSmaller,
    /// Claimed ratio above the entropy bound.
    Inflated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialOutcome {
    pub codec:      CodecId,
    pub stage:      TrialStage,
    pub verdict:    TrialVerdict,
    pub input_len:  usize,
    pub output_len: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Compressed {
    pub codec:    CodecId,
    pub payload:  Vec<u8>,
    pub attempts: Vec<TrialOutcome>,
}

/// Ranked candidates, best first.  Store is not listed; it is always tried
/// last.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodecChoice {
    pub ranked:      Vec<RankedCandidate>,
    pub redundancy:  f64,
    pub ratio_bound: f64,
}

pub fn select(
    table: &PatternTable,
    hint: ContentHint,
    registry: &CodecProfileRegistry,
    entropy: &EntropyEstimate,
    input_len: usize,
) -> CodecChoice {
    let redundancy = table.redundancy();
    let ratio_bound = entropy.ratio_bound(input_len);
    let mut ranked = Vec::new();

    for p in registry.profiles() {
        if p.codec_id == CodecId::Store {
            continue;
        }
        let specialised = p.content_affinity != ContentAffinity::Generic;
        if specialised && p.content_affinity != hint {
            continue;
        }
        let gain = if specialised { (2.0 * redundancy).max(1.0) } else { 2.0 * redundancy };
        let mut predicted = 1.0 + (p.reference_ratio - 1.0) * gain;

        let downgraded = predicted > ratio_bound;
        if downgraded {
            warn!(
                codec = %p.codec_id,
                predicted,
                bound = ratio_bound,
                "predicted ratio exceeds entropy bound, downgrading"
            );
            predicted = ratio_bound;
        }
        if predicted <= 1.0 {
            debug!(codec = %p.codec_id, predicted, "no predicted gain, skipping");
            continue;
        }
        ranked.push(RankedCandidate {
            codec: p.codec_id,
            predicted_ratio: predicted,
            throughput: p.reference_throughput_bytes_per_sec,
            downgraded,
        });
    }

    rank(&mut ranked);
    debug!(
        redundancy,
        ratio_bound,
        ranking = ?ranked.iter().map(|c| c.codec.name()).collect::<Vec<_>>(),
        "codec ranking"
    );
    CodecChoice { ranked, redundancy, ratio_bound }
}

/// Ratio descending; runs of near-equal ratios ordered by throughput.
fn rank(ranked: &mut [RankedCandidate]) {
    ranked.sort_by(|a, b| b.predicted_ratio.total_cmp(&a.predicted_ratio));
    let mut i = 0;
    while i < ranked.len() {
        let mut j = i + 1;
        while j < ranked.len()
            && ranked[i].predicted_ratio - ranked[j].predicted_ratio <= TIE_EPSILON
        {
            j += 1;
        }
        ranked[i..j].sort_by(|a, b| b.throughput.total_cmp(&a.throughput));
        i = j;
    }
}

fn ratio(input: usize, output: usize) -> f64 {
    input as f64 / output.max(1) as f64
}

impl CodecChoice {
    /// Best-ranked codec, or Store if nothing predicts a gain.
    pub fn primary(&self) -> CodecId {
        self.ranked.first().map_or(CodecId::Store, |c| c.codec)
    }

    /// Every codec that will be attempted, in order, ending with Store.
    pub fn order(&self) -> Vec<CodecId> {
        self.ranked.iter().map(|c| c.codec).chain([CodecId::Store]).collect()
    }

    /// Compress `input` with the first candidate that survives its trial.
    /// `sample` is the trial input; it may be `input` itself.
    pub fn compress(
        &self,
        input: &[u8],
        sample: &[u8],
        entropy: &EntropyEstimate,
        level: i32,
    ) -> Compressed {
        let mut attempts = Vec::new();
        let sample_bound = entropy.ratio_bound(sample.len());
        let full_bound = entropy.ratio_bound(input.len());
        let sample_is_input = std::ptr::eq(sample, input);

        for cand in &self.ranked {
            let codec = get_codec(cand.codec);

            let trial = match sample_trial(codec, sample, level, sample_bound) {
                Ok(out) => out,
                Err((verdict, output_len)) => {
                    warn!(codec = %cand.codec, ?verdict, sample_len = sample.len(), "codec trial rejected");
                    attempts.push(TrialOutcome {
                        codec: cand.codec,
                        stage: TrialStage::Sample,
                        verdict,
                        input_len: sample.len(),
                        output_len,
                    });
                    continue;
                }
            };
            attempts.push(TrialOutcome {
                codec:      cand.codec,
                stage:      TrialStage::Sample,
                verdict:    TrialVerdict::Accepted,
                input_len:  sample.len(),
                output_len: Some(trial.len()),
            });

            let full = if sample_is_input { Ok(trial) } else { codec.compress(input, level) };
            let verdict = match &full {
                Err(_) => TrialVerdict::Failed,
                Ok(out) if out.len() >= input.len() => TrialVerdict::NotSmaller,
                Ok(out) if ratio(input.len(), out.len()) > full_bound => TrialVerdict::Inflated,
                Ok(_) => TrialVerdict::Accepted,
            };
            attempts.push(TrialOutcome {
                codec:      cand.codec,
                stage:      TrialStage::Full,
                verdict,
                input_len:  input.len(),
                output_len: full.as_ref().ok().map(Vec::len),
            });

            match full {
                Ok(payload) if verdict == TrialVerdict::Accepted => {
                    debug!(
                        codec = %cand.codec,
                        input_len = input.len(),
                        output_len = payload.len(),
                        "codec selected"
                    );
                    return Compressed { codec: cand.codec, payload, attempts };
                }
                _ => warn!(codec = %cand.codec, ?verdict, "full compression rejected"),
            }
        }

        attempts.push(TrialOutcome {
            codec:      CodecId::Store,
            stage:      TrialStage::Full,
            verdict:    TrialVerdict::Accepted,
            input_len:  input.len(),
            output_len: Some(input.len()),
        });
        debug!(input_len = input.len(), "storing raw");
        Compressed { codec: CodecId::Store, payload: input.to_vec(), attempts }
    }
}

fn sample_trial(
    codec: &dyn Codec,
    sample: &[u8],
    level: i32,
    bound: f64,
) -> Result<Vec<u8>, (TrialVerdict, Option<usize>)> {
    let out = codec.compress(sample, level).map_err(|_| (TrialVerdict::Failed, None))?;
    let len = Some(out.len());
    match codec.decompress_bounded(&out, sample.len()) {
        Ok(back) if back == sample => {}
        _ => return Err((TrialVerdict::Mismatch, len)),
    }
    if out.len() >= sample.len() {
        return Err((TrialVerdict::NotSmaller, len));
    }
    if ratio(sample.len(), out.len()) > bound {
        return Err((TrialVerdict::Inflated, len));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::profile::CodecProfile;
    use crate::codec::CodecError;
    use crate::pattern::{scan, ScanConfig};
    use rand::{rngs::StdRng, RngCore, SeedableRng};

    fn choose(data: &[u8], hint: ContentHint, registry: &CodecProfileRegistry) -> (CodecChoice, EntropyEstimate) {
        let table = scan(data, &ScanConfig::default());
        let entropy = EntropyEstimate::measure(data);
        (select(&table, hint, registry, &entropy, data.len()), entropy)
    }

    fn text() -> Vec<u8> {
        b"Lorem ipsum dolor sit amet, consectetur adipiscing elit. ".repeat(500)
    }

    #[test]
    fn redundant_text_prefers_zstd() {
        let data = text();
        let (choice, entropy) = choose(&data, ContentHint::Generic, CodecProfileRegistry::builtin());
        assert_eq!(choice.primary(), CodecId::Zstd);
        assert!(!choice.order().contains(&CodecId::BytePlaneZstd));
        assert_eq!(*choice.order().last().unwrap(), CodecId::Store);

        let out = choice.compress(&data, &data, &entropy, 3);
        assert_eq!(out.codec, CodecId::Zstd);
        assert!(out.payload.len() < data.len());
        assert_eq!(get_codec(CodecId::Zstd).decompress(&out.payload).unwrap(), data);
    }

    #[test]
    fn random_data_falls_back_to_store() {
        let mut data = vec![0u8; 32 * 1024];
        StdRng::seed_from_u64(11).fill_bytes(&mut data);
        let (choice, entropy) = choose(&data, ContentHint::Generic, CodecProfileRegistry::builtin());
        let out = choice.compress(&data, &data, &entropy, 3);
        assert_eq!(out.codec, CodecId::Store);
        assert_eq!(out.payload, data);
        assert!(out
            .attempts
            .iter()
            .filter(|a| a.codec != CodecId::Store)
            .all(|a| a.verdict != TrialVerdict::Accepted || a.stage == TrialStage::Sample));
    }

    #[test]
    fn tensor_hint_admits_specialised_codec() {
        let data: Vec<u8> = (0..8192).flat_map(|i| (i as f32).sin().to_le_bytes()).collect();
        let (choice, _) = choose(&data, ContentHint::NumericTensor, CodecProfileRegistry::builtin());
        assert!(choice.order().contains(&CodecId::BytePlaneZstd));
    }

    #[test]
    fn ties_break_on_throughput() {
        let mut ranked = vec![
            RankedCandidate { codec: CodecId::Brotli, predicted_ratio: 2.0, throughput: 6e7, downgraded: false },
            RankedCandidate { codec: CodecId::Lz4, predicted_ratio: 2.0 + 1e-12, throughput: 2e9, downgraded: false },
            RankedCandidate { codec: CodecId::Zstd, predicted_ratio: 3.0, throughput: 4e8, downgraded: false },
        ];
        rank(&mut ranked);
        let order: Vec<CodecId> = ranked.iter().map(|c| c.codec).collect();
        assert_eq!(order, vec![CodecId::Zstd, CodecId::Lz4, CodecId::Brotli]);
    }

    #[test]
    fn inflated_claims_are_downgraded() {
        let reg = CodecProfileRegistry::from_profiles(vec![
            CodecProfile {
                codec_id:                           CodecId::Store,
                reference_ratio:                    1.0,
                reference_throughput_bytes_per_sec: 1e9,
                content_affinity:                   ContentAffinity::Generic,
            },
            CodecProfile {
                codec_id:                           CodecId::Lz4,
                reference_ratio:                    1000.0,
                reference_throughput_bytes_per_sec: 1e9,
                content_affinity:                   ContentAffinity::Generic,
            },
        ])
        .unwrap();
        let data = text();
        let (choice, _) = choose(&data, ContentHint::Generic, &reg);
        assert!(choice.ranked[0].downgraded);
        assert!(choice.ranked[0].predicted_ratio <= choice.ratio_bound);
    }

    struct Lying;
    impl Codec for Lying {
        fn codec_id(&self) -> CodecId { CodecId::Zstd }
        fn compress(&self, _: &[u8], _: i32) -> Result<Vec<u8>, CodecError> { Ok(vec![0; 1]) }
        fn decompress(&self, _: &[u8]) -> Result<Vec<u8>, CodecError> { Ok(Vec::new()) }
    }

    #[test]
    fn trial_rejects_non_round_trip() {
        let sample = text();
        let res = sample_trial(&Lying, &sample, 3, 1e9);
        assert_eq!(res.unwrap_err().0, TrialVerdict::Mismatch);

        let store = sample_trial(get_codec(CodecId::Store), &sample, 0, 1e9);
        assert_eq!(store.unwrap_err().0, TrialVerdict::NotSmaller);

        let zstd = sample_trial(get_codec(CodecId::Zstd), &sample, 3, 1.5);
        assert_eq!(zstd.unwrap_err().0, TrialVerdict::Inflated);
    }
}
