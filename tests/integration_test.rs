use mendec::container::{HEADER_SIZE, LEAF_COUNT_OFFSET};
use mendec::ecc::{BlockKind, BlockStatus, EccBlock};
use mendec::{
    decode, decode_with, encode, encode_with_registry, verify, CancelFlag, CodecId,
    CodecProfileRegistry, Container, ContentHint, DecodeOptions, EncodeError, EncodeOptions,
    FatalError, LostBlockPolicy, RepairState,
};
use proptest::prelude::*;
use rand::seq::index;
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use tempfile::NamedTempFile;

fn alternating(len: usize) -> Vec<u8> {
    b"AB".iter().copied().cycle().take(len).collect()
}

fn random(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// Log-like text: compressible, but not so much that it fits in one block.
fn log_lines(len: usize) -> Vec<u8> {
    const ACTIONS: [&str; 6] = ["login", "logout", "upload", "download", "delete", "rename"];
    let mut rng = StdRng::seed_from_u64(3);
    let mut out = Vec::with_capacity(len + 128);
    let mut ts = 1_700_000_000u64;
    while out.len() < len {
        ts += rng.gen_range(0..5);
        let line = format!(
            "{ts} INFO session={:08x} user={} action={} bytes={}\n",
            rng.gen::<u32>(),
            rng.gen_range(0..500),
            ACTIONS[rng.gen_range(0..ACTIONS.len())],
            rng.gen_range(0..1_000_000),
        );
        out.extend_from_slice(line.as_bytes());
    }
    out.truncate(len);
    out
}

/// Little-endian f32 samples in `[10, 20)`: one constant byte plane.
fn floats(count: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(21);
    (0..count).flat_map(|_| rng.gen_range(10.0f32..20.0).to_le_bytes()).collect()
}

/// Flip one random bit in each of `bytes` distinct positions across the
/// payload and inner parity of `block`.
fn flip_bits(block: &mut EccBlock, bytes: usize, rng: &mut StdRng) {
    let payload_len = block.payload.len();
    let total = payload_len + block.inner_parity.len();
    for pos in index::sample(rng, total, bytes) {
        let mask = 1u8 << rng.gen_range(0..8);
        if pos < payload_len {
            block.payload[pos] ^= mask;
        } else {
            block.inner_parity[pos - payload_len] ^= mask;
        }
    }
}

fn wipe(block: &mut EccBlock) {
    block.payload.iter_mut().for_each(|b| *b = !*b);
    block.inner_parity.iter_mut().for_each(|b| *b = !*b);
}

fn with_blocks(c: Container, f: impl FnOnce(&mut Vec<EccBlock>)) -> Container {
    let (header, mut blocks, tree) = c.into_parts();
    f(&mut blocks);
    Container::from_parts(header, blocks, tree)
}

// ── Round trips ──────────────────────────────────────────────────────────────

#[test]
fn test_small_inputs_round_trip() {
    for data in [Vec::new(), vec![0x5A], alternating(10_000)] {
        let c = encode(&data, &EncodeOptions::default()).unwrap();
        let parsed = Container::from_bytes(&c.to_bytes()).unwrap();
        assert_eq!(parsed, c);
        let (out, report) = decode(&parsed).unwrap();
        assert_eq!(out, data);
        assert_eq!(report.state, RepairState::AllHealthy);
        assert_eq!(report.damage_ratio_observed, 0.0);
    }
}

#[test]
fn test_random_input_is_stored() {
    let data = random(1 << 20, 11);
    let c = encode(&data, &EncodeOptions::default()).unwrap();
    assert_eq!(c.header().codec_id, CodecId::Store);
    // Compression ratio exactly 1.0; only ECC and tree overhead remain.
    assert_eq!(c.header().payload_len, c.header().original_size);
    let container_len = c.to_bytes().len();
    assert!(container_len > data.len());
    assert!(container_len * 4 < data.len() * 5, "overhead too large: {container_len}");
    assert_eq!(decode(&c).unwrap().0, data);
}

#[test]
fn test_repetitive_input_compresses() {
    let data = alternating(1 << 20);
    let c = encode(&data, &EncodeOptions::default()).unwrap();
    assert_ne!(c.header().codec_id, CodecId::Store);
    assert!(c.to_bytes().len() < data.len() / 50);
}

#[test]
fn test_custom_registry_restricts_codecs() {
    let registry = CodecProfileRegistry::from_json(
        r#"[
            {"codec_id": "store", "reference_ratio": 1.0, "reference_throughput_bytes_per_sec": 8e9},
            {"codec_id": "lz4",   "reference_ratio": 2.0, "reference_throughput_bytes_per_sec": 2e9}
        ]"#,
    )
    .unwrap();
    let data = alternating(200_000);
    let c = encode_with_registry(&data, &EncodeOptions::default(), &registry).unwrap();
    assert_eq!(c.header().codec_id, CodecId::Lz4);
    assert_eq!(decode(&c).unwrap().0, data);
}

#[test]
fn test_numeric_content_is_detected() {
    let registry = CodecProfileRegistry::from_json(
        r#"[
            {"codec_id": "store", "reference_ratio": 1.0, "reference_throughput_bytes_per_sec": 8e9},
            {"codec_id": "byteplane-zstd", "reference_ratio": 1.6,
             "reference_throughput_bytes_per_sec": 5e8, "content_affinity": "numeric_tensor"}
        ]"#,
    )
    .unwrap();
    let data = floats(16 * 1024);

    let auto = encode_with_registry(&data, &EncodeOptions::default(), &registry).unwrap();
    assert_eq!(auto.header().codec_id, CodecId::BytePlaneZstd);
    assert!(auto.header().payload_len < auto.header().original_size);
    assert_eq!(decode(&auto).unwrap().0, data);

    // An explicit generic hint keeps the numeric-only codec out.
    let opts = EncodeOptions { content_hint: Some(ContentHint::Generic), ..EncodeOptions::default() };
    let generic = encode_with_registry(&data, &opts, &registry).unwrap();
    assert_eq!(generic.header().codec_id, CodecId::Store);

    // Text never triggers numeric detection.
    let text = encode_with_registry(&log_lines(64 * 1024), &EncodeOptions::default(), &registry).unwrap();
    assert_eq!(text.header().codec_id, CodecId::Store);
}

#[test]
fn test_path_round_trip() {
    let file = NamedTempFile::new().unwrap();
    let data = log_lines(50_000);
    let c = encode(&data, &EncodeOptions::default()).unwrap();
    c.write_to_path(file.path()).unwrap();
    let back = Container::read_from_path(file.path()).unwrap();
    assert_eq!(back, c);
    assert_eq!(decode(&back).unwrap().0, data);
}

// ── Repair ───────────────────────────────────────────────────────────────────

#[test]
fn test_alternating_survives_fifteen_percent_loss() {
    let data = alternating(1 << 20);
    let opts = EncodeOptions {
        damage_tolerance_percent: 20,
        block_size: 16,
        group_size: 4,
        ..EncodeOptions::default()
    };
    let c = encode(&data, &opts).unwrap();
    let leaves = c.header().leaf_count as usize;
    assert!(leaves > 2, "payload fits in {leaves} leaves");
    let damaged = ((leaves * 15).div_ceil(100)).max(1);

    let mut rng = StdRng::seed_from_u64(15);
    let targets = index::sample(&mut rng, leaves, damaged).into_vec();
    let c = with_blocks(c, |blocks| {
        for &i in &targets {
            flip_bits(&mut blocks[i], 8, &mut rng);
        }
    });
    let (out, report) = decode(&c).unwrap();
    assert_eq!(out, data);
    assert_eq!(report.state, RepairState::FullyRepaired);
    assert_eq!(report.repaired_blocks, damaged);
    assert_eq!(report.unrecoverable_blocks, 0);
    assert!(report.is_exact());
}

#[test]
fn test_bit_flips_within_budget_are_repaired() {
    let data = log_lines(1 << 20);
    let opts = EncodeOptions { damage_tolerance_percent: 20, ..EncodeOptions::default() };
    let c = encode(&data, &opts).unwrap();
    let leaves = c.header().leaf_count as usize;
    let damaged = leaves * 20 / 100;
    assert!(damaged > 0);

    let mut rng = StdRng::seed_from_u64(20);
    let targets = index::sample(&mut rng, leaves, damaged).into_vec();
    let c = with_blocks(c, |blocks| {
        for &i in &targets {
            flip_bits(&mut blocks[i], 16, &mut rng);
        }
    });
    assert_eq!(verify(&c).unwrap().len(), damaged);

    let (out, report) = decode(&c).unwrap();
    assert_eq!(out, data);
    assert_eq!(report.state, RepairState::FullyRepaired);
    assert_eq!(report.repaired_blocks, damaged);
    assert_eq!(report.unrecoverable_blocks, 0);
    for &i in &targets {
        assert_eq!(report.outcomes[i].status, BlockStatus::RepairedInner { corrected_bytes: 16 });
    }
}

#[test]
fn test_mixed_inner_and_outer_repair() {
    let data = log_lines(1 << 20);
    let opts = EncodeOptions { damage_tolerance_percent: 20, ..EncodeOptions::default() };
    let c = encode(&data, &opts).unwrap();
    let h = c.header().clone();
    let d = h.data_block_count as usize;
    let group = h.ecc_mode.group_size as usize;
    assert!(d > group, "need at least two outer groups, got {d} data blocks");

    let c = with_blocks(c, |blocks| {
        // Scattered byte errors: inner RS.
        for i in [1usize, 2, d] {
            for pos in (0..8).map(|k| k * 401 + 7) {
                blocks[i].payload[pos] ^= 0xC3;
            }
        }
        // One wiped leaf per group: outer XOR.
        wipe(&mut blocks[0]);
        wipe(&mut blocks[group]);
    });

    let (out, report) = decode(&c).unwrap();
    assert_eq!(out, data);
    assert_eq!(report.state, RepairState::FullyRepaired);
    assert_eq!(report.repaired_blocks, 5);
    assert_eq!(report.outcomes[0].status, BlockStatus::RepairedOuter);
    assert_eq!(report.outcomes[group].status, BlockStatus::RepairedOuter);
    assert_eq!(report.outcomes[1].status, BlockStatus::RepairedInner { corrected_bytes: 8 });
    assert_eq!(report.outcomes[d].kind, BlockKind::OuterParity);
    assert!(matches!(report.outcomes[d].status, BlockStatus::RepairedInner { .. }));
}

#[test]
fn test_two_losses_in_a_group_are_fatal() {
    let data = log_lines(300_000);
    let c = encode(&data, &EncodeOptions { damage_tolerance_percent: 20, ..EncodeOptions::default() }).unwrap();
    assert_ne!(c.header().codec_id, CodecId::Store);
    let c = with_blocks(c, |blocks| {
        wipe(&mut blocks[0]);
        wipe(&mut blocks[1]);
    });
    match decode(&c) {
        Err(FatalError::DamageExceedsTolerance { unrecoverable, .. }) => {
            assert_eq!(unrecoverable, vec![0, 1]);
        }
        other => panic!("expected DamageExceedsTolerance, got {other:?}"),
    }

    // Zero-filling the holes leaves an undecodable compressed stream.
    let zero_fill = DecodeOptions { lost_blocks: LostBlockPolicy::ZeroFill, ..DecodeOptions::default() };
    assert!(matches!(
        decode_with(&c, &zero_fill),
        Err(FatalError::DamageExceedsTolerance { .. })
    ));
}

#[test]
fn test_whole_group_loss_exceeds_budget() {
    let data = random(64 * 1024, 5);
    let opts = EncodeOptions { damage_tolerance_percent: 10, block_size: 1024, group_size: 4, ..EncodeOptions::default() };
    let c = encode(&data, &opts).unwrap();
    let d = c.header().data_block_count as usize;
    let leaves = c.header().leaf_count as usize;
    assert_eq!(leaves, d + d.div_ceil(4));

    let c = with_blocks(c, |blocks| {
        // Groups 0 and 1, data and parity alike.
        for i in (0..8).chain([d, d + 1]) {
            wipe(&mut blocks[i]);
        }
    });
    let zero_fill = DecodeOptions { lost_blocks: LostBlockPolicy::ZeroFill, ..DecodeOptions::default() };
    match decode_with(&c, &zero_fill) {
        Err(FatalError::DamageExceedsTolerance { unrecoverable, budget }) => {
            assert_eq!(unrecoverable.len(), 10);
            assert_eq!(budget, leaves * 10 / 100);
        }
        other => panic!("expected DamageExceedsTolerance, got {other:?}"),
    }
}

#[test]
fn test_zero_fill_keeps_stored_payload_usable() {
    let data = random(32 * 1024, 9);
    let opts = EncodeOptions { damage_tolerance_percent: 25, block_size: 1024, group_size: 2, ..EncodeOptions::default() };
    let c = encode(&data, &opts).unwrap();
    assert_eq!(c.header().codec_id, CodecId::Store);
    let c = with_blocks(c, |blocks| {
        wipe(&mut blocks[4]);
        wipe(&mut blocks[5]);
    });

    let zero_fill = DecodeOptions { lost_blocks: LostBlockPolicy::ZeroFill, ..DecodeOptions::default() };
    let (out, report) = decode_with(&c, &zero_fill).unwrap();
    assert_eq!(report.state, RepairState::PartiallyRepaired);
    assert_eq!(report.lost_payload_ranges, vec![4096..5120, 5120..6144]);
    assert!(out[4096..6144].iter().all(|&b| b == 0));
    assert_eq!(out[..4096], data[..4096]);
    assert_eq!(out[6144..], data[6144..]);
}

// ── Verify and trust ─────────────────────────────────────────────────────────

#[test]
fn test_verify_is_read_only() {
    let c = encode(&log_lines(200_000), &EncodeOptions::default()).unwrap();
    let c = with_blocks(c, |blocks| blocks[2].payload[100] ^= 0x01);
    let before = c.clone();
    let first = verify(&c).unwrap();
    let second = verify(&c).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.into_iter().collect::<Vec<_>>(), vec![2]);
    assert_eq!(c, before);
}

#[test]
fn test_tampered_leaf_count_is_malformed() {
    let c = encode(&log_lines(100_000), &EncodeOptions::default()).unwrap();

    let (mut header, blocks, tree) = c.clone().into_parts();
    header.leaf_count += 1;
    let forged = Container::from_parts(header, blocks, tree);
    assert!(matches!(decode(&forged), Err(FatalError::MalformedContainer { .. })));
    assert!(matches!(verify(&forged), Err(FatalError::MalformedContainer { .. })));

    let mut bytes = c.to_bytes();
    let field = LEAF_COUNT_OFFSET..LEAF_COUNT_OFFSET + 4;
    let count = u32::from_le_bytes(bytes[field.clone()].try_into().unwrap());
    bytes[field].copy_from_slice(&(count - 1).to_le_bytes());
    // Without a fresh CRC the header itself is rejected.
    assert!(matches!(Container::from_bytes(&bytes), Err(FatalError::MalformedContainer { .. })));

    let crc = crc32fast::hash(&bytes[..HEADER_SIZE - 4]);
    bytes[HEADER_SIZE - 4..HEADER_SIZE].copy_from_slice(&crc.to_le_bytes());
    assert!(matches!(Container::from_bytes(&bytes), Err(FatalError::MalformedContainer { .. })));
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[test]
fn test_cancellation() {
    let flag = CancelFlag::new();
    flag.cancel();
    let opts = EncodeOptions { cancel: Some(flag.clone()), ..EncodeOptions::default() };
    assert!(matches!(encode(&alternating(4096), &opts), Err(EncodeError::Cancelled)));

    let c = encode(&alternating(4096), &EncodeOptions::default()).unwrap();
    let opts = DecodeOptions { cancel: Some(flag), ..DecodeOptions::default() };
    assert!(matches!(decode_with(&c, &opts), Err(FatalError::Cancelled)));
}

// ── Properties ───────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_round_trip(
        data in prop::collection::vec(any::<u8>(), 0..4096),
        tolerance in 0u8..=100,
        block_size in 16usize..512,
        group_size in 1u8..8,
    ) {
        let opts = EncodeOptions {
            damage_tolerance_percent: tolerance,
            block_size,
            group_size,
            ..EncodeOptions::default()
        };
        let c = encode(&data, &opts).unwrap();
        let parsed = Container::from_bytes(&c.to_bytes()).unwrap();
        let (out, report) = decode(&parsed).unwrap();
        prop_assert_eq!(out, data);
        prop_assert_eq!(report.state, RepairState::AllHealthy);
    }
}
