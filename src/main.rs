use clap::{ArgAction, Parser, Subcommand};
use mendec::codec::ContentAffinity;
use mendec::pipeline::{DEFAULT_BLOCK_SIZE, DEFAULT_COMPRESSION_LEVEL, DEFAULT_DAMAGE_TOLERANCE_PERCENT};
use mendec::{
    decode_with, encode_with_registry, scan, verify, CodecProfileRegistry, Container, ContentHint,
    DecodeOptions, EncodeOptions, LostBlockPolicy, ScanConfig,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mendec", version, about = "Self-healing compression containers (.mndc)")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).  RUST_LOG wins when set.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress a file into a .mndc container
    Encode {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Share of leaves that may be lost outright (0-100)
        #[arg(short, long, default_value_t = DEFAULT_DAMAGE_TOLERANCE_PERCENT)]
        tolerance: u8,
        /// Content hint: auto, generic or numeric_tensor
        #[arg(long, default_value = "auto", value_parser = parse_hint)]
        hint: Hint,
        /// ECC block size in bytes
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: usize,
        /// Data blocks per outer parity block
        #[arg(long, default_value_t = mendec::ecc::DEFAULT_GROUP_SIZE)]
        group_size: u8,
        /// Compression level passed to the chosen backend
        #[arg(short, long, default_value_t = DEFAULT_COMPRESSION_LEVEL)]
        level: i32,
        /// JSON file of codec profiles replacing the built-in baselines
        #[arg(long)]
        profiles: Option<PathBuf>,
    },
    /// Verify, repair and decompress a container
    Decode {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Zero-fill data leaves that cannot be rebuilt instead of failing
        #[arg(long)]
        zero_fill: bool,
    },
    /// Check every leaf against the Merkle tree without repairing
    Verify {
        input: PathBuf,
    },
    /// Show container header fields
    Info {
        input: PathBuf,
    },
    /// Print the multi-granularity pattern table of a raw file
    Scan {
        input: PathBuf,
        #[arg(long, default_value_t = mendec::pattern::DEFAULT_TOP_K)]
        top_k: usize,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {

        // ── Encode ───────────────────────────────────────────────────────────
        Commands::Encode { input, output, tolerance, hint, block_size, group_size, level, profiles } => {
            let registry = match profiles {
                Some(path) => CodecProfileRegistry::from_json(&std::fs::read_to_string(path)?)?,
                None       => CodecProfileRegistry::builtin().clone(),
            };
            let opts = EncodeOptions {
                damage_tolerance_percent: tolerance,
                content_hint: hint.0,
                block_size,
                group_size,
                compression_level: level,
                ..EncodeOptions::default()
            };
            let data = std::fs::read(&input)?;
            let container = encode_with_registry(&data, &opts, &registry)?;
            container.write_to_path(&output)?;

            let h = container.header();
            println!("Created: {}", output.display());
            println!("  codec          {}", h.codec_id);
            println!("  original size  {} B", h.original_size);
            println!("  payload        {} B", h.payload_len);
            println!("  leaves         {} × {} B", h.leaf_count, h.leaf_size);
            println!("  merkle root    {}", hex::encode(h.merkle_root));
        }

        // ── Decode ───────────────────────────────────────────────────────────
        Commands::Decode { input, output, zero_fill } => {
            let container = Container::read_from_path(&input)?;
            let opts = DecodeOptions {
                lost_blocks: if zero_fill { LostBlockPolicy::ZeroFill } else { LostBlockPolicy::Reject },
                ..DecodeOptions::default()
            };
            let (data, report) = decode_with(&container, &opts)?;
            std::fs::write(&output, &data)?;
            eprintln!("{}", serde_json::to_string_pretty(&report)?);
            println!("Decoded {} B → {}", data.len(), output.display());
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { input } => {
            let container = Container::read_from_path(&input)?;
            let damaged = verify(&container)?;
            if damaged.is_empty() {
                println!("OK: all {} leaves verify", container.header().leaf_count);
            } else {
                println!("DAMAGED: {} of {} leaves", damaged.len(), container.header().leaf_count);
                for i in &damaged {
                    let kind = container.blocks()[*i as usize].kind;
                    println!("  leaf {:>6}  {:?}", i, kind);
                }
                std::process::exit(1);
            }
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let container = Container::read_from_path(&input)?;
            let h = container.header();
            println!("── .mndc Container ──────────────────────────────────────");
            println!("  Path             {}", input.display());
            println!("  Format version   {}", h.format_version);
            println!("  Codec            {}", h.codec_id);
            println!("  Original size    {} B", h.original_size);
            println!("  Payload          {} B", h.payload_len);
            println!("  Tolerance        {}%", h.damage_tolerance_percent);
            println!("  Inner RS symbols {}", h.ecc_mode.inner_symbols);
            println!("  Outer group      {}", h.ecc_mode.group_size);
            println!("  Block size       {} B", h.block_size);
            println!("  Leaves           {} ({} data) × {} B", h.leaf_count, h.data_block_count, h.leaf_size);
            println!("  Merkle root      {}", hex::encode(h.merkle_root));
            println!("  Pattern summary  {}", hex::encode(h.pattern_summary_checksum));
        }

        // ── Scan ─────────────────────────────────────────────────────────────
        Commands::Scan { input, top_k } => {
            let data = std::fs::read(&input)?;
            let table = scan(&data, &ScanConfig { top_k, ..ScanConfig::default() });
            println!("Scanned {} B, overall redundancy {:.3}", table.scanned_bytes, table.redundancy());
            println!("{:>6} {:>12} {:>8} {:>10}  Top pattern", "Bits", "Windows", "Mass", "Redund.");
            for t in &table.tables {
                let redundancy = t
                    .redundancy(table.top_k)
                    .map_or_else(|| "-".to_string(), |r| format!("{r:.3}"));
                let top = t
                    .entries
                    .first()
                    .map(|e| format!("{} ×{}", hex::encode(&e.pattern_bytes), e.frequency))
                    .unwrap_or_default();
                println!("{:>6} {:>12} {:>8.3} {:>10}  {}",
                    t.window_bits, t.total_windows, t.top_mass(), redundancy, top);
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// `None` means auto-detect.
#[derive(Clone, Copy)]
struct Hint(Option<ContentHint>);

fn parse_hint(s: &str) -> Result<Hint, String> {
    match s {
        "auto" => Ok(Hint(None)),
        "generic" => Ok(Hint(Some(ContentAffinity::Generic))),
        "numeric_tensor" | "numeric-tensor" | "tensor" => Ok(Hint(Some(ContentAffinity::NumericTensor))),
        other => Err(format!("unknown content hint '{other}' (auto, generic, numeric_tensor)")),
    }
}
