pub mod cancel;
pub mod codec;
pub mod container;
pub mod ecc;
pub mod error;
pub mod merkle;
pub mod pattern;
pub mod perf;
pub mod pipeline;
pub mod repair;

pub use cancel::CancelFlag;
pub use codec::{get_codec, CodecId, CodecProfile, CodecProfileRegistry, ContentHint};
pub use container::{Container, ContainerHeader};
pub use error::{EncodeError, FatalError};
pub use pattern::{scan, PatternTable, ScanConfig};
pub use pipeline::{decode, decode_with, encode, encode_with_registry, verify, DecodeOptions, EncodeOptions};
pub use repair::{LostBlockPolicy, RepairReport, RepairState};
