use std::io;
use thiserror::Error;

/// Errors surfaced by `encode`.
///
/// A failing codec backend never surfaces here; the selector falls back to
/// storing raw.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Invalid encode options: {0}")]
    InvalidOptions(String),
    #[error("Encode cancelled")]
    Cancelled,
}

/// Errors surfaced by `decode` / `verify` and by container parsing.
#[derive(Error, Debug)]
pub enum FatalError {
    /// Header or tree is structurally inconsistent.  No repair is attempted.
    #[error("Malformed container: {detail}")]
    MalformedContainer { detail: String },

    /// More blocks are lost than the container's declared tolerance, or a
    /// data block could not be rebuilt and the caller did not opt into
    /// zero-filling.
    #[error("Damage exceeds tolerance: {} unrecoverable block(s) {:?}, budget {budget}",
            unrecoverable.len(), unrecoverable)]
    DamageExceedsTolerance { unrecoverable: Vec<u32>, budget: usize },

    /// The body verified (or was repaired) but the codec could not restore it.
    #[error("Codec {codec} failed to restore payload: {detail}")]
    Codec { codec: &'static str, detail: String },

    #[error("Decode cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl FatalError {
    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        FatalError::MalformedContainer { detail: detail.into() }
    }
}
