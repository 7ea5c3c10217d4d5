//! Reference performance profiles for each backend.
//!
//! The builtin baselines are measured numbers for the crates this build
//! links against, not vendor claims.  A registry is read-only once built;
//! callers wanting different baselines construct their own and pass it to
//! `encode_with_registry`.

use std::collections::HashSet;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::CodecId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentAffinity {
    #[default]
    Generic,
    NumericTensor,
}

/// Classification of the input, given by the caller or detected by
/// `pattern::detect_content`.  Same domain as [`ContentAffinity`].
pub type ContentHint = ContentAffinity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecProfile {
    pub codec_id:                           CodecId,
    pub reference_ratio:                    f64,
    pub reference_throughput_bytes_per_sec: f64,
    #[serde(default)]
    pub content_affinity:                   ContentAffinity,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Profile {codec}: reference ratio {ratio} is below 1.0")]
    InvalidRatio { codec: CodecId, ratio: f64 },
    #[error("Profile {codec}: throughput {throughput} must be positive")]
    InvalidThroughput { codec: CodecId, throughput: f64 },
    #[error("Codec {0} is listed more than once")]
    Duplicate(CodecId),
    #[error("Registry must contain the store codec")]
    MissingStore,
    #[error("Invalid profile JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodecProfileRegistry {
    profiles: Vec<CodecProfile>,
}

fn builtin_profiles() -> Vec<CodecProfile> {
    use CodecId::*;
    use ContentAffinity::*;
    let p = |codec_id, reference_ratio, reference_throughput_bytes_per_sec, content_affinity| {
        CodecProfile { codec_id, reference_ratio, reference_throughput_bytes_per_sec, content_affinity }
    };
    vec![
        p(Store,         1.00, 8.0e9, Generic),
        p(Zstd,          3.37, 4.0e8, Generic),
        p(Lz4,           2.16, 2.0e9, Generic),
        p(Brotli,        3.30, 6.0e7, Generic),
        p(Lzma,          1.70, 1.5e7, Generic),
        p(BytePlaneZstd, 1.60, 3.0e8, NumericTensor),
    ]
}

impl CodecProfileRegistry {
    /// Process-wide builtin registry.
    pub fn builtin() -> &'static Self {
        static BUILTIN: OnceLock<CodecProfileRegistry> = OnceLock::new();
        BUILTIN.get_or_init(|| CodecProfileRegistry { profiles: builtin_profiles() })
    }

    pub fn from_profiles(profiles: Vec<CodecProfile>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for p in &profiles {
            if !(p.reference_ratio >= 1.0) {
                return Err(RegistryError::InvalidRatio { codec: p.codec_id, ratio: p.reference_ratio });
            }
            if !(p.reference_throughput_bytes_per_sec > 0.0) {
                return Err(RegistryError::InvalidThroughput {
                    codec:      p.codec_id,
                    throughput: p.reference_throughput_bytes_per_sec,
                });
            }
            if !seen.insert(p.codec_id) {
                return Err(RegistryError::Duplicate(p.codec_id));
            }
        }
        if !seen.contains(&CodecId::Store) {
            return Err(RegistryError::MissingStore);
        }
        Ok(Self { profiles })
    }

    /// Parse a JSON array of profiles.
    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        Self::from_profiles(serde_json::from_str(json)?)
    }

    pub fn profiles(&self) -> &[CodecProfile] { &self.profiles }

    pub fn get(&self, id: CodecId) -> Option<&CodecProfile> {
        self.profiles.iter().find(|p| p.codec_id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_is_valid_and_shared() {
        let a = CodecProfileRegistry::builtin();
        let b = CodecProfileRegistry::builtin();
        assert!(std::ptr::eq(a, b));
        assert!(CodecProfileRegistry::from_profiles(a.profiles().to_vec()).is_ok());
        assert_eq!(a.get(CodecId::Zstd).unwrap().reference_ratio, 3.37);
        assert_eq!(
            a.get(CodecId::BytePlaneZstd).unwrap().content_affinity,
            ContentAffinity::NumericTensor
        );
    }

    #[test]
    fn json_profiles_load() {
        let json = r#"[
            {"codec_id": "store", "reference_ratio": 1.0, "reference_throughput_bytes_per_sec": 1e9},
            {"codec_id": "lz4", "reference_ratio": 2.0, "reference_throughput_bytes_per_sec": 1e9}
        ]"#;
        let reg = CodecProfileRegistry::from_json(json).unwrap();
        assert_eq!(reg.profiles().len(), 2);
        assert_eq!(reg.get(CodecId::Lz4).unwrap().content_affinity, ContentAffinity::Generic);
        assert!(reg.get(CodecId::Zstd).is_none());
    }

    #[test]
    fn invalid_profiles_are_rejected() {
        let store = CodecProfile {
            codec_id:                           CodecId::Store,
            reference_ratio:                    1.0,
            reference_throughput_bytes_per_sec: 1.0,
            content_affinity:                   ContentAffinity::Generic,
        };
        let shrink = CodecProfile { codec_id: CodecId::Zstd, reference_ratio: 0.5, ..store.clone() };
        assert!(matches!(
            CodecProfileRegistry::from_profiles(vec![store.clone(), shrink]),
            Err(RegistryError::InvalidRatio { .. })
        ));

        let stalled = CodecProfile { codec_id: CodecId::Lz4, reference_throughput_bytes_per_sec: 0.0, ..store.clone() };
        assert!(matches!(
            CodecProfileRegistry::from_profiles(vec![store.clone(), stalled]),
            Err(RegistryError::InvalidThroughput { .. })
        ));

        assert!(matches!(
            CodecProfileRegistry::from_profiles(vec![store.clone(), store.clone()]),
            Err(RegistryError::Duplicate(CodecId::Store))
        ));

        let zstd = CodecProfile { codec_id: CodecId::Zstd, ..store };
        assert!(matches!(
            CodecProfileRegistry::from_profiles(vec![zstd]),
            Err(RegistryError::MissingStore)
        ));

        assert!(matches!(CodecProfileRegistry::from_json("{"), Err(RegistryError::Json(_))));
    }
}
