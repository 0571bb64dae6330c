//! Policy manifest v0.9: the capability set exchanged at handshake.

use crate::anchor::ANCHOR_ENCODING_V1;
use crate::annotation::ChainPolicyKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const LFCC_VERSION: &str = "0.9";

#[derive(Debug, Error, PartialEq)]
pub enum ManifestError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Field {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
}

/// Block structure representation. Peers must agree exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StructureMode {
    A,
    B,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorEncoding {
    pub version: String,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainPolicyCaps {
    pub allowed_kinds: Vec<ChainPolicyKind>,
    pub max_intervening_blocks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelocationPolicy {
    pub default_level: u8,
    pub enable_level_2: bool,
    pub enable_level_3: bool,
    pub level_2_max_distance_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizationLimits {
    pub max_payload_bytes: u64,
    pub max_nesting_depth: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiSanitizationPolicy {
    pub allowed_marks: Vec<String>,
    pub allowed_block_types: Vec<String>,
    pub reject_unknown_structure: bool,
    pub limits: SanitizationLimits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityPolicy {
    pub context_hash_enabled: bool,
    pub chain_hash_enabled: bool,
    pub checkpoint_every_ops: u32,
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyManifestV09 {
    pub lfcc_version: String,
    pub policy_id: String,
    pub structure_mode: StructureMode,
    pub anchor_encoding: AnchorEncoding,
    pub chain_policy: ChainPolicyCaps,
    pub relocation_policy: RelocationPolicy,
    pub ai_sanitization_policy: AiSanitizationPolicy,
    pub integrity_policy: IntegrityPolicy,
}

impl Default for PolicyManifestV09 {
    fn default() -> Self {
        let strings = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
        Self {
            lfcc_version: LFCC_VERSION.to_string(),
            policy_id: "default".to_string(),
            structure_mode: StructureMode::A,
            anchor_encoding: AnchorEncoding {
                version: ANCHOR_ENCODING_V1.to_string(),
                format: "hex_checksum".to_string(),
            },
            chain_policy: ChainPolicyCaps {
                allowed_kinds: vec![
                    ChainPolicyKind::StrictAdjacency,
                    ChainPolicyKind::RequiredOrder,
                    ChainPolicyKind::BoundedGap,
                ],
                max_intervening_blocks: 3,
            },
            relocation_policy: RelocationPolicy {
                default_level: 1,
                enable_level_2: true,
                enable_level_3: false,
                level_2_max_distance_ratio: 0.1,
            },
            ai_sanitization_policy: AiSanitizationPolicy {
                allowed_marks: strings(&["bold", "italic", "underline", "strike", "code", "link"]),
                allowed_block_types: strings(&[
                    "paragraph",
                    "heading",
                    "list_item",
                    "quote",
                    "code_block",
                ]),
                reject_unknown_structure: true,
                limits: SanitizationLimits {
                    max_payload_bytes: 1024 * 1024,
                    max_nesting_depth: 16,
                },
            },
            integrity_policy: IntegrityPolicy {
                context_hash_enabled: true,
                chain_hash_enabled: true,
                checkpoint_every_ops: 100,
                debounce_ms: 250,
            },
        }
    }
}

impl PolicyManifestV09 {
    /// Structural checks beyond what deserialisation enforces.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.lfcc_version.is_empty() {
            return Err(ManifestError::MissingField("lfcc_version"));
        }
        if self.policy_id.is_empty() {
            return Err(ManifestError::MissingField("policy_id"));
        }
        if self.anchor_encoding.version.is_empty() {
            return Err(ManifestError::MissingField("anchor_encoding.version"));
        }
        if self.chain_policy.allowed_kinds.is_empty() {
            return Err(ManifestError::MissingField("chain_policy.allowed_kinds"));
        }
        let ratio = self.relocation_policy.level_2_max_distance_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ManifestError::OutOfRange {
                field: "relocation_policy.level_2_max_distance_ratio",
                value: ratio.to_string(),
            });
        }
        if self.relocation_policy.default_level == 0 || self.relocation_policy.default_level > 3 {
            return Err(ManifestError::OutOfRange {
                field: "relocation_policy.default_level",
                value: self.relocation_policy.default_level.to_string(),
            });
        }
        Ok(())
    }
}

/// SHA-256 (hex) of the manifest's JSON encoding.
///
/// Struct fields serialise in declaration order, so equal manifests hash equally.
pub fn manifest_hash(manifest: &PolicyManifestV09) -> serde_json::Result<String> {
    let json = serde_json::to_vec(manifest)?;
    Ok(hex::encode(Sha256::digest(&json)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest_is_valid() {
        assert_eq!(PolicyManifestV09::default().validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_bad_ratio() {
        let mut manifest = PolicyManifestV09::default();
        manifest.relocation_policy.level_2_max_distance_ratio = 1.5;
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_hash_is_stable_and_sensitive() {
        let a = PolicyManifestV09::default();
        let mut b = PolicyManifestV09::default();
        assert_eq!(manifest_hash(&a).unwrap(), manifest_hash(&b).unwrap());
        b.integrity_policy.debounce_ms = 500;
        assert_ne!(manifest_hash(&a).unwrap(), manifest_hash(&b).unwrap());
        assert_eq!(manifest_hash(&a).unwrap().len(), 64);
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_string(&PolicyManifestV09::default()).unwrap();
        assert!(json.contains("\"structure_mode\":\"A\""));
        assert!(json.contains("\"anchor_encoding\":{\"version\":\"v1\""));
        assert!(json.contains("\"enable_level_2\":true"));
        assert!(json.contains("\"allowed_kinds\":[\"strict_adjacency\""));
    }
}
