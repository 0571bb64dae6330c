//! Field-by-field manifest negotiation.

use super::manifest::{
    manifest_hash, AiSanitizationPolicy, AnchorEncoding, ChainPolicyCaps, IntegrityPolicy,
    PolicyManifestV09, RelocationPolicy, SanitizationLimits,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    ClientWins,
    ServerWins,
    Min,
    Max,
    Intersection,
    Reject,
}

/// Strategy per negotiated field.
pub const FIELD_STRATEGIES: &[(&str, Strategy)] = &[
    ("lfcc_version", Strategy::Reject),
    ("structure_mode", Strategy::Reject),
    ("anchor_encoding.version", Strategy::Reject),
    ("anchor_encoding.format", Strategy::Reject),
    ("chain_policy.allowed_kinds", Strategy::Intersection),
    ("chain_policy.max_intervening_blocks", Strategy::Min),
    ("relocation_policy.default_level", Strategy::Min),
    ("relocation_policy.enable_level_2", Strategy::Min),
    ("relocation_policy.enable_level_3", Strategy::Min),
    ("relocation_policy.level_2_max_distance_ratio", Strategy::Min),
    ("ai_sanitization_policy.allowed_marks", Strategy::Intersection),
    ("ai_sanitization_policy.allowed_block_types", Strategy::Intersection),
    ("ai_sanitization_policy.reject_unknown_structure", Strategy::Max),
    ("ai_sanitization_policy.limits.max_payload_bytes", Strategy::Min),
    ("ai_sanitization_policy.limits.max_nesting_depth", Strategy::Min),
    ("integrity_policy.context_hash_enabled", Strategy::Max),
    ("integrity_policy.chain_hash_enabled", Strategy::Max),
    ("integrity_policy.checkpoint_every_ops", Strategy::ServerWins),
    ("integrity_policy.debounce_ms", Strategy::ClientWins),
];

pub fn strategy_for(field: &str) -> Option<Strategy> {
    FIELD_STRATEGIES
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, strategy)| *strategy)
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NegotiationError {
    #[error("Incompatible {field}: client {client}, server {server}")]
    Incompatible {
        field: &'static str,
        client: Value,
        server: Value,
    },

    #[error("No common value for {field}")]
    EmptyIntersection { field: &'static str },

    #[error("Strategy {strategy:?} cannot apply to {field}")]
    InvalidStrategy {
        field: &'static str,
        strategy: Strategy,
    },

    #[error("Manifest could not be encoded: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NegotiationLogEntry {
    pub field: &'static str,
    pub strategy: Strategy,
    pub client: Value,
    pub server: Value,
    pub effective: Value,
}

/// Capabilities present on only one side after intersection.
///
/// This covers both directions: what the client asked for and the server did
/// not grant, and what the server offers that the client does not know. Both
/// are dropped from the effective manifest, so both are worth a notice.
/// Entries are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedFeatures {
    pub marks: Vec<String>,
    pub blocks: Vec<String>,
}

impl DegradedFeatures {
    pub fn is_empty(&self) -> bool {
        self.marks.is_empty() && self.blocks.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Negotiated {
    pub effective_manifest: PolicyManifestV09,
    pub negotiation_log: Vec<NegotiationLogEntry>,
    pub degraded: DegradedFeatures,
}

struct Negotiator {
    log: Vec<NegotiationLogEntry>,
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl Negotiator {
    fn strategy(field: &'static str) -> Strategy {
        // Unlisted fields must match exactly.
        strategy_for(field).unwrap_or(Strategy::Reject)
    }

    fn record<T: Serialize>(&mut self, field: &'static str, strategy: Strategy, client: &T, server: &T, effective: &T) {
        self.log.push(NegotiationLogEntry {
            field,
            strategy,
            client: to_value(client),
            server: to_value(server),
            effective: to_value(effective),
        });
    }

    fn scalar<T>(&mut self, field: &'static str, client: &T, server: &T) -> Result<T, NegotiationError>
    where
        T: PartialOrd + Clone + Serialize,
    {
        let strategy = Self::strategy(field);
        let effective = match strategy {
            Strategy::ClientWins => client.clone(),
            Strategy::ServerWins => server.clone(),
            Strategy::Min => {
                if client <= server {
                    client.clone()
                } else {
                    server.clone()
                }
            }
            Strategy::Max => {
                if client >= server {
                    client.clone()
                } else {
                    server.clone()
                }
            }
            Strategy::Reject => {
                if client != server {
                    return Err(NegotiationError::Incompatible {
                        field,
                        client: to_value(client),
                        server: to_value(server),
                    });
                }
                client.clone()
            }
            Strategy::Intersection => {
                return Err(NegotiationError::InvalidStrategy { field, strategy });
            }
        };
        self.record(field, strategy, client, server, &effective);
        Ok(effective)
    }

    /// Intersect two allow-lists, keeping the client's order.
    ///
    /// Returns the effective list and the elements present on only one side.
    fn set<T>(&mut self, field: &'static str, client: &[T], server: &[T]) -> Result<(Vec<T>, Vec<T>), NegotiationError>
    where
        T: Ord + Clone + Serialize,
    {
        let strategy = Self::strategy(field);
        if strategy != Strategy::Intersection {
            return Err(NegotiationError::InvalidStrategy { field, strategy });
        }
        let client_set: BTreeSet<&T> = client.iter().collect();
        let server_set: BTreeSet<&T> = server.iter().collect();

        let mut effective = Vec::new();
        for item in client {
            if server_set.contains(item) && !effective.contains(item) {
                effective.push(item.clone());
            }
        }
        let one_sided: Vec<T> = client_set
            .symmetric_difference(&server_set)
            .map(|item| (*item).clone())
            .collect();

        self.record(field, strategy, &client.to_vec(), &server.to_vec(), &effective);
        Ok((effective, one_sided))
    }
}

/// Negotiate an effective manifest from the client's and server's manifests.
///
/// `structure_mode` and the anchor encoding must match exactly. Allow-lists are
/// intersected and their one-sided elements reported as degraded features.
pub fn negotiate_manifests(
    client: &PolicyManifestV09,
    server: &PolicyManifestV09,
) -> Result<Negotiated, NegotiationError> {
    let mut n = Negotiator { log: Vec::new() };

    let lfcc_version = n.scalar("lfcc_version", &client.lfcc_version, &server.lfcc_version)?;
    let structure_mode = n.scalar("structure_mode", &client.structure_mode, &server.structure_mode)?;
    let anchor_encoding = AnchorEncoding {
        version: n.scalar(
            "anchor_encoding.version",
            &client.anchor_encoding.version,
            &server.anchor_encoding.version,
        )?,
        format: n.scalar(
            "anchor_encoding.format",
            &client.anchor_encoding.format,
            &server.anchor_encoding.format,
        )?,
    };

    let (allowed_kinds, _) = n.set(
        "chain_policy.allowed_kinds",
        &client.chain_policy.allowed_kinds,
        &server.chain_policy.allowed_kinds,
    )?;
    if allowed_kinds.is_empty() {
        return Err(NegotiationError::EmptyIntersection {
            field: "chain_policy.allowed_kinds",
        });
    }
    let chain_policy = ChainPolicyCaps {
        allowed_kinds,
        max_intervening_blocks: n.scalar(
            "chain_policy.max_intervening_blocks",
            &client.chain_policy.max_intervening_blocks,
            &server.chain_policy.max_intervening_blocks,
        )?,
    };

    let (c, s) = (&client.relocation_policy, &server.relocation_policy);
    let relocation_policy = RelocationPolicy {
        default_level: n.scalar("relocation_policy.default_level", &c.default_level, &s.default_level)?,
        enable_level_2: n.scalar("relocation_policy.enable_level_2", &c.enable_level_2, &s.enable_level_2)?,
        enable_level_3: n.scalar("relocation_policy.enable_level_3", &c.enable_level_3, &s.enable_level_3)?,
        level_2_max_distance_ratio: n.scalar(
            "relocation_policy.level_2_max_distance_ratio",
            &c.level_2_max_distance_ratio,
            &s.level_2_max_distance_ratio,
        )?,
    };

    let (c, s) = (&client.ai_sanitization_policy, &server.ai_sanitization_policy);
    let (allowed_marks, degraded_marks) =
        n.set("ai_sanitization_policy.allowed_marks", &c.allowed_marks, &s.allowed_marks)?;
    let (allowed_block_types, degraded_blocks) = n.set(
        "ai_sanitization_policy.allowed_block_types",
        &c.allowed_block_types,
        &s.allowed_block_types,
    )?;
    let ai_sanitization_policy = AiSanitizationPolicy {
        allowed_marks,
        allowed_block_types,
        reject_unknown_structure: n.scalar(
            "ai_sanitization_policy.reject_unknown_structure",
            &c.reject_unknown_structure,
            &s.reject_unknown_structure,
        )?,
        limits: SanitizationLimits {
            max_payload_bytes: n.scalar(
                "ai_sanitization_policy.limits.max_payload_bytes",
                &c.limits.max_payload_bytes,
                &s.limits.max_payload_bytes,
            )?,
            max_nesting_depth: n.scalar(
                "ai_sanitization_policy.limits.max_nesting_depth",
                &c.limits.max_nesting_depth,
                &s.limits.max_nesting_depth,
            )?,
        },
    };

    let (c, s) = (&client.integrity_policy, &server.integrity_policy);
    let integrity_policy = IntegrityPolicy {
        context_hash_enabled: n.scalar(
            "integrity_policy.context_hash_enabled",
            &c.context_hash_enabled,
            &s.context_hash_enabled,
        )?,
        chain_hash_enabled: n.scalar(
            "integrity_policy.chain_hash_enabled",
            &c.chain_hash_enabled,
            &s.chain_hash_enabled,
        )?,
        checkpoint_every_ops: n.scalar(
            "integrity_policy.checkpoint_every_ops",
            &c.checkpoint_every_ops,
            &s.checkpoint_every_ops,
        )?,
        debounce_ms: n.scalar("integrity_policy.debounce_ms", &c.debounce_ms, &s.debounce_ms)?,
    };

    let effective_manifest = PolicyManifestV09 {
        lfcc_version,
        policy_id: negotiated_policy_id(client, server)
            .map_err(|e| NegotiationError::Encoding(e.to_string()))?,
        structure_mode,
        anchor_encoding,
        chain_policy,
        relocation_policy,
        ai_sanitization_policy,
        integrity_policy,
    };

    let degraded = DegradedFeatures {
        marks: degraded_marks,
        blocks: degraded_blocks,
    };
    debug!(
        "Negotiated {} ({} degraded marks, {} degraded blocks)",
        effective_manifest.policy_id,
        degraded.marks.len(),
        degraded.blocks.len()
    );

    Ok(Negotiated {
        effective_manifest,
        negotiation_log: n.log,
        degraded,
    })
}

/// `negotiated-<hash>` over both input manifests, so peers can compare outcomes.
pub fn negotiated_policy_id(
    client: &PolicyManifestV09,
    server: &PolicyManifestV09,
) -> serde_json::Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(manifest_hash(client)?.as_bytes());
    hasher.update(b":");
    hasher.update(manifest_hash(server)?.as_bytes());
    let digest = hex::encode(hasher.finalize());
    Ok(format!("negotiated-{}", &digest[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::ChainPolicyKind;
    use crate::policy::StructureMode;

    // ==== Reject fields ====

    #[test]
    fn test_structure_mode_mismatch_fails() {
        let client = PolicyManifestV09::default();
        let mut server = PolicyManifestV09::default();
        server.structure_mode = StructureMode::B;

        let err = negotiate_manifests(&client, &server).unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Incompatible { field: "structure_mode", .. }
        ));
    }

    #[test]
    fn test_anchor_version_mismatch_fails() {
        let client = PolicyManifestV09::default();
        let mut server = PolicyManifestV09::default();
        server.anchor_encoding.version = "v2".into();

        let err = negotiate_manifests(&client, &server).unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Incompatible { field: "anchor_encoding.version", .. }
        ));
    }

    // ==== Idempotence ====

    #[test]
    fn test_self_negotiation_succeeds() {
        let manifest = PolicyManifestV09::default();
        let negotiated = negotiate_manifests(&manifest, &manifest).unwrap();

        let mut effective = negotiated.effective_manifest.clone();
        assert!(effective.policy_id.starts_with("negotiated-"));
        effective.policy_id = manifest.policy_id.clone();
        assert_eq!(effective, manifest);
        assert!(negotiated.degraded.is_empty());
        assert_eq!(negotiated.negotiation_log.len(), FIELD_STRATEGIES.len());
    }

    #[test]
    fn test_policy_id_is_deterministic() {
        let client = PolicyManifestV09::default();
        let mut server = PolicyManifestV09::default();
        server.integrity_policy.checkpoint_every_ops = 50;

        let a = negotiate_manifests(&client, &server).unwrap();
        let b = negotiate_manifests(&client, &server).unwrap();
        assert_eq!(a.effective_manifest.policy_id, b.effective_manifest.policy_id);
        assert_ne!(
            a.effective_manifest.policy_id,
            negotiate_manifests(&client, &client).unwrap().effective_manifest.policy_id
        );
    }

    // ==== Strategies ====

    #[test]
    fn test_relocation_flags_take_conservative_side() {
        let mut client = PolicyManifestV09::default();
        client.relocation_policy.enable_level_3 = true;
        let mut server = PolicyManifestV09::default();
        server.relocation_policy.enable_level_2 = false;

        let effective = negotiate_manifests(&client, &server).unwrap().effective_manifest;
        assert!(!effective.relocation_policy.enable_level_2);
        assert!(!effective.relocation_policy.enable_level_3);
    }

    #[test]
    fn test_allow_lists_intersect_and_report_degraded() {
        let mut client = PolicyManifestV09::default();
        client.ai_sanitization_policy.allowed_marks.push("highlight".into());
        let mut server = PolicyManifestV09::default();
        server.ai_sanitization_policy.allowed_block_types.retain(|b| b != "quote");

        let negotiated = negotiate_manifests(&client, &server).unwrap();
        let sanitization = &negotiated.effective_manifest.ai_sanitization_policy;
        assert!(!sanitization.allowed_marks.contains(&"highlight".to_string()));
        assert!(!sanitization.allowed_block_types.contains(&"quote".to_string()));
        assert_eq!(negotiated.degraded.marks, vec!["highlight".to_string()]);
        assert_eq!(negotiated.degraded.blocks, vec!["quote".to_string()]);
    }

    #[test]
    fn test_degraded_covers_server_only_features() {
        let client = PolicyManifestV09::default();
        let mut server = PolicyManifestV09::default();
        server.ai_sanitization_policy.allowed_marks.push("superscript".into());
        server.ai_sanitization_policy.allowed_marks.push("kbd".into());

        let negotiated = negotiate_manifests(&client, &server).unwrap();
        assert_eq!(
            negotiated.effective_manifest.ai_sanitization_policy.allowed_marks,
            client.ai_sanitization_policy.allowed_marks
        );
        assert_eq!(negotiated.degraded.marks, vec!["kbd".to_string(), "superscript".to_string()]);
        assert!(negotiated.degraded.blocks.is_empty());
    }

    #[test]
    fn test_client_and_server_wins() {
        let mut client = PolicyManifestV09::default();
        client.integrity_policy.debounce_ms = 10;
        client.integrity_policy.checkpoint_every_ops = 1;
        let mut server = PolicyManifestV09::default();
        server.integrity_policy.debounce_ms = 900;
        server.integrity_policy.checkpoint_every_ops = 500;

        let effective = negotiate_manifests(&client, &server).unwrap().effective_manifest;
        assert_eq!(effective.integrity_policy.debounce_ms, 10);
        assert_eq!(effective.integrity_policy.checkpoint_every_ops, 500);
    }

    #[test]
    fn test_disjoint_chain_kinds_fail() {
        let mut client = PolicyManifestV09::default();
        client.chain_policy.allowed_kinds = vec![ChainPolicyKind::BoundedGap];
        let mut server = PolicyManifestV09::default();
        server.chain_policy.allowed_kinds = vec![ChainPolicyKind::StrictAdjacency];

        assert!(matches!(
            negotiate_manifests(&client, &server),
            Err(NegotiationError::EmptyIntersection { .. })
        ));
    }

    #[test]
    fn test_every_field_has_a_strategy() {
        assert_eq!(strategy_for("structure_mode"), Some(Strategy::Reject));
        assert_eq!(strategy_for("anchor_encoding.version"), Some(Strategy::Reject));
        assert_eq!(
            strategy_for("ai_sanitization_policy.allowed_marks"),
            Some(Strategy::Intersection)
        );
        assert_eq!(strategy_for("unknown"), None);
    }
}
