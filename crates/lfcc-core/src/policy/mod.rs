//! Policy manifests and their negotiation.

mod manifest;
mod negotiate;

pub use manifest::{
    manifest_hash, AiSanitizationPolicy, AnchorEncoding, ChainPolicyCaps, IntegrityPolicy,
    ManifestError, PolicyManifestV09, RelocationPolicy, SanitizationLimits, StructureMode,
    LFCC_VERSION,
};
pub use negotiate::{
    negotiate_manifests, negotiated_policy_id, strategy_for, DegradedFeatures, Negotiated,
    NegotiationError, NegotiationLogEntry, Strategy, FIELD_STRATEGIES,
};
