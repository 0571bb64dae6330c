//! lfcc-core: annotation anchoring, integrity verification and document sync
//! over Loro CRDTs.
//!
//! This crate provides:
//! - Stable anchors, spans and annotations with chain policies
//! - The integrity scanner (context/chain hashes, display-state derivation)
//! - Policy manifests and their field-by-field negotiation
//! - The wire protocol, a sans-IO server engine and a sans-IO client state machine
//! - Compaction policy and the update/snapshot storage contract
//! - Redacted repro bundles for diagnostics

pub mod anchor;
pub mod annotation;
pub mod client;
pub mod clock;
pub mod compaction;
pub mod crdt;
pub mod diagnostics;
pub mod dirty;
pub mod divergence;
pub mod document;
pub mod events;
pub mod integrity;
pub mod policy;
pub mod presence;
pub mod protocol;
pub mod sync_engine;

pub use anchor::{decode_anchor, encode_anchor, resolve, AnchorError, BlockId, Resolution, Span, StableAnchor};
pub use annotation::{
    AnnotatedSpan, Annotation, Chain, ChainPolicy, ChainPolicyKind, DisplayState, StoredState,
};
pub use client::{ClientConfig, ClientOutput, ConnectionState, RetryPolicy, SyncClient};
pub use compaction::{
    check_and_compact, run_compaction, should_compact, CompactionError, CompactionPolicy,
    CompactionReport, DocSnapshot, MemoryStore, StoreError, UpdateRecord, UpdateStore,
};
pub use crdt::{CrdtError, CrdtRuntime, FrontierTag, LoroRuntime};
pub use diagnostics::{DiagnosticsLimits, ErrorLog, ReproBundle, ReproBundleBuilder};
pub use dirty::{DirtyInfo, DirtyLog, OpCode};
pub use divergence::{DivergenceBanner, DivergenceReason, DivergenceTracker, RecoveryAction};
pub use document::{BlockDocument, DocumentError, DocumentState};
pub use events::{EventBus, LfccEvent, Subscription};
pub use integrity::{IntegrityScanner, ScanMode, ScanSummary};
pub use policy::{manifest_hash, negotiate_manifests, Negotiated, PolicyManifestV09};
pub use presence::{PresenceConfig, PresenceStore};
pub use sync_engine::{ConnectionId, EngineConfig, Outbound, SyncEngine};
