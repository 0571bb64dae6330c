//! Annotation integrity: context/chain hashing and scanning.
//!
//! The scanner never raises on a failed lookup. Anything it cannot confirm is
//! reported as unverified and degrades the annotation's display state.

mod hash;
mod scanner;

pub use hash::{
    chain_hash, compute_chain_hash, compute_span_hash, context_hash, seal_annotation, HashResult,
    SpanLookup,
};
pub use scanner::{
    check_chain_structure, derive_display_state, AnnotationScan, ChainStatus, IntegrityScanner,
    Mismatch, MismatchKind, ScanMode, ScanSummary, SpanStatus,
};
