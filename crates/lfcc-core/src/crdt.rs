//! Narrow interface over the CRDT library.
//!
//! The merge algorithm is Loro's. Everything above this module only sees frontier
//! tags, version vectors and opaque update bytes.

use loro::{ExportMode, Frontiers, LoroDoc, VersionVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrdtError {
    #[error("Loro error: {0}")]
    Loro(String),

    #[error("Invalid frontier tag: {0}")]
    InvalidFrontier(String),

    #[error("Frontier not known locally: {0}")]
    UnknownFrontier(FrontierTag),
}

pub type Result<T> = std::result::Result<T, CrdtError>;

/// Opaque, comparable marker of a causally-consistent document state.
///
/// Hex encoding of Loro's encoded `Frontiers`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrontierTag(String);

impl FrontierTag {
    pub fn from_frontiers(frontiers: &Frontiers) -> Self {
        Self(hex::encode(frontiers.encode()))
    }

    pub fn to_frontiers(&self) -> Result<Frontiers> {
        let bytes = hex::decode(&self.0).map_err(|e| CrdtError::InvalidFrontier(e.to_string()))?;
        Frontiers::decode(&bytes).map_err(|e| CrdtError::InvalidFrontier(e.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for FrontierTag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for FrontierTag {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Display for FrontierTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The operations the sync layer needs from a CRDT document.
pub trait CrdtRuntime: Send + Sync {
    /// Tag of the current frontiers.
    fn frontier_tag(&self) -> FrontierTag;

    /// Version vector as `peer (hex) -> counter`.
    fn version_vector(&self) -> BTreeMap<String, i32>;

    /// Apply an update. Importing the same update twice is a no-op.
    fn import(&mut self, update: &[u8]) -> Result<()>;

    /// Updates since `since`, or the full history when `None`.
    fn export_since(&self, since: Option<&FrontierTag>) -> Result<Vec<u8>>;

    /// Full snapshot of the current state.
    fn export_snapshot(&self) -> Result<Vec<u8>>;

    /// Whether every operation named by `tag` is present locally.
    fn knows_frontier(&self, tag: &FrontierTag) -> bool;

    /// Whether a peer at `tag` already has everything we have.
    fn is_caught_up(&self, tag: Option<&FrontierTag>) -> bool;
}

/// [`CrdtRuntime`] backed by a `LoroDoc`.
pub struct LoroRuntime {
    doc: LoroDoc,
}

impl Default for LoroRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl LoroRuntime {
    pub fn new() -> Self {
        Self { doc: LoroDoc::new() }
    }

    /// Create a runtime with a fixed peer id (useful for deterministic tests).
    pub fn with_peer_id(peer_id: u64) -> Result<Self> {
        let doc = LoroDoc::new();
        doc.set_peer_id(peer_id)
            .map_err(|e| CrdtError::Loro(e.to_string()))?;
        Ok(Self { doc })
    }

    /// Load a runtime from snapshot/update bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut runtime = Self::new();
        runtime.import(bytes)?;
        Ok(runtime)
    }

    pub fn doc(&self) -> &LoroDoc {
        &self.doc
    }

    fn vv_of(&self, tag: &FrontierTag) -> Option<VersionVector> {
        let frontiers = tag.to_frontiers().ok()?;
        self.doc.frontiers_to_vv(&frontiers)
    }
}

impl CrdtRuntime for LoroRuntime {
    fn frontier_tag(&self) -> FrontierTag {
        FrontierTag::from_frontiers(&self.doc.oplog_frontiers())
    }

    fn version_vector(&self) -> BTreeMap<String, i32> {
        self.doc
            .oplog_vv()
            .iter()
            .map(|(peer, counter)| (format!("{peer:016x}"), *counter))
            .collect()
    }

    fn import(&mut self, update: &[u8]) -> Result<()> {
        self.doc
            .import(update)
            .map_err(|e| CrdtError::Loro(e.to_string()))?;
        Ok(())
    }

    fn export_since(&self, since: Option<&FrontierTag>) -> Result<Vec<u8>> {
        let from = match since {
            Some(tag) => self
                .vv_of(tag)
                .ok_or_else(|| CrdtError::UnknownFrontier(tag.clone()))?,
            None => VersionVector::default(),
        };
        self.doc
            .export(ExportMode::updates(&from))
            .map_err(|e| CrdtError::Loro(e.to_string()))
    }

    fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| CrdtError::Loro(e.to_string()))
    }

    fn knows_frontier(&self, tag: &FrontierTag) -> bool {
        self.vv_of(tag).is_some()
    }

    fn is_caught_up(&self, tag: Option<&FrontierTag>) -> bool {
        let ours = self.doc.oplog_vv();
        match tag {
            None => ours.is_empty(),
            Some(tag) => match self.vv_of(tag) {
                Some(theirs) => theirs.includes_vv(&ours),
                // They have operations we have never seen; only a catch-up can reconcile.
                None => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime_with_text(peer: u64, text: &str) -> LoroRuntime {
        let runtime = LoroRuntime::with_peer_id(peer).unwrap();
        runtime.doc().get_text("body").insert(0, text).unwrap();
        runtime.doc().commit();
        runtime
    }

    #[test]
    fn test_frontier_tag_roundtrip() {
        let runtime = runtime_with_text(1, "hello");
        let tag = runtime.frontier_tag();
        assert!(!tag.is_empty());
        assert!(runtime.knows_frontier(&tag));
        assert_eq!(FrontierTag::from_frontiers(&tag.to_frontiers().unwrap()), tag);
    }

    #[test]
    fn test_invalid_frontier_tag() {
        let tag = FrontierTag::from("zz-not-hex");
        assert!(tag.to_frontiers().is_err());
        assert!(!LoroRuntime::new().knows_frontier(&tag));
    }

    #[test]
    fn test_export_since_and_import() {
        let source = runtime_with_text(1, "hello");
        let mut replica = LoroRuntime::with_peer_id(2).unwrap();
        replica.import(&source.export_since(None).unwrap()).unwrap();
        assert_eq!(replica.frontier_tag(), source.frontier_tag());

        let before = source.frontier_tag();
        source.doc().get_text("body").insert(5, " world").unwrap();
        source.doc().commit();

        let delta = source.export_since(Some(&before)).unwrap();
        replica.import(&delta).unwrap();
        assert_eq!(replica.doc().get_text("body").to_string(), "hello world");
    }

    #[test]
    fn test_is_caught_up() {
        let source = runtime_with_text(1, "abc");
        let tag = source.frontier_tag();
        assert!(source.is_caught_up(Some(&tag)));
        assert!(!source.is_caught_up(None));
        assert!(LoroRuntime::new().is_caught_up(None));

        source.doc().get_text("body").insert(0, "x").unwrap();
        source.doc().commit();
        assert!(!source.is_caught_up(Some(&tag)));
    }

    #[test]
    fn test_unknown_frontier_export_fails() {
        let other = runtime_with_text(9, "elsewhere");
        let local = runtime_with_text(1, "here");
        let err = local.export_since(Some(&other.frontier_tag())).unwrap_err();
        assert!(matches!(err, CrdtError::UnknownFrontier(_)));
    }

    #[test]
    fn test_version_vector_keys() {
        let runtime = runtime_with_text(0xab, "x");
        let vv = runtime.version_vector();
        assert_eq!(vv.get("00000000000000ab"), Some(&1));
    }
}
