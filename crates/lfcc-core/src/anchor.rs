//! Stable anchors and spans over block-structured text.
//!
//! A [`StableAnchor`] names a character offset inside one block. Two anchors in the
//! same block resolve to a [`Span`]; multi-block coverage is a sequence of spans
//! joined by an annotation's chain.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Identifier of a block in the document.
pub type BlockId = String;

/// Current anchor encoding version.
pub const ANCHOR_ENCODING_V1: &str = "v1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnchorError {
    #[error("Anchors resolve to different blocks: {start} vs {end}")]
    CrossBlock { start: BlockId, end: BlockId },

    #[error("Inverted span in {block_id}: start {start} > end {end}")]
    Inverted {
        block_id: BlockId,
        start: usize,
        end: usize,
    },

    #[error("Unsupported anchor encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("Corrupt anchor: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, AnchorError>;

/// A position inside a block's current text, independent of edits elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StableAnchor {
    pub block_id: BlockId,
    pub offset: usize,
}

impl StableAnchor {
    pub fn new(block_id: impl Into<BlockId>, offset: usize) -> Self {
        Self {
            block_id: block_id.into(),
            offset,
        }
    }
}

/// Result of resolving an anchor against the live block set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved { block_id: BlockId, offset: usize },
    /// The anchor's block no longer exists. The owning annotation becomes orphaned.
    Missing { block_id: BlockId },
}

impl Resolution {
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing { .. })
    }
}

/// Resolve an anchor. Pure: only consults whether the block still exists.
pub fn resolve(anchor: &StableAnchor, block_exists: impl Fn(&str) -> bool) -> Resolution {
    if block_exists(&anchor.block_id) {
        Resolution::Resolved {
            block_id: anchor.block_id.clone(),
            offset: anchor.offset,
        }
    } else {
        Resolution::Missing {
            block_id: anchor.block_id.clone(),
        }
    }
}

/// A contiguous `[start, end)` range within one block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub block_id: BlockId,
    pub start: usize,
    pub end: usize,
}

impl Span {
    /// Build a single-block span from two anchors.
    pub fn from_anchors(start: &StableAnchor, end: &StableAnchor) -> Result<Self> {
        if start.block_id != end.block_id {
            return Err(AnchorError::CrossBlock {
                start: start.block_id.clone(),
                end: end.block_id.clone(),
            });
        }
        Self::new(start.block_id.clone(), start.offset, end.offset)
    }

    pub fn new(block_id: impl Into<BlockId>, start: usize, end: usize) -> Result<Self> {
        let block_id = block_id.into();
        if start > end {
            return Err(AnchorError::Inverted {
                block_id,
                start,
                end,
            });
        }
        Ok(Self {
            block_id,
            start,
            end,
        })
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn start_anchor(&self) -> StableAnchor {
        StableAnchor::new(self.block_id.clone(), self.start)
    }

    pub fn end_anchor(&self) -> StableAnchor {
        StableAnchor::new(self.block_id.clone(), self.end)
    }
}

/// Encode an anchor with the `v1` encoding: `v1.<hex block id>.<offset>.<checksum>`.
pub fn encode_anchor(anchor: &StableAnchor) -> String {
    let body = format!("{}.{}", hex::encode(anchor.block_id.as_bytes()), anchor.offset);
    format!("{ANCHOR_ENCODING_V1}.{body}.{}", checksum(&body))
}

/// Decode an anchor produced by [`encode_anchor`].
pub fn decode_anchor(encoded: &str) -> Result<StableAnchor> {
    let mut parts = encoded.split('.');
    let version = parts.next().unwrap_or_default();
    if version != ANCHOR_ENCODING_V1 {
        return Err(AnchorError::UnsupportedEncoding(version.to_string()));
    }

    let (Some(block_hex), Some(offset), Some(sum), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AnchorError::Corrupt(encoded.to_string()));
    };

    let body = format!("{block_hex}.{offset}");
    if checksum(&body) != sum {
        return Err(AnchorError::Corrupt("checksum mismatch".to_string()));
    }

    let block_bytes = hex::decode(block_hex).map_err(|e| AnchorError::Corrupt(e.to_string()))?;
    let block_id = String::from_utf8(block_bytes).map_err(|e| AnchorError::Corrupt(e.to_string()))?;
    let offset = offset
        .parse::<usize>()
        .map_err(|e| AnchorError::Corrupt(e.to_string()))?;

    Ok(StableAnchor { block_id, offset })
}

fn checksum(body: &str) -> String {
    let digest = Sha256::digest(body.as_bytes());
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Resolution ====================

    #[test]
    fn test_resolve_existing_block() {
        let anchor = StableAnchor::new("b1", 4);
        let resolved = resolve(&anchor, |id| id == "b1");
        assert_eq!(
            resolved,
            Resolution::Resolved {
                block_id: "b1".into(),
                offset: 4
            }
        );
    }

    #[test]
    fn test_resolve_missing_block() {
        let anchor = StableAnchor::new("gone", 0);
        assert!(resolve(&anchor, |_| false).is_missing());
    }

    // ==================== Spans ====================

    #[test]
    fn test_span_from_same_block_anchors() {
        let span = Span::from_anchors(&StableAnchor::new("b1", 2), &StableAnchor::new("b1", 7)).unwrap();
        assert_eq!(span.len(), 5);
        assert_eq!(span.start_anchor(), StableAnchor::new("b1", 2));
    }

    #[test]
    fn test_span_rejects_cross_block_anchors() {
        let err = Span::from_anchors(&StableAnchor::new("b1", 0), &StableAnchor::new("b2", 3)).unwrap_err();
        assert!(matches!(err, AnchorError::CrossBlock { .. }));
    }

    #[test]
    fn test_span_rejects_inverted_range() {
        assert!(Span::new("b1", 5, 2).is_err());
        assert!(Span::new("b1", 3, 3).unwrap().is_empty());
    }

    // ==================== Encoding ====================

    #[test]
    fn test_encode_decode_anchor() {
        let anchor = StableAnchor::new("block-ü", 42);
        let encoded = encode_anchor(&anchor);
        assert!(encoded.starts_with("v1."));
        assert_eq!(decode_anchor(&encoded).unwrap(), anchor);
    }

    #[test]
    fn test_decode_rejects_tampered_anchor() {
        let encoded = encode_anchor(&StableAnchor::new("b1", 1));
        let tampered = encoded.replacen(".1.", ".2.", 1);
        assert!(matches!(decode_anchor(&tampered), Err(AnchorError::Corrupt(_))));
    }

    #[test]
    fn test_decode_rejects_other_version() {
        assert_eq!(
            decode_anchor("v2.6231.0.deadbeef"),
            Err(AnchorError::UnsupportedEncoding("v2".into()))
        );
    }
}
