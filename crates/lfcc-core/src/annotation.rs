//! Annotation model: spans, chains and lifecycle states.
//!
//! `StoredState` is persisted. `DisplayState` is always derived from the stored
//! state plus the latest integrity scan (see [`crate::integrity`]) and is never
//! written back as ground truth.

use crate::anchor::{BlockId, Span};
use serde::{Deserialize, Serialize};

/// Ordering constraint kind for a multi-block annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainPolicyKind {
    /// Declared order, no intervening blocks at all.
    StrictAdjacency,
    /// Declared order, at most `max_intervening_blocks` between neighbours.
    RequiredOrder,
    /// Gaps bounded by `max_intervening_blocks`, order not enforced.
    BoundedGap,
}

impl ChainPolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StrictAdjacency => "strict_adjacency",
            Self::RequiredOrder => "required_order",
            Self::BoundedGap => "bounded_gap",
        }
    }

    pub fn enforces_order(&self) -> bool {
        !matches!(self, Self::BoundedGap)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainPolicy {
    pub kind: ChainPolicyKind,
    pub max_intervening_blocks: usize,
}

impl ChainPolicy {
    pub fn required_order(max_intervening_blocks: usize) -> Self {
        Self {
            kind: ChainPolicyKind::RequiredOrder,
            max_intervening_blocks,
        }
    }

    pub fn strict_adjacency() -> Self {
        Self {
            kind: ChainPolicyKind::StrictAdjacency,
            max_intervening_blocks: 0,
        }
    }

    /// Effective gap limit (strict adjacency ignores the declared value).
    pub fn gap_limit(&self) -> usize {
        match self.kind {
            ChainPolicyKind::StrictAdjacency => 0,
            _ => self.max_intervening_blocks,
        }
    }
}

/// Structural ordering constraint over the blocks an annotation touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chain {
    pub policy: ChainPolicy,
    pub order: Vec<BlockId>,
    /// Chain hash captured when the annotation was last sealed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_hash: Option<String>,
}

/// A span owned by an annotation, with its last-known context hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotatedSpan {
    pub span_id: String,
    #[serde(flatten)]
    pub span: Span,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_hash: Option<String>,
}

impl AnnotatedSpan {
    pub fn new(span_id: impl Into<String>, span: Span) -> Self {
        Self {
            span_id: span_id.into(),
            span,
            context_hash: None,
        }
    }

    pub fn block_id(&self) -> &str {
        &self.span.block_id
    }
}

/// Persisted lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoredState {
    #[default]
    Active,
    Orphan,
    Deleted,
}

/// UI-facing state, derived at scan time.
///
/// Variants are ordered from most to least trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayState {
    Active,
    ActivePartial,
    ActiveUnverified,
    Orphan,
}

impl DisplayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::ActivePartial => "active_partial",
            Self::ActiveUnverified => "active_unverified",
            Self::Orphan => "orphan",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: String,
    pub spans: Vec<AnnotatedSpan>,
    pub chain: Chain,
    /// User payload, opaque to the engine.
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub stored_state: StoredState,
    /// Whether the last integrity scan confirmed the stored hashes.
    #[serde(default)]
    pub verified: bool,
}

impl Annotation {
    /// Create an annotation over `spans`. The chain order follows the spans' blocks.
    pub fn new(id: impl Into<String>, spans: Vec<AnnotatedSpan>, policy: ChainPolicy) -> Self {
        let mut order: Vec<BlockId> = Vec::new();
        for span in &spans {
            if order.last().map(String::as_str) != Some(span.block_id()) {
                order.push(span.span.block_id.clone());
            }
        }

        Self {
            id: id.into(),
            spans,
            chain: Chain {
                policy,
                order,
                chain_hash: None,
            },
            content: String::new(),
            color: None,
            stored_state: StoredState::Active,
            verified: false,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    /// Blocks this annotation touches, in span order, without duplicates.
    pub fn block_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for span in &self.spans {
            if !ids.contains(&span.block_id()) {
                ids.push(span.block_id());
            }
        }
        ids
    }

    pub fn touches_block(&self, block_id: &str) -> bool {
        self.spans.iter().any(|s| s.block_id() == block_id)
            || self.chain.order.iter().any(|b| b == block_id)
    }

    pub fn is_multi_block(&self) -> bool {
        self.chain.order.len() > 1
    }

    pub fn is_deleted(&self) -> bool {
        self.stored_state == StoredState::Deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(id: &str, block: &str, start: usize, end: usize) -> AnnotatedSpan {
        AnnotatedSpan::new(id, Span::new(block, start, end).unwrap())
    }

    #[test]
    fn test_chain_order_follows_spans() {
        let ann = Annotation::new(
            "a1",
            vec![span("s1", "b1", 0, 3), span("s2", "b1", 5, 6), span("s3", "b3", 0, 2)],
            ChainPolicy::required_order(0),
        );
        assert_eq!(ann.chain.order, vec!["b1".to_string(), "b3".to_string()]);
        assert!(ann.is_multi_block());
        assert_eq!(ann.block_ids(), vec!["b1", "b3"]);
    }

    #[test]
    fn test_strict_adjacency_gap_limit() {
        let mut policy = ChainPolicy::strict_adjacency();
        policy.max_intervening_blocks = 4;
        assert_eq!(policy.gap_limit(), 0);
        assert_eq!(ChainPolicy::required_order(2).gap_limit(), 2);
    }

    #[test]
    fn test_display_state_ordering() {
        assert!(DisplayState::Active < DisplayState::ActivePartial);
        assert!(DisplayState::ActivePartial < DisplayState::ActiveUnverified);
        assert!(DisplayState::ActiveUnverified < DisplayState::Orphan);
    }

    #[test]
    fn test_wire_format() {
        let ann = Annotation::new("a1", vec![span("s1", "b1", 0, 3)], ChainPolicy::required_order(0))
            .with_content("note");
        let json = serde_json::to_string(&ann).unwrap();
        assert!(json.contains("\"storedState\":\"active\""));
        assert!(json.contains("\"kind\":\"required_order\""));
        assert!(json.contains("\"maxInterveningBlocks\":0"));
        assert!(json.contains("\"blockId\":\"b1\""));

        let parsed: Annotation = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ann);
    }
}
