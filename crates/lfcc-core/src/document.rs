//! BlockDocument: Loro document wrapper for block-structured text with annotations.
//!
//! Each document is represented as a Loro document with:
//! - `order`: LoroList of block ids (document order)
//! - `blocks`: LoroMap of block id -> LoroText
//! - `annotations`: LoroMap of annotation id -> JSON-encoded [`Annotation`]
//!
//! [`DocumentState`] is the read contract the integrity scanner works against. The
//! editor view is expected to provide its own implementation; `BlockDocument` is the
//! CRDT-backed one.

use crate::anchor::{BlockId, Span};
use crate::annotation::{Annotation, StoredState};
use crate::crdt::{CrdtRuntime, FrontierTag, LoroRuntime};
use loro::{Container, LoroList, LoroMap, LoroText, LoroValue, ValueOrContainer};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Loro error: {0}")]
    Loro(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Block not found: {0}")]
    BlockNotFound(BlockId),

    #[error("Block already exists: {0}")]
    BlockExists(BlockId),

    #[error("Range {start}..{end} out of bounds for block {block_id} (len {len})")]
    OutOfRange {
        block_id: BlockId,
        start: usize,
        end: usize,
        len: usize,
    },
}

pub type Result<T> = std::result::Result<T, DocumentError>;

/// Read access to live document state, as needed by the integrity scanner.
pub trait DocumentState {
    /// All annotations, including deleted ones.
    fn annotations(&self) -> Vec<Annotation>;

    /// Annotations touching any of `blocks`.
    fn annotations_in_blocks(&self, blocks: &BTreeSet<BlockId>) -> Vec<Annotation> {
        self.annotations()
            .into_iter()
            .filter(|a| blocks.iter().any(|b| a.touches_block(b)))
            .collect()
    }

    /// Text covered by `span`. `Ok(None)` means the block no longer exists.
    fn span_text(&self, span: &Span) -> Result<Option<String>>;

    /// Block ids in document order.
    fn block_order(&self) -> Vec<BlockId>;

    fn block_exists(&self, block_id: &str) -> bool {
        self.block_order().iter().any(|b| b == block_id)
    }
}

/// A block-structured document stored in a Loro document.
pub struct BlockDocument {
    runtime: LoroRuntime,
}

impl Default for BlockDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDocument {
    pub fn new() -> Self {
        Self {
            runtime: LoroRuntime::new(),
        }
    }

    /// Wrap an existing runtime (e.g. one loaded from a snapshot).
    pub fn from_runtime(runtime: LoroRuntime) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &LoroRuntime {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut LoroRuntime {
        &mut self.runtime
    }

    /// Frontier tag of the underlying CRDT document.
    pub fn frontier_tag(&self) -> FrontierTag {
        self.runtime.frontier_tag()
    }

    fn order(&self) -> LoroList {
        self.runtime.doc().get_list("order")
    }

    fn blocks(&self) -> LoroMap {
        self.runtime.doc().get_map("blocks")
    }

    fn annotation_map(&self) -> LoroMap {
        self.runtime.doc().get_map("annotations")
    }

    /// Commit pending changes
    pub fn commit(&self) {
        self.runtime.doc().commit();
    }

    pub fn block_count(&self) -> usize {
        self.order().len()
    }

    fn text_of(&self, block_id: &str) -> Option<LoroText> {
        match self.blocks().get(block_id) {
            Some(ValueOrContainer::Container(Container::Text(text))) => Some(text),
            _ => None,
        }
    }

    fn position_of(&self, block_id: &str) -> Option<usize> {
        self.block_order().iter().position(|b| b == block_id)
    }

    /// Insert a block at `index` in document order.
    pub fn insert_block(&self, index: usize, block_id: &str, text: &str) -> Result<()> {
        if self.position_of(block_id).is_some() {
            return Err(DocumentError::BlockExists(block_id.to_string()));
        }
        let index = index.min(self.block_count());

        let content = self
            .blocks()
            .get_or_create_container(block_id, LoroText::new())
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        if !text.is_empty() {
            content
                .insert(0, text)
                .map_err(|e| DocumentError::Loro(e.to_string()))?;
        }
        self.order()
            .insert(index, block_id)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.commit();
        Ok(())
    }

    pub fn append_block(&self, block_id: &str, text: &str) -> Result<()> {
        self.insert_block(self.block_count(), block_id, text)
    }

    /// Remove a block and its text.
    pub fn delete_block(&self, block_id: &str) -> Result<()> {
        let index = self
            .position_of(block_id)
            .ok_or_else(|| DocumentError::BlockNotFound(block_id.to_string()))?;
        self.order()
            .delete(index, 1)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.blocks()
            .delete(block_id)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.commit();
        Ok(())
    }

    /// Move a block to `new_index` in document order.
    pub fn move_block(&self, block_id: &str, new_index: usize) -> Result<()> {
        let index = self
            .position_of(block_id)
            .ok_or_else(|| DocumentError::BlockNotFound(block_id.to_string()))?;
        let order = self.order();
        order
            .delete(index, 1)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        order
            .insert(new_index.min(order.len()), block_id)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.commit();
        Ok(())
    }

    /// Insert `text` at character offset `pos` inside a block.
    pub fn insert_text(&self, block_id: &str, pos: usize, text: &str) -> Result<()> {
        let content = self
            .text_of(block_id)
            .ok_or_else(|| DocumentError::BlockNotFound(block_id.to_string()))?;
        content
            .insert(pos, text)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.commit();
        Ok(())
    }

    /// Delete `len` characters at `pos` inside a block.
    pub fn delete_text(&self, block_id: &str, pos: usize, len: usize) -> Result<()> {
        let content = self
            .text_of(block_id)
            .ok_or_else(|| DocumentError::BlockNotFound(block_id.to_string()))?;
        content
            .delete(pos, len)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.commit();
        Ok(())
    }

    pub fn block_text(&self, block_id: &str) -> Option<String> {
        self.text_of(block_id).map(|t| t.to_string())
    }

    /// Store (or replace) an annotation record.
    pub fn put_annotation(&self, annotation: &Annotation) -> Result<()> {
        let json = serde_json::to_string(annotation)
            .map_err(|e| DocumentError::Serialization(e.to_string()))?;
        self.annotation_map()
            .insert(&annotation.id, json)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.commit();
        Ok(())
    }

    pub fn annotation(&self, id: &str) -> Option<Annotation> {
        self.annotations().into_iter().find(|a| a.id == id)
    }

    /// Transition an annotation's persisted lifecycle state.
    ///
    /// Deletion is soft: the record stays in the document.
    pub fn set_stored_state(&self, id: &str, state: StoredState) -> Result<bool> {
        let Some(mut annotation) = self.annotation(id) else {
            return Ok(false);
        };
        if annotation.stored_state == state {
            return Ok(false);
        }
        annotation.stored_state = state;
        self.put_annotation(&annotation)?;
        Ok(true)
    }
}

impl DocumentState for BlockDocument {
    fn annotations(&self) -> Vec<Annotation> {
        let LoroValue::Map(map) = self.annotation_map().get_deep_value() else {
            return Vec::new();
        };

        let mut annotations: Vec<Annotation> = map
            .iter()
            .filter_map(|(key, value)| match value {
                LoroValue::String(json) => match serde_json::from_str::<Annotation>(json) {
                    Ok(annotation) => Some(annotation),
                    Err(e) => {
                        warn!("Skipping unreadable annotation record {}: {}", key, e);
                        None
                    }
                },
                _ => {
                    warn!("Skipping non-string annotation record {}", key);
                    None
                }
            })
            .collect();
        annotations.sort_by(|a, b| a.id.cmp(&b.id));
        annotations
    }

    fn span_text(&self, span: &Span) -> Result<Option<String>> {
        if self.position_of(&span.block_id).is_none() {
            return Ok(None);
        }
        let Some(text) = self.block_text(&span.block_id) else {
            return Ok(None);
        };

        let len = text.chars().count();
        if span.end > len {
            return Err(DocumentError::OutOfRange {
                block_id: span.block_id.clone(),
                start: span.start,
                end: span.end,
                len,
            });
        }
        Ok(Some(text.chars().skip(span.start).take(span.len()).collect()))
    }

    fn block_order(&self) -> Vec<BlockId> {
        match self.order().get_value() {
            LoroValue::List(list) => list
                .iter()
                .filter_map(|v| match v {
                    LoroValue::String(s) => Some(s.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{AnnotatedSpan, ChainPolicy};

    fn doc_with_blocks() -> BlockDocument {
        let doc = BlockDocument::new();
        doc.append_block("b1", "Hello world").unwrap();
        doc.append_block("b3", "Goodbye moon").unwrap();
        doc
    }

    #[test]
    fn test_new_document_is_empty() {
        let doc = BlockDocument::new();
        assert_eq!(doc.block_count(), 0);
        assert!(doc.annotations().is_empty());
    }

    #[test]
    fn test_block_order_and_insert() {
        let doc = doc_with_blocks();
        doc.insert_block(1, "b2", "middle").unwrap();
        assert_eq!(doc.block_order(), vec!["b1", "b2", "b3"]);
        assert!(doc.block_exists("b2"));
        assert!(matches!(
            doc.insert_block(0, "b2", "dup"),
            Err(DocumentError::BlockExists(_))
        ));
    }

    #[test]
    fn test_span_text() {
        let doc = doc_with_blocks();
        let span = Span::new("b1", 6, 11).unwrap();
        assert_eq!(doc.span_text(&span).unwrap(), Some("world".to_string()));

        let missing = Span::new("nope", 0, 1).unwrap();
        assert_eq!(doc.span_text(&missing).unwrap(), None);

        let too_long = Span::new("b1", 0, 99).unwrap();
        assert!(matches!(
            doc.span_text(&too_long),
            Err(DocumentError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_text_edits() {
        let doc = doc_with_blocks();
        doc.insert_text("b1", 5, ",").unwrap();
        doc.delete_text("b3", 0, 8).unwrap();
        assert_eq!(doc.block_text("b1").as_deref(), Some("Hello, world"));
        assert_eq!(doc.block_text("b3").as_deref(), Some("moon"));
    }

    #[test]
    fn test_delete_and_move_block() {
        let doc = doc_with_blocks();
        doc.append_block("b4", "tail").unwrap();
        doc.move_block("b4", 0).unwrap();
        assert_eq!(doc.block_order(), vec!["b4", "b1", "b3"]);

        doc.delete_block("b1").unwrap();
        assert_eq!(doc.block_order(), vec!["b4", "b3"]);
        assert!(doc.block_text("b1").is_none());
    }

    #[test]
    fn test_annotation_records() {
        let doc = doc_with_blocks();
        let ann = Annotation::new(
            "a1",
            vec![AnnotatedSpan::new("s1", Span::new("b1", 0, 5).unwrap())],
            ChainPolicy::required_order(0),
        )
        .with_content("greeting");
        doc.put_annotation(&ann).unwrap();

        assert_eq!(doc.annotation("a1"), Some(ann));
        assert!(doc.set_stored_state("a1", StoredState::Orphan).unwrap());
        assert!(!doc.set_stored_state("a1", StoredState::Orphan).unwrap());
        assert_eq!(doc.annotation("a1").unwrap().stored_state, StoredState::Orphan);

        let in_b3: BTreeSet<BlockId> = ["b3".to_string()].into_iter().collect();
        assert!(doc.annotations_in_blocks(&in_b3).is_empty());
    }

    #[test]
    fn test_sync_between_documents() {
        let doc1 = doc_with_blocks();
        let mut doc2 = BlockDocument::new();

        let snapshot = doc1.runtime().export_snapshot().unwrap();
        doc2.runtime_mut().import(&snapshot).unwrap();

        assert_eq!(doc2.block_order(), vec!["b1", "b3"]);
        assert_eq!(doc2.block_text("b3").as_deref(), Some("Goodbye moon"));
        assert_eq!(doc2.frontier_tag(), doc1.frontier_tag());
    }
}
