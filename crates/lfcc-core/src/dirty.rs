//! Dirty-info: compact descriptions of edit batches that drive incremental scans.

use crate::anchor::BlockId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

/// Default number of dirty-info entries retained.
pub const DEFAULT_DIRTY_LOG_CAPACITY: usize = 25;

/// Kind of edit contained in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpCode {
    OpTextEdit,
    OpMarkEdit,
    OpBlockSplit,
    OpBlockJoin,
    OpBlockConvert,
    OpListReparent,
    OpTableStruct,
    OpReorder,
    OpPaste,
    OpImmutableRewrite,
}

impl OpCode {
    /// Structural ops can change block order, so they may break chains in
    /// blocks they never touched.
    pub fn is_structural(&self) -> bool {
        !matches!(self, Self::OpTextEdit | Self::OpMarkEdit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TouchedRange {
    pub block_id: BlockId,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirtyInfo {
    pub op_codes: Vec<OpCode>,
    pub touched_blocks: Vec<BlockId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub touched_ranges: Option<Vec<TouchedRange>>,
}

impl DirtyInfo {
    pub fn text_edit(block_id: impl Into<BlockId>) -> Self {
        Self {
            op_codes: vec![OpCode::OpTextEdit],
            touched_blocks: vec![block_id.into()],
            touched_ranges: None,
        }
    }

    pub fn structural(op: OpCode, touched_blocks: Vec<BlockId>) -> Self {
        Self {
            op_codes: vec![op],
            touched_blocks,
            touched_ranges: None,
        }
    }

    pub fn has_structural_change(&self) -> bool {
        self.op_codes.iter().any(OpCode::is_structural)
    }

    /// All blocks named by `touched_blocks` or `touched_ranges`.
    pub fn affected_blocks(&self) -> BTreeSet<BlockId> {
        let mut blocks: BTreeSet<BlockId> = self.touched_blocks.iter().cloned().collect();
        if let Some(ranges) = &self.touched_ranges {
            blocks.extend(ranges.iter().map(|r| r.block_id.clone()));
        }
        blocks
    }
}

/// Bounded history of dirty-info entries, oldest dropped first.
#[derive(Debug, Clone)]
pub struct DirtyLog {
    entries: VecDeque<DirtyInfo>,
    capacity: usize,
}

impl Default for DirtyLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_DIRTY_LOG_CAPACITY)
    }
}

impl DirtyLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, info: DirtyInfo) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(info);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirtyInfo> {
        self.entries.iter()
    }
}
