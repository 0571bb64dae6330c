//! Repro bundles: bounded, redacted snapshots of sync and integrity state.
//!
//! By default no document text leaves the bundle. Annotation content, span
//! text and error messages are replaced by `{size}` summaries unless the user
//! explicitly opts in with `include_content`.

use crate::annotation::{Annotation, ChainPolicyKind, DisplayState, StoredState};
use crate::compaction::UpdateRecord;
use crate::crdt::{CrdtRuntime, FrontierTag};
use crate::dirty::DirtyInfo;
use crate::divergence::DivergenceBanner;
use crate::document::{BlockDocument, DocumentState};
use crate::integrity::{derive_display_state, IntegrityScanner};
use crate::policy::PolicyManifestV09;
use crate::protocol::{ErrorCategory, ErrorCode, ErrorPayload};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

pub const REPRO_BUNDLE_VERSION: &str = "1.0.0";

/// Default capacity of [`ErrorLog`].
pub const DEFAULT_ERROR_LOG_CAPACITY: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsLimits {
    pub max_annotations: usize,
    pub max_dirty_entries: usize,
    pub max_updates: usize,
    pub max_errors: usize,
}

impl Default for DiagnosticsLimits {
    fn default() -> Self {
        Self {
            max_annotations: 50,
            max_dirty_entries: 25,
            max_updates: 20,
            max_errors: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSummary {
    /// Length in bytes of the redacted value.
    pub size: usize,
}

impl ContentSummary {
    fn of(text: &str) -> Self {
        Self { size: text.len() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanEntry {
    pub span_id: String,
    pub block_id: String,
    pub start: usize,
    pub end: usize,
    pub sealed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationEntry {
    pub id: String,
    pub chain_policy: ChainPolicyKind,
    pub block_ids: Vec<String>,
    pub spans: Vec<SpanEntry>,
    pub stored_state: StoredState,
    pub display_state: DisplayState,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_summary: Option<ContentSummary>,
}

/// Metadata of a stored update. Update bytes are never included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEntry {
    pub seq: u64,
    pub client_id: String,
    pub size_bytes: usize,
    pub frontier_tag: FrontierTag,
    pub parent_frontier_tag: FrontierTag,
    pub created_at: u64,
}

impl From<&UpdateRecord> for UpdateEntry {
    fn from(record: &UpdateRecord) -> Self {
        Self {
            seq: record.seq,
            client_id: record.client_id.clone(),
            size_bytes: record.data.len(),
            frontier_tag: record.frontier_tag.clone(),
            parent_frontier_tag: record.parent_frontier_tag.clone(),
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub at: u64,
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_summary: Option<ContentSummary>,
}

/// Recent protocol errors, oldest dropped first.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    entries: VecDeque<(u64, ErrorPayload)>,
    capacity: usize,
    dropped: usize,
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_ERROR_LOG_CAPACITY)
    }
}

impl ErrorLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn record(&mut self, at: u64, error: &ErrorPayload) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back((at, error.clone()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries evicted since creation.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u64, ErrorPayload)> {
        self.entries.iter()
    }
}

/// How many entries of each collection were left out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Omitted {
    pub annotations: usize,
    pub dirty_entries: usize,
    pub updates: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReproBundle {
    pub version: String,
    pub created_at: u64,
    pub doc_id: String,
    pub frontiers: FrontierTag,
    pub version_vector: BTreeMap<String, i32>,
    pub block_count: usize,
    pub negotiated_policy: Option<PolicyManifestV09>,
    pub include_content: bool,
    pub annotations: Vec<AnnotationEntry>,
    pub dirty_log: Vec<DirtyInfo>,
    pub updates: Vec<UpdateEntry>,
    pub errors: Vec<ErrorEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub divergence: Option<DivergenceBanner>,
    pub omitted: Omitted,
}

impl ReproBundle {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Collects the inputs of a [`ReproBundle`].
pub struct ReproBundleBuilder<'a> {
    doc_id: String,
    document: &'a BlockDocument,
    scanner: Option<&'a IntegrityScanner>,
    policy: Option<&'a PolicyManifestV09>,
    updates: &'a [UpdateRecord],
    errors: Option<&'a ErrorLog>,
    include_content: bool,
    limits: DiagnosticsLimits,
}

impl<'a> ReproBundleBuilder<'a> {
    pub fn new(doc_id: impl Into<String>, document: &'a BlockDocument) -> Self {
        Self {
            doc_id: doc_id.into(),
            document,
            scanner: None,
            policy: None,
            updates: &[],
            errors: None,
            include_content: false,
            limits: DiagnosticsLimits::default(),
        }
    }

    pub fn scanner(mut self, scanner: &'a IntegrityScanner) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn policy(mut self, policy: &'a PolicyManifestV09) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn updates(mut self, updates: &'a [UpdateRecord]) -> Self {
        self.updates = updates;
        self
    }

    pub fn errors(mut self, errors: &'a ErrorLog) -> Self {
        self.errors = Some(errors);
        self
    }

    /// Include annotation text and error messages verbatim. Only set on an explicit user request.
    pub fn include_content(mut self, include: bool) -> Self {
        self.include_content = include;
        self
    }

    pub fn limits(mut self, limits: DiagnosticsLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn build(self, now: u64) -> ReproBundle {
        let mut omitted = Omitted::default();

        let all = self.document.annotations();
        omitted.annotations = all.len().saturating_sub(self.limits.max_annotations);
        let annotations = all
            .iter()
            .take(self.limits.max_annotations)
            .map(|a| self.annotation_entry(a))
            .collect();

        let dirty_log = match self.scanner {
            Some(scanner) => {
                let log = scanner.dirty_log();
                let skip = log.len().saturating_sub(self.limits.max_dirty_entries);
                omitted.dirty_entries = skip;
                log.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        };

        // Most recent updates are the interesting ones.
        let skip = self.updates.len().saturating_sub(self.limits.max_updates);
        omitted.updates = skip;
        let updates = self.updates[skip..].iter().map(UpdateEntry::from).collect();

        let errors = match self.errors {
            Some(log) => {
                let skip = log.len().saturating_sub(self.limits.max_errors);
                omitted.errors = skip + log.dropped();
                log.iter()
                    .skip(skip)
                    .map(|(at, e)| self.error_entry(*at, e))
                    .collect()
            }
            None => Vec::new(),
        };

        let runtime = self.document.runtime();
        ReproBundle {
            version: REPRO_BUNDLE_VERSION.to_string(),
            created_at: now,
            doc_id: self.doc_id.clone(),
            frontiers: runtime.frontier_tag(),
            version_vector: runtime.version_vector(),
            block_count: self.document.block_count(),
            negotiated_policy: self.policy.cloned(),
            include_content: self.include_content,
            annotations,
            dirty_log,
            updates,
            errors,
            divergence: self.scanner.and_then(|s| s.divergence_banner().cloned()),
            omitted,
        }
    }

    fn annotation_entry(&self, annotation: &Annotation) -> AnnotationEntry {
        let (display_state, verified) = match self.scanner {
            Some(scanner) => (
                scanner.display_state(annotation),
                scanner.is_verified(&annotation.id),
            ),
            None => (
                derive_display_state(annotation.stored_state, None),
                annotation.verified,
            ),
        };
        let spans = annotation
            .spans
            .iter()
            .map(|s| SpanEntry {
                span_id: s.span_id.clone(),
                block_id: s.span.block_id.clone(),
                start: s.span.start,
                end: s.span.end,
                sealed: s.context_hash.is_some(),
                text: if self.include_content {
                    self.document.span_text(&s.span).ok().flatten()
                } else {
                    None
                },
            })
            .collect();

        let (content, content_summary) = if self.include_content {
            (Some(annotation.content.clone()), None)
        } else {
            (None, Some(ContentSummary::of(&annotation.content)))
        };

        AnnotationEntry {
            id: annotation.id.clone(),
            chain_policy: annotation.chain.policy.kind,
            block_ids: annotation.block_ids().into_iter().map(String::from).collect(),
            spans,
            stored_state: annotation.stored_state,
            display_state,
            verified,
            content,
            content_summary,
        }
    }

    fn error_entry(&self, at: u64, error: &ErrorPayload) -> ErrorEntry {
        let (message, message_summary) = if self.include_content {
            (Some(error.message.clone()), None)
        } else {
            (None, Some(ContentSummary::of(&error.message)))
        };
        ErrorEntry {
            at,
            code: error.code,
            category: error.category,
            retryable: error.retryable,
            message,
            message_summary,
        }
    }
}
