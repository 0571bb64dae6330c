//! Integrity scanner: compares stored hashes against live document state.

use super::hash::{compute_chain_hash, compute_span_hash, HashResult, SpanLookup};
use crate::anchor::BlockId;
use crate::annotation::{Annotation, Chain, DisplayState, StoredState};
use crate::clock::now_ms;
use crate::dirty::{DirtyInfo, DirtyLog};
use crate::divergence::{DivergenceBanner, DivergenceReason, DivergenceTracker};
use crate::document::DocumentState;
use crate::events::{EventBus, LfccEvent};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Verified,
    /// Text under the span changed (or the span no longer fits its block).
    Mismatch,
    /// Hash could not be computed or was never captured.
    Unavailable,
    /// The span's block is gone.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChainStatus {
    Intact,
    OrderViolation {
        expected: Vec<BlockId>,
        found: Vec<BlockId>,
    },
    GapExceeded {
        after: BlockId,
        before: BlockId,
        intervening: usize,
        max: usize,
    },
    MissingBlock {
        block_id: BlockId,
    },
    HashMismatch {
        expected: Option<String>,
        actual: String,
    },
}

impl ChainStatus {
    pub fn is_intact(&self) -> bool {
        matches!(self, Self::Intact)
    }
}

/// Latest scan result for one annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationScan {
    pub annotation_id: String,
    /// `(span_id, status)` in span order.
    pub spans: Vec<(String, SpanStatus)>,
    pub chain: ChainStatus,
    pub mode: ScanMode,
}

impl AnnotationScan {
    pub fn all_spans_missing(&self) -> bool {
        !self.spans.is_empty() && self.spans.iter().all(|(_, s)| *s == SpanStatus::Missing)
    }

    pub fn verified(&self) -> bool {
        self.spans.iter().all(|(_, s)| *s == SpanStatus::Verified) && self.chain.is_intact()
    }

    fn verified_count(&self) -> usize {
        self.spans
            .iter()
            .filter(|(_, s)| *s == SpanStatus::Verified)
            .count()
    }
}

/// Derive the UI state from the stored state and the latest scan.
pub fn derive_display_state(stored: StoredState, scan: Option<&AnnotationScan>) -> DisplayState {
    if stored != StoredState::Active {
        return DisplayState::Orphan;
    }
    let Some(scan) = scan else {
        return DisplayState::ActiveUnverified;
    };
    if scan.all_spans_missing() {
        return DisplayState::Orphan;
    }
    if scan.verified() {
        return DisplayState::Active;
    }
    if scan.verified_count() > 0 {
        DisplayState::ActivePartial
    } else {
        DisplayState::ActiveUnverified
    }
}

/// One mismatch found during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MismatchKind {
    SpanHash {
        #[serde(rename = "spanId")]
        span_id: String,
        #[serde(rename = "blockId")]
        block_id: BlockId,
        expected: Option<String>,
        actual: Option<String>,
    },
    SpanMissing {
        #[serde(rename = "spanId")]
        span_id: String,
        #[serde(rename = "blockId")]
        block_id: BlockId,
    },
    Chain { chain: ChainStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mismatch {
    pub annotation_id: String,
    #[serde(flatten)]
    pub kind: MismatchKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub mode: ScanMode,
    pub ok: bool,
    pub failure_count: usize,
    pub scanned: usize,
    pub report: Vec<Mismatch>,
    /// Annotations whose blocks are all gone; the caller should persist
    /// `StoredState::Orphan` for them.
    pub orphaned: Vec<String>,
}

/// Scans annotations and keeps the latest result per annotation.
pub struct IntegrityScanner {
    results: HashMap<String, AnnotationScan>,
    dirty_log: DirtyLog,
    divergence: DivergenceTracker,
    banner: Option<DivergenceBanner>,
    events: Option<Arc<EventBus>>,
}

impl Default for IntegrityScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl IntegrityScanner {
    pub fn new() -> Self {
        Self {
            results: HashMap::new(),
            dirty_log: DirtyLog::default(),
            divergence: DivergenceTracker::default(),
            banner: None,
            events: None,
        }
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_dirty_log(mut self, dirty_log: DirtyLog) -> Self {
        self.dirty_log = dirty_log;
        self
    }

    /// Rescan every annotation. The result replaces all earlier results.
    pub fn scan_full<D: DocumentState + ?Sized>(&mut self, doc: &D) -> ScanSummary {
        let annotations = doc.annotations();
        let order = doc.block_order();
        let positions = positions(&order);

        self.results.clear();
        let summary = self.scan_set(doc, annotations, &positions, ScanMode::Full);

        if let Some(consecutive) = self.divergence.record(summary.ok) {
            let banner = DivergenceBanner::new(DivergenceReason::RepeatedScanFailure { consecutive });
            warn!("Integrity scans failed {} times in a row", consecutive);
            if self.banner.is_none() {
                self.emit(LfccEvent::DivergenceDetected {
                    banner: banner.clone(),
                    timestamp: now_ms(),
                });
            }
            self.banner = Some(banner);
        } else if summary.ok {
            self.banner = None;
        }
        summary
    }

    /// Rescan the annotations affected by one edit batch.
    ///
    /// Structural edits also rescan every multi-block annotation, since a block
    /// inserted or moved elsewhere can break a chain it never touched.
    pub fn scan_incremental<D: DocumentState + ?Sized>(
        &mut self,
        doc: &D,
        dirty: DirtyInfo,
    ) -> ScanSummary {
        let affected = dirty.affected_blocks();
        let structural = dirty.has_structural_change();
        self.dirty_log.push(dirty);

        let annotations: Vec<Annotation> = if structural {
            doc.annotations()
                .into_iter()
                .filter(|a| a.is_multi_block() || affected.iter().any(|b| a.touches_block(b)))
                .collect()
        } else {
            doc.annotations_in_blocks(&affected)
        };

        let order = doc.block_order();
        let positions = positions(&order);
        self.scan_set(doc, annotations, &positions, ScanMode::Incremental)
    }

    fn scan_set<D: DocumentState + ?Sized>(
        &mut self,
        doc: &D,
        mut annotations: Vec<Annotation>,
        positions: &HashMap<&str, usize>,
        mode: ScanMode,
    ) -> ScanSummary {
        annotations.sort_by(|a, b| a.id.cmp(&b.id));

        let mut report = Vec::new();
        let mut orphaned = Vec::new();
        let mut scanned = 0;

        for annotation in annotations.iter().filter(|a| !a.is_deleted()) {
            let scan = scan_annotation(doc, annotation, positions, mode, &mut report);
            if annotation.stored_state == StoredState::Active && scan.all_spans_missing() {
                orphaned.push(annotation.id.clone());
            }
            self.results.insert(annotation.id.clone(), scan);
            scanned += 1;
        }

        let summary = ScanSummary {
            mode,
            ok: report.is_empty(),
            failure_count: report.len(),
            scanned,
            report,
            orphaned,
        };
        debug!(
            "{:?} scan: {} annotations, {} failures",
            mode, summary.scanned, summary.failure_count
        );
        self.emit(LfccEvent::ScanCompleted {
            mode,
            ok: summary.ok,
            failure_count: summary.failure_count,
            timestamp: now_ms(),
        });
        summary
    }

    pub fn result(&self, annotation_id: &str) -> Option<&AnnotationScan> {
        self.results.get(annotation_id)
    }

    /// Current display state of `annotation`.
    pub fn display_state(&self, annotation: &Annotation) -> DisplayState {
        derive_display_state(annotation.stored_state, self.results.get(&annotation.id))
    }

    /// Whether the last scan of `annotation_id` confirmed every stored hash.
    pub fn is_verified(&self, annotation_id: &str) -> bool {
        self.results.get(annotation_id).is_some_and(AnnotationScan::verified)
    }

    /// Copy scan outcomes into each annotation's `verified` flag.
    pub fn apply_verification(&self, annotations: &mut [Annotation]) {
        for annotation in annotations {
            annotation.verified = self.is_verified(&annotation.id);
        }
    }

    /// Display states of all scanned annotations, by id.
    pub fn display_states(&self, annotations: &[Annotation]) -> BTreeMap<String, DisplayState> {
        annotations
            .iter()
            .map(|a| (a.id.clone(), self.display_state(a)))
            .collect()
    }

    pub fn dirty_log(&self) -> &DirtyLog {
        &self.dirty_log
    }

    /// Banner to show while scans keep failing.
    pub fn divergence_banner(&self) -> Option<&DivergenceBanner> {
        self.banner.as_ref()
    }

    /// Forget all results, e.g. after the document was reloaded.
    pub fn reset(&mut self) {
        self.results.clear();
        self.divergence.reset();
        self.banner = None;
    }

    fn emit(&self, event: LfccEvent) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }
}

fn positions(order: &[BlockId]) -> HashMap<&str, usize> {
    order
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect()
}

fn scan_annotation<D: DocumentState + ?Sized>(
    doc: &D,
    annotation: &Annotation,
    positions: &HashMap<&str, usize>,
    mode: ScanMode,
    report: &mut Vec<Mismatch>,
) -> AnnotationScan {
    let mut spans = Vec::with_capacity(annotation.spans.len());

    for span in &annotation.spans {
        let lookup = if positions.contains_key(span.block_id()) {
            compute_span_hash(doc, span)
        } else {
            SpanLookup::BlockMissing
        };

        let status = match lookup {
            SpanLookup::BlockMissing => {
                report.push(Mismatch {
                    annotation_id: annotation.id.clone(),
                    kind: MismatchKind::SpanMissing {
                        span_id: span.span_id.clone(),
                        block_id: span.block_id().to_string(),
                    },
                });
                SpanStatus::Missing
            }
            lookup => {
                let actual = match &lookup {
                    SpanLookup::Present(HashResult::Ok(hash)) => Some(hash.clone()),
                    _ => None,
                };
                let status = match (&span.context_hash, &actual, &lookup) {
                    (Some(expected), Some(actual), _) if expected == actual => SpanStatus::Verified,
                    (_, _, SpanLookup::OutOfRange) => SpanStatus::Mismatch,
                    (Some(_), Some(_), _) => SpanStatus::Mismatch,
                    _ => SpanStatus::Unavailable,
                };
                if status != SpanStatus::Verified {
                    report.push(Mismatch {
                        annotation_id: annotation.id.clone(),
                        kind: MismatchKind::SpanHash {
                            span_id: span.span_id.clone(),
                            block_id: span.block_id().to_string(),
                            expected: span.context_hash.clone(),
                            actual,
                        },
                    });
                }
                status
            }
        };
        spans.push((span.span_id.clone(), status));
    }

    let chain = check_chain(annotation, positions);
    if !chain.is_intact() {
        report.push(Mismatch {
            annotation_id: annotation.id.clone(),
            kind: MismatchKind::Chain {
                chain: chain.clone(),
            },
        });
    }

    AnnotationScan {
        annotation_id: annotation.id.clone(),
        spans,
        chain,
        mode,
    }
}

fn check_chain(annotation: &Annotation, positions: &HashMap<&str, usize>) -> ChainStatus {
    let actual = compute_chain_hash(annotation);
    if annotation.chain.chain_hash.as_deref() != Some(actual.as_str()) {
        return ChainStatus::HashMismatch {
            expected: annotation.chain.chain_hash.clone(),
            actual,
        };
    }
    check_chain_structure(&annotation.chain, positions)
}

/// Order and gap checks against current block positions.
pub fn check_chain_structure(chain: &Chain, positions: &HashMap<&str, usize>) -> ChainStatus {
    let mut located = Vec::with_capacity(chain.order.len());
    for block_id in &chain.order {
        match positions.get(block_id.as_str()) {
            Some(&pos) => located.push((pos, block_id)),
            None => {
                return ChainStatus::MissingBlock {
                    block_id: block_id.clone(),
                };
            }
        }
    }

    if chain.policy.kind.enforces_order()
        && located.windows(2).any(|pair| pair[1].0 <= pair[0].0)
    {
        let mut found = located.clone();
        found.sort_by_key(|(pos, _)| *pos);
        return ChainStatus::OrderViolation {
            expected: chain.order.clone(),
            found: found.into_iter().map(|(_, id)| id.clone()).collect(),
        };
    }

    let mut sorted = located;
    sorted.sort_by_key(|(pos, _)| *pos);
    let max = chain.policy.gap_limit();
    let distinct: BTreeSet<usize> = sorted.iter().map(|(pos, _)| *pos).collect();
    if distinct.len() != sorted.len() {
        // The same block listed twice can never satisfy an ordering.
        return ChainStatus::OrderViolation {
            expected: chain.order.clone(),
            found: sorted.into_iter().map(|(_, id)| id.clone()).collect(),
        };
    }
    for pair in sorted.windows(2) {
        let intervening = pair[1].0 - pair[0].0 - 1;
        if intervening > max {
            return ChainStatus::GapExceeded {
                after: pair[0].1.clone(),
                before: pair[1].1.clone(),
                intervening,
                max,
            };
        }
    }
    ChainStatus::Intact
}
