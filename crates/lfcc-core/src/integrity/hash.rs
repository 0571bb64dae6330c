//! Context and chain hashes.
//!
//! Both hashes are SHA-256 over a canonical, length-prefixed encoding so that
//! field boundaries can never be confused (`"ab" + "c"` vs `"a" + "bc"`).

use crate::anchor::BlockId;
use crate::annotation::{AnnotatedSpan, Annotation, ChainPolicyKind};
use crate::document::{DocumentError, DocumentState};
use sha2::{Digest, Sha256};
use tracing::warn;

const SPAN_DOMAIN: &str = "LFCC_SPAN_V1";
const CHAIN_DOMAIN: &str = "LFCC_CHAIN_V1";

/// Outcome of computing a hash against live document state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashResult {
    Ok(String),
    /// The hash could not be computed; callers must fail closed.
    Unavailable,
}

impl HashResult {
    pub fn as_deref(&self) -> Option<&str> {
        match self {
            Self::Ok(hash) => Some(hash),
            Self::Unavailable => None,
        }
    }
}

/// What a span's block currently looks like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanLookup {
    /// The block exists; the hash may still be unavailable.
    Present(HashResult),
    /// The span no longer fits inside its block.
    OutOfRange,
    BlockMissing,
}

struct Canonical(Sha256);

impl Canonical {
    fn new(domain: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain.as_bytes());
        hasher.update(b"\n");
        Self(hasher)
    }

    fn field(&mut self, key: &str, value: &str) -> &mut Self {
        self.0
            .update(format!("{key}={}:", value.len()).as_bytes());
        self.0.update(value.as_bytes());
        self.0.update(b"\n");
        self
    }

    fn finish(self) -> String {
        hex::encode(self.0.finalize())
    }
}

/// Hash binding a span's id, its block and the text it covers.
pub fn context_hash(span_id: &str, block_id: &str, text: &str) -> String {
    let mut canonical = Canonical::new(SPAN_DOMAIN);
    canonical
        .field("span_id", span_id)
        .field("block_id", block_id)
        .field("text", text);
    canonical.finish()
}

/// Hash binding a chain's policy to its declared block order.
pub fn chain_hash(kind: ChainPolicyKind, max_intervening_blocks: usize, order: &[BlockId]) -> String {
    let mut canonical = Canonical::new(CHAIN_DOMAIN);
    canonical
        .field("policy_kind", kind.as_str())
        .field("max_intervening_blocks", &max_intervening_blocks.to_string())
        .field("block_count", &order.len().to_string());
    for block_id in order {
        canonical.field("block_id", block_id);
    }
    canonical.finish()
}

/// Compute the current context hash of `span` against `doc`.
pub fn compute_span_hash<D: DocumentState + ?Sized>(doc: &D, span: &AnnotatedSpan) -> SpanLookup {
    match doc.span_text(&span.span) {
        Ok(Some(text)) => SpanLookup::Present(HashResult::Ok(context_hash(
            &span.span_id,
            span.block_id(),
            &text,
        ))),
        Ok(None) => SpanLookup::BlockMissing,
        Err(DocumentError::OutOfRange { .. }) => SpanLookup::OutOfRange,
        Err(e) => {
            warn!("Context hash unavailable for span {}: {}", span.span_id, e);
            SpanLookup::Present(HashResult::Unavailable)
        }
    }
}

/// Chain hash of the annotation's declared chain.
pub fn compute_chain_hash(annotation: &Annotation) -> String {
    let chain = &annotation.chain;
    chain_hash(chain.policy.kind, chain.policy.max_intervening_blocks, &chain.order)
}

/// Capture current hashes into the annotation.
///
/// Returns `false` if any span could not be hashed; such spans keep no hash and
/// will never verify until sealed again.
pub fn seal_annotation<D: DocumentState + ?Sized>(annotation: &mut Annotation, doc: &D) -> bool {
    let mut complete = true;
    for span in &mut annotation.spans {
        span.context_hash = match compute_span_hash(doc, span) {
            SpanLookup::Present(HashResult::Ok(hash)) => Some(hash),
            _ => {
                complete = false;
                None
            }
        };
    }
    annotation.chain.chain_hash = Some(compute_chain_hash(annotation));
    complete
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::Span;
    use crate::annotation::ChainPolicy;
    use crate::document::BlockDocument;

    #[test]
    fn test_context_hash_deterministic() {
        assert_eq!(context_hash("s1", "b1", "hello"), context_hash("s1", "b1", "hello"));
        assert_eq!(context_hash("s1", "b1", "hello").len(), 64);
    }

    #[test]
    fn test_context_hash_field_boundaries() {
        assert_ne!(context_hash("ab", "c", "x"), context_hash("a", "bc", "x"));
        assert_ne!(context_hash("s1", "b1", "hello"), context_hash("s1", "b2", "hello"));
    }

    #[test]
    fn test_chain_hash_depends_on_order_and_policy() {
        let order = vec!["b1".to_string(), "b2".to_string()];
        let reversed = vec!["b2".to_string(), "b1".to_string()];
        let base = chain_hash(ChainPolicyKind::RequiredOrder, 0, &order);
        assert_ne!(base, chain_hash(ChainPolicyKind::RequiredOrder, 0, &reversed));
        assert_ne!(base, chain_hash(ChainPolicyKind::RequiredOrder, 1, &order));
        assert_ne!(base, chain_hash(ChainPolicyKind::BoundedGap, 0, &order));
    }

    #[test]
    fn test_compute_span_hash_lookup() {
        let doc = BlockDocument::new();
        doc.append_block("b1", "hello world").unwrap();
        doc.commit();

        let present = AnnotatedSpan::new("s1", Span::new("b1", 0, 5).unwrap());
        assert_eq!(
            compute_span_hash(&doc, &present),
            SpanLookup::Present(HashResult::Ok(context_hash("s1", "b1", "hello")))
        );

        let missing = AnnotatedSpan::new("s2", Span::new("gone", 0, 1).unwrap());
        assert_eq!(compute_span_hash(&doc, &missing), SpanLookup::BlockMissing);

        let too_long = AnnotatedSpan::new("s3", Span::new("b1", 0, 50).unwrap());
        assert_eq!(compute_span_hash(&doc, &too_long), SpanLookup::OutOfRange);
    }

    #[test]
    fn test_seal_annotation() {
        let doc = BlockDocument::new();
        doc.append_block("b1", "hello").unwrap();
        doc.commit();

        let mut annotation = Annotation::new(
            "a1",
            vec![AnnotatedSpan::new("s1", Span::new("b1", 1, 4).unwrap())],
            ChainPolicy::strict_adjacency(),
        );
        assert!(seal_annotation(&mut annotation, &doc));
        assert_eq!(
            annotation.spans[0].context_hash.as_deref(),
            Some(context_hash("s1", "b1", "ell").as_str())
        );
        assert!(annotation.chain.chain_hash.is_some());
    }
}
