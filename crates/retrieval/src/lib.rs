//! Hybrid retrieval: three independent scorers fused by reciprocal-rank
//! fusion.
//!
//! Each scorer returns a ranked candidate list; fusion is rank-only with
//! k = 60, ties broken by most-recent timestamp. The engine degrades
//! gracefully — an empty vector index or a query without entity mentions
//! simply silences that scorer.

pub mod fusion;
pub mod graphwalk;
pub mod lexical;
pub mod semantic;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};
use uuid::Uuid;

use engram_core::assertion;
use engram_core::ingest;
use engram_extract::Embedder;
use engram_store::types::SourceKind;
use engram_store::{Database, Result, VectorIndex};

/// Candidates each scorer contributes before fusion, as a multiple of the
/// requested limit.
const CANDIDATE_FACTOR: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: usize,
    pub source_kind: Option<SourceKind>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl SearchOptions {
    pub fn with_limit(limit: usize) -> Self {
        Self { limit, ..Self::default() }
    }

    fn effective_limit(&self) -> usize {
        if self.limit == 0 { 10 } else { self.limit }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    Lexical,
    Semantic,
    Graph,
}

impl ScorerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScorerKind::Lexical => "lexical",
            ScorerKind::Semantic => "semantic",
            ScorerKind::Graph => "graph",
        }
    }
}

/// Which scorers surfaced a result, and at what rank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerContribution {
    pub scorer: ScorerKind,
    pub rank: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Message,
    Assertion,
    ScreenCapture,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: Uuid,
    pub kind: ResultKind,
    pub score: f64,
    pub provenance: Vec<ScorerContribution>,
    pub payload: serde_json::Value,
}

/// Internal candidate identity shared across scorers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemRef {
    Message(Uuid),
    Assertion(Uuid),
}

/// Vector-index key for a message embedding.
pub fn message_vector_key(id: Uuid) -> String {
    format!("msg:{id}")
}

/// Vector-index key for an assertion embedding.
pub fn assertion_vector_key(id: Uuid) -> String {
    format!("asrt:{id}")
}

pub fn parse_vector_key(key: &str) -> Option<ItemRef> {
    let (prefix, raw) = key.split_once(':')?;
    let id = Uuid::parse_str(raw).ok()?;
    match prefix {
        "msg" => Some(ItemRef::Message(id)),
        "asrt" => Some(ItemRef::Assertion(id)),
        _ => None,
    }
}

/// Run the hybrid query path: lexical + semantic + graph → RRF.
#[instrument(skip(db, vectors, embedder), fields(query = %query))]
pub fn search(
    db: &Database,
    vectors: &VectorIndex,
    embedder: Option<&dyn Embedder>,
    query: &str,
    options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    let limit = options.effective_limit();
    let candidates = limit * CANDIDATE_FACTOR;

    let lexical = db.with_conn(|conn| lexical::rank(conn, query, options, candidates))?;
    let semantic = semantic::rank(vectors, embedder, query, candidates)?;
    let graph = db.with_conn(|conn| graphwalk::rank(conn, query, options, candidates))?;

    debug!(
        lexical = lexical.len(),
        semantic = semantic.len(),
        graph = graph.len(),
        "scorer candidate counts"
    );

    let fused = fusion::reciprocal_rank_fusion(&[
        (ScorerKind::Lexical, lexical),
        (ScorerKind::Semantic, semantic),
        (ScorerKind::Graph, graph),
    ]);

    // Hydrate payloads, pick up timestamps for the tie-break, then cut.
    let mut hydrated = Vec::new();
    db.with_conn(|conn| {
        for candidate in fused {
            match candidate.item {
                ItemRef::Message(id) => {
                    let Ok(message) = ingest::get_message(conn, id) else {
                        continue;
                    };
                    if let Some(kind) = options.source_kind {
                        if message.source_kind != kind {
                            continue;
                        }
                    }
                    let kind = if message.source_kind == SourceKind::ScreenCapture {
                        ResultKind::ScreenCapture
                    } else {
                        ResultKind::Message
                    };
                    hydrated.push((
                        message.sent_at,
                        SearchResult {
                            id,
                            kind,
                            score: candidate.score,
                            provenance: candidate.provenance,
                            payload: json!({
                                "subject": message.subject,
                                "body_text": message.body_text,
                                "sender_id": message.sender_id,
                                "recipient_ids": message.recipient_ids,
                                "source_kind": message.source_kind.as_str(),
                                "sent_at": message.sent_at,
                            }),
                        },
                    ));
                }
                ItemRef::Assertion(id) => {
                    if options.source_kind.is_some() {
                        continue;
                    }
                    let Ok(row) = assertion::assertion_by_id(conn, id) else {
                        continue;
                    };
                    hydrated.push((
                        row.extracted_at,
                        SearchResult {
                            id,
                            kind: ResultKind::Assertion,
                            score: candidate.score,
                            provenance: candidate.provenance,
                            payload: json!({
                                "subject_id": row.subject_id,
                                "predicate": row.predicate,
                                "object": row.object,
                                "confidence": row.confidence,
                                "extracted_at": row.extracted_at,
                            }),
                        },
                    ));
                }
            }
        }
        Ok(())
    })?;

    hydrated.sort_by(|(ts_a, a), (ts_b, b)| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| ts_b.cmp(ts_a))
    });
    Ok(hydrated.into_iter().take(limit).map(|(_, r)| r).collect())
}
