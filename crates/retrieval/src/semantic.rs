//! Semantic scorer — embed the query, cosine-top-k against the vector index.

use tracing::debug;

use engram_extract::Embedder;
use engram_store::{Result, VectorIndex};

use crate::{ItemRef, parse_vector_key};

/// Ranked candidates by cosine similarity; ranks start at 1. Silent when no
/// embedder is configured or the index is empty.
pub fn rank(
    vectors: &VectorIndex,
    embedder: Option<&dyn Embedder>,
    query: &str,
    limit: usize,
) -> Result<Vec<(ItemRef, usize)>> {
    let Some(embedder) = embedder else {
        return Ok(Vec::new());
    };
    if vectors.is_empty() {
        return Ok(Vec::new());
    }
    let Some(query_vector) = embedder.embed(query) else {
        debug!("embedder returned no vector for query — semantic scorer silent");
        return Ok(Vec::new());
    };

    let hits = vectors.top_k(&query_vector, limit)?;
    Ok(hits
        .into_iter()
        .filter_map(|(key, _)| parse_vector_key(&key))
        .enumerate()
        .map(|(i, item)| (item, i + 1))
        .collect())
}
