//! Reciprocal-rank fusion, k = 60.

use std::collections::HashMap;

use crate::{ItemRef, ScorerContribution, ScorerKind};

/// The RRF constant.
pub const RRF_K: f64 = 60.0;

#[derive(Debug, Clone)]
pub struct FusedCandidate {
    pub item: ItemRef,
    pub score: f64,
    pub provenance: Vec<ScorerContribution>,
}

/// fused_score(d) = Σ_s 1/(k + rank_s(d)) over the scorers that returned d.
/// Output is sorted by fused score descending; equal scores keep a stable
/// order and are re-broken by recency downstream.
pub fn reciprocal_rank_fusion(
    scorers: &[(ScorerKind, Vec<(ItemRef, usize)>)],
) -> Vec<FusedCandidate> {
    let mut fused: HashMap<ItemRef, FusedCandidate> = HashMap::new();

    for (scorer, ranking) in scorers {
        for (item, rank) in ranking {
            let entry = fused.entry(*item).or_insert_with(|| FusedCandidate {
                item: *item,
                score: 0.0,
                provenance: Vec::new(),
            });
            entry.score += 1.0 / (RRF_K + *rank as f64);
            entry.provenance.push(ScorerContribution {
                scorer: *scorer,
                rank: *rank,
            });
        }
    }

    let mut out: Vec<FusedCandidate> = fused.into_values().collect();
    out.sort_by(|a, b| b.score.total_cmp(&a.score));
    out
}
