//! The fact-extractor and identity-arbiter collaborator traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use engram_store::Result;
use engram_store::types::Message;

/// An entity mention surfaced by extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    /// Entity kind slug (`person`, `organisation`, `place`, `thing`).
    pub kind: String,
    /// `(attribute kind slug, value)` pairs, e.g. `("title", "engineer")`.
    pub attributes: Vec<(String, String)>,
    pub confidence: f64,
    pub mention_text: String,
}

/// A subject-predicate-object fact. `subject: None` means the message sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedFact {
    pub subject: Option<String>,
    pub predicate: String,
    pub object: String,
    /// Whether the object names an entity (vs a literal value).
    pub object_is_entity: bool,
    pub confidence: f64,
    pub evidence_text: String,
}

/// A directed relationship. `from: None` means the message sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub from: Option<String>,
    pub to: String,
    pub kind: String,
    pub confidence: f64,
    pub evidence_text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    pub entities: Vec<ExtractedEntity>,
    pub facts: Vec<ExtractedFact>,
    pub relationships: Vec<ExtractedRelationship>,
}

impl ExtractionOutcome {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.facts.is_empty() && self.relationships.is_empty()
    }
}

/// Turns one message into entities, facts, and relationships.
///
/// Implementations may block on remote calls; the background worker wraps
/// every invocation in a deadline and leaves the message unprocessed on
/// expiry.
#[async_trait]
pub trait FactExtractor: Send + Sync {
    async fn extract(&self, message: &Message) -> Result<ExtractionOutcome>;
}

// ── Identity arbitration (resolver stage 4) ───────────────────────────────────

/// What the resolver knows about the probe when it asks for arbitration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSummary {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub alias: Option<String>,
}

/// A fuzzy candidate the resolver could not separate on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub entity_id: Uuid,
    pub canonical_name: String,
    /// Neighbours shared with the probe's message context.
    pub shared_neighbours: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArbiterVerdict {
    /// The probe is this existing entity.
    Match(Uuid),
    /// The probe is genuinely someone new.
    NewEntity,
    /// No judgement; the resolver quarantines the probe.
    Inconclusive,
}

/// Optional model-assisted judgement for ambiguous probes.
#[async_trait]
pub trait IdentityArbiter: Send + Sync {
    async fn arbitrate(
        &self,
        probe: &ProbeSummary,
        candidates: &[CandidateSummary],
    ) -> Result<ArbiterVerdict>;
}
