//! Collaborator interfaces consumed by the core, plus the bundled
//! rule-based fallback extractor.
//!
//! The LLM extractor, embedder, PII scrubber, and OCR provider are external
//! systems; the core sees them only through the traits here. Every
//! implementation must tolerate being called from a background worker with a
//! deadline around it.

mod embedder;
mod extractor;
mod rules;
mod scrubber;

pub use embedder::{Embedder, HashingEmbedder};
pub use extractor::{
    ArbiterVerdict, CandidateSummary, ExtractedEntity, ExtractedFact, ExtractedRelationship,
    ExtractionOutcome, FactExtractor, IdentityArbiter, ProbeSummary,
};
pub use rules::RuleBasedExtractor;
pub use scrubber::{PiiScrubber, ScrubOutcome};
