//! Style extraction and the engagement feedback loop.
//!
//! Two concerns: a deterministic analyser that reads style out of the stored
//! corpus, and an adaptation loop that nudges the single user-style row from
//! implicit signals — gated, rate-limited, capped, audited, and frozen
//! outright when the user is venting.

pub mod adapt;
pub mod analysis;
pub mod engagement;
pub mod extract;
pub mod mirror;
pub mod recipient;

pub use adapt::{AdaptationOutcome, DriftReport, learning_rate};
pub use engagement::{EngagementSignal, EngagementSummary, LearningStats};
pub use mirror::MirrorPrompt;
