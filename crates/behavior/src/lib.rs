//! Behavioural layer: pattern detection, the daily-rhythm matrix, and the
//! prediction queue.

pub mod patterns;
pub mod predict;
pub mod rhythm;

pub use patterns::{detect_patterns, list_patterns};
pub use predict::{accuracy, ensure_prediction, pending_predictions, refresh_from_patterns};
pub use rhythm::{RhythmMatrix, load_matrix, record_events};
