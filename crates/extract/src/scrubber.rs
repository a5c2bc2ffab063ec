//! The PII-scrubber collaborator — reversible token substitution.

/// Result of scrubbing: the redacted text plus the `(token, original)` map
/// needed to reverse it.
#[derive(Debug, Clone, Default)]
pub struct ScrubOutcome {
    pub scrubbed_text: String,
    pub token_map: Vec<(String, String)>,
}

impl ScrubOutcome {
    /// Reinstate the original values for every token in the map.
    pub fn restore(&self) -> String {
        let mut text = self.scrubbed_text.clone();
        for (token, original) in &self.token_map {
            text = text.replace(token, original);
        }
        text
    }
}

/// Replaces sensitive spans with opaque tokens before storage. Implemented
/// by an external collaborator; applied to message bodies at ingestion when
/// configured.
pub trait PiiScrubber: Send + Sync {
    fn scrub(&self, text: &str) -> ScrubOutcome;
}
