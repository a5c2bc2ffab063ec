//! Engine configuration — a closed struct, no free-form option bag.
//!
//! Every section has serde defaults so a partial TOML file (or none at all)
//! yields a working configuration. `":memory:"` is a valid `db_path` for
//! tests; in that mode the vector index always runs in-process.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render config file: {0}")]
    Render(#[from] toml::ser::Error),
}

/// Weights of the composite engagement score. They should sum to 1.0; the
/// score is clamped to [0, 1] either way.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct EngagementWeights {
    pub edit_ratio: f64,
    pub sentiment: f64,
    pub continuation: f64,
    pub thread_length: f64,
    pub acceptance: f64,
}

impl Default for EngagementWeights {
    fn default() -> Self {
        Self {
            edit_ratio: 0.35,
            sentiment: 0.30,
            continuation: 0.20,
            thread_length: 0.10,
            acceptance: 0.05,
        }
    }
}

/// Knobs of the style-adaptation loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationConfig {
    /// Interactions required before any adaptation is permitted.
    pub min_interactions: u32,
    /// Minimum engagement-score confidence before adaptation is permitted.
    pub min_confidence: f64,
    /// Initial learning rate α(0).
    pub learning_rate_initial: f64,
    /// Floor the learning rate never decays below.
    pub learning_rate_floor: f64,
    /// Absolute per-dimension change cap per adaptation step.
    pub per_step_cap: f64,
    /// CUSUM slack parameter k.
    pub drift_slack: f64,
    /// CUSUM alarm threshold h.
    pub drift_threshold: f64,
    /// Number of most-recent evolution entries the drift monitor inspects.
    pub drift_window: usize,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            min_interactions: 10,
            min_confidence: 0.3,
            learning_rate_initial: 0.30,
            learning_rate_floor: 0.05,
            per_step_cap: 0.01,
            drift_slack: 0.002,
            drift_threshold: 0.02,
            drift_window: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path of the SQLite database file, or `":memory:"`.
    pub db_path: String,
    /// Directory holding the vector-index sidecar. `None` keeps vectors
    /// in-process only.
    pub vector_dir: Option<String>,
    /// The user's own email address, used to mark outgoing messages and to
    /// seed the self entity.
    pub user_email: Option<String>,
    /// The user's own phone number.
    pub user_phone: Option<String>,
    /// Seconds between background processing cycles.
    pub process_interval_secs: u64,
    /// Seconds between proactive-trigger scans.
    pub proactive_interval_secs: u64,
    /// Messages/events drained per processing cycle.
    pub batch_size: usize,
    /// Deadline for a single collaborator call (LLM extractor, embedder).
    pub collaborator_timeout_secs: u64,
    /// Blend factor weighting recipient style against user style when
    /// producing a mirror prompt. Clamped to [0.6, 0.8].
    pub mirror_level: f64,
    /// Messages required before onboarding may run.
    pub minimum_onboarding_messages: usize,
    /// Hours during which a merge stays reversible.
    pub merge_revert_window_hours: i64,
    pub engagement_weights: EngagementWeights,
    pub adaptation: AdaptationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            vector_dir: None,
            user_email: None,
            user_phone: None,
            process_interval_secs: 60,
            proactive_interval_secs: 60,
            batch_size: 25,
            collaborator_timeout_secs: 30,
            mirror_level: 0.7,
            minimum_onboarding_messages: 50,
            merge_revert_window_hours: 72,
            engagement_weights: EngagementWeights::default(),
            adaptation: AdaptationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Build a config for an on-disk database at `db_path` with defaults
    /// everywhere else.
    pub fn at(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Mirror level clamped to the contract range.
    pub fn effective_mirror_level(&self) -> f64 {
        self.mirror_level.clamp(0.6, 0.8)
    }

    pub fn is_in_memory(&self) -> bool {
        self.db_path == ":memory:"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.db_path, ":memory:");
        assert_eq!(config.process_interval_secs, 60);
        assert_eq!(config.minimum_onboarding_messages, 50);
        let w = config.engagement_weights;
        let sum = w.edit_ratio + w.sentiment + w.continuation + w.thread_length + w.acceptance;
        assert!((sum - 1.0).abs() < 1e-9, "weights should sum to 1.0, got {sum}");
    }

    #[test]
    fn mirror_level_is_clamped_to_contract_range() {
        let mut config = EngineConfig::default();
        config.mirror_level = 0.95;
        assert_eq!(config.effective_mirror_level(), 0.8);
        config.mirror_level = 0.1;
        assert_eq!(config.effective_mirror_level(), 0.6);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let parsed: EngineConfig =
            toml::from_str("db_path = \"/tmp/engram.db\"\nprocess_interval_secs = 5\n").unwrap();
        assert_eq!(parsed.db_path, "/tmp/engram.db");
        assert_eq!(parsed.process_interval_secs, 5);
        assert_eq!(parsed.adaptation.min_interactions, 10);
    }

    #[test]
    fn round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engram.toml");
        let mut config = EngineConfig::at("/tmp/e.db");
        config.user_email = Some("me@example.com".to_string());
        config.save_to(&path).unwrap();
        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded.db_path, "/tmp/e.db");
        assert_eq!(loaded.user_email.as_deref(), Some("me@example.com"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let loaded = EngineConfig::load_from("/nonexistent/engram.toml").unwrap();
        assert_eq!(loaded.db_path, ":memory:");
    }
}
