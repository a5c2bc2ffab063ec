//! The adaptation loop: gated, rate-limited, capped, audited, freezable.
//!
//! Every change to the single user-style row goes through
//! [`learn_from_interaction`] under one write transaction, producing exactly
//! one evolution entry per dimension changed. Vent mode freezes the loop for
//! the session; the event is still recorded.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use engram_config::{AdaptationConfig, EngineConfig};
use engram_store::Result;
use engram_store::rows;
use engram_store::types::{EngagementEvent, PersonalityEvolutionEntry, StyleDimension, ts_to_sql};

use crate::analysis;
use crate::engagement::{self, EngagementSignal, composite_score};
use crate::extract::{load_user_style, save_user_style};
use crate::recipient::load_recipient_style;

/// Engagement score above which the loop pulls the user style toward the
/// recipient's; below it, no target is defined and nothing moves.
const ADAPT_SCORE_FLOOR: f64 = 0.5;

/// Recent engagement events consulted for the vent-mode sentiment window.
const SENTIMENT_WINDOW: usize = 5;
/// Vent-mode thresholds.
const VENT_SENTIMENT: f64 = -0.5;
const VENT_THREAD_LENGTH: i64 = 8;
const VENT_CAPS_RATIO: f64 = 0.3;
const VENT_VELOCITY_PER_MIN: i64 = 5;

/// α(N) = max(floor, initial · 0.9^(N/10)). Monotonically non-increasing.
pub fn learning_rate(interactions: i64, config: &AdaptationConfig) -> f64 {
    let decayed =
        config.learning_rate_initial * 0.9f64.powf(interactions.max(0) as f64 / 10.0);
    decayed.max(config.learning_rate_floor)
}

#[derive(Debug, Clone)]
pub struct AdaptationOutcome {
    pub event: EngagementEvent,
    pub score: f64,
    pub confidence: f64,
    pub frozen: bool,
    pub applied: bool,
    pub deltas: Vec<(StyleDimension, f64)>,
}

/// The vent-mode predicate: sustained negative sentiment AND one of a long
/// thread, shouting, or high message velocity.
fn vent_mode_active(
    conn: &Connection,
    signal: &EngagementSignal,
    now: DateTime<Utc>,
) -> Result<bool> {
    let mut sentiments: Vec<f64> = signal.response_sentiment.into_iter().collect();
    for event in engagement::recent_engagements(conn, SENTIMENT_WINDOW)? {
        if let Some(sentiment) = event.response_sentiment {
            sentiments.push(sentiment);
        }
    }
    if sentiments.is_empty() {
        return Ok(false);
    }
    let mean = sentiments.iter().sum::<f64>() / sentiments.len() as f64;
    if mean > VENT_SENTIMENT {
        return Ok(false);
    }

    let long_thread = signal.thread_length.is_some_and(|l| l >= VENT_THREAD_LENGTH);
    let shouting = signal
        .user_final_text
        .as_deref()
        .is_some_and(|text| analysis::caps_ratio(text) >= VENT_CAPS_RATIO);
    let velocity =
        engagement::engagements_since(conn, now - Duration::seconds(60))? + 1 >= VENT_VELOCITY_PER_MIN;

    Ok(long_thread || shouting || velocity)
}

/// Apply one engagement signal to the user-style row.
///
/// Freeze beats everything: a vent-mode event is persisted but the profile
/// row is untouched. Otherwise adaptation requires enough interactions,
/// enough signal confidence, a positive engagement score, and a known
/// recipient style to aim at. Each dimension moves by at most
/// `per_step_cap`, and each move appends one evolution entry.
pub fn learn_from_interaction(
    conn: &Connection,
    signal: &EngagementSignal,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Result<AdaptationOutcome> {
    let event_id = Uuid::new_v4();
    let (score, confidence) = composite_score(signal, &config.engagement_weights);

    if vent_mode_active(conn, signal, now)? {
        warn!(draft = %signal.draft_id, "vent mode active — adaptation frozen");
        let event = engagement::record_engagement(conn, signal, event_id, false, None, now)?;
        return Ok(AdaptationOutcome {
            event,
            score,
            confidence,
            frozen: true,
            applied: false,
            deltas: Vec::new(),
        });
    }

    let adaptation = &config.adaptation;
    let mut profile = load_user_style(conn)?;
    let interactions = profile.interaction_count;

    let eligible = interactions >= i64::from(adaptation.min_interactions)
        && confidence >= adaptation.min_confidence
        && score >= ADAPT_SCORE_FLOOR;

    let mut deltas: Vec<(StyleDimension, f64)> = Vec::new();
    if eligible {
        if let Some(recipient) = signal
            .recipient_entity_id
            .map(|id| load_recipient_style(conn, id))
            .transpose()?
            .flatten()
        {
            let rate = learning_rate(interactions, adaptation);
            for dimension in StyleDimension::ALL {
                let old = profile.dimension(dimension);
                let target = recipient.dimension(dimension);
                let step = (rate * (target - old))
                    .clamp(-adaptation.per_step_cap, adaptation.per_step_cap);
                if step.abs() < 1e-9 {
                    continue;
                }
                let new = (old + step).clamp(0.0, 1.0);
                profile.set_dimension(dimension, new);
                insert_evolution(conn, dimension, old, new, event_id, rate, now)?;
                deltas.push((dimension, new - old));
            }
            if !deltas.is_empty() {
                info!(
                    event = %event_id,
                    dimensions = deltas.len(),
                    rate = format!("{rate:.3}"),
                    score = format!("{score:.2}"),
                    "style adapted"
                );
            }
        } else {
            debug!(draft = %signal.draft_id, "no recipient style to aim at — nothing applied");
        }
    }

    profile.interaction_count += 1;
    profile.updated_at = now;
    save_user_style(conn, &profile)?;

    let applied = !deltas.is_empty();
    let total_delta: f64 = deltas.iter().map(|(_, d)| d.abs()).sum();
    let event = engagement::record_engagement(
        conn,
        signal,
        event_id,
        applied,
        applied.then_some(total_delta),
        now,
    )?;

    Ok(AdaptationOutcome {
        event,
        score,
        confidence,
        frozen: false,
        applied,
        deltas,
    })
}

// ── Evolution audit log ───────────────────────────────────────────────────────

fn insert_evolution(
    conn: &Connection,
    dimension: StyleDimension,
    old_value: f64,
    new_value: f64,
    engagement_event_id: Uuid,
    learning_rate: f64,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO personality_evolution
             (dimension, old_value, new_value, engagement_event_id, learning_rate, changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            dimension.as_str(),
            old_value,
            new_value,
            engagement_event_id.to_string(),
            learning_rate,
            ts_to_sql(now),
        ],
    )?;
    Ok(())
}

pub fn evolution_entries(
    conn: &Connection,
    dimension: Option<StyleDimension>,
    limit: usize,
) -> Result<Vec<PersonalityEvolutionEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM personality_evolution
         WHERE (?1 IS NULL OR dimension = ?1)
         ORDER BY id DESC LIMIT ?2",
        rows::EVOLUTION_COLS
    ))?;
    let entries = stmt
        .query_map(
            params![dimension.map(|d| d.as_str().to_string()), limit as i64],
            rows::evolution_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

pub fn evolution_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT count(*) FROM personality_evolution", [], |r| r.get(0))?)
}

// ── Drift detection ───────────────────────────────────────────────────────────

/// One-sided CUSUM over recent evolution deltas for one dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    pub dimension: StyleDimension,
    /// Positive CUSUM statistic (sustained upward movement).
    pub upward: f64,
    /// Negative CUSUM statistic (sustained downward movement).
    pub downward: f64,
    pub triggered: bool,
    pub entries_inspected: usize,
}

/// Change-point monitor: surfaces sustained directional movement per style
/// dimension without blocking anything.
pub fn detect_drift(conn: &Connection, config: &AdaptationConfig) -> Result<Vec<DriftReport>> {
    let mut reports = Vec::new();
    for dimension in StyleDimension::ALL {
        let mut entries = evolution_entries(conn, Some(dimension), config.drift_window)?;
        entries.reverse(); // oldest first

        let mut upward = 0.0f64;
        let mut downward = 0.0f64;
        let mut peak_up = 0.0f64;
        let mut peak_down = 0.0f64;
        for entry in &entries {
            let delta = entry.new_value - entry.old_value;
            upward = (upward + delta - config.drift_slack).max(0.0);
            downward = (downward - delta - config.drift_slack).max(0.0);
            peak_up = peak_up.max(upward);
            peak_down = peak_down.max(downward);
        }

        reports.push(DriftReport {
            dimension,
            upward: peak_up,
            downward: peak_down,
            triggered: peak_up > config.drift_threshold || peak_down > config.drift_threshold,
            entries_inspected: entries.len(),
        });
    }
    Ok(reports)
}
