//! Engagement events: recording, the composite score, and summaries.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use engram_config::EngagementWeights;
use engram_store::Result;
use engram_store::rows;
use engram_store::types::{ContextTag, EngagementEvent, EngagementKind, ts_to_sql};

/// Edit ratio below which a draft counts as explicitly accepted.
const ACCEPTANCE_EDIT_RATIO: f64 = 0.05;

/// The implicit-feedback signal shape accepted by the façade.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngagementSignal {
    pub draft_id: String,
    pub kind: Option<EngagementKind>,
    pub ai_draft_length: Option<i64>,
    pub user_final_length: Option<i64>,
    pub edit_ratio: Option<f64>,
    /// Response sentiment in [-1, 1].
    pub response_sentiment: Option<f64>,
    pub thread_length: Option<i64>,
    pub thread_continued: Option<bool>,
    pub recipient_entity_id: Option<Uuid>,
    pub context: Option<ContextTag>,
    /// The user's final text, when available; used only for the vent-mode
    /// caps ratio and never persisted.
    pub user_final_text: Option<String>,
}

impl EngagementSignal {
    /// The given edit ratio, or |final − draft| / draft when both lengths are
    /// present.
    pub fn effective_edit_ratio(&self) -> Option<f64> {
        if let Some(ratio) = self.edit_ratio {
            return Some(ratio.max(0.0));
        }
        match (self.ai_draft_length, self.user_final_length) {
            (Some(draft), Some(final_len)) if draft > 0 => {
                Some((draft - final_len).abs() as f64 / draft as f64)
            }
            _ => None,
        }
    }

    fn effective_kind(&self) -> EngagementKind {
        self.kind.unwrap_or(EngagementKind::DraftSent)
    }
}

/// Composite engagement score in [0, 1] plus its confidence — the summed
/// weight of the signals actually present.
pub fn composite_score(signal: &EngagementSignal, weights: &EngagementWeights) -> (f64, f64) {
    let mut weighted = 0.0;
    let mut confidence = 0.0;

    let edit_ratio = signal.effective_edit_ratio();
    if let Some(ratio) = edit_ratio {
        // A lightly-edited draft is a good draft.
        weighted += weights.edit_ratio * (1.0 - ratio.clamp(0.0, 1.0));
        confidence += weights.edit_ratio;
    }
    if let Some(sentiment) = signal.response_sentiment {
        weighted += weights.sentiment * ((sentiment.clamp(-1.0, 1.0) + 1.0) / 2.0);
        confidence += weights.sentiment;
    }
    if let Some(continued) = signal.thread_continued {
        weighted += weights.continuation * if continued { 1.0 } else { 0.0 };
        confidence += weights.continuation;
    }
    if let Some(length) = signal.thread_length {
        weighted += weights.thread_length * (length.max(0) as f64 / 10.0).min(1.0);
        confidence += weights.thread_length;
    }
    if let Some(ratio) = edit_ratio {
        weighted += weights.acceptance * if ratio < ACCEPTANCE_EDIT_RATIO { 1.0 } else { 0.0 };
        confidence += weights.acceptance;
    }

    if confidence == 0.0 {
        return (0.0, 0.0);
    }
    ((weighted / confidence).clamp(0.0, 1.0), confidence)
}

/// Persist one engagement event. Every signal is recorded, applied or not.
pub fn record_engagement(
    conn: &Connection,
    signal: &EngagementSignal,
    event_id: Uuid,
    adaptation_applied: bool,
    applied_delta: Option<f64>,
    now: DateTime<Utc>,
) -> Result<EngagementEvent> {
    let event = EngagementEvent {
        id: event_id,
        draft_id: signal.draft_id.clone(),
        kind: signal.effective_kind(),
        ai_draft_len: signal.ai_draft_length,
        user_final_len: signal.user_final_length,
        edit_ratio: signal.effective_edit_ratio(),
        response_sentiment: signal.response_sentiment,
        thread_length: signal.thread_length,
        thread_continued: signal.thread_continued,
        recipient_entity_id: signal.recipient_entity_id,
        context: signal.context,
        adaptation_applied,
        applied_delta,
        recorded_at: now,
    };
    conn.execute(
        "INSERT INTO engagement_events
             (id, draft_id, kind, ai_draft_len, user_final_len, edit_ratio, response_sentiment,
              thread_length, thread_continued, recipient_entity_id, context,
              adaptation_applied, applied_delta, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            event.id.to_string(),
            event.draft_id,
            event.kind.as_str(),
            event.ai_draft_len,
            event.user_final_len,
            event.edit_ratio,
            event.response_sentiment,
            event.thread_length,
            event.thread_continued,
            event.recipient_entity_id.map(|id| id.to_string()),
            event.context.map(|c| c.as_str()),
            event.adaptation_applied,
            event.applied_delta,
            ts_to_sql(now),
        ],
    )?;
    Ok(event)
}

pub fn recent_engagements(conn: &Connection, limit: usize) -> Result<Vec<EngagementEvent>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM engagement_events ORDER BY recorded_at DESC LIMIT ?1",
        rows::ENGAGEMENT_COLS
    ))?;
    let events = stmt
        .query_map([limit as i64], rows::engagement_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}

pub fn engagement_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT count(*) FROM engagement_events", [], |r| r.get(0))?)
}

/// Events recorded at or after `since` — the vent-mode velocity input.
pub fn engagements_since(conn: &Connection, since: DateTime<Utc>) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT count(*) FROM engagement_events WHERE recorded_at >= ?1",
        [ts_to_sql(since)],
        |r| r.get(0),
    )?)
}

// ── Aggregates for the façade ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngagementSummary {
    pub total_events: i64,
    pub adapted_events: i64,
    pub avg_edit_ratio: Option<f64>,
    pub avg_sentiment: Option<f64>,
    pub drafts_sent: i64,
    pub drafts_edited: i64,
    pub responses_received: i64,
    pub threads_continued: i64,
}

pub fn summary(conn: &Connection) -> Result<EngagementSummary> {
    let (total, adapted, avg_edit, avg_sentiment) = conn.query_row(
        "SELECT count(*),
                coalesce(sum(adaptation_applied), 0),
                avg(edit_ratio),
                avg(response_sentiment)
         FROM engagement_events",
        [],
        |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, Option<f64>>(2)?,
                r.get::<_, Option<f64>>(3)?,
            ))
        },
    )?;
    let count_kind = |kind: &str| -> Result<i64> {
        Ok(conn.query_row(
            "SELECT count(*) FROM engagement_events WHERE kind = ?1",
            [kind],
            |r| r.get(0),
        )?)
    };
    Ok(EngagementSummary {
        total_events: total,
        adapted_events: adapted,
        avg_edit_ratio: avg_edit,
        avg_sentiment,
        drafts_sent: count_kind("draft_sent")?,
        drafts_edited: count_kind("draft_edited")?,
        responses_received: count_kind("response_received")?,
        threads_continued: count_kind("thread_continued")?,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningStats {
    pub interaction_count: i64,
    pub current_learning_rate: f64,
    pub adaptations_applied: i64,
    pub events_recorded: i64,
    pub evolution_entries: i64,
}
