//! Proactive triggers: meeting prep, deadline warnings, and rhythm-based
//! suggestions. Triggers stay stored until acknowledged; acceptance feedback
//! feeds an acceptance-rate statistic.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use engram_behavior::{ensure_prediction, list_patterns, load_matrix};
use engram_store::error::{EngramError, Result};
use engram_store::rows;
use engram_store::types::{
    PatternKind, PredictionKind, ProactiveTrigger, TriggerKind, ts_from_sql, ts_to_sql,
};

use crate::WorkerContext;
use crate::worker::WorkerHandle;

/// Lead time for meeting-prep triggers.
const MEETING_PREP_LEAD_MIN: i64 = 5;
/// Lead time for deadline warnings.
const DEADLINE_LEAD_HOURS: i64 = 24;
/// Focus score above which a rhythm suggestion may fire.
const SUGGESTION_FOCUS_FLOOR: f64 = 0.8;
/// Pattern confidence required for a rhythm suggestion.
const SUGGESTION_CONFIDENCE_FLOOR: f64 = 0.5;
/// Energy jump between consecutive hours that predicts a context switch.
const CONTEXT_SWITCH_RAMP: f64 = 0.5;

fn store_trigger(
    conn: &Connection,
    kind: TriggerKind,
    message: &str,
    fire_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool> {
    // One live trigger per (kind, message).
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM proactive_triggers
             WHERE kind = ?1 AND message = ?2 AND acknowledged = 0",
            params![kind.as_str(), message],
            |r| r.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO proactive_triggers (id, kind, message, fire_at, acknowledged, created_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        params![
            Uuid::new_v4().to_string(),
            kind.as_str(),
            message,
            ts_to_sql(fire_at),
            ts_to_sql(now),
        ],
    )?;
    info!(kind = kind.as_str(), message, "proactive trigger fired");
    Ok(true)
}

/// One proactive scan. Returns the number of triggers newly stored.
pub async fn run_proactive_scan(ctx: &WorkerContext) -> Result<usize> {
    let now = Utc::now();
    ctx.db.with_tx(|tx| {
        let mut fired = 0usize;

        // Calendar commitments: meeting prep 5 minutes before start.
        let mut stmt = tx.prepare(
            "SELECT payload FROM events WHERE kind = 'calendar_event'",
        )?;
        let payloads = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        for raw in payloads {
            let Ok(payload) = serde_json::from_str::<serde_json::Value>(&raw) else {
                continue;
            };
            let title = payload
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or("upcoming event");

            if let Some(starts_at) = payload
                .get("starts_at")
                .and_then(|v| v.as_str())
                .and_then(|s| ts_from_sql(s).ok())
            {
                let lead = starts_at - now;
                if lead > ChronoDuration::zero()
                    && lead <= ChronoDuration::minutes(MEETING_PREP_LEAD_MIN)
                    && store_trigger(
                        tx,
                        TriggerKind::MeetingPrep,
                        &format!("Prep for \"{title}\" starting at {}", starts_at.format("%H:%M")),
                        now,
                        now,
                    )?
                {
                    fired += 1;
                }
            }

            if let Some(due_at) = payload
                .get("due_at")
                .and_then(|v| v.as_str())
                .and_then(|s| ts_from_sql(s).ok())
            {
                let lead = due_at - now;
                if lead > ChronoDuration::zero()
                    && lead <= ChronoDuration::hours(DEADLINE_LEAD_HOURS)
                    && store_trigger(
                        tx,
                        TriggerKind::DeadlineWarning,
                        &format!("\"{title}\" is due {}", due_at.format("%Y-%m-%d %H:%M")),
                        now,
                        now,
                    )?
                {
                    fired += 1;
                    ensure_prediction(
                        tx,
                        PredictionKind::DeadlineWarning,
                        &format!("\"{title}\" deadline at {}", due_at.format("%Y-%m-%d %H:%M")),
                        now,
                        due_at,
                        0.9,
                        now,
                    )?;
                }
            }
        }

        // Rhythm: a sharp energy ramp into the next hour reads as a coming
        // context switch.
        let matrix = load_matrix(tx)?;
        let this_hour = matrix.energy_level(now.hour());
        let next_hour = matrix.energy_level((now.hour() + 1) % 24);
        if next_hour - this_hour >= CONTEXT_SWITCH_RAMP {
            ensure_prediction(
                tx,
                PredictionKind::ContextSwitch,
                &format!("activity usually ramps up around {:02}:00", (now.hour() + 1) % 24),
                now,
                now + ChronoDuration::hours(1),
                next_hour - this_hour,
                now,
            )?;
        }

        // Rhythm suggestions: a habitual slot with a confident habit.
        let focus = matrix.focus_score(now.hour(), now.weekday().num_days_from_monday());
        if focus >= SUGGESTION_FOCUS_FLOOR {
            for pattern in list_patterns(tx, Some(PatternKind::TimeHabit))? {
                if pattern.confidence < SUGGESTION_CONFIDENCE_FLOOR {
                    continue;
                }
                if pattern.key.ends_with(&format!("@{:02}", now.hour()))
                    && store_trigger(
                        tx,
                        TriggerKind::PatternSuggestion,
                        &format!("This is usually when you do this: {}", pattern.description),
                        now,
                        now,
                    )?
                {
                    fired += 1;
                }
            }
        }

        Ok(fired)
    })
}

/// Spawn the proactive-trigger timer.
pub fn spawn_proactive_service(ctx: Arc<WorkerContext>) -> WorkerHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let interval = Duration::from_secs(ctx.config.proactive_interval_secs.max(1));
    let task = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "proactive service started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match run_proactive_scan(&ctx).await {
                        Ok(fired) if fired > 0 => debug!(fired, "proactive scan complete"),
                        Ok(_) => {}
                        Err(err) => warn!(?err, "proactive scan failed"),
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("proactive service stopped");
    });
    WorkerHandle::from_parts(stop_tx, task)
}

pub fn pending_triggers(conn: &Connection) -> Result<Vec<ProactiveTrigger>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM proactive_triggers WHERE acknowledged = 0 ORDER BY fire_at",
        rows::TRIGGER_COLS
    ))?;
    let triggers = stmt
        .query_map([], rows::trigger_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(triggers)
}

/// Acknowledge a trigger, recording whether the user accepted it.
pub fn acknowledge_trigger(conn: &Connection, id: Uuid, accepted: bool) -> Result<()> {
    let updated = conn.execute(
        "UPDATE proactive_triggers SET acknowledged = 1, accepted = ?1 WHERE id = ?2",
        params![accepted, id.to_string()],
    )?;
    if updated == 0 {
        return Err(EngramError::NotFound {
            what: "trigger",
            id: id.to_string(),
        });
    }
    Ok(())
}

/// Fraction of acknowledged triggers the user accepted; `None` until any
/// have been acknowledged.
pub fn acceptance_rate(conn: &Connection) -> Result<Option<f64>> {
    let (acknowledged, accepted): (i64, i64) = conn.query_row(
        "SELECT count(*), coalesce(sum(accepted), 0) FROM proactive_triggers
         WHERE acknowledged = 1",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    if acknowledged == 0 {
        return Ok(None);
    }
    Ok(Some(accepted as f64 / acknowledged as f64))
}

#[cfg(test)]
mod tests {
    use engram_config::EngineConfig;
    use engram_core::ingest::emit_event;
    use engram_core::resolver::IdentityResolver;
    use engram_extract::RuleBasedExtractor;
    use engram_store::types::EventKind;
    use engram_store::{Database, VectorIndex};
    use serde_json::json;

    use super::*;

    fn context() -> WorkerContext {
        WorkerContext {
            db: Arc::new(Database::open(":memory:").unwrap()),
            vectors: Arc::new(VectorIndex::in_memory()),
            resolver: IdentityResolver::default(),
            extractor: Arc::new(RuleBasedExtractor::default()),
            embedder: None,
            arbiter: None,
            config: EngineConfig::default(),
        }
    }

    #[tokio::test]
    async fn meeting_prep_fires_inside_the_lead_window() {
        let ctx = context();
        let starts_at = Utc::now() + ChronoDuration::minutes(3);
        ctx.db
            .with_conn(|conn| {
                emit_event(
                    conn,
                    EventKind::CalendarEvent,
                    Utc::now(),
                    json!({"title": "1:1 with Maria", "starts_at": ts_to_sql(starts_at)}),
                    None,
                )?;
                Ok(())
            })
            .unwrap();

        assert_eq!(run_proactive_scan(&ctx).await.unwrap(), 1);
        // Idempotent while unacknowledged.
        assert_eq!(run_proactive_scan(&ctx).await.unwrap(), 0);

        ctx.db
            .with_conn(|conn| {
                let pending = pending_triggers(conn)?;
                assert_eq!(pending.len(), 1);
                assert_eq!(pending[0].kind, TriggerKind::MeetingPrep);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn deadline_warning_fires_a_day_ahead_only() {
        let ctx = context();
        ctx.db
            .with_conn(|conn| {
                emit_event(
                    conn,
                    EventKind::CalendarEvent,
                    Utc::now(),
                    json!({"title": "tax filing", "due_at": ts_to_sql(Utc::now() + ChronoDuration::hours(20))}),
                    None,
                )?;
                emit_event(
                    conn,
                    EventKind::CalendarEvent,
                    Utc::now(),
                    json!({"title": "far away", "due_at": ts_to_sql(Utc::now() + ChronoDuration::hours(60))}),
                    None,
                )?;
                Ok(())
            })
            .unwrap();

        assert_eq!(run_proactive_scan(&ctx).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn acknowledgement_feeds_the_acceptance_rate() {
        let ctx = context();
        ctx.db
            .with_conn(|conn| {
                store_trigger(conn, TriggerKind::PatternSuggestion, "s1", Utc::now(), Utc::now())?;
                store_trigger(conn, TriggerKind::PatternSuggestion, "s2", Utc::now(), Utc::now())?;
                assert_eq!(acceptance_rate(conn)?, None);
                let pending = pending_triggers(conn)?;
                acknowledge_trigger(conn, pending[0].id, true)?;
                acknowledge_trigger(conn, pending[1].id, false)?;
                assert_eq!(acceptance_rate(conn)?, Some(0.5));
                assert!(pending_triggers(conn)?.is_empty());
                Ok(())
            })
            .unwrap();
    }
}
