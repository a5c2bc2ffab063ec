//! The prediction queue: generated from detected patterns, scored for
//! accuracy over a sliding window once outcomes are marked.

use chrono::{DateTime, Duration, Timelike, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;
use uuid::Uuid;

use engram_store::error::{EngramError, Result};
use engram_store::rows;
use engram_store::types::{PatternKind, Prediction, PredictionKind, ts_to_sql};

use crate::patterns::list_patterns;

/// Pattern confidence required before it seeds a prediction.
const SEED_CONFIDENCE: f64 = 0.4;
/// Sliding window of resolved predictions used for the accuracy figure.
const ACCURACY_WINDOW: usize = 50;

pub fn insert_prediction(
    conn: &Connection,
    kind: PredictionKind,
    description: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    confidence: f64,
    now: DateTime<Utc>,
) -> Result<Prediction> {
    let prediction = Prediction {
        id: Uuid::new_v4(),
        kind,
        description: description.to_string(),
        window_start,
        window_end,
        confidence: confidence.clamp(0.0, 1.0),
        outcome: None,
        created_at: now,
    };
    conn.execute(
        "INSERT INTO predictions
             (id, kind, description, window_start, window_end, confidence, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            prediction.id.to_string(),
            kind.as_str(),
            prediction.description,
            ts_to_sql(window_start),
            ts_to_sql(window_end),
            prediction.confidence,
            ts_to_sql(now),
        ],
    )?;
    Ok(prediction)
}

/// Insert unless an unresolved prediction with the same description and an
/// open window already exists. Returns whether a row was written.
pub fn ensure_prediction(
    conn: &Connection,
    kind: PredictionKind,
    description: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    confidence: f64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM predictions
             WHERE description = ?1 AND outcome IS NULL AND window_end >= ?2",
            params![description, ts_to_sql(now)],
            |r| r.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Ok(false);
    }
    insert_prediction(conn, kind, description, window_start, window_end, confidence, now)?;
    Ok(true)
}

/// Unresolved predictions whose window has not yet closed.
pub fn pending_predictions(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<Prediction>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM predictions
         WHERE outcome IS NULL AND window_end >= ?1
         ORDER BY window_start",
        rows::PREDICTION_COLS
    ))?;
    let predictions = stmt
        .query_map([ts_to_sql(now)], rows::prediction_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(predictions)
}

pub fn mark_outcome(conn: &Connection, id: Uuid, correct: bool) -> Result<()> {
    let updated = conn.execute(
        "UPDATE predictions SET outcome = ?1 WHERE id = ?2",
        params![correct, id.to_string()],
    )?;
    if updated == 0 {
        return Err(EngramError::NotFound {
            what: "prediction",
            id: id.to_string(),
        });
    }
    Ok(())
}

/// Fraction of correct outcomes over the most recent resolved predictions.
/// `None` until at least one outcome has been marked.
pub fn accuracy(conn: &Connection) -> Result<Option<f64>> {
    let (resolved, correct): (i64, i64) = conn.query_row(
        "SELECT count(*), coalesce(sum(outcome), 0) FROM (
             SELECT outcome FROM predictions
             WHERE outcome IS NOT NULL
             ORDER BY created_at DESC LIMIT ?1
         )",
        [ACCURACY_WINDOW as i64],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    if resolved == 0 {
        return Ok(None);
    }
    Ok(Some(correct as f64 / resolved as f64))
}

/// Worker step: seed `next_action` predictions from time-habit patterns
/// whose hour is coming up, and `need_surfaced` predictions from confident
/// trigger→response pairs. Windows already predicted are skipped.
pub fn refresh_from_patterns(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    let mut created = 0usize;
    for pattern in list_patterns(conn, Some(PatternKind::TimeHabit))? {
        if pattern.confidence < SEED_CONFIDENCE {
            continue;
        }
        // Key shape is `<event_kind>@<hour>`.
        let Some((event_kind, hour_raw)) = pattern.key.rsplit_once('@') else {
            continue;
        };
        let Ok(hour) = hour_raw.parse::<u32>() else { continue };

        let today_slot = now
            .date_naive()
            .and_hms_opt(hour, 0, 0)
            .map(|naive| naive.and_utc());
        let Some(mut window_start) = today_slot else { continue };
        if window_start < now - Duration::hours(1) {
            window_start += Duration::days(1);
        }
        let window_end = window_start + Duration::hours(1);

        // Only predict for windows starting within the next hour.
        if window_start > now + Duration::hours(1) {
            continue;
        }

        if ensure_prediction(
            conn,
            PredictionKind::NextAction,
            &format!("{event_kind} expected around {hour:02}:00"),
            window_start,
            window_end,
            pattern.confidence,
            now,
        )? {
            created += 1;
        }
    }

    for pattern in list_patterns(conn, Some(PatternKind::TriggerResponse))? {
        if pattern.confidence < SEED_CONFIDENCE {
            continue;
        }
        if ensure_prediction(
            conn,
            PredictionKind::NeedSurfaced,
            &format!("likely follow-up: {}", pattern.key),
            now,
            now + Duration::hours(1),
            pattern.confidence,
            now,
        )? {
            created += 1;
        }
    }

    if created > 0 {
        debug!(created, hour = now.hour(), "predictions refreshed from patterns");
    }
    Ok(created)
}
