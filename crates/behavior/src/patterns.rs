//! Pattern detection over the event log.
//!
//! Four candidate kinds: time-of-day habits, 30-minute sequences,
//! day-of-week densities, and trigger→response pairs. Confidence climbs
//! with observations; candidates under the floor are pruned.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use rusqlite::{Connection, params};
use tracing::{debug, info};
use uuid::Uuid;

use engram_store::Result;
use engram_store::rows;
use engram_store::types::{BehaviouralPattern, EventKind, PatternKind, ts_from_sql, ts_to_sql};

/// Occurrences required before a candidate is stored.
const MIN_OCCURRENCES: i64 = 3;
/// Confidence floor below which stored patterns are discarded.
const CONFIDENCE_FLOOR: f64 = 0.2;
/// Window for sequence candidates.
const SEQUENCE_WINDOW_MIN: i64 = 30;
/// Window for trigger→response candidates.
const TRIGGER_RESPONSE_SECS: i64 = 60;
/// Events inspected per detection pass.
const SCAN_LIMIT: usize = 5000;

/// External stimuli for trigger→response detection.
const EXTERNAL_KINDS: &[EventKind] = &[
    EventKind::MessageReceived,
    EventKind::ResponseReceived,
    EventKind::CalendarEvent,
];
/// User actions for trigger→response detection.
const ACTION_KINDS: &[EventKind] =
    &[EventKind::MessageSent, EventKind::DraftSent, EventKind::DraftEdited];

fn confidence_for(occurrences: i64) -> f64 {
    (occurrences as f64 / (occurrences as f64 + 5.0)).min(0.95)
}

fn load_recent(conn: &Connection) -> Result<Vec<(EventKind, DateTime<Utc>)>> {
    let mut stmt = conn.prepare(
        "SELECT kind, occurred_at FROM events ORDER BY occurred_at DESC LIMIT ?1",
    )?;
    let raw = stmt
        .query_map([SCAN_LIMIT as i64], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut events = Vec::with_capacity(raw.len());
    for (kind, occurred_at) in raw {
        events.push((EventKind::parse(&kind)?, ts_from_sql(&occurred_at)?));
    }
    events.reverse(); // chronological
    Ok(events)
}

fn upsert(
    conn: &Connection,
    kind: PatternKind,
    key: &str,
    description: &str,
    occurrences: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO behaviour_patterns
             (id, kind, key, description, occurrences, confidence, first_seen, last_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT (kind, key) DO UPDATE SET
             occurrences = excluded.occurrences,
             confidence = excluded.confidence,
             description = excluded.description,
             last_seen = excluded.last_seen",
        params![
            Uuid::new_v4().to_string(),
            kind.as_str(),
            key,
            description,
            occurrences,
            confidence_for(occurrences),
            ts_to_sql(now),
        ],
    )?;
    Ok(())
}

/// Run all four detectors over the recent event log and refresh the stored
/// candidates. Returns the number of live patterns after pruning.
pub fn detect_patterns(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    let events = load_recent(conn)?;
    if events.is_empty() {
        return Ok(0);
    }

    // Time-based habits: (kind, hour-of-day).
    let mut by_hour: std::collections::HashMap<(EventKind, u32), i64> =
        std::collections::HashMap::new();
    // Day-of-week densities: (kind, weekday).
    let mut by_weekday: std::collections::HashMap<(EventKind, u32), i64> =
        std::collections::HashMap::new();
    for (kind, at) in &events {
        *by_hour.entry((*kind, at.hour())).or_default() += 1;
        *by_weekday
            .entry((*kind, at.weekday().num_days_from_monday()))
            .or_default() += 1;
    }

    for ((kind, hour), count) in &by_hour {
        if *count >= MIN_OCCURRENCES {
            upsert(
                conn,
                PatternKind::TimeHabit,
                &format!("{}@{hour:02}", kind.as_str()),
                &format!("{} tends to happen around {hour:02}:00", kind.as_str()),
                *count,
                now,
            )?;
        }
    }

    for ((kind, weekday), count) in &by_weekday {
        let kind_total: i64 = by_weekday
            .iter()
            .filter(|((k, _), _)| k == kind)
            .map(|(_, c)| *c)
            .sum();
        let average = kind_total as f64 / 7.0;
        if *count >= MIN_OCCURRENCES && (*count as f64) > average {
            upsert(
                conn,
                PatternKind::DayOfWeek,
                &format!("{}@w{weekday}", kind.as_str()),
                &format!("{} clusters on weekday {weekday}", kind.as_str()),
                *count,
                now,
            )?;
        }
    }

    // Sequences: A→B→C inside a 30-minute window.
    let mut sequences: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
    for window in events.windows(3) {
        let span = window[2].1 - window[0].1;
        if span <= Duration::minutes(SEQUENCE_WINDOW_MIN) && span >= Duration::zero() {
            let key = format!(
                "{}>{}>{}",
                window[0].0.as_str(),
                window[1].0.as_str(),
                window[2].0.as_str()
            );
            *sequences.entry(key).or_default() += 1;
        }
    }
    for (key, count) in &sequences {
        if *count >= MIN_OCCURRENCES {
            upsert(
                conn,
                PatternKind::Sequence,
                key,
                &format!("sequence {key} within {SEQUENCE_WINDOW_MIN} minutes"),
                *count,
                now,
            )?;
        }
    }

    // Trigger→response: external stimulus followed by a user action in 60 s.
    let mut responses: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
    for (i, (kind, at)) in events.iter().enumerate() {
        if !EXTERNAL_KINDS.contains(kind) {
            continue;
        }
        if let Some((action, _)) = events[i + 1..]
            .iter()
            .take_while(|(_, later)| *later - *at <= Duration::seconds(TRIGGER_RESPONSE_SECS))
            .find(|(k, _)| ACTION_KINDS.contains(k))
        {
            let key = format!("{}->{}", kind.as_str(), action.as_str());
            *responses.entry(key).or_default() += 1;
        }
    }
    for (key, count) in &responses {
        if *count >= MIN_OCCURRENCES {
            upsert(
                conn,
                PatternKind::TriggerResponse,
                key,
                &format!("{key} within {TRIGGER_RESPONSE_SECS}s"),
                *count,
                now,
            )?;
        }
    }

    let pruned = conn.execute(
        "DELETE FROM behaviour_patterns WHERE confidence < ?1",
        [CONFIDENCE_FLOOR],
    )?;
    if pruned > 0 {
        debug!(pruned, "low-confidence patterns discarded");
    }

    let live: i64 =
        conn.query_row("SELECT count(*) FROM behaviour_patterns", [], |r| r.get(0))?;
    info!(events = events.len(), patterns = live, "pattern detection pass complete");
    Ok(live as usize)
}

pub fn list_patterns(
    conn: &Connection,
    kind: Option<PatternKind>,
) -> Result<Vec<BehaviouralPattern>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM behaviour_patterns
         WHERE (?1 IS NULL OR kind = ?1)
         ORDER BY confidence DESC, occurrences DESC",
        rows::PATTERN_COLS
    ))?;
    let patterns = stmt
        .query_map(
            params![kind.map(|k| k.as_str().to_string())],
            rows::pattern_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(patterns)
}
