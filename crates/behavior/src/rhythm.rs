//! The 24×7 daily-rhythm matrix and the focus/energy heuristics on top.

use chrono::{Datelike, Timelike};
use rusqlite::{Connection, params};

use engram_store::Result;
use engram_store::types::Event;

/// The full matrix: `counts[hour][weekday]`, weekday 0 = Monday.
#[derive(Debug, Clone)]
pub struct RhythmMatrix {
    pub counts: [[i64; 7]; 24],
}

impl RhythmMatrix {
    pub fn total(&self) -> i64 {
        self.counts.iter().flatten().sum()
    }

    pub fn peak(&self) -> i64 {
        self.counts.iter().flatten().copied().max().unwrap_or(0)
    }

    /// Cell density relative to the busiest cell, in [0, 1]. A high score
    /// means this slot is one the user habitually works in.
    pub fn focus_score(&self, hour: u32, weekday: u32) -> f64 {
        let peak = self.peak();
        if peak == 0 || hour >= 24 || weekday >= 7 {
            return 0.0;
        }
        self.counts[hour as usize][weekday as usize] as f64 / peak as f64
    }

    /// Hour-of-day activity share across all weekdays, in [0, 1].
    pub fn energy_level(&self, hour: u32) -> f64 {
        let total = self.total();
        if total == 0 || hour >= 24 {
            return 0.0;
        }
        let row: i64 = self.counts[hour as usize].iter().sum();
        let busiest_row = (0..24)
            .map(|h| self.counts[h].iter().sum::<i64>())
            .max()
            .unwrap_or(0);
        if busiest_row == 0 {
            0.0
        } else {
            row as f64 / busiest_row as f64
        }
    }

    /// The `n` busiest hours, most active first.
    pub fn peak_hours(&self, n: usize) -> Vec<u32> {
        let mut rows: Vec<(u32, i64)> = (0..24u32)
            .map(|h| (h, self.counts[h as usize].iter().sum()))
            .filter(|(_, count)| *count > 0)
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1));
        rows.into_iter().take(n).map(|(h, _)| h).collect()
    }
}

/// Count a batch of events into the persistent matrix.
pub fn record_events(conn: &Connection, events: &[Event]) -> Result<()> {
    for event in events {
        let hour = event.occurred_at.hour();
        let weekday = event.occurred_at.weekday().num_days_from_monday();
        conn.execute(
            "INSERT INTO daily_rhythm (hour, weekday, event_count) VALUES (?1, ?2, 1)
             ON CONFLICT (hour, weekday) DO UPDATE SET event_count = event_count + 1",
            params![hour, weekday],
        )?;
    }
    Ok(())
}

/// Drop the matrix and recount it from the whole event log. Used by
/// onboarding; incremental updates are the worker's job.
pub fn rebuild_matrix(conn: &Connection) -> Result<RhythmMatrix> {
    conn.execute("DELETE FROM daily_rhythm", [])?;
    let mut stmt = conn.prepare("SELECT occurred_at FROM events")?;
    let stamps = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for raw in stamps {
        let at = engram_store::types::ts_from_sql(&raw)?;
        conn.execute(
            "INSERT INTO daily_rhythm (hour, weekday, event_count) VALUES (?1, ?2, 1)
             ON CONFLICT (hour, weekday) DO UPDATE SET event_count = event_count + 1",
            params![at.hour(), at.weekday().num_days_from_monday()],
        )?;
    }
    load_matrix(conn)
}

pub fn load_matrix(conn: &Connection) -> Result<RhythmMatrix> {
    let mut matrix = RhythmMatrix { counts: [[0; 7]; 24] };
    let mut stmt = conn.prepare("SELECT hour, weekday, event_count FROM daily_rhythm")?;
    let cells = stmt
        .query_map([], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (hour, weekday, count) in cells {
        if (0..24).contains(&hour) && (0..7).contains(&weekday) {
            matrix.counts[hour as usize][weekday as usize] = count;
        }
    }
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use engram_store::Database;
    use engram_store::types::EventKind;
    use uuid::Uuid;

    use super::*;

    fn event_at(at: DateTime<Utc>) -> Event {
        Event {
            id: Uuid::new_v4(),
            kind: EventKind::MessageSent,
            occurred_at: at,
            payload: serde_json::json!({}),
            context: None,
            processed: false,
        }
    }

    #[test]
    fn matrix_accumulates_by_hour_and_weekday() {
        let db = Database::open(":memory:").unwrap();
        db.with_conn(|conn| {
            // 2026-03-02 is a Monday.
            let monday_nine = DateTime::parse_from_rfc3339("2026-03-02T09:10:00Z")
                .unwrap()
                .with_timezone(&Utc);
            let events: Vec<Event> = (0..3)
                .map(|week| event_at(monday_nine + Duration::weeks(week)))
                .collect();
            record_events(conn, &events)?;
            let matrix = load_matrix(conn)?;
            assert_eq!(matrix.counts[9][0], 3);
            assert_eq!(matrix.total(), 3);
            assert_eq!(matrix.focus_score(9, 0), 1.0);
            assert_eq!(matrix.focus_score(3, 3), 0.0);
            assert_eq!(matrix.peak_hours(1), vec![9]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn empty_matrix_scores_zero_everywhere() {
        let db = Database::open(":memory:").unwrap();
        db.with_conn(|conn| {
            let matrix = load_matrix(conn)?;
            assert_eq!(matrix.focus_score(9, 0), 0.0);
            assert_eq!(matrix.energy_level(9), 0.0);
            assert!(matrix.peak_hours(3).is_empty());
            Ok(())
        })
        .unwrap();
    }
}
