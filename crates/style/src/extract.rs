//! Global user-style extraction from the sent corpus, plus load/save of the
//! single profile row.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use tracing::{debug, info};

use engram_store::Result;
use engram_store::rows;
use engram_store::types::{UserStyleProfile, ts_to_sql};

use crate::analysis;

pub fn load_user_style(conn: &Connection) -> Result<UserStyleProfile> {
    Ok(conn.query_row(
        &format!(
            "SELECT {} FROM user_style_profile WHERE id = 1",
            rows::USER_STYLE_COLS
        ),
        [],
        rows::user_style_from_row,
    )?)
}

pub fn save_user_style(conn: &Connection, profile: &UserStyleProfile) -> Result<()> {
    conn.execute(
        "UPDATE user_style_profile SET
             formality = ?1, verbosity = ?2, emoji_density = ?3, avg_message_len = ?4,
             greetings = ?5, signoffs = ?6, signatures = ?7,
             interaction_count = ?8, updated_at = ?9
         WHERE id = 1",
        params![
            profile.formality,
            profile.verbosity,
            profile.emoji_density,
            profile.avg_message_len,
            serde_json::to_string(&profile.greetings)?,
            serde_json::to_string(&profile.signoffs)?,
            serde_json::to_string(&profile.signatures)?,
            profile.interaction_count,
            ts_to_sql(profile.updated_at),
        ],
    )?;
    Ok(())
}

/// Walk the user's sent messages and recompute the global style profile.
/// The interaction counter is preserved — it belongs to the adaptation loop,
/// not the analyser. Returns the number of messages analysed.
pub fn extract_user_style(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    let mut stmt =
        conn.prepare("SELECT body_text FROM messages WHERE from_user = 1 ORDER BY sent_at")?;
    let bodies = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if bodies.is_empty() {
        debug!("no sent messages — user style unchanged");
        return Ok(0);
    }

    let count = bodies.len() as f64;
    let formality = bodies.iter().map(|b| analysis::formality(b)).sum::<f64>() / count;
    let emoji_density = bodies.iter().map(|b| analysis::emoji_density(b)).sum::<f64>() / count;
    let avg_len = bodies.iter().map(|b| b.chars().count()).sum::<usize>() / bodies.len();
    let verbosity = analysis::verbosity(avg_len);

    let greetings = analysis::recurring_phrases(
        bodies.iter().filter_map(|b| analysis::greeting_candidate(b)),
        2,
        5,
    );
    let signoffs = analysis::recurring_phrases(
        bodies.iter().filter_map(|b| analysis::signoff_candidate(b)),
        2,
        5,
    );
    // Signature phrases recur at the very end across nearly all messages.
    let signatures = analysis::recurring_phrases(
        bodies.iter().filter_map(|b| analysis::signoff_candidate(b)),
        (bodies.len() / 2).max(3),
        2,
    );

    let mut profile = load_user_style(conn)?;
    profile.formality = formality;
    profile.verbosity = verbosity;
    profile.emoji_density = emoji_density;
    profile.avg_message_len = avg_len as i64;
    profile.greetings = greetings;
    profile.signoffs = signoffs;
    profile.signatures = signatures;
    profile.updated_at = now;
    save_user_style(conn, &profile)?;

    info!(
        messages = bodies.len(),
        formality = format!("{formality:.2}"),
        verbosity = format!("{verbosity:.2}"),
        "user style extracted"
    );
    Ok(bodies.len())
}

#[cfg(test)]
mod tests {
    use engram_store::Database;
    use uuid::Uuid;

    use super::*;

    fn seed_sent(conn: &Connection, body: &str, n: usize) {
        let sender = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO entities (id, canonical_name, kind, created_at, updated_at)
             VALUES (?1, 'Me', 'person', '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z')",
            [&sender],
        )
        .unwrap();
        for i in 0..n {
            conn.execute(
                "INSERT INTO messages (id, source_kind, source_id, sender_id, body_text, body_hash, sent_at, from_user)
                 VALUES (?1, 'mail', ?2, ?3, ?4, 'h', '2026-01-01T00:00:00.000000Z', 1)",
                params![Uuid::new_v4().to_string(), format!("s{i}-{body:.4}"), sender, body],
            )
            .unwrap();
        }
    }

    #[test]
    fn profile_reflects_the_corpus_register() {
        let db = Database::open(":memory:").unwrap();
        db.with_conn(|conn| {
            seed_sent(
                conn,
                "Dear team,\n\nPlease find the updated projections attached for review before \
                 the Thursday session.\n\nKind regards,\nAlex",
                4,
            );
            let analysed = extract_user_style(conn, Utc::now())?;
            assert_eq!(analysed, 4);
            let profile = load_user_style(conn)?;
            assert!(profile.formality > 0.6, "formality was {}", profile.formality);
            assert!(profile.greetings.iter().any(|g| g.contains("dear team")));
            assert!(profile.signoffs.iter().any(|s| s.contains("alex")));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn empty_corpus_leaves_the_row_untouched() {
        let db = Database::open(":memory:").unwrap();
        db.with_conn(|conn| {
            assert_eq!(extract_user_style(conn, Utc::now())?, 0);
            let profile = load_user_style(conn)?;
            assert_eq!(profile.formality, 0.5);
            assert_eq!(profile.interaction_count, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn interaction_count_survives_re_extraction() {
        let db = Database::open(":memory:").unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE user_style_profile SET interaction_count = 7 WHERE id = 1",
                [],
            )?;
            seed_sent(conn, "hey! quick one — can't make it, push to fri?", 3);
            extract_user_style(conn, Utc::now())?;
            assert_eq!(load_user_style(conn)?.interaction_count, 7);
            Ok(())
        })
        .unwrap();
    }
}
