//! Lexical scorer — BM25 over the FTS5 message index.

use rusqlite::{Connection, params};

use engram_store::Result;
use engram_store::types::ts_to_sql;
use uuid::Uuid;

use crate::{ItemRef, SearchOptions};

/// Build a safe FTS5 query: bare tokens OR'ed together. FTS operators and
/// punctuation in user input are stripped rather than escaped.
fn fts_query(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

/// Ranked message candidates, best (lowest bm25) first; ranks start at 1.
pub fn rank(
    conn: &Connection,
    query: &str,
    options: &SearchOptions,
    limit: usize,
) -> Result<Vec<(ItemRef, usize)>> {
    let Some(match_expr) = fts_query(query) else {
        return Ok(Vec::new());
    };

    let mut stmt = conn.prepare(
        "SELECT m.id
         FROM messages_fts
         JOIN messages m ON m.rowid = messages_fts.rowid
         WHERE messages_fts MATCH ?1
           AND (?2 IS NULL OR m.source_kind = ?2)
           AND (?3 IS NULL OR m.sent_at >= ?3)
           AND (?4 IS NULL OR m.sent_at <= ?4)
         ORDER BY bm25(messages_fts)
         LIMIT ?5",
    )?;
    let ids = stmt
        .query_map(
            params![
                match_expr,
                options.source_kind.map(|k| k.as_str().to_string()),
                options.since.map(ts_to_sql),
                options.until.map(ts_to_sql),
                limit as i64,
            ],
            |r| r.get::<_, String>(0),
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(ids
        .into_iter()
        .filter_map(|raw| Uuid::parse_str(&raw).ok())
        .enumerate()
        .map(|(i, id)| (ItemRef::Message(id), i + 1))
        .collect())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use engram_core::ingest::{NormalizedMessage, Participant, RecipientKind, RecipientSpec, ingest_batch};
    use engram_core::resolver::IdentityResolver;
    use engram_store::Database;
    use engram_store::types::SourceKind;

    use super::*;

    fn seed(db: &Database, source_id: &str, body: &str) {
        let message = NormalizedMessage {
            source_kind: SourceKind::Mail,
            source_id: source_id.to_string(),
            thread_id: None,
            sender: Participant {
                email: Some("sender@x".to_string()),
                phone: None,
                name: Some("Sender".to_string()),
            },
            recipients: vec![RecipientSpec {
                participant: Participant {
                    email: Some("me@y".to_string()),
                    phone: None,
                    name: None,
                },
                kind: RecipientKind::To,
            }],
            subject: None,
            body_text: body.to_string(),
            body_raw: None,
            timestamp: Utc::now(),
            from_user: false,
        };
        let report = ingest_batch(db, &IdentityResolver::default(), None, None, &[message]);
        assert_eq!(report.ingested, 1);
    }

    #[test]
    fn finds_unique_token_in_body() {
        let db = Database::open(":memory:").unwrap();
        seed(&db, "a", "the wifi password is BlueElephant2024");
        seed(&db, "b", "lunch on thursday");

        let hits = db
            .with_conn(|conn| rank(conn, "office wifi password", &SearchOptions::default(), 10))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, 1);
    }

    #[test]
    fn operator_characters_are_neutralised() {
        let db = Database::open(":memory:").unwrap();
        seed(&db, "a", "quarterly planning notes");
        let hits = db
            .with_conn(|conn| rank(conn, "\"quarterly* AND (notes)\"", &SearchOptions::default(), 10))
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn empty_query_returns_nothing() {
        let db = Database::open(":memory:").unwrap();
        seed(&db, "a", "anything at all");
        let hits = db
            .with_conn(|conn| rank(conn, "???", &SearchOptions::default(), 10))
            .unwrap();
        assert!(hits.is_empty());
    }
}
