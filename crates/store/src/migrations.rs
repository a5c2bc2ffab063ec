//! Numbered schema migrations, applied in order at open-time.
//!
//! The current version lives in the one-row `schema_version` table. Opening
//! an older database upgrades it in place; each migration runs inside one
//! transaction.

use rusqlite::Connection;
use tracing::info;

use crate::error::{EngramError, Result};

/// Migration bodies, index 0 = version 1.
const MIGRATIONS: &[&str] = &[
    // ── v1: identity graph, assertions, messages, events ──────────────────────
    r#"
    CREATE TABLE entities (
        id             TEXT PRIMARY KEY,
        canonical_name TEXT NOT NULL CHECK (length(canonical_name) > 0),
        kind           TEXT NOT NULL,
        created_at     TEXT NOT NULL,
        updated_at     TEXT NOT NULL,
        merged_ids     TEXT NOT NULL DEFAULT '[]',
        retired        INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE entity_attributes (
        id                      INTEGER PRIMARY KEY,
        entity_id               TEXT NOT NULL REFERENCES entities(id),
        kind                    TEXT NOT NULL,
        value                   TEXT NOT NULL,
        confidence              REAL NOT NULL DEFAULT 0.8,
        provenance_assertion_id TEXT,
        UNIQUE (entity_id, kind, value)
    );
    CREATE INDEX idx_attributes_by_value ON entity_attributes(kind, value);

    CREATE TABLE assertions (
        id               TEXT PRIMARY KEY,
        subject_id       TEXT NOT NULL REFERENCES entities(id),
        predicate        TEXT NOT NULL,
        object_entity_id TEXT,
        object_literal   TEXT,
        confidence       REAL NOT NULL,
        source_kind      TEXT NOT NULL,
        source_id        TEXT NOT NULL,
        source_at        TEXT NOT NULL,
        extracted_at     TEXT NOT NULL,
        superseded_by    TEXT,
        superseded_at    TEXT,
        embedding_ref    TEXT,
        CHECK (object_entity_id IS NOT NULL OR object_literal IS NOT NULL)
    );
    CREATE INDEX idx_assertions_subject ON assertions(subject_id, predicate);

    CREATE TABLE graph_edges (
        from_entity_id   TEXT NOT NULL,
        to_entity_id     TEXT NOT NULL,
        kind             TEXT NOT NULL,
        strength         REAL NOT NULL,
        evidence_count   INTEGER NOT NULL,
        last_evidence_at TEXT NOT NULL,
        PRIMARY KEY (from_entity_id, to_entity_id, kind)
    );
    CREATE INDEX idx_edges_from ON graph_edges(from_entity_id, strength);

    CREATE TABLE messages (
        id            TEXT PRIMARY KEY,
        source_kind   TEXT NOT NULL,
        source_id     TEXT NOT NULL,
        thread_id     TEXT,
        sender_id     TEXT NOT NULL REFERENCES entities(id),
        recipient_ids TEXT NOT NULL DEFAULT '[]',
        subject       TEXT,
        body_text     TEXT NOT NULL,
        body_raw      TEXT,
        body_hash     TEXT NOT NULL,
        sent_at       TEXT NOT NULL,
        from_user     INTEGER NOT NULL DEFAULT 0,
        processed     INTEGER NOT NULL DEFAULT 0,
        attempts      INTEGER NOT NULL DEFAULT 0,
        UNIQUE (source_kind, source_id)
    );
    CREATE INDEX idx_messages_unprocessed ON messages(processed, sent_at);

    CREATE VIRTUAL TABLE messages_fts USING fts5(
        subject, body_text,
        content='messages', content_rowid='rowid'
    );
    CREATE TRIGGER messages_ai AFTER INSERT ON messages BEGIN
        INSERT INTO messages_fts(rowid, subject, body_text)
        VALUES (new.rowid, new.subject, new.body_text);
    END;
    CREATE TRIGGER messages_ad AFTER DELETE ON messages BEGIN
        INSERT INTO messages_fts(messages_fts, rowid, subject, body_text)
        VALUES ('delete', old.rowid, old.subject, old.body_text);
    END;
    CREATE TRIGGER messages_au AFTER UPDATE OF subject, body_text ON messages BEGIN
        INSERT INTO messages_fts(messages_fts, rowid, subject, body_text)
        VALUES ('delete', old.rowid, old.subject, old.body_text);
        INSERT INTO messages_fts(rowid, subject, body_text)
        VALUES (new.rowid, new.subject, new.body_text);
    END;

    CREATE TABLE events (
        id          TEXT PRIMARY KEY,
        kind        TEXT NOT NULL,
        occurred_at TEXT NOT NULL,
        payload     TEXT NOT NULL DEFAULT '{}',
        context     TEXT,
        processed   INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX idx_events_unprocessed ON events(processed, occurred_at);
    "#,
    // ── v2: style profiles and the engagement loop ────────────────────────────
    r#"
    CREATE TABLE user_style_profile (
        id                INTEGER PRIMARY KEY CHECK (id = 1),
        formality         REAL NOT NULL DEFAULT 0.5,
        verbosity         REAL NOT NULL DEFAULT 0.5,
        emoji_density     REAL NOT NULL DEFAULT 0.0,
        avg_message_len   INTEGER NOT NULL DEFAULT 0,
        greetings         TEXT NOT NULL DEFAULT '[]',
        signoffs          TEXT NOT NULL DEFAULT '[]',
        signatures        TEXT NOT NULL DEFAULT '[]',
        interaction_count INTEGER NOT NULL DEFAULT 0,
        updated_at        TEXT NOT NULL
    );
    INSERT INTO user_style_profile (id, updated_at) VALUES (1, '1970-01-01T00:00:00.000000Z');

    CREATE TABLE recipient_style_profiles (
        entity_id          TEXT PRIMARY KEY REFERENCES entities(id),
        formality          REAL NOT NULL DEFAULT 0.5,
        verbosity          REAL NOT NULL DEFAULT 0.5,
        emoji_density      REAL NOT NULL DEFAULT 0.0,
        avg_message_len    INTEGER NOT NULL DEFAULT 0,
        relationship       TEXT NOT NULL DEFAULT 'unknown',
        warmth             REAL NOT NULL DEFAULT 0.5,
        emoji_usage        REAL NOT NULL DEFAULT 0.0,
        avg_response_hours REAL NOT NULL DEFAULT 0.0,
        examples           TEXT NOT NULL DEFAULT '[]',
        message_count      INTEGER NOT NULL DEFAULT 0,
        updated_at         TEXT NOT NULL
    );

    CREATE TABLE engagement_events (
        id                  TEXT PRIMARY KEY,
        draft_id            TEXT NOT NULL,
        kind                TEXT NOT NULL,
        ai_draft_len        INTEGER,
        user_final_len      INTEGER,
        edit_ratio          REAL,
        response_sentiment  REAL,
        thread_length       INTEGER,
        thread_continued    INTEGER,
        recipient_entity_id TEXT,
        context             TEXT,
        adaptation_applied  INTEGER NOT NULL DEFAULT 0,
        applied_delta       REAL,
        recorded_at         TEXT NOT NULL
    );
    CREATE INDEX idx_engagement_recency ON engagement_events(recorded_at);

    CREATE TABLE personality_evolution (
        id                  INTEGER PRIMARY KEY,
        dimension           TEXT NOT NULL,
        old_value           REAL NOT NULL,
        new_value           REAL NOT NULL,
        engagement_event_id TEXT NOT NULL,
        learning_rate       REAL NOT NULL,
        changed_at          TEXT NOT NULL
    );
    "#,
    // ── v3: behaviour layer, quarantine, merge audit, onboarding marker ───────
    r#"
    CREATE TABLE behaviour_patterns (
        id          TEXT PRIMARY KEY,
        kind        TEXT NOT NULL,
        key         TEXT NOT NULL,
        description TEXT NOT NULL,
        occurrences INTEGER NOT NULL DEFAULT 1,
        confidence  REAL NOT NULL DEFAULT 0.0,
        first_seen  TEXT NOT NULL,
        last_seen   TEXT NOT NULL,
        UNIQUE (kind, key)
    );

    CREATE TABLE daily_rhythm (
        hour        INTEGER NOT NULL CHECK (hour BETWEEN 0 AND 23),
        weekday     INTEGER NOT NULL CHECK (weekday BETWEEN 0 AND 6),
        event_count INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (hour, weekday)
    );

    CREATE TABLE predictions (
        id           TEXT PRIMARY KEY,
        kind         TEXT NOT NULL,
        description  TEXT NOT NULL,
        window_start TEXT NOT NULL,
        window_end   TEXT NOT NULL,
        confidence   REAL NOT NULL,
        outcome      INTEGER,
        created_at   TEXT NOT NULL
    );

    CREATE TABLE proactive_triggers (
        id           TEXT PRIMARY KEY,
        kind         TEXT NOT NULL,
        message      TEXT NOT NULL,
        fire_at      TEXT NOT NULL,
        acknowledged INTEGER NOT NULL DEFAULT 0,
        accepted     INTEGER,
        created_at   TEXT NOT NULL
    );

    CREATE TABLE pending_probes (
        id         TEXT PRIMARY KEY,
        name       TEXT,
        email      TEXT,
        phone      TEXT,
        alias      TEXT,
        context    TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    );

    CREATE TABLE merge_log (
        id                  TEXT PRIMARY KEY,
        surviving_id        TEXT NOT NULL,
        retired_id          TEXT NOT NULL,
        retired_snapshot    TEXT NOT NULL,
        moved_attribute_ids TEXT NOT NULL DEFAULT '[]',
        merged_at           TEXT NOT NULL,
        reverted            INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE onboarding_state (
        id           INTEGER PRIMARY KEY CHECK (id = 1),
        completed_at TEXT,
        profile      TEXT
    );
    INSERT INTO onboarding_state (id, completed_at, profile) VALUES (1, NULL, NULL);
    "#,
];

pub const CURRENT_VERSION: i64 = MIGRATIONS.len() as i64;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            id      INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );
        INSERT OR IGNORE INTO schema_version (id, version) VALUES (1, 0);",
    )?;

    let mut version: i64 =
        conn.query_row("SELECT version FROM schema_version WHERE id = 1", [], |r| {
            r.get(0)
        })?;

    if version > CURRENT_VERSION {
        return Err(EngramError::Migration(format!(
            "database schema v{version} is newer than this build (v{CURRENT_VERSION})"
        )));
    }

    while version < CURRENT_VERSION {
        let next = version + 1;
        let body = MIGRATIONS[version as usize];
        let tx_result: Result<()> = (|| {
            conn.execute_batch("BEGIN")?;
            conn.execute_batch(body)?;
            conn.execute(
                "UPDATE schema_version SET version = ?1 WHERE id = 1",
                [next],
            )?;
            conn.execute_batch("COMMIT")?;
            Ok(())
        })();
        if let Err(err) = tx_result {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(EngramError::Migration(format!(
                "migration to v{next} failed: {err}"
            )));
        }
        info!(from = version, to = next, "schema migrated");
        version = next;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrates_fresh_database_to_current() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        let version: i64 = conn
            .query_row("SELECT version FROM schema_version WHERE id = 1", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn rerunning_is_a_no_op() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn fts_triggers_track_message_rows() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        conn.execute(
            "INSERT INTO entities (id, canonical_name, kind, created_at, updated_at)
             VALUES ('e1', 'Test', 'person', '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO messages (id, source_kind, source_id, sender_id, body_text, body_hash, sent_at)
             VALUES ('m1', 'mail', 's1', 'e1', 'zanzibar shipment arrives', 'h', '2026-01-01T00:00:00.000000Z')",
            [],
        )
        .unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT count(*) FROM messages_fts WHERE messages_fts MATCH 'zanzibar'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        conn.execute("DELETE FROM messages WHERE id = 'm1'", []).unwrap();
        let hits_after: i64 = conn
            .query_row(
                "SELECT count(*) FROM messages_fts WHERE messages_fts MATCH 'zanzibar'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hits_after, 0);
    }
}
