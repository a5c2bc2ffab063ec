//! Append-only, bi-temporal assertion store with supersession.
//!
//! Conflict key is `(subject, predicate)` for literal objects and
//! `(subject, predicate, object_entity_id)` for entity objects. A newer
//! assertion supersedes the old one only when its source instant is not
//! earlier and its confidence is not lower; the old row stays queryable by
//! id and through the as-of axis.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;
use uuid::Uuid;

use engram_store::error::{EngramError, Result};
use engram_store::rows;
use engram_store::types::{Assertion, AssertionObject, SourceKind, ts_to_sql};

use crate::entity;

#[derive(Debug, Clone)]
pub struct NewAssertion {
    pub subject_id: Uuid,
    pub predicate: String,
    pub object: AssertionObject,
    pub confidence: f64,
    pub source_kind: SourceKind,
    pub source_id: String,
    pub source_at: DateTime<Utc>,
    pub embedding_ref: Option<String>,
}

/// Insert an assertion, superseding the current conflicting one when the
/// newcomer qualifies. The extraction instant is stamped here.
pub fn insert_assertion(
    conn: &Connection,
    new: NewAssertion,
    now: DateTime<Utc>,
) -> Result<Assertion> {
    if new.predicate.trim().is_empty() {
        return Err(EngramError::InputInvalid("assertion predicate must be non-empty".into()));
    }
    entity::get_live_entity(conn, new.subject_id)?;
    let (object_entity_id, object_literal) = match &new.object {
        AssertionObject::Entity(id) => {
            entity::get_live_entity(conn, *id)?;
            (Some(id.to_string()), None)
        }
        AssertionObject::Literal(text) => (None, Some(text.clone())),
    };

    let assertion = Assertion {
        id: Uuid::new_v4(),
        subject_id: new.subject_id,
        predicate: new.predicate.clone(),
        object: new.object.clone(),
        confidence: new.confidence.clamp(0.0, 1.0),
        source_kind: new.source_kind,
        source_id: new.source_id.clone(),
        source_at: new.source_at,
        extracted_at: now,
        superseded_by: None,
        superseded_at: None,
        embedding_ref: new.embedding_ref.clone(),
    };

    // Find the current conflicting assertion, if any.
    let conflict = match &object_entity_id {
        Some(object_id) => conn
            .query_row(
                &format!(
                    "SELECT {} FROM assertions
                     WHERE subject_id = ?1 AND predicate = ?2 AND object_entity_id = ?3
                       AND superseded_by IS NULL",
                    rows::ASSERTION_COLS
                ),
                params![new.subject_id.to_string(), new.predicate, object_id],
                rows::assertion_from_row,
            )
            .optional()?,
        None => conn
            .query_row(
                &format!(
                    "SELECT {} FROM assertions
                     WHERE subject_id = ?1 AND predicate = ?2 AND object_entity_id IS NULL
                       AND superseded_by IS NULL",
                    rows::ASSERTION_COLS
                ),
                params![new.subject_id.to_string(), new.predicate],
                rows::assertion_from_row,
            )
            .optional()?,
    };

    conn.execute(
        "INSERT INTO assertions
             (id, subject_id, predicate, object_entity_id, object_literal, confidence,
              source_kind, source_id, source_at, extracted_at, embedding_ref)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            assertion.id.to_string(),
            assertion.subject_id.to_string(),
            assertion.predicate,
            object_entity_id,
            object_literal,
            assertion.confidence,
            assertion.source_kind.as_str(),
            assertion.source_id,
            ts_to_sql(assertion.source_at),
            ts_to_sql(assertion.extracted_at),
            assertion.embedding_ref,
        ],
    )?;

    if let Some(old) = conflict {
        if assertion.source_at >= old.source_at && assertion.confidence >= old.confidence {
            conn.execute(
                "UPDATE assertions SET superseded_by = ?1, superseded_at = ?2 WHERE id = ?3",
                params![assertion.id.to_string(), ts_to_sql(now), old.id.to_string()],
            )?;
            debug!(
                new = %assertion.id,
                old = %old.id,
                predicate = %assertion.predicate,
                "assertion superseded"
            );
        }
    }

    Ok(assertion)
}

pub fn assertion_by_id(conn: &Connection, id: Uuid) -> Result<Assertion> {
    conn.query_row(
        &format!("SELECT {} FROM assertions WHERE id = ?1", rows::ASSERTION_COLS),
        [id.to_string()],
        rows::assertion_from_row,
    )
    .optional()?
    .ok_or(EngramError::NotFound {
        what: "assertion",
        id: id.to_string(),
    })
}

/// Non-superseded assertions about a subject, newest evidence first.
pub fn current_for(conn: &Connection, subject_id: Uuid) -> Result<Vec<Assertion>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM assertions
         WHERE subject_id = ?1 AND superseded_by IS NULL
         ORDER BY source_at DESC",
        rows::ASSERTION_COLS
    ))?;
    let assertions = stmt
        .query_map([subject_id.to_string()], rows::assertion_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(assertions)
}

/// The subject's assertions as the system knew them at `at`: extracted by
/// then, and not yet superseded by then.
pub fn as_of(conn: &Connection, subject_id: Uuid, at: DateTime<Utc>) -> Result<Vec<Assertion>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM assertions
         WHERE subject_id = ?1
           AND extracted_at <= ?2
           AND (superseded_at IS NULL OR superseded_at > ?2)
         ORDER BY source_at DESC",
        rows::ASSERTION_COLS
    ))?;
    let assertions = stmt
        .query_map(
            params![subject_id.to_string(), ts_to_sql(at)],
            rows::assertion_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(assertions)
}

pub fn assertion_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT count(*) FROM assertions", [], |r| r.get(0))?)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use engram_store::Database;
    use engram_store::types::EntityKind;

    use super::*;

    fn subject(conn: &Connection) -> Uuid {
        entity::create_entity(conn, "Jake Miller", EntityKind::Person, Utc::now())
            .unwrap()
            .id
    }

    fn works_at(subject_id: Uuid, literal: &str, source_at: DateTime<Utc>, confidence: f64) -> NewAssertion {
        NewAssertion {
            subject_id,
            predicate: "works_at".to_string(),
            object: AssertionObject::Literal(literal.to_string()),
            confidence,
            source_kind: SourceKind::Mail,
            source_id: "m1".to_string(),
            source_at,
            embedding_ref: None,
        }
    }

    #[test]
    fn newer_equal_confidence_supersedes() {
        let db = Database::open(":memory:").unwrap();
        db.with_conn(|conn| {
            let s = subject(conn);
            let t0 = Utc::now();
            let old = insert_assertion(conn, works_at(s, "Acme", t0, 0.8), t0)?;
            let new = insert_assertion(conn, works_at(s, "Anthropic", t0 + Duration::days(1), 0.8), t0 + Duration::days(1))?;

            let current = current_for(conn, s)?;
            assert_eq!(current.len(), 1);
            assert_eq!(current[0].id, new.id);

            let old_row = assertion_by_id(conn, old.id)?;
            assert_eq!(old_row.superseded_by, Some(new.id));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn lower_confidence_newcomer_does_not_supersede() {
        let db = Database::open(":memory:").unwrap();
        db.with_conn(|conn| {
            let s = subject(conn);
            let t0 = Utc::now();
            let old = insert_assertion(conn, works_at(s, "Acme", t0, 0.9), t0)?;
            insert_assertion(conn, works_at(s, "Anthropic", t0 + Duration::days(1), 0.4), t0 + Duration::days(1))?;
            let old_row = assertion_by_id(conn, old.id)?;
            assert!(old_row.is_current());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn non_conflicting_assertions_grow_the_current_set() {
        let db = Database::open(":memory:").unwrap();
        db.with_conn(|conn| {
            let s = subject(conn);
            let now = Utc::now();
            insert_assertion(conn, works_at(s, "Acme", now, 0.8), now)?;
            let before = current_for(conn, s)?.len();
            insert_assertion(
                conn,
                NewAssertion {
                    predicate: "lives_in".to_string(),
                    ..works_at(s, "Lisbon", now, 0.8)
                },
                now,
            )?;
            assert_eq!(current_for(conn, s)?.len(), before + 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn entity_objects_conflict_per_object() {
        let db = Database::open(":memory:").unwrap();
        db.with_conn(|conn| {
            let s = subject(conn);
            let now = Utc::now();
            let org_a = entity::create_entity(conn, "Acme", EntityKind::Organisation, now)?.id;
            let org_b = entity::create_entity(conn, "Anthropic", EntityKind::Organisation, now)?.id;
            let make = |org: Uuid, at: DateTime<Utc>| NewAssertion {
                object: AssertionObject::Entity(org),
                ..works_at(s, "", at, 0.8)
            };
            insert_assertion(conn, make(org_a, now), now)?;
            insert_assertion(conn, make(org_b, now + Duration::hours(1)), now)?;
            // Different object entities do not conflict.
            assert_eq!(current_for(conn, s)?.len(), 2);
            // Re-observing the same pair supersedes the earlier sighting.
            insert_assertion(conn, make(org_b, now + Duration::hours(2)), now)?;
            assert_eq!(current_for(conn, s)?.len(), 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn as_of_pins_the_recording_axis() {
        let db = Database::open(":memory:").unwrap();
        db.with_conn(|conn| {
            let s = subject(conn);
            let t0 = Utc::now();
            let t1 = t0 + Duration::hours(1);
            let t2 = t0 + Duration::hours(2);

            let old = insert_assertion(conn, works_at(s, "Acme", t1, 0.8), t1)?;
            // Before extraction: invisible.
            assert!(as_of(conn, s, t0)?.is_empty());
            // After extraction: visible.
            assert_eq!(as_of(conn, s, t1)?.len(), 1);

            // Supersede at t2; just before t2 the old row still shows.
            insert_assertion(conn, works_at(s, "Anthropic", t2, 0.9), t2)?;
            let just_before = as_of(conn, s, t2 - Duration::microseconds(1))?;
            assert_eq!(just_before.len(), 1);
            assert_eq!(just_before[0].id, old.id);

            let after = as_of(conn, s, t2)?;
            assert_eq!(after.len(), 1);
            assert_ne!(after[0].id, old.id);
            Ok(())
        })
        .unwrap();
    }
}
