//! Ingestion pipeline: normalise → resolve participants → persist → emit.
//!
//! Each message is atomic: the message row, its participants, and its event
//! all commit together or not at all. Assertion/relationship extraction is
//! not inline — the background worker picks the message up from the
//! unprocessed queue.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use engram_extract::PiiScrubber;
use engram_store::error::{EngramError, Result};
use engram_store::rows;
use engram_store::types::{ContextTag, Event, EventKind, Message, SourceKind, ts_to_sql};
use engram_store::{Database, content_hash};

use crate::graph;
use crate::resolver::{IdentityResolver, Probe};

/// Mail domains that lean personal when tagging context.
const FREE_MAIL_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "hotmail.com",
    "outlook.com",
    "live.com",
    "icloud.com",
    "me.com",
    "aol.com",
    "proton.me",
    "protonmail.com",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Participant {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub name: Option<String>,
}

impl Participant {
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.phone.is_none() && self.name.is_none()
    }

    fn probe(&self) -> Probe {
        Probe::person(self.name.as_deref(), self.email.as_deref(), self.phone.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientKind {
    To,
    Cc,
    Bcc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientSpec {
    #[serde(flatten)]
    pub participant: Participant,
    pub kind: RecipientKind,
}

/// The normalised message shape accepted by ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub source_kind: SourceKind,
    pub source_id: String,
    pub thread_id: Option<String>,
    pub sender: Participant,
    pub recipients: Vec<RecipientSpec>,
    pub subject: Option<String>,
    pub body_text: String,
    pub body_raw: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub from_user: bool,
}

/// Per-batch aggregate returned by `ingest`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub ingested: usize,
    pub skipped: usize,
    pub entities_created: usize,
    pub entities_merged: usize,
    pub errors: Vec<String>,
}

struct ItemOutcome {
    entities_created: usize,
    entities_merged: usize,
}

/// Ingest a batch. One bad item never fails the batch; its error is recorded
/// in the report and processing continues.
#[instrument(skip_all, fields(batch = batch.len()))]
pub fn ingest_batch(
    db: &Database,
    resolver: &IdentityResolver,
    scrubber: Option<&dyn PiiScrubber>,
    user_email: Option<&str>,
    batch: &[NormalizedMessage],
) -> IngestReport {
    let mut report = IngestReport::default();

    for item in batch {
        let result = db.with_tx(|tx| ingest_one(tx, resolver, scrubber, user_email, item));
        match result {
            Ok(outcome) => {
                report.ingested += 1;
                report.entities_created += outcome.entities_created;
                report.entities_merged += outcome.entities_merged;
            }
            Err(EngramError::Duplicate { .. }) => {
                debug!(source_id = %item.source_id, "duplicate message skipped");
                report.skipped += 1;
            }
            Err(err) => {
                report.errors.push(format!("{}/{}: {err}", item.source_kind.as_str(), item.source_id));
            }
        }
    }

    info!(
        ingested = report.ingested,
        skipped = report.skipped,
        created = report.entities_created,
        merged = report.entities_merged,
        errors = report.errors.len(),
        "ingest batch complete"
    );
    report
}

fn ingest_one(
    conn: &Connection,
    resolver: &IdentityResolver,
    scrubber: Option<&dyn PiiScrubber>,
    user_email: Option<&str>,
    item: &NormalizedMessage,
) -> Result<ItemOutcome> {
    if item.source_id.trim().is_empty() {
        return Err(EngramError::InputInvalid("message source_id must be non-empty".into()));
    }
    if item.sender.is_empty() {
        return Err(EngramError::InputInvalid(format!(
            "message {} has no sender",
            item.source_id
        )));
    }

    let duplicate: Option<String> = conn
        .query_row(
            "SELECT id FROM messages WHERE source_kind = ?1 AND source_id = ?2",
            params![item.source_kind.as_str(), item.source_id],
            |r| r.get(0),
        )
        .optional()?;
    if duplicate.is_some() {
        return Err(EngramError::Duplicate {
            source_kind: item.source_kind.as_str().to_string(),
            source_id: item.source_id.clone(),
        });
    }

    let now = Utc::now();
    let mut outcome = ItemOutcome { entities_created: 0, entities_merged: 0 };
    let mut co_occurring: Vec<Uuid> = Vec::new();

    let sender = resolver.resolve(conn, &item.sender.probe(), &co_occurring, now)?;
    track(&mut outcome, sender.created, sender.merged);
    co_occurring.push(sender.entity_id);

    let mut recipient_ids = Vec::new();
    for recipient in &item.recipients {
        if recipient.participant.is_empty() {
            continue;
        }
        let resolved = resolver.resolve(conn, &recipient.participant.probe(), &co_occurring, now)?;
        track(&mut outcome, resolved.created, resolved.merged);
        if !recipient_ids.contains(&resolved.entity_id) {
            recipient_ids.push(resolved.entity_id);
        }
        co_occurring.push(resolved.entity_id);
    }

    let body_text = match scrubber {
        Some(scrubber) => scrubber.scrub(&item.body_text).scrubbed_text,
        None => item.body_text.clone(),
    };

    let from_user = item.from_user
        || matches!(
            (user_email, item.sender.email.as_deref()),
            (Some(mine), Some(theirs)) if mine.eq_ignore_ascii_case(theirs)
        );

    let message_id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO messages
             (id, source_kind, source_id, thread_id, sender_id, recipient_ids,
              subject, body_text, body_raw, body_hash, sent_at, from_user, processed, attempts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, 0)",
        params![
            message_id.to_string(),
            item.source_kind.as_str(),
            item.source_id,
            item.thread_id,
            sender.entity_id.to_string(),
            serde_json::to_string(&recipient_ids)?,
            item.subject,
            body_text,
            item.body_raw,
            content_hash(&body_text),
            ts_to_sql(item.timestamp),
            from_user,
        ],
    )?;

    graph::record_co_occurrence(conn, sender.entity_id, &recipient_ids, now)?;

    let kind = if from_user { EventKind::MessageSent } else { EventKind::MessageReceived };
    let context = infer_context(item.sender.email.as_deref(), item.recipients.len());
    emit_event(
        conn,
        kind,
        item.timestamp,
        json!({
            "message_id": message_id,
            "source_kind": item.source_kind.as_str(),
            "thread_id": item.thread_id,
        }),
        Some(context),
    )?;

    Ok(outcome)
}

fn track(outcome: &mut ItemOutcome, created: bool, merged: bool) {
    if created {
        outcome.entities_created += 1;
    }
    if merged {
        outcome.entities_merged += 1;
    }
}

/// Best-effort work/personal tagging from the sender domain and recipient
/// multiplicity.
pub fn infer_context(sender_email: Option<&str>, recipient_count: usize) -> ContextTag {
    let domain = sender_email
        .and_then(|email| email.rsplit('@').next())
        .map(str::to_lowercase);
    match domain {
        Some(domain) if FREE_MAIL_DOMAINS.contains(&domain.as_str()) => {
            if recipient_count >= 3 {
                ContextTag::Work
            } else {
                ContextTag::Personal
            }
        }
        Some(_) => ContextTag::Work,
        None => {
            if recipient_count <= 1 {
                ContextTag::Personal
            } else {
                ContextTag::Work
            }
        }
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

pub fn emit_event(
    conn: &Connection,
    kind: EventKind,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
    context: Option<ContextTag>,
) -> Result<Event> {
    let event = Event {
        id: Uuid::new_v4(),
        kind,
        occurred_at,
        payload,
        context,
        processed: false,
    };
    conn.execute(
        "INSERT INTO events (id, kind, occurred_at, payload, context, processed)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)",
        params![
            event.id.to_string(),
            kind.as_str(),
            ts_to_sql(occurred_at),
            event.payload.to_string(),
            event.context.map(|c| c.as_str()),
        ],
    )?;
    Ok(event)
}

// ── Message accessors used by the worker and retrieval ────────────────────────

pub fn get_message(conn: &Connection, id: Uuid) -> Result<Message> {
    conn.query_row(
        &format!("SELECT {} FROM messages WHERE id = ?1", rows::MESSAGE_COLS),
        [id.to_string()],
        rows::message_from_row,
    )
    .optional()?
    .ok_or(EngramError::NotFound {
        what: "message",
        id: id.to_string(),
    })
}

pub fn unprocessed_messages(conn: &Connection, limit: usize) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages WHERE processed = 0 ORDER BY sent_at LIMIT ?1",
        rows::MESSAGE_COLS
    ))?;
    let messages = stmt
        .query_map([limit as i64], rows::message_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(messages)
}

pub fn mark_message_processed(conn: &Connection, id: Uuid) -> Result<()> {
    conn.execute("UPDATE messages SET processed = 1 WHERE id = ?1", [id.to_string()])?;
    Ok(())
}

pub fn bump_message_attempts(conn: &Connection, id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE messages SET attempts = attempts + 1 WHERE id = ?1",
        [id.to_string()],
    )?;
    Ok(())
}

pub fn unprocessed_events(conn: &Connection, limit: usize) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM events WHERE processed = 0 ORDER BY occurred_at LIMIT ?1",
        rows::EVENT_COLS
    ))?;
    let events = stmt
        .query_map([limit as i64], rows::event_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}

pub fn mark_event_processed(conn: &Connection, id: Uuid) -> Result<()> {
    conn.execute("UPDATE events SET processed = 1 WHERE id = ?1", [id.to_string()])?;
    Ok(())
}

pub fn message_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT count(*) FROM messages", [], |r| r.get(0))?)
}

pub fn event_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT count(*) FROM events", [], |r| r.get(0))?)
}

#[cfg(test)]
mod tests {
    use engram_store::Database;

    use super::*;

    fn sample(source_id: &str, sender_email: &str, sender_name: &str) -> NormalizedMessage {
        NormalizedMessage {
            source_kind: SourceKind::Mail,
            source_id: source_id.to_string(),
            thread_id: None,
            sender: Participant {
                email: Some(sender_email.to_string()),
                phone: None,
                name: Some(sender_name.to_string()),
            },
            recipients: vec![RecipientSpec {
                participant: Participant {
                    email: Some("me@example.com".to_string()),
                    phone: None,
                    name: Some("Me".to_string()),
                },
                kind: RecipientKind::To,
            }],
            subject: Some("hello".to_string()),
            body_text: "catching up over coffee next week".to_string(),
            body_raw: None,
            timestamp: Utc::now(),
            from_user: false,
        }
    }

    #[test]
    fn ingesting_twice_is_idempotent() {
        let db = Database::open(":memory:").unwrap();
        let resolver = IdentityResolver::default();
        let batch = [sample("s1", "jake@x", "Jake Miller")];

        let first = ingest_batch(&db, &resolver, None, None, &batch);
        assert_eq!((first.ingested, first.skipped), (1, 0));

        let second = ingest_batch(&db, &resolver, None, None, &batch);
        assert_eq!((second.ingested, second.skipped), (0, 1));
        assert!(second.errors.is_empty());

        db.with_conn(|conn| {
            assert_eq!(message_count(conn)?, 1);
            assert_eq!(event_count(conn)?, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn missing_sender_is_a_reported_error_not_a_batch_failure() {
        let db = Database::open(":memory:").unwrap();
        let resolver = IdentityResolver::default();
        let mut bad = sample("s2", "a@b", "A");
        bad.sender = Participant::default();
        let good = sample("s3", "c@d", "C");

        let report = ingest_batch(&db, &resolver, None, None, &[bad, good]);
        assert_eq!(report.ingested, 1);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn sender_matching_user_email_is_from_user() {
        let db = Database::open(":memory:").unwrap();
        let resolver = IdentityResolver::default();
        let batch = [sample("s4", "owner@self.io", "Owner")];
        ingest_batch(&db, &resolver, None, Some("owner@self.io"), &batch);

        db.with_conn(|conn| {
            let sent: i64 = conn.query_row(
                "SELECT count(*) FROM events WHERE kind = 'message_sent'",
                [],
                |r| r.get(0),
            )?;
            assert_eq!(sent, 1);
            let from_user: bool =
                conn.query_row("SELECT from_user FROM messages LIMIT 1", [], |r| r.get(0))?;
            assert!(from_user);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn co_occurrence_edges_are_written() {
        let db = Database::open(":memory:").unwrap();
        let resolver = IdentityResolver::default();
        ingest_batch(&db, &resolver, None, None, &[sample("s5", "jake@x", "Jake Miller")]);
        db.with_conn(|conn| {
            let edges: i64 = conn.query_row(
                "SELECT count(*) FROM graph_edges WHERE kind = 'communicates_with'",
                [],
                |r| r.get(0),
            )?;
            assert_eq!(edges, 2, "sender↔recipient both directions");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn context_inference_heuristics() {
        assert_eq!(infer_context(Some("a@gmail.com"), 1), ContextTag::Personal);
        assert_eq!(infer_context(Some("a@gmail.com"), 4), ContextTag::Work);
        assert_eq!(infer_context(Some("a@corp.io"), 1), ContextTag::Work);
        assert_eq!(infer_context(None, 0), ContextTag::Personal);
    }
}
