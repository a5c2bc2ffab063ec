//! Per-recipient style extraction — how one correspondent writes, how warm
//! they are, and how quickly they respond.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;
use uuid::Uuid;

use engram_store::Result;
use engram_store::rows;
use engram_store::types::{Message, RecipientStyleProfile, ts_to_sql};

use crate::analysis;

/// Exemplar messages kept per recipient.
const MAX_EXAMPLES: usize = 3;
const EXAMPLE_CHARS: usize = 200;

pub fn load_recipient_style(
    conn: &Connection,
    entity_id: Uuid,
) -> Result<Option<RecipientStyleProfile>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM recipient_style_profiles WHERE entity_id = ?1",
                rows::RECIPIENT_STYLE_COLS
            ),
            [entity_id.to_string()],
            rows::recipient_style_from_row,
        )
        .optional()?)
}

pub fn save_recipient_style(conn: &Connection, profile: &RecipientStyleProfile) -> Result<()> {
    conn.execute(
        "INSERT INTO recipient_style_profiles
             (entity_id, formality, verbosity, emoji_density, avg_message_len, relationship,
              warmth, emoji_usage, avg_response_hours, examples, message_count, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT (entity_id) DO UPDATE SET
             formality = excluded.formality,
             verbosity = excluded.verbosity,
             emoji_density = excluded.emoji_density,
             avg_message_len = excluded.avg_message_len,
             relationship = excluded.relationship,
             warmth = excluded.warmth,
             emoji_usage = excluded.emoji_usage,
             avg_response_hours = excluded.avg_response_hours,
             examples = excluded.examples,
             message_count = excluded.message_count,
             updated_at = excluded.updated_at",
        params![
            profile.entity_id.to_string(),
            profile.formality,
            profile.verbosity,
            profile.emoji_density,
            profile.avg_message_len,
            profile.relationship,
            profile.warmth,
            profile.emoji_usage,
            profile.avg_response_hours,
            serde_json::to_string(&profile.examples)?,
            profile.message_count,
            ts_to_sql(profile.updated_at),
        ],
    )?;
    Ok(())
}

/// Entity ids appearing as a recipient of any sent message — the set the
/// onboarding pass iterates.
pub fn known_recipients(conn: &Connection) -> Result<Vec<Uuid>> {
    let mut stmt =
        conn.prepare("SELECT recipient_ids FROM messages WHERE from_user = 1")?;
    let lists = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut out: Vec<Uuid> = Vec::new();
    for raw in lists {
        if let Ok(ids) = serde_json::from_str::<Vec<Uuid>>(&raw) {
            for id in ids {
                if !out.contains(&id) {
                    out.push(id);
                }
            }
        }
    }
    Ok(out)
}

fn exchanged_messages(conn: &Connection, entity_id: Uuid) -> Result<Vec<Message>> {
    let key = entity_id.to_string();
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages
         WHERE sender_id = ?1 OR recipient_ids LIKE ?2
         ORDER BY sent_at",
        rows::MESSAGE_COLS
    ))?;
    let messages = stmt
        .query_map(params![key, format!("%{key}%")], rows::message_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(messages)
}

/// Recompute the style profile of one recipient from the exchanged corpus.
/// Returns `false` when nothing has ever been exchanged with them.
pub fn extract_recipient_style(
    conn: &Connection,
    entity_id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool> {
    let exchanged = exchanged_messages(conn, entity_id)?;
    if exchanged.is_empty() {
        return Ok(false);
    }

    let theirs: Vec<&Message> = exchanged.iter().filter(|m| m.sender_id == entity_id).collect();
    let bodies: Vec<&str> = theirs.iter().map(|m| m.body_text.as_str()).collect();

    let (formality, emoji_density, warmth, avg_len) = if bodies.is_empty() {
        (0.5, 0.0, 0.5, 0)
    } else {
        let n = bodies.len() as f64;
        (
            bodies.iter().map(|b| analysis::formality(b)).sum::<f64>() / n,
            bodies.iter().map(|b| analysis::emoji_density(b)).sum::<f64>() / n,
            bodies.iter().map(|b| analysis::warmth(b)).sum::<f64>() / n,
            bodies.iter().map(|b| b.chars().count()).sum::<usize>() / bodies.len(),
        )
    };

    // Response time: user message → their next reply in the same thread.
    let mut response_hours = Vec::new();
    for (i, message) in exchanged.iter().enumerate() {
        if !message.from_user || message.thread_id.is_none() {
            continue;
        }
        if let Some(reply) = exchanged[i + 1..].iter().find(|m| {
            m.sender_id == entity_id && m.thread_id == message.thread_id
        }) {
            let hours = (reply.sent_at - message.sent_at).num_minutes() as f64 / 60.0;
            if hours >= 0.0 {
                response_hours.push(hours);
            }
        }
    }
    let avg_response_hours = if response_hours.is_empty() {
        0.0
    } else {
        response_hours.iter().sum::<f64>() / response_hours.len() as f64
    };

    let examples: Vec<String> = theirs
        .iter()
        .rev()
        .take(MAX_EXAMPLES)
        .map(|m| m.body_text.chars().take(EXAMPLE_CHARS).collect())
        .collect();

    let relationship = infer_relationship(conn, entity_id)?;

    let profile = RecipientStyleProfile {
        entity_id,
        formality,
        verbosity: analysis::verbosity(avg_len),
        emoji_density,
        avg_message_len: avg_len as i64,
        relationship,
        warmth,
        emoji_usage: if emoji_density > 0.0 { 1.0 } else { 0.0 },
        avg_response_hours,
        examples,
        message_count: exchanged.len() as i64,
        updated_at: now,
    };
    save_recipient_style(conn, &profile)?;
    debug!(entity = %entity_id, messages = exchanged.len(), "recipient style extracted");
    Ok(true)
}

/// Colleague vs friend, from the context tags of events mentioning messages
/// exchanged with this entity. Best-effort.
fn infer_relationship(conn: &Connection, entity_id: Uuid) -> Result<String> {
    let key = entity_id.to_string();
    let work: i64 = conn.query_row(
        "SELECT count(*) FROM events e
         WHERE e.context = 'work'
           AND e.payload LIKE '%message_id%'
           AND EXISTS (
               SELECT 1 FROM messages m
               WHERE e.payload LIKE '%' || m.id || '%'
                 AND (m.sender_id = ?1 OR m.recipient_ids LIKE '%' || ?1 || '%')
           )",
        [&key],
        |r| r.get(0),
    )?;
    let personal: i64 = conn.query_row(
        "SELECT count(*) FROM events e
         WHERE e.context = 'personal'
           AND e.payload LIKE '%message_id%'
           AND EXISTS (
               SELECT 1 FROM messages m
               WHERE e.payload LIKE '%' || m.id || '%'
                 AND (m.sender_id = ?1 OR m.recipient_ids LIKE '%' || ?1 || '%')
           )",
        [&key],
        |r| r.get(0),
    )?;
    Ok(if work > personal {
        "colleague".to_string()
    } else if personal > 0 {
        "friend".to_string()
    } else {
        "unknown".to_string()
    })
}

#[cfg(test)]
mod tests {
    use engram_core::ingest::{NormalizedMessage, Participant, RecipientKind, RecipientSpec, ingest_batch};
    use engram_core::resolver::IdentityResolver;
    use engram_store::Database;
    use engram_store::types::SourceKind;

    use super::*;

    fn exchange(db: &Database) -> Uuid {
        let mut batch = Vec::new();
        for (i, (from_user, body)) in [
            (true, "Hi Maria, are we still on for the review on Thursday?"),
            (false, "Dear Alex,\n\nYes, Thursday works well. I appreciate the thorough agenda you sent.\n\nKind regards,\nMaria"),
            (true, "Great, see you then!"),
            (false, "Looking forward to it — thanks again, this is great.\n\nKind regards,\nMaria"),
        ]
        .iter()
        .enumerate()
        {
            let (sender, recipient) = if *from_user {
                ("me@self.io", "maria@corp.io")
            } else {
                ("maria@corp.io", "me@self.io")
            };
            batch.push(NormalizedMessage {
                source_kind: SourceKind::Mail,
                source_id: format!("x{i}"),
                thread_id: Some("t1".to_string()),
                sender: Participant {
                    email: Some(sender.to_string()),
                    phone: None,
                    name: Some(if *from_user { "Alex Reed" } else { "Maria Santos" }.to_string()),
                },
                recipients: vec![RecipientSpec {
                    participant: Participant {
                        email: Some(recipient.to_string()),
                        phone: None,
                        name: Some(if *from_user { "Maria Santos" } else { "Alex Reed" }.to_string()),
                    },
                    kind: RecipientKind::To,
                }],
                subject: None,
                body_text: body.to_string(),
                body_raw: None,
                timestamp: Utc::now() + chrono::Duration::hours(i as i64),
                from_user: *from_user,
            });
        }
        let report = ingest_batch(db, &IdentityResolver::default(), None, Some("me@self.io"), &batch);
        assert_eq!(report.ingested, 4);

        db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT id FROM entities WHERE canonical_name = 'Maria Santos'",
                [],
                |r| r.get::<_, String>(0),
            )?)
        })
        .map(|raw| Uuid::parse_str(&raw).unwrap())
        .unwrap()
    }

    #[test]
    fn profile_measures_their_messages_not_ours() {
        let db = Database::open(":memory:").unwrap();
        let maria = exchange(&db);
        db.with_conn(|conn| {
            assert!(extract_recipient_style(conn, maria, Utc::now())?);
            let profile = load_recipient_style(conn, maria)?.expect("profile exists");
            assert_eq!(profile.message_count, 4);
            assert!(profile.formality > 0.55, "Maria writes formally, got {}", profile.formality);
            assert!(profile.warmth > 0.5);
            assert!(!profile.examples.is_empty());
            assert!(profile.avg_response_hours > 0.0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn unknown_recipient_yields_no_profile() {
        let db = Database::open(":memory:").unwrap();
        db.with_conn(|conn| {
            assert!(!extract_recipient_style(conn, Uuid::new_v4(), Utc::now())?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn known_recipients_come_from_sent_messages() {
        let db = Database::open(":memory:").unwrap();
        let maria = exchange(&db);
        db.with_conn(|conn| {
            let recipients = known_recipients(conn)?;
            assert!(recipients.contains(&maria));
            Ok(())
        })
        .unwrap();
    }
}
