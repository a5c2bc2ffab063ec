//! Graph scorer — entity references in the query, two-hop walk, messages
//! scored by the walk strength of their participants.

use std::collections::{HashMap, HashSet};

use rusqlite::{Connection, params};
use tracing::debug;
use uuid::Uuid;

use engram_core::{entity, graph};
use engram_store::Result;
use engram_store::rows;
use engram_store::types::ts_to_sql;

use crate::{ItemRef, SearchOptions};

/// Walk depth for the graph scorer.
const WALK_HOPS: u32 = 2;

/// Entities the query mentions by exact name/alias token match.
pub fn query_entities(conn: &Connection, query: &str) -> Result<Vec<Uuid>> {
    let query_lower = query.to_lowercase();
    let query_tokens: HashSet<String> = query_lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(str::to_string)
        .collect();
    if query_tokens.is_empty() {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM entities WHERE retired = 0",
        rows::ENTITY_COLS
    ))?;
    let live = stmt
        .query_map([], rows::entity_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut mentioned = Vec::new();
    for candidate in live {
        let name_lower = candidate.canonical_name.to_lowercase();
        let name_tokens: Vec<&str> = name_lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        let full_mention = !name_tokens.is_empty()
            && name_tokens.iter().all(|t| query_tokens.contains(*t));
        let first_name_mention = name_tokens
            .first()
            .is_some_and(|t| t.len() >= 3 && query_tokens.contains(*t));

        let mut hit = full_mention || first_name_mention;
        if !hit {
            for attr in entity::attributes_of(conn, candidate.id)? {
                if attr.kind == engram_store::types::AttributeKind::Alias
                    && query_tokens.contains(&attr.value.to_lowercase())
                {
                    hit = true;
                    break;
                }
            }
        }
        if hit {
            mentioned.push(candidate.id);
        }
    }
    Ok(mentioned)
}

/// Ranked message candidates from the two-hop walk; ranks start at 1.
/// Contributes nothing when the query mentions no known entity.
pub fn rank(
    conn: &Connection,
    query: &str,
    options: &SearchOptions,
    limit: usize,
) -> Result<Vec<(ItemRef, usize)>> {
    let seeds = query_entities(conn, query)?;
    if seeds.is_empty() {
        return Ok(Vec::new());
    }
    debug!(seeds = seeds.len(), "graph scorer seeds");

    // Walk score per reached entity: 1.0 for a seed, mean edge strength along
    // the shortest walk otherwise.
    let mut entity_scores: HashMap<Uuid, f64> = HashMap::new();
    for seed in &seeds {
        entity_scores.insert(*seed, 1.0);
        for (reached, hops) in graph::connected_within(conn, *seed, WALK_HOPS)? {
            let Some(path) = graph::shortest_path(conn, *seed, reached, WALK_HOPS)? else {
                continue;
            };
            let mut strength_sum = 0.0;
            for pair in path.windows(2) {
                strength_sum += graph::edge_strength_between(conn, pair[0], pair[1])?;
            }
            let score = strength_sum / f64::from(hops.max(1));
            entity_scores
                .entry(reached)
                .and_modify(|s| *s = s.max(score))
                .or_insert(score);
        }
    }

    // Score messages by the walk scores of their participants.
    let mut message_scores: HashMap<Uuid, (f64, String)> = HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT id, sender_id, recipient_ids, sent_at FROM messages
         WHERE (?1 IS NULL OR source_kind = ?1)
           AND (?2 IS NULL OR sent_at >= ?2)
           AND (?3 IS NULL OR sent_at <= ?3)",
    )?;
    let message_rows = stmt
        .query_map(
            params![
                options.source_kind.map(|k| k.as_str().to_string()),
                options.since.map(ts_to_sql),
                options.until.map(ts_to_sql),
            ],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                ))
            },
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for (id_raw, sender_raw, recipients_raw, sent_at) in message_rows {
        let Ok(id) = Uuid::parse_str(&id_raw) else { continue };
        let mut participants: Vec<Uuid> = Uuid::parse_str(&sender_raw).into_iter().collect();
        if let Ok(recipients) = serde_json::from_str::<Vec<Uuid>>(&recipients_raw) {
            participants.extend(recipients);
        }
        let score: f64 = participants
            .iter()
            .filter_map(|p| entity_scores.get(p))
            .sum();
        if score > 0.0 {
            message_scores.insert(id, (score, sent_at));
        }
    }

    let mut ranked: Vec<(Uuid, f64, String)> = message_scores
        .into_iter()
        .map(|(id, (score, ts))| (id, score, ts))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.2.cmp(&a.2)));
    ranked.truncate(limit);

    Ok(ranked
        .into_iter()
        .enumerate()
        .map(|(i, (id, _, _))| (ItemRef::Message(id), i + 1))
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

    fn seed_message(db: &Database, source_id: &str, sender_name: &str, sender_email: &str, body: &str) {
        let message = NormalizedMessage {
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
                    email: Some("me@self".to_string()),
                    phone: None,
                    name: Some("Me".to_string()),
                },
                kind: RecipientKind::To,
            }],
            subject: None,
            body_text: body.to_string(),
            body_raw: None,
            timestamp: Utc::now(),
            from_user: false,
        };
        assert_eq!(
            ingest_batch(db, &IdentityResolver::default(), None, None, &[message]).ingested,
            1
        );
    }

    #[test]
    fn first_name_mention_seeds_the_walk() {
        let db = Database::open(":memory:").unwrap();
        seed_message(&db, "a", "Jake Miller", "jake@x", "started at Anthropic");
        seed_message(&db, "b", "Nina Patel", "nina@y", "unrelated note");

        let jake_message: Uuid = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT id FROM messages WHERE source_id = 'a'",
                    [],
                    |r| r.get::<_, String>(0),
                )?)
            })
            .map(|raw| Uuid::parse_str(&raw).unwrap())
            .unwrap();

        let hits = db
            .with_conn(|conn| rank(conn, "Where does Jake work?", &SearchOptions::default(), 10))
            .unwrap();
        // Nina's message is faintly reachable through the shared recipient,
        // but Jake's own message must rank first.
        assert_eq!(hits[0], (ItemRef::Message(jake_message), 1));
    }

    #[test]
    fn no_entity_mention_means_no_contribution() {
        let db = Database::open(":memory:").unwrap();
        seed_message(&db, "a", "Jake Miller", "jake@x", "hello");
        let hits = db
            .with_conn(|conn| rank(conn, "quarterly budget forecast", &SearchOptions::default(), 10))
            .unwrap();
        assert!(hits.is_empty());
    }
}
