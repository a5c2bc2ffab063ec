//! Relationship graph — directed edges aggregated from assertions and
//! message co-occurrence.
//!
//! Traversals treat edges as undirected neighbourhoods and always bound
//! depth; nothing here keeps cross-row references in memory.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;
use uuid::Uuid;

use engram_store::error::{EngramError, Result};
use engram_store::rows;
use engram_store::types::{EdgeKind, GraphEdge, ts_to_sql};

use crate::entity;

/// Strength gained per unit of new evidence confidence.
const REINFORCEMENT_RATE: f64 = 0.1;
/// Confidence assigned to co-occurrence evidence.
const CO_OCCURRENCE_CONFIDENCE: f64 = 0.3;
/// Default traversal bound.
pub const DEFAULT_MAX_HOPS: u32 = 3;

/// Upsert an edge on `(from, to, kind)`: evidence_count += 1,
/// strength ← min(1, strength + 0.1 · confidence), last_evidence_at ← now.
pub fn upsert_edge(
    conn: &Connection,
    from: Uuid,
    to: Uuid,
    kind: &EdgeKind,
    confidence: f64,
    now: DateTime<Utc>,
) -> Result<GraphEdge> {
    if from == to {
        return Err(EngramError::IntegrityViolated(
            "graph edge endpoints must be distinct".into(),
        ));
    }
    // Both endpoints must be live.
    entity::get_live_entity(conn, from)?;
    entity::get_live_entity(conn, to)?;

    let gain = REINFORCEMENT_RATE * confidence.clamp(0.0, 1.0);
    conn.execute(
        "INSERT INTO graph_edges (from_entity_id, to_entity_id, kind, strength, evidence_count, last_evidence_at)
         VALUES (?1, ?2, ?3, min(1.0, ?4), 1, ?5)
         ON CONFLICT (from_entity_id, to_entity_id, kind) DO UPDATE SET
             strength = min(1.0, strength + ?4),
             evidence_count = evidence_count + 1,
             last_evidence_at = ?5",
        params![from.to_string(), to.to_string(), kind.as_str(), gain, ts_to_sql(now)],
    )?;

    let edge = conn.query_row(
        &format!(
            "SELECT {} FROM graph_edges
             WHERE from_entity_id = ?1 AND to_entity_id = ?2 AND kind = ?3",
            rows::EDGE_COLS
        ),
        params![from.to_string(), to.to_string(), kind.as_str()],
        rows::edge_from_row,
    )?;
    Ok(edge)
}

/// `communicates_with` edges between a sender and each recipient, both
/// directions, at small weight.
pub fn record_co_occurrence(
    conn: &Connection,
    sender: Uuid,
    recipients: &[Uuid],
    now: DateTime<Utc>,
) -> Result<()> {
    for recipient in recipients {
        if *recipient == sender {
            continue;
        }
        upsert_edge(conn, sender, *recipient, &EdgeKind::CommunicatesWith, CO_OCCURRENCE_CONFIDENCE, now)?;
        upsert_edge(conn, *recipient, sender, &EdgeKind::CommunicatesWith, CO_OCCURRENCE_CONFIDENCE, now)?;
    }
    Ok(())
}

/// Edges touching `entity_id` in either direction, optionally filtered by
/// kind and minimum strength, strongest first.
pub fn neighbours(
    conn: &Connection,
    entity_id: Uuid,
    kind: Option<&EdgeKind>,
    min_strength: f64,
) -> Result<Vec<GraphEdge>> {
    let key = entity_id.to_string();
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM graph_edges
         WHERE (from_entity_id = ?1 OR to_entity_id = ?1)
           AND strength >= ?2
           AND (?3 IS NULL OR kind = ?3)
         ORDER BY strength DESC",
        rows::EDGE_COLS
    ))?;
    let edges = stmt
        .query_map(
            params![key, min_strength, kind.map(|k| k.as_str().to_string())],
            rows::edge_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(edges)
}

/// Count of `candidate`'s neighbours (strength ≥ floor) that appear in
/// `context`. Used by resolver stage 3.
pub fn shared_neighbours(
    conn: &Connection,
    candidate: Uuid,
    context: &[Uuid],
    strength_floor: f64,
) -> Result<usize> {
    if context.is_empty() {
        return Ok(0);
    }
    let context: HashSet<Uuid> = context.iter().copied().collect();
    let mut shared = HashSet::new();
    for edge in neighbours(conn, candidate, None, strength_floor)? {
        let other = if edge.from_entity_id == candidate {
            edge.to_entity_id
        } else {
            edge.from_entity_id
        };
        if context.contains(&other) {
            shared.insert(other);
        }
    }
    Ok(shared.len())
}

fn adjacent(conn: &Connection, entity_id: Uuid) -> Result<Vec<Uuid>> {
    let key = entity_id.to_string();
    let mut stmt = conn.prepare(
        "SELECT from_entity_id, to_entity_id FROM graph_edges
         WHERE from_entity_id = ?1 OR to_entity_id = ?1",
    )?;
    let pairs = stmt
        .query_map([key], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut out = Vec::new();
    for (from, to) in pairs {
        let from = Uuid::parse_str(&from)
            .map_err(|e| EngramError::IntegrityViolated(e.to_string()))?;
        let to =
            Uuid::parse_str(&to).map_err(|e| EngramError::IntegrityViolated(e.to_string()))?;
        out.push(if from == entity_id { to } else { from });
    }
    Ok(out)
}

/// Breadth-first shortest path between two entities, bounded by `max_hops`.
/// Returns the node sequence including both endpoints, or `None`.
pub fn shortest_path(
    conn: &Connection,
    a: Uuid,
    b: Uuid,
    max_hops: u32,
) -> Result<Option<Vec<Uuid>>> {
    if a == b {
        return Ok(Some(vec![a]));
    }
    let max_hops = max_hops.min(DEFAULT_MAX_HOPS * 2);
    let mut parents: HashMap<Uuid, Uuid> = HashMap::new();
    let mut depth: HashMap<Uuid, u32> = HashMap::from([(a, 0)]);
    let mut queue = VecDeque::from([a]);

    while let Some(current) = queue.pop_front() {
        let current_depth = depth[&current];
        if current_depth >= max_hops {
            continue;
        }
        for next in adjacent(conn, current)? {
            if depth.contains_key(&next) {
                continue;
            }
            depth.insert(next, current_depth + 1);
            parents.insert(next, current);
            if next == b {
                let mut path = vec![b];
                let mut node = b;
                while let Some(&parent) = parents.get(&node) {
                    path.push(parent);
                    node = parent;
                }
                path.reverse();
                return Ok(Some(path));
            }
            queue.push_back(next);
        }
    }
    Ok(None)
}

/// All entities reachable within `hops`, with their distance.
pub fn connected_within(conn: &Connection, entity_id: Uuid, hops: u32) -> Result<Vec<(Uuid, u32)>> {
    let hops = hops.min(DEFAULT_MAX_HOPS);
    let mut depth: HashMap<Uuid, u32> = HashMap::from([(entity_id, 0)]);
    let mut queue = VecDeque::from([entity_id]);
    while let Some(current) = queue.pop_front() {
        let current_depth = depth[&current];
        if current_depth >= hops {
            continue;
        }
        for next in adjacent(conn, current)? {
            if !depth.contains_key(&next) {
                depth.insert(next, current_depth + 1);
                queue.push_back(next);
            }
        }
    }
    let mut reached: Vec<(Uuid, u32)> = depth
        .into_iter()
        .filter(|(id, _)| *id != entity_id)
        .collect();
    reached.sort_by_key(|(_, d)| *d);
    debug!(entity = %entity_id, hops, reached = reached.len(), "graph walk complete");
    Ok(reached)
}

/// Strength of the direct edge between two entities (either direction,
/// strongest kind), used by the retrieval graph scorer.
pub fn edge_strength_between(conn: &Connection, a: Uuid, b: Uuid) -> Result<f64> {
    let strength: Option<f64> = conn
        .query_row(
            "SELECT max(strength) FROM graph_edges
             WHERE (from_entity_id = ?1 AND to_entity_id = ?2)
                OR (from_entity_id = ?2 AND to_entity_id = ?1)",
            params![a.to_string(), b.to_string()],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    Ok(strength.unwrap_or(0.0))
}

#[cfg(test)]
mod tests {
    use engram_store::Database;
    use engram_store::types::EntityKind;

    use super::*;

    fn seed(conn: &Connection, names: &[&str]) -> Vec<Uuid> {
        names
            .iter()
            .map(|name| {
                entity::create_entity(conn, name, EntityKind::Person, Utc::now())
                    .unwrap()
                    .id
            })
            .collect()
    }

    #[test]
    fn strength_grows_with_diminishing_bound() {
        let db = Database::open(":memory:").unwrap();
        db.with_conn(|conn| {
            let ids = seed(conn, &["A", "B"]);
            let mut last = 0.0;
            for _ in 0..15 {
                let edge = upsert_edge(conn, ids[0], ids[1], &EdgeKind::Knows, 1.0, Utc::now())?;
                assert!(edge.strength >= last);
                assert!(edge.strength <= 1.0);
                last = edge.strength;
            }
            assert!((last - 1.0).abs() < 1e-9, "15 × 0.1 saturates at 1.0");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn self_loops_are_rejected() {
        let db = Database::open(":memory:").unwrap();
        db.with_conn(|conn| {
            let ids = seed(conn, &["A"]);
            assert!(upsert_edge(conn, ids[0], ids[0], &EdgeKind::Knows, 1.0, Utc::now()).is_err());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn shortest_path_respects_hop_bound() {
        let db = Database::open(":memory:").unwrap();
        db.with_conn(|conn| {
            let ids = seed(conn, &["A", "B", "C", "D"]);
            for window in ids.windows(2) {
                upsert_edge(conn, window[0], window[1], &EdgeKind::Knows, 1.0, Utc::now())?;
            }
            let path = shortest_path(conn, ids[0], ids[3], 3)?.expect("path exists");
            assert_eq!(path, vec![ids[0], ids[1], ids[2], ids[3]]);
            assert!(shortest_path(conn, ids[0], ids[3], 2)?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn connected_within_reports_distances() {
        let db = Database::open(":memory:").unwrap();
        db.with_conn(|conn| {
            let ids = seed(conn, &["A", "B", "C"]);
            upsert_edge(conn, ids[0], ids[1], &EdgeKind::Knows, 1.0, Utc::now())?;
            upsert_edge(conn, ids[1], ids[2], &EdgeKind::Knows, 1.0, Utc::now())?;
            let reached = connected_within(conn, ids[0], 2)?;
            assert_eq!(reached.len(), 2);
            assert_eq!(reached[0], (ids[1], 1));
            assert_eq!(reached[1], (ids[2], 2));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn co_occurrence_writes_both_directions() {
        let db = Database::open(":memory:").unwrap();
        db.with_conn(|conn| {
            let ids = seed(conn, &["Sender", "R1"]);
            record_co_occurrence(conn, ids[0], &ids[1..], Utc::now())?;
            let out = neighbours(conn, ids[0], Some(&EdgeKind::CommunicatesWith), 0.0)?;
            assert_eq!(out.len(), 2);
            Ok(())
        })
        .unwrap();
    }
}
