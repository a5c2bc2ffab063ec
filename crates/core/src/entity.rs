//! Entity rows: creation, lookup, attributes, and the merge/revert machinery.
//!
//! Merging B into A rewrites every reference (attributes, messages,
//! assertions, edges) to A, appends B to A's merge history, and retires B.
//! The inverse rewrite stays possible while the merge window is open because
//! every merge logs the exact row ids it touched.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use engram_store::error::{EngramError, Result};
use engram_store::rows;
use engram_store::types::{
    AttributeKind, Entity, EntityAttribute, EntityKind, MergeLogEntry, ts_to_sql,
};

pub fn create_entity(
    conn: &Connection,
    name: &str,
    kind: EntityKind,
    now: DateTime<Utc>,
) -> Result<Entity> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngramError::InputInvalid(
            "entity canonical name must be non-empty".into(),
        ));
    }
    let entity = Entity {
        id: Uuid::new_v4(),
        canonical_name: name.to_string(),
        kind,
        created_at: now,
        updated_at: now,
        merged_ids: Vec::new(),
        retired: false,
    };
    conn.execute(
        "INSERT INTO entities (id, canonical_name, kind, created_at, updated_at, merged_ids, retired)
         VALUES (?1, ?2, ?3, ?4, ?5, '[]', 0)",
        params![
            entity.id.to_string(),
            entity.canonical_name,
            kind.as_str(),
            ts_to_sql(now),
            ts_to_sql(now),
        ],
    )?;
    debug!(id = %entity.id, name = %entity.canonical_name, kind = kind.as_str(), "entity created");
    Ok(entity)
}

pub fn get_entity(conn: &Connection, id: Uuid) -> Result<Entity> {
    conn.query_row(
        &format!("SELECT {} FROM entities WHERE id = ?1", rows::ENTITY_COLS),
        [id.to_string()],
        rows::entity_from_row,
    )
    .optional()?
    .ok_or(EngramError::NotFound {
        what: "entity",
        id: id.to_string(),
    })
}

/// Like [`get_entity`] but rejects entities merged away.
pub fn get_live_entity(conn: &Connection, id: Uuid) -> Result<Entity> {
    let entity = get_entity(conn, id)?;
    if entity.retired {
        return Err(EngramError::IntegrityViolated(format!(
            "entity {id} has been merged away"
        )));
    }
    Ok(entity)
}

/// Case-insensitive substring search over canonical names and aliases of
/// live entities.
pub fn find_entities(conn: &Connection, query: &str) -> Result<Vec<Entity>> {
    let needle = format!("%{}%", query.trim().to_lowercase());
    let mut stmt = conn.prepare(&format!(
        "SELECT DISTINCT {cols} FROM entities e
         LEFT JOIN entity_attributes a
                ON a.entity_id = e.id AND a.kind = 'alias'
         WHERE e.retired = 0
           AND (lower(e.canonical_name) LIKE ?1 OR lower(a.value) LIKE ?1)
         ORDER BY e.canonical_name",
        cols = rows::ENTITY_COLS
            .split(", ")
            .map(|c| format!("e.{c}"))
            .collect::<Vec<_>>()
            .join(", "),
    ))?;
    let found = stmt
        .query_map([needle], rows::entity_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(found)
}

pub fn live_entity_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT count(*) FROM entities WHERE retired = 0", [], |r| r.get(0))?)
}

// ── Attributes ────────────────────────────────────────────────────────────────

pub fn attributes_of(conn: &Connection, entity_id: Uuid) -> Result<Vec<EntityAttribute>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM entity_attributes WHERE entity_id = ?1 ORDER BY id",
        rows::ATTRIBUTE_COLS
    ))?;
    let attrs = stmt
        .query_map([entity_id.to_string()], rows::attribute_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(attrs)
}

/// Insert an attribute, ignoring an exact `(entity, kind, value)` duplicate.
/// Returns whether a new row was written.
pub fn add_attribute(
    conn: &Connection,
    entity_id: Uuid,
    kind: &AttributeKind,
    value: &str,
    confidence: f64,
    provenance_assertion_id: Option<Uuid>,
) -> Result<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EngramError::InputInvalid("attribute value must be non-empty".into()));
    }
    let written = conn.execute(
        "INSERT OR IGNORE INTO entity_attributes
             (entity_id, kind, value, confidence, provenance_assertion_id)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entity_id.to_string(),
            kind.as_str(),
            value,
            confidence.clamp(0.0, 1.0),
            provenance_assertion_id.map(|id| id.to_string()),
        ],
    )?;
    Ok(written > 0)
}

/// Find the live entity holding an exact `(kind, value)` attribute.
pub fn find_by_attribute(
    conn: &Connection,
    kind: &AttributeKind,
    value: &str,
) -> Result<Option<Entity>> {
    let entity = conn
        .query_row(
            &format!(
                "SELECT {cols} FROM entities e
                 JOIN entity_attributes a ON a.entity_id = e.id
                 WHERE e.retired = 0 AND a.kind = ?1 AND lower(a.value) = lower(?2)
                 LIMIT 1",
                cols = rows::ENTITY_COLS
                    .split(", ")
                    .map(|c| format!("e.{c}"))
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            params![kind.as_str(), value],
            rows::entity_from_row,
        )
        .optional()?;
    Ok(entity)
}

// ── Merge ─────────────────────────────────────────────────────────────────────

/// Everything a merge rewrote, packed into the merge-log snapshot so the
/// inverse rewrite can be applied later.
#[derive(Debug, Serialize, Deserialize)]
struct MergeSnapshot {
    entity: Entity,
    sender_message_ids: Vec<String>,
    recipient_message_ids: Vec<String>,
    subject_assertion_ids: Vec<String>,
    object_assertion_ids: Vec<String>,
    /// Original edge rows of the retired entity, re-created on revert.
    edges: Vec<engram_store::types::GraphEdge>,
}

/// Merge `retired` into `survivor`. All references are rewritten, the
/// survivor absorbs the retired entity's attributes, and an audit row is
/// appended to `merge_log`.
pub fn merge_entities(
    conn: &Connection,
    survivor_id: Uuid,
    retired_id: Uuid,
    now: DateTime<Utc>,
) -> Result<MergeLogEntry> {
    if survivor_id == retired_id {
        return Err(EngramError::InputInvalid("cannot merge an entity into itself".into()));
    }
    let mut survivor = get_live_entity(conn, survivor_id)?;
    let retired = get_live_entity(conn, retired_id)?;
    if survivor.kind != retired.kind {
        return Err(EngramError::InputInvalid(format!(
            "cannot merge {} into {}: kinds differ",
            retired.canonical_name, survivor.canonical_name
        )));
    }

    let retired_key = retired_id.to_string();
    let survivor_key = survivor_id.to_string();

    // Attributes: re-home with dedup, remembering the surviving row ids.
    let mut moved_attribute_ids = Vec::new();
    for attr in attributes_of(conn, retired_id)? {
        conn.execute(
            "INSERT OR IGNORE INTO entity_attributes
                 (entity_id, kind, value, confidence, provenance_assertion_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                survivor_key,
                attr.kind.as_str(),
                attr.value,
                attr.confidence,
                attr.provenance_assertion_id.map(|id| id.to_string()),
            ],
        )?;
        let moved_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM entity_attributes
                 WHERE entity_id = ?1 AND kind = ?2 AND value = ?3",
                params![survivor_key, attr.kind.as_str(), attr.value],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(id) = moved_id {
            moved_attribute_ids.push(id);
        }
    }
    conn.execute(
        "DELETE FROM entity_attributes WHERE entity_id = ?1",
        [&retired_key],
    )?;

    // Messages: sender rewrites are a plain UPDATE; recipient lists are JSON.
    let sender_message_ids = collect_ids(
        conn,
        "SELECT id FROM messages WHERE sender_id = ?1",
        &retired_key,
    )?;
    conn.execute(
        "UPDATE messages SET sender_id = ?1 WHERE sender_id = ?2",
        params![survivor_key, retired_key],
    )?;

    let mut recipient_message_ids = Vec::new();
    {
        let mut stmt =
            conn.prepare("SELECT id, recipient_ids FROM messages WHERE recipient_ids LIKE ?1")?;
        let hits = stmt
            .query_map([format!("%{retired_key}%")], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (message_id, raw) in hits {
            let before: Vec<Uuid> = serde_json::from_str(&raw)?;
            let mut ids = Vec::with_capacity(before.len());
            for id in &before {
                let id = if *id == retired_id { survivor_id } else { *id };
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            if ids != before {
                conn.execute(
                    "UPDATE messages SET recipient_ids = ?1 WHERE id = ?2",
                    params![serde_json::to_string(&ids)?, message_id],
                )?;
                recipient_message_ids.push(message_id);
            }
        }
    }

    // Assertions: subject and entity-object references.
    let subject_assertion_ids = collect_ids(
        conn,
        "SELECT id FROM assertions WHERE subject_id = ?1",
        &retired_key,
    )?;
    conn.execute(
        "UPDATE assertions SET subject_id = ?1 WHERE subject_id = ?2",
        params![survivor_key, retired_key],
    )?;
    let object_assertion_ids = collect_ids(
        conn,
        "SELECT id FROM assertions WHERE object_entity_id = ?1",
        &retired_key,
    )?;
    conn.execute(
        "UPDATE assertions SET object_entity_id = ?1 WHERE object_entity_id = ?2",
        params![survivor_key, retired_key],
    )?;

    // Edges: fold the retired entity's edges into the survivor's, combining
    // colliding rows and dropping would-be self-loops.
    let mut edges = Vec::new();
    {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM graph_edges WHERE from_entity_id = ?1 OR to_entity_id = ?1",
            rows::EDGE_COLS
        ))?;
        let found = stmt
            .query_map([&retired_key], rows::edge_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        edges.extend(found);
    }
    conn.execute(
        "DELETE FROM graph_edges WHERE from_entity_id = ?1 OR to_entity_id = ?1",
        [&retired_key],
    )?;
    for edge in &edges {
        let from = if edge.from_entity_id == retired_id { survivor_id } else { edge.from_entity_id };
        let to = if edge.to_entity_id == retired_id { survivor_id } else { edge.to_entity_id };
        if from == to {
            continue;
        }
        conn.execute(
            "INSERT INTO graph_edges (from_entity_id, to_entity_id, kind, strength, evidence_count, last_evidence_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (from_entity_id, to_entity_id, kind) DO UPDATE SET
                 strength = min(1.0, max(strength, excluded.strength)),
                 evidence_count = evidence_count + excluded.evidence_count,
                 last_evidence_at = max(last_evidence_at, excluded.last_evidence_at)",
            params![
                from.to_string(),
                to.to_string(),
                edge.kind.as_str(),
                edge.strength,
                edge.evidence_count,
                ts_to_sql(edge.last_evidence_at),
            ],
        )?;
    }

    // Recipient profile rows keyed by the retired id are dropped; they are
    // regenerated from the merged corpus on the next extraction pass.
    conn.execute(
        "DELETE FROM recipient_style_profiles WHERE entity_id = ?1",
        [&retired_key],
    )?;

    // Survivor absorbs the audit history; retired is tombstoned.
    survivor.merged_ids.push(retired_id);
    survivor.merged_ids.extend(retired.merged_ids.iter());
    conn.execute(
        "UPDATE entities SET merged_ids = ?1, updated_at = ?2 WHERE id = ?3",
        params![
            serde_json::to_string(&survivor.merged_ids)?,
            ts_to_sql(now),
            survivor_key,
        ],
    )?;
    conn.execute(
        "UPDATE entities SET retired = 1, updated_at = ?1 WHERE id = ?2",
        params![ts_to_sql(now), retired_key],
    )?;

    let snapshot = MergeSnapshot {
        entity: retired.clone(),
        sender_message_ids,
        recipient_message_ids,
        subject_assertion_ids,
        object_assertion_ids,
        edges,
    };
    let entry = MergeLogEntry {
        id: Uuid::new_v4(),
        surviving_id: survivor_id,
        retired_id,
        retired_snapshot: serde_json::to_value(&snapshot)?,
        moved_attribute_ids,
        merged_at: now,
        reverted: false,
    };
    conn.execute(
        "INSERT INTO merge_log (id, surviving_id, retired_id, retired_snapshot, moved_attribute_ids, merged_at, reverted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
        params![
            entry.id.to_string(),
            survivor_key,
            retired_key,
            serde_json::to_string(&snapshot)?,
            serde_json::to_string(&entry.moved_attribute_ids)?,
            ts_to_sql(now),
        ],
    )?;

    info!(
        survivor = %survivor_id,
        retired = %retired_id,
        attributes = entry.moved_attribute_ids.len(),
        "entities merged"
    );
    Ok(entry)
}

/// Apply the inverse rewrite of the most recent un-reverted merge of
/// `retired_id`, provided the revert window is still open.
pub fn revert_merge(
    conn: &Connection,
    retired_id: Uuid,
    window_hours: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let entry = conn
        .query_row(
            &format!(
                "SELECT {} FROM merge_log WHERE retired_id = ?1 AND reverted = 0
                 ORDER BY merged_at DESC LIMIT 1",
                rows::MERGE_LOG_COLS
            ),
            [retired_id.to_string()],
            rows::merge_log_from_row,
        )
        .optional()?
        .ok_or(EngramError::NotFound {
            what: "merge-log entry",
            id: retired_id.to_string(),
        })?;

    if now - entry.merged_at > Duration::hours(window_hours) {
        return Err(EngramError::InputInvalid(format!(
            "merge of {retired_id} is older than the {window_hours}h revert window"
        )));
    }

    let snapshot: MergeSnapshot = serde_json::from_value(entry.retired_snapshot.clone())?;
    let retired_key = retired_id.to_string();
    let survivor_key = entry.surviving_id.to_string();

    // Restore the tombstoned entity.
    conn.execute(
        "UPDATE entities SET retired = 0, updated_at = ?1 WHERE id = ?2",
        params![ts_to_sql(now), retired_key],
    )?;

    // Give back the attribute rows that were re-homed.
    for attr_id in &entry.moved_attribute_ids {
        conn.execute(
            "UPDATE entity_attributes SET entity_id = ?1 WHERE id = ?2 AND entity_id = ?3",
            params![retired_key, attr_id, survivor_key],
        )?;
    }

    for message_id in &snapshot.sender_message_ids {
        conn.execute(
            "UPDATE messages SET sender_id = ?1 WHERE id = ?2",
            params![retired_key, message_id],
        )?;
    }
    for message_id in &snapshot.recipient_message_ids {
        let raw: String = conn.query_row(
            "SELECT recipient_ids FROM messages WHERE id = ?1",
            [message_id],
            |r| r.get(0),
        )?;
        let mut ids: Vec<Uuid> = serde_json::from_str(&raw)?;
        for id in &mut ids {
            if *id == entry.surviving_id {
                *id = retired_id;
            }
        }
        conn.execute(
            "UPDATE messages SET recipient_ids = ?1 WHERE id = ?2",
            params![serde_json::to_string(&ids)?, message_id],
        )?;
    }

    for assertion_id in &snapshot.subject_assertion_ids {
        conn.execute(
            "UPDATE assertions SET subject_id = ?1 WHERE id = ?2",
            params![retired_key, assertion_id],
        )?;
    }
    for assertion_id in &snapshot.object_assertion_ids {
        conn.execute(
            "UPDATE assertions SET object_entity_id = ?1 WHERE id = ?2",
            params![retired_key, assertion_id],
        )?;
    }

    // Re-create the retired entity's original edges.
    for edge in &snapshot.edges {
        conn.execute(
            "INSERT OR REPLACE INTO graph_edges
                 (from_entity_id, to_entity_id, kind, strength, evidence_count, last_evidence_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                edge.from_entity_id.to_string(),
                edge.to_entity_id.to_string(),
                edge.kind.as_str(),
                edge.strength,
                edge.evidence_count,
                ts_to_sql(edge.last_evidence_at),
            ],
        )?;
    }

    // Strip the retired id from the survivor's merge history.
    let survivor = get_entity(conn, entry.surviving_id)?;
    let merged_ids: Vec<Uuid> = survivor
        .merged_ids
        .into_iter()
        .filter(|id| *id != retired_id)
        .collect();
    conn.execute(
        "UPDATE entities SET merged_ids = ?1, updated_at = ?2 WHERE id = ?3",
        params![serde_json::to_string(&merged_ids)?, ts_to_sql(now), survivor_key],
    )?;

    conn.execute(
        "UPDATE merge_log SET reverted = 1 WHERE id = ?1",
        [entry.id.to_string()],
    )?;
    info!(retired = %retired_id, survivor = %entry.surviving_id, "merge reverted");
    Ok(())
}

fn collect_ids(conn: &Connection, sql: &str, key: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map([key], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}
