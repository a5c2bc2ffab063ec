//! Row → struct mappers shared by every crate that queries the store.
//!
//! Each mapper expects the column order of its matching `*_COLS` constant;
//! callers splice that constant into their SELECT so the two cannot drift.

use rusqlite::Row;
use uuid::Uuid;

use crate::types::*;

fn conv<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conv(idx, e))
}

fn uuid_opt_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Uuid::parse_str(&s).map_err(|e| conv(idx, e)))
        .transpose()
}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    let raw: String = row.get(idx)?;
    ts_from_sql(&raw).map_err(|e| conv(idx, e))
}

fn ts_opt_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<chrono::DateTime<chrono::Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| ts_from_sql(&s).map_err(|e| conv(idx, e))).transpose()
}

fn json_at<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conv(idx, e))
}

// ── Entities ──────────────────────────────────────────────────────────────────

pub const ENTITY_COLS: &str =
    "id, canonical_name, kind, created_at, updated_at, merged_ids, retired";

pub fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    let kind_raw: String = row.get(2)?;
    Ok(Entity {
        id: uuid_at(row, 0)?,
        canonical_name: row.get(1)?,
        kind: EntityKind::parse(&kind_raw).map_err(|e| conv(2, e))?,
        created_at: ts_at(row, 3)?,
        updated_at: ts_at(row, 4)?,
        merged_ids: json_at(row, 5)?,
        retired: row.get(6)?,
    })
}

pub const ATTRIBUTE_COLS: &str =
    "id, entity_id, kind, value, confidence, provenance_assertion_id";

pub fn attribute_from_row(row: &Row<'_>) -> rusqlite::Result<EntityAttribute> {
    let kind_raw: String = row.get(2)?;
    Ok(EntityAttribute {
        id: row.get(0)?,
        entity_id: uuid_at(row, 1)?,
        kind: AttributeKind::parse(&kind_raw),
        value: row.get(3)?,
        confidence: row.get(4)?,
        provenance_assertion_id: uuid_opt_at(row, 5)?,
    })
}

// ── Assertions ────────────────────────────────────────────────────────────────

pub const ASSERTION_COLS: &str = "id, subject_id, predicate, object_entity_id, object_literal, \
     confidence, source_kind, source_id, source_at, extracted_at, \
     superseded_by, superseded_at, embedding_ref";

pub fn assertion_from_row(row: &Row<'_>) -> rusqlite::Result<Assertion> {
    let object = match uuid_opt_at(row, 3)? {
        Some(id) => AssertionObject::Entity(id),
        None => AssertionObject::Literal(row.get::<_, Option<String>>(4)?.unwrap_or_default()),
    };
    let source_kind_raw: String = row.get(6)?;
    Ok(Assertion {
        id: uuid_at(row, 0)?,
        subject_id: uuid_at(row, 1)?,
        predicate: row.get(2)?,
        object,
        confidence: row.get(5)?,
        source_kind: SourceKind::parse(&source_kind_raw).map_err(|e| conv(6, e))?,
        source_id: row.get(7)?,
        source_at: ts_at(row, 8)?,
        extracted_at: ts_at(row, 9)?,
        superseded_by: uuid_opt_at(row, 10)?,
        superseded_at: ts_opt_at(row, 11)?,
        embedding_ref: row.get(12)?,
    })
}

// ── Graph edges ───────────────────────────────────────────────────────────────

pub const EDGE_COLS: &str =
    "from_entity_id, to_entity_id, kind, strength, evidence_count, last_evidence_at";

pub fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<GraphEdge> {
    let kind_raw: String = row.get(2)?;
    Ok(GraphEdge {
        from_entity_id: uuid_at(row, 0)?,
        to_entity_id: uuid_at(row, 1)?,
        kind: EdgeKind::parse(&kind_raw),
        strength: row.get(3)?,
        evidence_count: row.get(4)?,
        last_evidence_at: ts_at(row, 5)?,
    })
}

// ── Messages ──────────────────────────────────────────────────────────────────

pub const MESSAGE_COLS: &str = "id, source_kind, source_id, thread_id, sender_id, recipient_ids, \
     subject, body_text, body_raw, sent_at, from_user, processed, attempts";

pub fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let source_kind_raw: String = row.get(1)?;
    Ok(Message {
        id: uuid_at(row, 0)?,
        source_kind: SourceKind::parse(&source_kind_raw).map_err(|e| conv(1, e))?,
        source_id: row.get(2)?,
        thread_id: row.get(3)?,
        sender_id: uuid_at(row, 4)?,
        recipient_ids: json_at::<Vec<Uuid>>(row, 5)?,
        subject: row.get(6)?,
        body_text: row.get(7)?,
        body_raw: row.get(8)?,
        sent_at: ts_at(row, 9)?,
        from_user: row.get(10)?,
        processed: row.get(11)?,
        attempts: row.get(12)?,
    })
}

// ── Events ────────────────────────────────────────────────────────────────────

pub const EVENT_COLS: &str = "id, kind, occurred_at, payload, context, processed";

pub fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let kind_raw: String = row.get(1)?;
    let context_raw: Option<String> = row.get(4)?;
    Ok(Event {
        id: uuid_at(row, 0)?,
        kind: EventKind::parse(&kind_raw).map_err(|e| conv(1, e))?,
        occurred_at: ts_at(row, 2)?,
        payload: json_at(row, 3)?,
        context: context_raw
            .map(|s| ContextTag::parse(&s).map_err(|e| conv(4, e)))
            .transpose()?,
        processed: row.get(5)?,
    })
}

// ── Style profiles ────────────────────────────────────────────────────────────

pub const USER_STYLE_COLS: &str = "formality, verbosity, emoji_density, avg_message_len, \
     greetings, signoffs, signatures, interaction_count, updated_at";

pub fn user_style_from_row(row: &Row<'_>) -> rusqlite::Result<UserStyleProfile> {
    Ok(UserStyleProfile {
        formality: row.get(0)?,
        verbosity: row.get(1)?,
        emoji_density: row.get(2)?,
        avg_message_len: row.get(3)?,
        greetings: json_at(row, 4)?,
        signoffs: json_at(row, 5)?,
        signatures: json_at(row, 6)?,
        interaction_count: row.get(7)?,
        updated_at: ts_at(row, 8)?,
    })
}

pub const RECIPIENT_STYLE_COLS: &str =
    "entity_id, formality, verbosity, emoji_density, avg_message_len, relationship, \
     warmth, emoji_usage, avg_response_hours, examples, message_count, updated_at";

pub fn recipient_style_from_row(row: &Row<'_>) -> rusqlite::Result<RecipientStyleProfile> {
    Ok(RecipientStyleProfile {
        entity_id: uuid_at(row, 0)?,
        formality: row.get(1)?,
        verbosity: row.get(2)?,
        emoji_density: row.get(3)?,
        avg_message_len: row.get(4)?,
        relationship: row.get(5)?,
        warmth: row.get(6)?,
        emoji_usage: row.get(7)?,
        avg_response_hours: row.get(8)?,
        examples: json_at(row, 9)?,
        message_count: row.get(10)?,
        updated_at: ts_at(row, 11)?,
    })
}

// ── Engagement ────────────────────────────────────────────────────────────────

pub const ENGAGEMENT_COLS: &str =
    "id, draft_id, kind, ai_draft_len, user_final_len, edit_ratio, response_sentiment, \
     thread_length, thread_continued, recipient_entity_id, context, adaptation_applied, \
     applied_delta, recorded_at";

pub fn engagement_from_row(row: &Row<'_>) -> rusqlite::Result<EngagementEvent> {
    let kind_raw: String = row.get(2)?;
    let context_raw: Option<String> = row.get(10)?;
    Ok(EngagementEvent {
        id: uuid_at(row, 0)?,
        draft_id: row.get(1)?,
        kind: EngagementKind::parse(&kind_raw).map_err(|e| conv(2, e))?,
        ai_draft_len: row.get(3)?,
        user_final_len: row.get(4)?,
        edit_ratio: row.get(5)?,
        response_sentiment: row.get(6)?,
        thread_length: row.get(7)?,
        thread_continued: row.get(8)?,
        recipient_entity_id: uuid_opt_at(row, 9)?,
        context: context_raw
            .map(|s| ContextTag::parse(&s).map_err(|e| conv(10, e)))
            .transpose()?,
        adaptation_applied: row.get(11)?,
        applied_delta: row.get(12)?,
        recorded_at: ts_at(row, 13)?,
    })
}

pub const EVOLUTION_COLS: &str =
    "id, dimension, old_value, new_value, engagement_event_id, learning_rate, changed_at";

pub fn evolution_from_row(row: &Row<'_>) -> rusqlite::Result<PersonalityEvolutionEntry> {
    let dim_raw: String = row.get(1)?;
    Ok(PersonalityEvolutionEntry {
        id: row.get(0)?,
        dimension: StyleDimension::parse(&dim_raw).map_err(|e| conv(1, e))?,
        old_value: row.get(2)?,
        new_value: row.get(3)?,
        engagement_event_id: uuid_at(row, 4)?,
        learning_rate: row.get(5)?,
        changed_at: ts_at(row, 6)?,
    })
}

// ── Behaviour ─────────────────────────────────────────────────────────────────

pub const PATTERN_COLS: &str =
    "id, kind, key, description, occurrences, confidence, first_seen, last_seen";

pub fn pattern_from_row(row: &Row<'_>) -> rusqlite::Result<BehaviouralPattern> {
    let kind_raw: String = row.get(1)?;
    Ok(BehaviouralPattern {
        id: uuid_at(row, 0)?,
        kind: PatternKind::parse(&kind_raw).map_err(|e| conv(1, e))?,
        key: row.get(2)?,
        description: row.get(3)?,
        occurrences: row.get(4)?,
        confidence: row.get(5)?,
        first_seen: ts_at(row, 6)?,
        last_seen: ts_at(row, 7)?,
    })
}

pub const PREDICTION_COLS: &str =
    "id, kind, description, window_start, window_end, confidence, outcome, created_at";

pub fn prediction_from_row(row: &Row<'_>) -> rusqlite::Result<Prediction> {
    let kind_raw: String = row.get(1)?;
    Ok(Prediction {
        id: uuid_at(row, 0)?,
        kind: PredictionKind::parse(&kind_raw).map_err(|e| conv(1, e))?,
        description: row.get(2)?,
        window_start: ts_at(row, 3)?,
        window_end: ts_at(row, 4)?,
        confidence: row.get(5)?,
        outcome: row.get(6)?,
        created_at: ts_at(row, 7)?,
    })
}

pub const TRIGGER_COLS: &str =
    "id, kind, message, fire_at, acknowledged, accepted, created_at";

pub fn trigger_from_row(row: &Row<'_>) -> rusqlite::Result<ProactiveTrigger> {
    let kind_raw: String = row.get(1)?;
    Ok(ProactiveTrigger {
        id: uuid_at(row, 0)?,
        kind: TriggerKind::parse(&kind_raw).map_err(|e| conv(1, e))?,
        message: row.get(2)?,
        fire_at: ts_at(row, 3)?,
        acknowledged: row.get(4)?,
        accepted: row.get(5)?,
        created_at: ts_at(row, 6)?,
    })
}

// ── Resolver bookkeeping ──────────────────────────────────────────────────────

pub const PROBE_COLS: &str = "id, name, email, phone, alias, context, created_at";

pub fn probe_from_row(row: &Row<'_>) -> rusqlite::Result<PendingProbe> {
    Ok(PendingProbe {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        alias: row.get(4)?,
        context: json_at(row, 5)?,
        created_at: ts_at(row, 6)?,
    })
}

pub const MERGE_LOG_COLS: &str =
    "id, surviving_id, retired_id, retired_snapshot, moved_attribute_ids, merged_at, reverted";

pub fn merge_log_from_row(row: &Row<'_>) -> rusqlite::Result<MergeLogEntry> {
    Ok(MergeLogEntry {
        id: uuid_at(row, 0)?,
        surviving_id: uuid_at(row, 1)?,
        retired_id: uuid_at(row, 2)?,
        retired_snapshot: json_at(row, 3)?,
        moved_attribute_ids: json_at(row, 4)?,
        merged_at: ts_at(row, 5)?,
        reverted: row.get(6)?,
    })
}
