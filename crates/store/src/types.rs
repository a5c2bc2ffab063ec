//! Row types and tagged variants for every aggregate the store owns.
//!
//! References between rows are by id, never by pointer; instants are stored
//! as fixed-width UTC text so SQL ordering and Rust ordering agree.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngramError, Result};

// ── Instant encoding ──────────────────────────────────────────────────────────

/// Encode an instant as sortable fixed-width UTC text
/// (`2026-08-01T12:34:56.123456Z`).
pub fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn ts_from_sql(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngramError::IntegrityViolated(format!("bad instant {raw:?}: {e}")))
}

// ── Entities ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    #[default]
    Person,
    Organisation,
    Place,
    Thing,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Person => "person",
            EntityKind::Organisation => "organisation",
            EntityKind::Place => "place",
            EntityKind::Thing => "thing",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "person" => Ok(EntityKind::Person),
            "organisation" => Ok(EntityKind::Organisation),
            "place" => Ok(EntityKind::Place),
            "thing" => Ok(EntityKind::Thing),
            other => Err(EngramError::IntegrityViolated(format!(
                "unknown entity kind {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub canonical_name: String,
    pub kind: EntityKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Audit list of prior ids merged into this entity.
    pub merged_ids: Vec<Uuid>,
    /// A retired entity has been merged away; its id is never reused.
    pub retired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    Email,
    Phone,
    Alias,
    Title,
    Company,
    Other(String),
}

impl AttributeKind {
    pub fn as_str(&self) -> &str {
        match self {
            AttributeKind::Email => "email",
            AttributeKind::Phone => "phone",
            AttributeKind::Alias => "alias",
            AttributeKind::Title => "title",
            AttributeKind::Company => "company",
            AttributeKind::Other(s) => s,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "email" => AttributeKind::Email,
            "phone" => AttributeKind::Phone,
            "alias" => AttributeKind::Alias,
            "title" => AttributeKind::Title,
            "company" => AttributeKind::Company,
            other => AttributeKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityAttribute {
    pub id: i64,
    pub entity_id: Uuid,
    pub kind: AttributeKind,
    pub value: String,
    pub confidence: f64,
    /// The assertion that sourced this attribute, when known.
    pub provenance_assertion_id: Option<Uuid>,
}

// ── Assertions ────────────────────────────────────────────────────────────────

/// The object slot of a subject-predicate-object record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionObject {
    Entity(Uuid),
    Literal(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assertion {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub predicate: String,
    pub object: AssertionObject,
    pub confidence: f64,
    pub source_kind: SourceKind,
    pub source_id: String,
    /// When the evidence was created in the real world.
    pub source_at: DateTime<Utc>,
    /// When the system observed it.
    pub extracted_at: DateTime<Utc>,
    pub superseded_by: Option<Uuid>,
    pub superseded_at: Option<DateTime<Utc>>,
    /// Key into the vector index, when this assertion was embedded.
    pub embedding_ref: Option<String>,
}

impl Assertion {
    pub fn is_current(&self) -> bool {
        self.superseded_by.is_none()
    }
}

// ── Graph edges ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    CommunicatesWith,
    WorksAt,
    LivesIn,
    MarriedTo,
    Knows,
    Other(String),
}

impl EdgeKind {
    pub fn as_str(&self) -> &str {
        match self {
            EdgeKind::CommunicatesWith => "communicates_with",
            EdgeKind::WorksAt => "works_at",
            EdgeKind::LivesIn => "lives_in",
            EdgeKind::MarriedTo => "is_married_to",
            EdgeKind::Knows => "knows",
            EdgeKind::Other(s) => s,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "communicates_with" => EdgeKind::CommunicatesWith,
            "works_at" => EdgeKind::WorksAt,
            "lives_in" => EdgeKind::LivesIn,
            "is_married_to" => EdgeKind::MarriedTo,
            "knows" => EdgeKind::Knows,
            other => EdgeKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from_entity_id: Uuid,
    pub to_entity_id: Uuid,
    pub kind: EdgeKind,
    /// Aggregated strength in [0, 1]; updated by a diminishing-returns rule.
    pub strength: f64,
    pub evidence_count: i64,
    pub last_evidence_at: DateTime<Utc>,
}

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Mail,
    ShortMessage,
    Slack,
    ScreenCapture,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Mail => "mail",
            SourceKind::ShortMessage => "short_message",
            SourceKind::Slack => "slack",
            SourceKind::ScreenCapture => "screen_capture",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "mail" => Ok(SourceKind::Mail),
            "short_message" => Ok(SourceKind::ShortMessage),
            "slack" => Ok(SourceKind::Slack),
            "screen_capture" => Ok(SourceKind::ScreenCapture),
            other => Err(EngramError::InputInvalid(format!(
                "unknown source kind {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub source_kind: SourceKind,
    pub source_id: String,
    pub thread_id: Option<String>,
    pub sender_id: Uuid,
    pub recipient_ids: Vec<Uuid>,
    pub subject: Option<String>,
    pub body_text: String,
    pub body_raw: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub from_user: bool,
    pub processed: bool,
    /// Extraction attempts made so far; incremented on collaborator failure.
    pub attempts: i64,
}

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageSent,
    MessageReceived,
    DraftSent,
    DraftEdited,
    ResponseReceived,
    CalendarEvent,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::MessageSent => "message_sent",
            EventKind::MessageReceived => "message_received",
            EventKind::DraftSent => "draft_sent",
            EventKind::DraftEdited => "draft_edited",
            EventKind::ResponseReceived => "response_received",
            EventKind::CalendarEvent => "calendar_event",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "message_sent" => Ok(EventKind::MessageSent),
            "message_received" => Ok(EventKind::MessageReceived),
            "draft_sent" => Ok(EventKind::DraftSent),
            "draft_edited" => Ok(EventKind::DraftEdited),
            "response_received" => Ok(EventKind::ResponseReceived),
            "calendar_event" => Ok(EventKind::CalendarEvent),
            other => Err(EngramError::IntegrityViolated(format!(
                "unknown event kind {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextTag {
    Work,
    Personal,
}

impl ContextTag {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextTag::Work => "work",
            ContextTag::Personal => "personal",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "work" => Ok(ContextTag::Work),
            "personal" => Ok(ContextTag::Personal),
            other => Err(EngramError::IntegrityViolated(format!(
                "unknown context tag {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub context: Option<ContextTag>,
    pub processed: bool,
}

// ── Style profiles ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StyleDimension {
    Formality,
    Verbosity,
    EmojiDensity,
}

impl StyleDimension {
    pub const ALL: [StyleDimension; 3] = [
        StyleDimension::Formality,
        StyleDimension::Verbosity,
        StyleDimension::EmojiDensity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StyleDimension::Formality => "formality",
            StyleDimension::Verbosity => "verbosity",
            StyleDimension::EmojiDensity => "emoji_density",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "formality" => Ok(StyleDimension::Formality),
            "verbosity" => Ok(StyleDimension::Verbosity),
            "emoji_density" => Ok(StyleDimension::EmojiDensity),
            other => Err(EngramError::IntegrityViolated(format!(
                "unknown style dimension {other:?}"
            ))),
        }
    }
}

/// The single-row aggregate describing how the user writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStyleProfile {
    pub formality: f64,
    pub verbosity: f64,
    pub emoji_density: f64,
    pub avg_message_len: i64,
    pub greetings: Vec<String>,
    pub signoffs: Vec<String>,
    pub signatures: Vec<String>,
    pub interaction_count: i64,
    pub updated_at: DateTime<Utc>,
}

impl UserStyleProfile {
    pub fn dimension(&self, dim: StyleDimension) -> f64 {
        match dim {
            StyleDimension::Formality => self.formality,
            StyleDimension::Verbosity => self.verbosity,
            StyleDimension::EmojiDensity => self.emoji_density,
        }
    }

    pub fn set_dimension(&mut self, dim: StyleDimension, value: f64) {
        let value = value.clamp(0.0, 1.0);
        match dim {
            StyleDimension::Formality => self.formality = value,
            StyleDimension::Verbosity => self.verbosity = value,
            StyleDimension::EmojiDensity => self.emoji_density = value,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientStyleProfile {
    pub entity_id: Uuid,
    pub formality: f64,
    pub verbosity: f64,
    pub emoji_density: f64,
    pub avg_message_len: i64,
    pub relationship: String,
    pub warmth: f64,
    pub emoji_usage: f64,
    pub avg_response_hours: f64,
    pub examples: Vec<String>,
    pub message_count: i64,
    pub updated_at: DateTime<Utc>,
}

impl RecipientStyleProfile {
    pub fn dimension(&self, dim: StyleDimension) -> f64 {
        match dim {
            StyleDimension::Formality => self.formality,
            StyleDimension::Verbosity => self.verbosity,
            StyleDimension::EmojiDensity => self.emoji_density,
        }
    }
}

// ── Engagement ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementKind {
    DraftSent,
    DraftEdited,
    ResponseReceived,
    ThreadContinued,
}

impl EngagementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EngagementKind::DraftSent => "draft_sent",
            EngagementKind::DraftEdited => "draft_edited",
            EngagementKind::ResponseReceived => "response_received",
            EngagementKind::ThreadContinued => "thread_continued",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "draft_sent" => Ok(EngagementKind::DraftSent),
            "draft_edited" => Ok(EngagementKind::DraftEdited),
            "response_received" => Ok(EngagementKind::ResponseReceived),
            "thread_continued" => Ok(EngagementKind::ThreadContinued),
            other => Err(EngramError::IntegrityViolated(format!(
                "unknown engagement kind {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementEvent {
    pub id: Uuid,
    pub draft_id: String,
    pub kind: EngagementKind,
    pub ai_draft_len: Option<i64>,
    pub user_final_len: Option<i64>,
    pub edit_ratio: Option<f64>,
    /// Response sentiment in [-1, 1].
    pub response_sentiment: Option<f64>,
    pub thread_length: Option<i64>,
    pub thread_continued: Option<bool>,
    pub recipient_entity_id: Option<Uuid>,
    pub context: Option<ContextTag>,
    /// Whether the adaptation loop applied this event.
    pub adaptation_applied: bool,
    /// Net absolute style delta applied, if any.
    pub applied_delta: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// Audit row written for every style-dimension change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalityEvolutionEntry {
    pub id: i64,
    pub dimension: StyleDimension,
    pub old_value: f64,
    pub new_value: f64,
    pub engagement_event_id: Uuid,
    pub learning_rate: f64,
    pub changed_at: DateTime<Utc>,
}

// ── Behaviour ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    TimeHabit,
    Sequence,
    DayOfWeek,
    TriggerResponse,
}

impl PatternKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternKind::TimeHabit => "time_habit",
            PatternKind::Sequence => "sequence",
            PatternKind::DayOfWeek => "day_of_week",
            PatternKind::TriggerResponse => "trigger_response",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "time_habit" => Ok(PatternKind::TimeHabit),
            "sequence" => Ok(PatternKind::Sequence),
            "day_of_week" => Ok(PatternKind::DayOfWeek),
            "trigger_response" => Ok(PatternKind::TriggerResponse),
            other => Err(EngramError::IntegrityViolated(format!(
                "unknown pattern kind {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviouralPattern {
    pub id: Uuid,
    pub kind: PatternKind,
    /// Stable key describing the pattern, e.g. `message_sent@09`.
    pub key: String,
    pub description: String,
    pub occurrences: i64,
    pub confidence: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionKind {
    NextAction,
    NeedSurfaced,
    ContextSwitch,
    DeadlineWarning,
}

impl PredictionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PredictionKind::NextAction => "next_action",
            PredictionKind::NeedSurfaced => "need_surfaced",
            PredictionKind::ContextSwitch => "context_switch",
            PredictionKind::DeadlineWarning => "deadline_warning",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "next_action" => Ok(PredictionKind::NextAction),
            "need_surfaced" => Ok(PredictionKind::NeedSurfaced),
            "context_switch" => Ok(PredictionKind::ContextSwitch),
            "deadline_warning" => Ok(PredictionKind::DeadlineWarning),
            other => Err(EngramError::IntegrityViolated(format!(
                "unknown prediction kind {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: Uuid,
    pub kind: PredictionKind,
    pub description: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub confidence: f64,
    /// `None` until marked; then correct (`true`) or incorrect (`false`).
    pub outcome: Option<bool>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    MeetingPrep,
    DeadlineWarning,
    PatternSuggestion,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::MeetingPrep => "meeting_prep",
            TriggerKind::DeadlineWarning => "deadline_warning",
            TriggerKind::PatternSuggestion => "pattern_suggestion",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "meeting_prep" => Ok(TriggerKind::MeetingPrep),
            "deadline_warning" => Ok(TriggerKind::DeadlineWarning),
            "pattern_suggestion" => Ok(TriggerKind::PatternSuggestion),
            other => Err(EngramError::IntegrityViolated(format!(
                "unknown trigger kind {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactiveTrigger {
    pub id: Uuid,
    pub kind: TriggerKind,
    pub message: String,
    pub fire_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub accepted: Option<bool>,
    pub created_at: DateTime<Utc>,
}

// ── Resolver bookkeeping ──────────────────────────────────────────────────────

/// A probe the resolver refused to commit to, parked for later arbitration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingProbe {
    pub id: Uuid,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub alias: Option<String>,
    /// Candidate entity ids and context at quarantine time.
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Audit row written for every merge; carries enough to invert the rewrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeLogEntry {
    pub id: Uuid,
    pub surviving_id: Uuid,
    pub retired_id: Uuid,
    /// JSON snapshot of the retired entity row at merge time.
    pub retired_snapshot: serde_json::Value,
    /// Attribute row ids transferred to the survivor.
    pub moved_attribute_ids: Vec<i64>,
    pub merged_at: DateTime<Utc>,
    pub reverted: bool,
}
