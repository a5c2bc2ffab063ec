//! Engram — a local-first personal-memory engine.
//!
//! The entire core is exposed through the opaque [`Engram`] handle: ingest
//! normalised messages, search the corpus with hybrid retrieval, resolve and
//! inspect entities, read and adapt communication style, and drive the
//! background workers. Collaborators (LLM extractor, embedder, PII scrubber,
//! identity arbiter) are injected at construction; sensible local defaults
//! keep the engine functional without any of them.
//!
//! ```no_run
//! # use engram::{Engram, EngineConfig};
//! # async fn demo() -> engram::Result<()> {
//! let engram = Engram::open(EngineConfig::at("/tmp/engram/engram.db"))?;
//! let results = engram.search("Where does Jake work?", 10)?;
//! engram.close().await;
//! # Ok(())
//! # }
//! ```

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use engram_core::resolver::IdentityResolver;
use engram_core::{assertion, entity, graph, ingest};
use engram_extract::{Embedder, FactExtractor, IdentityArbiter, PiiScrubber, RuleBasedExtractor};
use engram_runtime::worker::{spawn_processing_worker, WorkerHandle};
use engram_runtime::{proactive, WorkerContext};
use engram_store::types::{
    Assertion, EngagementKind, Entity, EntityAttribute, GraphEdge, PersonalityEvolutionEntry,
    ProactiveTrigger, RecipientStyleProfile, SourceKind, StyleDimension, UserStyleProfile,
};
use engram_store::{Database, VectorIndex};
use engram_style::{adapt, engagement, extract as style_extract, mirror, recipient};

pub use engram_config::{AdaptationConfig, EngagementWeights, EngineConfig};
pub use engram_core::{IngestReport, NormalizedMessage, Participant, Probe, RecipientKind,
    RecipientSpec, Resolved};
pub use engram_extract::{ArbiterVerdict, ExtractionOutcome, HashingEmbedder, ScrubOutcome};
pub use engram_retrieval::{ResultKind, ScorerKind, SearchOptions, SearchResult};
pub use engram_runtime::{CycleReport, OnboardingReport};
pub use engram_store::{EngramError, Result};
pub use engram_style::{AdaptationOutcome, DriftReport, EngagementSignal, EngagementSummary,
    LearningStats, MirrorPrompt};

/// Recipient-style rows kept hot in the façade cache.
const STYLE_CACHE_CAPACITY: usize = 64;

// ── Views ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityView {
    pub entity: Entity,
    pub attributes: Vec<EntityAttribute>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityGraphView {
    pub entity: Entity,
    pub edges: Vec<GraphEdge>,
    /// Entities reachable within the hop bound, with their distance.
    pub reachable: Vec<(Uuid, u32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityStateView {
    pub entity: Entity,
    pub as_of: DateTime<Utc>,
    pub assertions: Vec<Assertion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub entities: i64,
    pub messages: i64,
    pub events: i64,
    pub assertions: i64,
    pub edges: i64,
    pub patterns: i64,
    pub pending_probes: i64,
    pub vectors: usize,
    pub prediction_accuracy: Option<f64>,
    pub trigger_acceptance_rate: Option<f64>,
}

// ── Builder ───────────────────────────────────────────────────────────────────

pub struct EngramBuilder {
    config: EngineConfig,
    extractor: Arc<dyn FactExtractor>,
    embedder: Option<Arc<dyn Embedder>>,
    arbiter: Option<Arc<dyn IdentityArbiter>>,
    scrubber: Option<Arc<dyn PiiScrubber>>,
}

impl EngramBuilder {
    pub fn extractor(mut self, extractor: Arc<dyn FactExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn arbiter(mut self, arbiter: Arc<dyn IdentityArbiter>) -> Self {
        self.arbiter = Some(arbiter);
        self
    }

    pub fn scrubber(mut self, scrubber: Arc<dyn PiiScrubber>) -> Self {
        self.scrubber = Some(scrubber);
        self
    }

    /// Initialise: open and migrate the database, open the vector index,
    /// and assemble the handle.
    pub fn build(self) -> Result<Engram> {
        let db = Arc::new(Database::open(&self.config.db_path)?);
        let vectors = if self.config.is_in_memory() {
            Arc::new(VectorIndex::in_memory())
        } else {
            Arc::new(VectorIndex::open(
                self.config.vector_dir.as_deref().map(std::path::Path::new),
            ))
        };
        let ctx = Arc::new(WorkerContext {
            db,
            vectors,
            resolver: IdentityResolver::default(),
            extractor: self.extractor,
            embedder: self.embedder,
            arbiter: self.arbiter,
            config: self.config,
        });
        info!(db = %ctx.db.path(), "engram initialised");
        Ok(Engram {
            ctx,
            scrubber: self.scrubber,
            worker: Mutex::new(None),
            proactive: Mutex::new(None),
            style_cache: Mutex::new(StyleCache::new()),
        })
    }
}

struct StyleCache {
    user: Option<UserStyleProfile>,
    recipients: LruCache<Uuid, RecipientStyleProfile>,
}

impl StyleCache {
    fn new() -> Self {
        Self {
            user: None,
            recipients: LruCache::new(
                NonZeroUsize::new(STYLE_CACHE_CAPACITY).expect("non-zero capacity"),
            ),
        }
    }

    fn clear(&mut self) {
        self.user = None;
        self.recipients.clear();
    }
}

// ── The handle ────────────────────────────────────────────────────────────────

pub struct Engram {
    ctx: Arc<WorkerContext>,
    scrubber: Option<Arc<dyn PiiScrubber>>,
    worker: Mutex<Option<WorkerHandle>>,
    proactive: Mutex<Option<WorkerHandle>>,
    style_cache: Mutex<StyleCache>,
}

impl Engram {
    pub fn builder(config: EngineConfig) -> EngramBuilder {
        EngramBuilder {
            config,
            extractor: Arc::new(RuleBasedExtractor::default()),
            embedder: None,
            arbiter: None,
            scrubber: None,
        }
    }

    /// Construct with default collaborators: the bundled rule-based
    /// extractor, no embedder, no arbiter, no scrubber.
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Stop the background services and release the handle.
    pub async fn close(self) {
        self.stop_processing_worker().await;
        self.stop_proactive_service().await;
        info!("engram closed");
    }

    fn invalidate_style_cache(&self) {
        self.style_cache.lock().expect("cache mutex poisoned").clear();
    }

    // ── Ingestion ─────────────────────────────────────────────────────────────

    /// Ingest a batch of normalised messages. Per-item failures are reported,
    /// never thrown; duplicates are silent skips.
    pub fn ingest(&self, batch: &[NormalizedMessage]) -> IngestReport {
        let report = ingest::ingest_batch(
            &self.ctx.db,
            &self.ctx.resolver,
            self.scrubber.as_deref(),
            self.ctx.config.user_email.as_deref(),
            batch,
        );
        if report.entities_merged > 0 {
            self.invalidate_style_cache();
        }
        report
    }

    // ── Search ────────────────────────────────────────────────────────────────

    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        self.search_with_options(query, &SearchOptions::with_limit(limit))
    }

    pub fn search_with_options(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        engram_retrieval::search(
            &self.ctx.db,
            &self.ctx.vectors,
            self.ctx.embedder.as_deref(),
            query,
            options,
        )
    }

    /// Restricted search over screen-capture sources only.
    pub fn search_screens(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let options = SearchOptions {
            limit,
            source_kind: Some(SourceKind::ScreenCapture),
            ..SearchOptions::default()
        };
        self.search_with_options(query, &options)
    }

    // ── Entities ──────────────────────────────────────────────────────────────

    pub fn resolve_entity(&self, probe: &Probe) -> Result<Resolved> {
        self.ctx
            .db
            .with_tx(|tx| self.ctx.resolver.resolve(tx, probe, &[], Utc::now()))
    }

    pub fn get_entity(&self, id: Uuid) -> Result<EntityView> {
        self.ctx.db.with_conn(|conn| {
            Ok(EntityView {
                entity: entity::get_entity(conn, id)?,
                attributes: entity::attributes_of(conn, id)?,
            })
        })
    }

    pub fn find_entities(&self, query: &str) -> Result<Vec<Entity>> {
        self.ctx.db.with_conn(|conn| entity::find_entities(conn, query))
    }

    pub fn get_entity_graph(&self, id: Uuid, hops: u32) -> Result<EntityGraphView> {
        self.ctx.db.with_conn(|conn| {
            Ok(EntityGraphView {
                entity: entity::get_live_entity(conn, id)?,
                edges: graph::neighbours(conn, id, None, 0.0)?,
                reachable: graph::connected_within(conn, id, hops)?,
            })
        })
    }

    /// Undo a recent merge while the revert window is open.
    pub fn revert_merge(&self, retired_id: Uuid) -> Result<()> {
        let window = self.ctx.config.merge_revert_window_hours;
        self.ctx
            .db
            .with_tx(|tx| entity::revert_merge(tx, retired_id, window, Utc::now()))?;
        self.invalidate_style_cache();
        Ok(())
    }

    // ── Bi-temporal queries ───────────────────────────────────────────────────

    pub fn get_assertions_as_of(&self, entity_id: Uuid, at: DateTime<Utc>) -> Result<Vec<Assertion>> {
        self.ctx.db.with_conn(|conn| assertion::as_of(conn, entity_id, at))
    }

    pub fn get_entity_state_as_of(
        &self,
        entity_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<EntityStateView> {
        self.ctx.db.with_conn(|conn| {
            Ok(EntityStateView {
                entity: entity::get_entity(conn, entity_id)?,
                as_of: at,
                assertions: assertion::as_of(conn, entity_id, at)?,
            })
        })
    }

    // ── Style ─────────────────────────────────────────────────────────────────

    pub fn get_user_style(&self) -> Result<UserStyleProfile> {
        {
            let cache = self.style_cache.lock().expect("cache mutex poisoned");
            if let Some(profile) = &cache.user {
                return Ok(profile.clone());
            }
        }
        let profile = self.ctx.db.with_conn(style_extract::load_user_style)?;
        self.style_cache.lock().expect("cache mutex poisoned").user = Some(profile.clone());
        Ok(profile)
    }

    /// Load the recipient's style profile, extracting it from the exchanged
    /// corpus on first access.
    pub fn get_recipient_style(&self, entity_id: Uuid) -> Result<Option<RecipientStyleProfile>> {
        {
            let mut cache = self.style_cache.lock().expect("cache mutex poisoned");
            if let Some(profile) = cache.recipients.get(&entity_id) {
                return Ok(Some(profile.clone()));
            }
        }
        let profile = self.ctx.db.with_conn(|conn| {
            if let Some(existing) = recipient::load_recipient_style(conn, entity_id)? {
                return Ok(Some(existing));
            }
            if recipient::extract_recipient_style(conn, entity_id, Utc::now())? {
                recipient::load_recipient_style(conn, entity_id)
            } else {
                Ok(None)
            }
        })?;
        if let Some(profile) = &profile {
            self.style_cache
                .lock()
                .expect("cache mutex poisoned")
                .recipients
                .put(entity_id, profile.clone());
        }
        Ok(profile)
    }

    pub fn generate_mirror_prompt(&self, recipient_id: Uuid) -> Result<MirrorPrompt> {
        let user = self.get_user_style()?;
        let recipient = self.get_recipient_style(recipient_id)?;
        Ok(mirror::generate_mirror_prompt(
            &user,
            recipient.as_ref(),
            self.ctx.config.effective_mirror_level(),
        ))
    }

    // ── Engagement ────────────────────────────────────────────────────────────

    /// Record that a draft went out, without running adaptation.
    pub fn record_draft_sent(
        &self,
        draft_id: &str,
        recipient_id: Option<Uuid>,
        ai_draft_length: Option<i64>,
    ) -> Result<()> {
        let signal = EngagementSignal {
            draft_id: draft_id.to_string(),
            kind: Some(EngagementKind::DraftSent),
            ai_draft_length,
            recipient_entity_id: recipient_id,
            ..Default::default()
        };
        self.record_engagement_event(&signal, engram_store::types::EventKind::DraftSent)
    }

    /// Record a user edit of a draft, without running adaptation.
    pub fn record_draft_edited(
        &self,
        draft_id: &str,
        recipient_id: Option<Uuid>,
        ai_draft_length: i64,
        user_final_length: i64,
    ) -> Result<()> {
        let signal = EngagementSignal {
            draft_id: draft_id.to_string(),
            kind: Some(EngagementKind::DraftEdited),
            ai_draft_length: Some(ai_draft_length),
            user_final_length: Some(user_final_length),
            recipient_entity_id: recipient_id,
            ..Default::default()
        };
        self.record_engagement_event(&signal, engram_store::types::EventKind::DraftEdited)
    }

    /// Record a response to a sent draft, without running adaptation.
    pub fn record_user_response(
        &self,
        draft_id: &str,
        recipient_id: Option<Uuid>,
        response_sentiment: Option<f64>,
        thread_length: Option<i64>,
    ) -> Result<()> {
        let signal = EngagementSignal {
            draft_id: draft_id.to_string(),
            kind: Some(EngagementKind::ResponseReceived),
            response_sentiment,
            thread_length,
            recipient_entity_id: recipient_id,
            ..Default::default()
        };
        self.record_engagement_event(&signal, engram_store::types::EventKind::ResponseReceived)
    }

    fn record_engagement_event(
        &self,
        signal: &EngagementSignal,
        event_kind: engram_store::types::EventKind,
    ) -> Result<()> {
        let now = Utc::now();
        self.ctx.db.with_tx(|tx| {
            engagement::record_engagement(tx, signal, Uuid::new_v4(), false, None, now)?;
            ingest::emit_event(
                tx,
                event_kind,
                now,
                json!({"draft_id": signal.draft_id}),
                signal.context,
            )?;
            Ok(())
        })
    }

    /// Apply one engagement signal to the adaptation loop. Strictly
    /// serialised: one write transaction, at most one evolution entry per
    /// dimension changed.
    pub fn learn_from_interaction(&self, signal: &EngagementSignal) -> Result<AdaptationOutcome> {
        let config = &self.ctx.config;
        let outcome = self
            .ctx
            .db
            .with_tx(|tx| adapt::learn_from_interaction(tx, signal, config, Utc::now()))?;
        self.invalidate_style_cache();
        Ok(outcome)
    }

    pub fn get_engagement_summary(&self) -> Result<EngagementSummary> {
        self.ctx.db.with_conn(engagement::summary)
    }

    pub fn get_learning_stats(&self) -> Result<LearningStats> {
        self.ctx.db.with_conn(|conn| {
            let profile = style_extract::load_user_style(conn)?;
            let summary = engagement::summary(conn)?;
            Ok(LearningStats {
                interaction_count: profile.interaction_count,
                current_learning_rate: adapt::learning_rate(
                    profile.interaction_count,
                    &self.ctx.config.adaptation,
                ),
                adaptations_applied: summary.adapted_events,
                events_recorded: summary.total_events,
                evolution_entries: adapt::evolution_count(conn)?,
            })
        })
    }

    pub fn detect_personality_drift(&self) -> Result<Vec<DriftReport>> {
        self.ctx
            .db
            .with_conn(|conn| adapt::detect_drift(conn, &self.ctx.config.adaptation))
    }

    pub fn get_personality_evolution(
        &self,
        dimension: Option<StyleDimension>,
        limit: usize,
    ) -> Result<Vec<PersonalityEvolutionEntry>> {
        self.ctx
            .db
            .with_conn(|conn| adapt::evolution_entries(conn, dimension, limit))
    }

    // ── Background services ───────────────────────────────────────────────────

    pub fn start_processing_worker(&self) {
        let mut slot = self.worker.lock().expect("worker mutex poisoned");
        if slot.is_none() {
            *slot = Some(spawn_processing_worker(self.ctx.clone()));
        }
    }

    pub async fn stop_processing_worker(&self) {
        let handle = self.worker.lock().expect("worker mutex poisoned").take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub fn start_proactive_service(&self) {
        let mut slot = self.proactive.lock().expect("proactive mutex poisoned");
        if slot.is_none() {
            *slot = Some(proactive::spawn_proactive_service(self.ctx.clone()));
        }
    }

    pub async fn stop_proactive_service(&self) {
        let handle = self.proactive.lock().expect("proactive mutex poisoned").take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// One manual tick of the processing worker — the same cycle body the
    /// timer runs.
    pub async fn run_processing_cycle(&self) -> Result<CycleReport> {
        let report = engram_runtime::run_processing_cycle(&self.ctx, None).await?;
        self.invalidate_style_cache();
        Ok(report)
    }

    /// One manual proactive scan — the same body the proactive timer runs.
    pub async fn run_proactive_scan(&self) -> Result<usize> {
        proactive::run_proactive_scan(&self.ctx).await
    }

    pub fn pending_triggers(&self) -> Result<Vec<ProactiveTrigger>> {
        self.ctx.db.with_conn(proactive::pending_triggers)
    }

    pub fn acknowledge_trigger(&self, id: Uuid, accepted: bool) -> Result<()> {
        self.ctx
            .db
            .with_conn(|conn| proactive::acknowledge_trigger(conn, id, accepted))
    }

    // ── Onboarding ────────────────────────────────────────────────────────────

    pub fn run_onboarding(
        &self,
        progress: impl FnMut(&str, f64),
    ) -> Result<OnboardingReport> {
        let report = engram_runtime::run_onboarding(&self.ctx, progress)?;
        self.invalidate_style_cache();
        Ok(report)
    }

    pub fn reset_onboarding(&self) -> Result<()> {
        self.ctx.db.with_conn(engram_runtime::reset_onboarding)
    }

    // ── Stats ─────────────────────────────────────────────────────────────────

    pub fn get_stats(&self) -> Result<EngineStats> {
        self.ctx.db.with_conn(|conn| {
            let count = |sql: &str| -> Result<i64> {
                Ok(conn.query_row(sql, [], |r| r.get(0))?)
            };
            Ok(EngineStats {
                entities: entity::live_entity_count(conn)?,
                messages: ingest::message_count(conn)?,
                events: ingest::event_count(conn)?,
                assertions: assertion::assertion_count(conn)?,
                edges: count("SELECT count(*) FROM graph_edges")?,
                patterns: count("SELECT count(*) FROM behaviour_patterns")?,
                pending_probes: count("SELECT count(*) FROM pending_probes")?,
                vectors: self.ctx.vectors.len(),
                prediction_accuracy: engram_behavior::accuracy(conn)?,
                trigger_acceptance_rate: proactive::acceptance_rate(conn)?,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_round_trip() {
        let engram = Engram::open(EngineConfig::default()).unwrap();
        let stats = engram.get_stats().unwrap();
        assert_eq!(stats.messages, 0);
        assert_eq!(stats.entities, 0);
    }

    #[test]
    fn user_style_cache_is_invalidated_by_learning() {
        let engram = Engram::open(EngineConfig::default()).unwrap();
        let first = engram.get_user_style().unwrap();
        assert_eq!(first.interaction_count, 0);
        engram
            .learn_from_interaction(&EngagementSignal {
                draft_id: "d1".to_string(),
                response_sentiment: Some(0.5),
                ..Default::default()
            })
            .unwrap();
        let second = engram.get_user_style().unwrap();
        assert_eq!(second.interaction_count, 1, "stale cache would say 0");
    }

    #[tokio::test]
    async fn workers_start_and_stop_idempotently() {
        let engram = Engram::open(EngineConfig::default()).unwrap();
        engram.start_processing_worker();
        engram.start_processing_worker();
        engram.start_proactive_service();
        engram.close().await;
    }
}
