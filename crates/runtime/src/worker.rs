//! The processing worker: one timer, one cycle body.
//!
//! A cycle drains up to K unprocessed messages through the fact extractor,
//! then up to K unprocessed events through the pattern detector and rhythm
//! matrix, then refreshes predictions and settles quarantined probes. The
//! loop observes its stop flag between items; a message mid-extraction
//! finishes before the worker exits.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use engram_behavior::{detect_patterns, record_events, refresh_from_patterns};
use engram_core::assertion::{NewAssertion, insert_assertion};
use engram_core::resolver::{Probe, arbitrate_pending};
use engram_core::{entity, graph, ingest};
use engram_extract::{Embedder, ExtractionOutcome, FactExtractor};
use engram_store::error::{EngramError, Result};
use engram_store::types::{AssertionObject, AttributeKind, EdgeKind, EntityKind, Message};

use crate::WorkerContext;

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub messages_processed: usize,
    pub messages_failed: usize,
    pub events_processed: usize,
    pub patterns_live: usize,
    pub predictions_created: usize,
    pub probes_settled: usize,
}

/// Handle to a spawned background loop; `stop()` flips the flag and waits
/// for the current item to complete.
pub struct WorkerHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn from_parts(stop_tx: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self { stop_tx, task }
    }

    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

/// Spawn the periodic processing worker.
pub fn spawn_processing_worker(ctx: Arc<WorkerContext>) -> WorkerHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let stop_for_cycle = stop_rx.clone();
    let interval = Duration::from_secs(ctx.config.process_interval_secs.max(1));
    let task = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "processing worker started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match run_processing_cycle(&ctx, Some(&stop_for_cycle)).await {
                        Ok(report) => debug!(
                            messages = report.messages_processed,
                            events = report.events_processed,
                            "processing cycle complete"
                        ),
                        Err(err) => warn!(?err, "processing cycle failed"),
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("processing worker stopped");
    });
    WorkerHandle { stop_tx, task }
}

/// One processing cycle. Callable directly (tests, onboarding) or from the
/// spawned loop.
pub async fn run_processing_cycle(
    ctx: &WorkerContext,
    stop: Option<&watch::Receiver<bool>>,
) -> Result<CycleReport> {
    let mut report = CycleReport::default();
    let should_stop = || stop.is_some_and(|rx| *rx.borrow());

    // 1. Messages → extractor → assertions, attributes, edges, vectors.
    let batch = ctx
        .db
        .with_conn(|conn| ingest::unprocessed_messages(conn, ctx.config.batch_size))?;
    for message in batch {
        if should_stop() {
            return Ok(report);
        }
        match process_message(ctx, &message).await {
            Ok(()) => report.messages_processed += 1,
            Err(err) => {
                report.messages_failed += 1;
                warn!(message = %message.id, %err, "extraction failed — message stays unprocessed");
                ctx.db
                    .with_conn(|conn| ingest::bump_message_attempts(conn, message.id))?;
            }
        }
    }

    // 2. Events → rhythm matrix, then a pattern-detection pass.
    let events = ctx
        .db
        .with_conn(|conn| ingest::unprocessed_events(conn, ctx.config.batch_size))?;
    if !events.is_empty() {
        report.events_processed = events.len();
        ctx.db.with_tx(|tx| {
            record_events(tx, &events)?;
            for event in &events {
                ingest::mark_event_processed(tx, event.id)?;
            }
            Ok(())
        })?;
    }
    report.patterns_live = ctx.db.with_conn(|conn| detect_patterns(conn, Utc::now()))?;

    // 3. Predictions whose windows have begun.
    report.predictions_created = ctx
        .db
        .with_conn(|conn| refresh_from_patterns(conn, Utc::now()))?;

    // 4. Quarantined probes, when an arbiter is configured.
    if let Some(arbiter) = &ctx.arbiter {
        let deadline = Duration::from_secs(ctx.config.collaborator_timeout_secs);
        report.probes_settled = arbitrate_pending(&ctx.db, arbiter.as_ref(), deadline).await?;
    }

    Ok(report)
}

async fn process_message(ctx: &WorkerContext, message: &Message) -> Result<()> {
    let deadline = Duration::from_secs(ctx.config.collaborator_timeout_secs);
    let outcome = tokio::time::timeout(deadline, ctx.extractor.extract(message))
        .await
        .map_err(|_| EngramError::ExtractorTimeout(format!("message {}", message.id)))??;

    // Embeddings are computed outside the write transaction.
    let message_vector = ctx.embedder.as_ref().and_then(|embedder| {
        let text = match &message.subject {
            Some(subject) => format!("{subject}\n{}", message.body_text),
            None => message.body_text.clone(),
        };
        embedder.embed(&text)
    });
    let fact_vectors: Vec<Option<Vec<f32>>> = outcome
        .facts
        .iter()
        .map(|fact| {
            ctx.embedder
                .as_ref()
                .and_then(|embedder| embedder.embed(&fact.evidence_text))
        })
        .collect();

    let message_key = format!("msg:{}", message.id);
    if let Some(vector) = &message_vector {
        ctx.vectors.upsert(&message_key, vector)?;
    }

    let vectors = &ctx.vectors;
    let resolver = &ctx.resolver;
    ctx.db.with_tx(|tx| {
        apply_outcome(tx, resolver, vectors, message, &outcome, &fact_vectors)
    })?;
    Ok(())
}

fn entity_kind_for(raw_kind: &str, predicate: Option<&str>) -> EntityKind {
    match raw_kind {
        "organisation" | "organization" | "company" => EntityKind::Organisation,
        "place" | "location" => EntityKind::Place,
        "thing" => EntityKind::Thing,
        "person" => EntityKind::Person,
        _ => match predicate {
            Some("works_at") => EntityKind::Organisation,
            Some("lives_in") => EntityKind::Place,
            _ => EntityKind::Person,
        },
    }
}

fn apply_outcome(
    tx: &rusqlite::Transaction<'_>,
    resolver: &engram_core::resolver::IdentityResolver,
    vectors: &engram_store::VectorIndex,
    message: &Message,
    outcome: &ExtractionOutcome,
    fact_vectors: &[Option<Vec<f32>>],
) -> Result<()> {
    let now = Utc::now();
    let mut co_occurring: Vec<Uuid> = vec![message.sender_id];
    co_occurring.extend(&message.recipient_ids);

    // Mentioned entities first, so facts and relationships can land on them.
    for mention in &outcome.entities {
        let kind = entity_kind_for(&mention.kind, None);
        let resolved =
            resolver.resolve(tx, &Probe::named(&mention.name, kind), &co_occurring, now)?;
        for (attr_kind, value) in &mention.attributes {
            entity::add_attribute(
                tx,
                resolved.entity_id,
                &AttributeKind::parse(attr_kind),
                value,
                mention.confidence,
                None,
            )?;
        }
        co_occurring.push(resolved.entity_id);
    }

    let resolve_name = |tx: &rusqlite::Transaction<'_>,
                        name: Option<&str>,
                        kind: EntityKind,
                        co_occurring: &[Uuid]|
     -> Result<Uuid> {
        match name {
            None => Ok(message.sender_id),
            Some(name) => Ok(resolver
                .resolve(tx, &Probe::named(name, kind), co_occurring, now)?
                .entity_id),
        }
    };

    for (fact, vector) in outcome.facts.iter().zip(fact_vectors) {
        let subject_id = resolve_name(tx, fact.subject.as_deref(), EntityKind::Person, &co_occurring)?;
        let object = if fact.object_is_entity {
            let kind = entity_kind_for("", Some(fact.predicate.as_str()));
            let object_id = resolver
                .resolve(tx, &Probe::named(&fact.object, kind), &co_occurring, now)?
                .entity_id;
            AssertionObject::Entity(object_id)
        } else {
            AssertionObject::Literal(fact.object.clone())
        };

        let assertion_id = Uuid::new_v4();
        let embedding_ref = vector.as_ref().map(|_| format!("asrt:{assertion_id}"));
        let inserted = insert_assertion(
            tx,
            NewAssertion {
                subject_id,
                predicate: fact.predicate.clone(),
                object: object.clone(),
                confidence: fact.confidence,
                source_kind: message.source_kind,
                source_id: message.source_id.clone(),
                source_at: message.sent_at,
                embedding_ref: embedding_ref.clone(),
            },
            now,
        )?;
        if let (Some(vector), Some(_)) = (vector, embedding_ref) {
            vectors.upsert(&format!("asrt:{}", inserted.id), vector)?;
        }

        // Relationship-shaped facts reinforce the graph too.
        if let AssertionObject::Entity(object_id) = object {
            if object_id != subject_id {
                graph::upsert_edge(
                    tx,
                    subject_id,
                    object_id,
                    &EdgeKind::parse(&fact.predicate),
                    fact.confidence,
                    now,
                )?;
            }
        }
    }

    for relationship in &outcome.relationships {
        let from = resolve_name(tx, relationship.from.as_deref(), EntityKind::Person, &co_occurring)?;
        let to = resolver
            .resolve(tx, &Probe::named(&relationship.to, EntityKind::Person), &co_occurring, now)?
            .entity_id;
        if from != to {
            graph::upsert_edge(tx, from, to, &EdgeKind::parse(&relationship.kind), relationship.confidence, now)?;
        }
    }

    ingest::mark_message_processed(tx, message.id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use engram_config::EngineConfig;
    use engram_core::ingest::{NormalizedMessage, Participant, RecipientKind, RecipientSpec, ingest_batch};
    use engram_core::resolver::IdentityResolver;
    use engram_extract::{HashingEmbedder, RuleBasedExtractor};
    use engram_store::types::SourceKind;
    use engram_store::{Database, VectorIndex};

    use super::*;

    fn context() -> WorkerContext {
        WorkerContext {
            db: Arc::new(Database::open(":memory:").unwrap()),
            vectors: Arc::new(VectorIndex::in_memory()),
            resolver: IdentityResolver::default(),
            extractor: Arc::new(RuleBasedExtractor::default()),
            embedder: Some(Arc::new(HashingEmbedder::default())),
            arbiter: None,
            config: EngineConfig::default(),
        }
    }

    fn jake_message() -> NormalizedMessage {
        NormalizedMessage {
            source_kind: SourceKind::Mail,
            source_id: "m1".to_string(),
            thread_id: None,
            sender: Participant {
                email: Some("jake@x".to_string()),
                phone: None,
                name: Some("Jake Miller".to_string()),
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
            body_text: "I just started at Anthropic as a research scientist".to_string(),
            body_raw: None,
            timestamp: Utc::now(),
            from_user: false,
        }
    }

    #[tokio::test]
    async fn cycle_extracts_assertions_and_marks_processed() {
        let ctx = context();
        let report = ingest_batch(&ctx.db, &ctx.resolver, None, None, &[jake_message()]);
        assert_eq!(report.ingested, 1);

        let cycle = run_processing_cycle(&ctx, None).await.unwrap();
        assert_eq!(cycle.messages_processed, 1);
        assert_eq!(cycle.messages_failed, 0);

        ctx.db
            .with_conn(|conn| {
                let unprocessed = ingest::unprocessed_messages(conn, 10)?;
                assert!(unprocessed.is_empty());
                let assertions: i64 =
                    conn.query_row("SELECT count(*) FROM assertions", [], |r| r.get(0))?;
                assert!(assertions >= 1, "works_at assertion expected");
                let orgs: i64 = conn.query_row(
                    "SELECT count(*) FROM entities WHERE kind = 'organisation' AND canonical_name = 'Anthropic'",
                    [],
                    |r| r.get(0),
                )?;
                assert_eq!(orgs, 1);
                Ok(())
            })
            .unwrap();

        // Message embedding landed in the vector index.
        assert!(ctx.vectors.len() >= 1);
    }

    #[tokio::test]
    async fn second_cycle_finds_nothing_left() {
        let ctx = context();
        ingest_batch(&ctx.db, &ctx.resolver, None, None, &[jake_message()]);
        run_processing_cycle(&ctx, None).await.unwrap();
        let second = run_processing_cycle(&ctx, None).await.unwrap();
        assert_eq!(second.messages_processed, 0);
        assert_eq!(second.events_processed, 0);
    }

    #[tokio::test]
    async fn stop_flag_halts_between_items() {
        let ctx = context();
        let mut batch = vec![jake_message()];
        batch.push(NormalizedMessage {
            source_id: "m2".to_string(),
            ..jake_message()
        });
        ingest_batch(&ctx.db, &ctx.resolver, None, None, &batch);

        let (tx, rx) = watch::channel(true); // already stopped
        let report = run_processing_cycle(&ctx, Some(&rx)).await.unwrap();
        drop(tx);
        assert_eq!(report.messages_processed, 0, "stop observed before first item");
    }

    #[tokio::test]
    async fn spawned_worker_stops_cleanly() {
        let ctx = Arc::new(context());
        let handle = spawn_processing_worker(ctx);
        handle.stop().await;
    }
}
