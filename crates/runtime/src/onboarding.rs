//! One-shot onboarding: run the analysers over the already-synced corpus,
//! in order, with progress callbacks, and record completion in a marker row.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument};

use engram_behavior::{detect_patterns, rhythm};
use engram_core::ingest;
use engram_store::Database;
use engram_store::error::{EngramError, Result};
use engram_store::types::{ContextTag, ts_from_sql, ts_to_sql};
use engram_style::{extract as style_extract, recipient};

use crate::WorkerContext;

const STEPS: &[&str] = &[
    "user-style",
    "recipient-styles",
    "patterns",
    "rhythm",
    "values",
    "cognitive-profile",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnboardingReport {
    pub messages_analysed: usize,
    pub recipients_profiled: usize,
    pub patterns_detected: usize,
    pub completed_at: DateTime<Utc>,
}

pub fn onboarding_completed_at(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = conn
        .query_row("SELECT completed_at FROM onboarding_state WHERE id = 1", [], |r| r.get(0))
        .optional()?
        .flatten();
    raw.as_deref().map(ts_from_sql).transpose()
}

/// Clear the completion marker so onboarding may run again.
pub fn reset_onboarding(conn: &Connection) -> Result<()> {
    conn.execute(
        "UPDATE onboarding_state SET completed_at = NULL, profile = NULL WHERE id = 1",
        [],
    )?;
    Ok(())
}

/// Run the onboarding pipeline. `progress` receives `(step, fraction)` as
/// each stage completes. Refuses to re-run while the marker is set and
/// refuses a corpus below the configured minimum.
#[instrument(skip_all)]
pub fn run_onboarding(
    ctx: &WorkerContext,
    mut progress: impl FnMut(&str, f64),
) -> Result<OnboardingReport> {
    let db: &Database = &ctx.db;
    let now = Utc::now();

    db.with_conn(|conn| {
        if onboarding_completed_at(conn)?.is_some() {
            return Err(EngramError::InputInvalid(
                "onboarding already completed; reset it first".into(),
            ));
        }
        let messages = ingest::message_count(conn)?;
        let minimum = ctx.config.minimum_onboarding_messages as i64;
        if messages < minimum {
            return Err(EngramError::InputInvalid(format!(
                "onboarding needs at least {minimum} messages, found {messages}"
            )));
        }
        Ok(())
    })?;

    let step_done = |i: usize, progress: &mut dyn FnMut(&str, f64)| {
        progress(STEPS[i], (i + 1) as f64 / STEPS.len() as f64);
    };

    // 1. Global user style.
    let messages_analysed = db.with_conn(|conn| style_extract::extract_user_style(conn, now))?;
    step_done(0, &mut progress);

    // 2. Per-recipient styles for everyone the user has written to.
    let recipients = db.with_conn(recipient::known_recipients)?;
    let mut recipients_profiled = 0usize;
    for entity_id in &recipients {
        if db.with_conn(|conn| recipient::extract_recipient_style(conn, *entity_id, now))? {
            recipients_profiled += 1;
        }
    }
    step_done(1, &mut progress);

    // 3. Patterns.
    let patterns_detected = db.with_conn(|conn| detect_patterns(conn, now))?;
    step_done(2, &mut progress);

    // 4. Rhythm matrix, rebuilt from the full event log.
    let matrix = db.with_conn(rhythm::rebuild_matrix)?;
    step_done(3, &mut progress);

    // 5. Values: the work/personal split and the strongest relationships.
    let values = db.with_conn(|conn| {
        let work: i64 = conn.query_row(
            "SELECT count(*) FROM events WHERE context = ?1",
            [ContextTag::Work.as_str()],
            |r| r.get(0),
        )?;
        let personal: i64 = conn.query_row(
            "SELECT count(*) FROM events WHERE context = ?1",
            [ContextTag::Personal.as_str()],
            |r| r.get(0),
        )?;
        let mut stmt = conn.prepare(
            "SELECT e.canonical_name, max(g.strength) AS s
             FROM graph_edges g JOIN entities e ON e.id = g.to_entity_id
             WHERE e.retired = 0
             GROUP BY g.to_entity_id ORDER BY s DESC LIMIT 5",
        )?;
        let top_contacts = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(json!({
            "work_events": work,
            "personal_events": personal,
            "top_contacts": top_contacts,
        }))
    })?;
    step_done(4, &mut progress);

    // 6. Cognitive profile: values plus rhythm-derived habits, persisted on
    //    the marker row.
    let profile = json!({
        "values": values,
        "peak_hours": matrix.peak_hours(3),
        "total_events": matrix.total(),
        "built_at": ts_to_sql(now),
    });
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE onboarding_state SET completed_at = ?1, profile = ?2 WHERE id = 1",
            rusqlite::params![ts_to_sql(now), profile.to_string()],
        )?;
        Ok(())
    })?;
    step_done(5, &mut progress);

    info!(
        messages = messages_analysed,
        recipients = recipients_profiled,
        patterns = patterns_detected,
        "onboarding complete"
    );
    Ok(OnboardingReport {
        messages_analysed,
        recipients_profiled,
        patterns_detected,
        completed_at: now,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use engram_config::EngineConfig;
    use engram_core::ingest::{NormalizedMessage, Participant, RecipientKind, RecipientSpec, ingest_batch};
    use engram_core::resolver::IdentityResolver;
    use engram_extract::RuleBasedExtractor;
    use engram_store::types::SourceKind;
    use engram_store::VectorIndex;

    use super::*;

    fn context(minimum: usize) -> WorkerContext {
        let mut config = EngineConfig::default();
        config.minimum_onboarding_messages = minimum;
        WorkerContext {
            db: Arc::new(Database::open(":memory:").unwrap()),
            vectors: Arc::new(VectorIndex::in_memory()),
            resolver: IdentityResolver::default(),
            extractor: Arc::new(RuleBasedExtractor::default()),
            embedder: None,
            arbiter: None,
            config,
        }
    }

    fn seed_corpus(ctx: &WorkerContext, count: usize) {
        let batch: Vec<NormalizedMessage> = (0..count)
            .map(|i| NormalizedMessage {
                source_kind: SourceKind::Mail,
                source_id: format!("seed-{i}"),
                thread_id: Some(format!("t{}", i % 3)),
                sender: Participant {
                    email: Some("me@self.io".to_string()),
                    phone: None,
                    name: Some("Alex Reed".to_string()),
                },
                recipients: vec![RecipientSpec {
                    participant: Participant {
                        email: Some("maria@corp.io".to_string()),
                        phone: None,
                        name: Some("Maria Santos".to_string()),
                    },
                    kind: RecipientKind::To,
                }],
                subject: Some("update".to_string()),
                body_text: format!("Quick update number {i}: all on track, thanks!"),
                body_raw: None,
                timestamp: Utc::now() - chrono::Duration::days((count - i) as i64),
                from_user: true,
            })
            .collect();
        let report = ingest_batch(&ctx.db, &ctx.resolver, None, Some("me@self.io"), &batch);
        assert_eq!(report.ingested, count);
    }

    #[test]
    fn refuses_a_thin_corpus() {
        let ctx = context(50);
        seed_corpus(&ctx, 5);
        let err = run_onboarding(&ctx, |_, _| {});
        assert!(matches!(err, Err(EngramError::InputInvalid(_))));
    }

    #[test]
    fn runs_once_then_requires_reset() {
        let ctx = context(10);
        seed_corpus(&ctx, 12);

        let mut steps = Vec::new();
        let report = run_onboarding(&ctx, |step, fraction| {
            steps.push((step.to_string(), fraction));
        })
        .unwrap();
        assert_eq!(report.messages_analysed, 12);
        assert_eq!(report.recipients_profiled, 1);
        assert_eq!(steps.len(), STEPS.len());
        assert_eq!(steps.last().unwrap().1, 1.0);

        assert!(run_onboarding(&ctx, |_, _| {}).is_err(), "marker prevents re-runs");
        ctx.db.with_conn(reset_onboarding).unwrap();
        assert!(run_onboarding(&ctx, |_, _| {}).is_ok());
    }
}
