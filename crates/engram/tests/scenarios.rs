//! End-to-end scenarios through the public façade: one handle, real
//! ingestion, real retrieval, real adaptation.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};

use engram::{
    EngagementSignal, Engram, EngineConfig, NormalizedMessage, Participant, Probe, RecipientKind,
    RecipientSpec, ResultKind,
};
use engram_extract::Embedder;
use engram_store::types::SourceKind;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

fn message(
    source_id: &str,
    sender_name: &str,
    sender_email: &str,
    body: &str,
    from_user: bool,
) -> NormalizedMessage {
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
                email: Some("me@self.io".to_string()),
                phone: None,
                name: Some("Alex Reed".to_string()),
            },
            kind: RecipientKind::To,
        }],
        subject: None,
        body_text: body.to_string(),
        body_raw: None,
        timestamp: Utc::now(),
        from_user,
    }
}

// ── Scenario 1: simple recall ─────────────────────────────────────────────────

#[test]
fn simple_recall_finds_jakes_employer() -> Result<()> {
    init_logging();
    let engram = Engram::open(EngineConfig::default())?;
    let report = engram.ingest(&[message(
        "m1",
        "Jake Miller",
        "jake@x",
        "I just started at Anthropic as a research scientist",
        false,
    )]);
    assert_eq!(report.ingested, 1);

    let results = engram.search("Where does Jake work?", 10)?;
    assert!(!results.is_empty(), "expected at least one result");
    let top = &results[0];
    assert!(top.score > 0.0);
    let body = top.payload["body_text"].as_str().unwrap_or_default();
    assert!(body.contains("Anthropic"), "body was {body:?}");
    Ok(())
}

// ── Scenario 2: entity merge ──────────────────────────────────────────────────

#[test]
fn same_person_with_two_emails_collapses_to_one_entity() -> Result<()> {
    init_logging();
    let engram = Engram::open(EngineConfig::default())?;
    engram.ingest(&[
        message("m1", "Sarah Chen", "sarah@work", "status update attached", false),
        message("m2", "Sarah Chen", "sallychen@gmail", "weekend plans?", false),
    ]);

    let sarahs: Vec<_> = engram
        .find_entities("Sarah")?
        .into_iter()
        .filter(|e| e.canonical_name == "Sarah Chen")
        .collect();
    assert_eq!(sarahs.len(), 1, "exactly one canonical Sarah Chen");

    let view = engram.get_entity(sarahs[0].id)?;
    let emails: Vec<&str> = view
        .attributes
        .iter()
        .filter(|a| a.kind.as_str() == "email")
        .map(|a| a.value.as_str())
        .collect();
    assert!(emails.contains(&"sarah@work"));
    assert!(emails.contains(&"sallychen@gmail"));
    Ok(())
}

// ── Scenario 3: adaptive mirroring ────────────────────────────────────────────

#[test]
fn engagement_pulls_formality_toward_the_recipient() -> Result<()> {
    init_logging();
    let engram = Engram::open(EngineConfig::default())?;

    // Maria writes formally; exchange enough to profile her.
    let mut batch = vec![message(
        "sent-1",
        "Alex Reed",
        "me@self.io",
        "quick check-in, all fine",
        true,
    )];
    for i in 0..4 {
        batch.push(message(
            &format!("maria-{i}"),
            "Maria Santos",
            "maria@corp.io",
            "Dear Alex,\n\nThank you for the considered update; I have reviewed the \
             projections and concur with the proposed adjustments.\n\nKind regards,\nMaria",
            false,
        ));
    }
    engram.ingest(&batch);

    let maria = engram
        .find_entities("Maria Santos")?
        .into_iter()
        .next()
        .expect("maria exists");
    let recipient_style = engram
        .get_recipient_style(maria.id)?
        .expect("profile from exchanged corpus");
    let start = engram.get_user_style()?;
    assert!(
        recipient_style.formality > start.formality,
        "recipient must be more formal than the 0.5 default for the pull to show"
    );

    let mut previous = start.formality;
    for i in 0..20 {
        let outcome = engram.learn_from_interaction(&EngagementSignal {
            draft_id: format!("d{i}"),
            ai_draft_length: Some(200),
            user_final_length: Some(205 + (i % 11) as i64),
            response_sentiment: Some(0.7),
            thread_continued: Some(true),
            recipient_entity_id: Some(maria.id),
            ..Default::default()
        })?;
        assert!(!outcome.frozen);

        let current = engram.get_user_style()?.formality;
        assert!(current >= previous, "formality must move monotonically");
        assert!(current - previous <= 0.01 + 1e-9, "per-step cap is 0.01");
        previous = current;
    }
    assert!(previous > start.formality, "formality moved toward the recipient");

    let formality_log = engram.get_personality_evolution(
        Some(engram_store::types::StyleDimension::Formality),
        100,
    )?;
    assert!(
        formality_log.len() <= 20,
        "≤ 20 formality entries, got {}",
        formality_log.len()
    );
    assert!(!formality_log.is_empty());
    Ok(())
}

// ── Scenario 4: vent-mode freeze ──────────────────────────────────────────────

#[test]
fn venting_freezes_adaptation_but_keeps_the_audit_trail() -> Result<()> {
    init_logging();
    let engram = Engram::open(EngineConfig::default())?;
    let before = engram.get_user_style()?;

    for i in 0..20 {
        let outcome = engram.learn_from_interaction(&EngagementSignal {
            draft_id: format!("vent-{i}"),
            response_sentiment: Some(-0.8),
            thread_length: Some(10),
            ..Default::default()
        })?;
        assert!(outcome.frozen, "event {i} should be frozen");
        assert!(!outcome.applied);
    }

    let after = engram.get_user_style()?;
    assert_eq!(before.formality, after.formality);
    assert_eq!(before.verbosity, after.verbosity);
    assert_eq!(before.emoji_density, after.emoji_density);

    assert!(engram.get_personality_evolution(None, 100)?.is_empty());
    let summary = engram.get_engagement_summary()?;
    assert_eq!(summary.total_events, 20, "every event persisted");
    assert_eq!(summary.adapted_events, 0);
    Ok(())
}

// ── Scenario 5: hybrid fusion ─────────────────────────────────────────────────

/// Maps the quarterly-review query and the coffee-shop message into the same
/// region so the vector scorer can lift what lexical ranking cannot.
struct StubEmbedder;

impl Embedder for StubEmbedder {
    fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let lower = text.to_lowercase();
        if lower.contains("valencia") || lower.contains("quarterly review location") {
            Some(vec![1.0, 0.0, 0.0])
        } else {
            Some(vec![0.0, 1.0, 0.0])
        }
    }

    fn dimensions(&self) -> usize {
        3
    }
}

#[tokio::test]
async fn vector_scorer_lifts_a_lexically_invisible_message() -> Result<()> {
    init_logging();
    let engram = Engram::builder(EngineConfig::default())
        .embedder(Arc::new(StubEmbedder))
        .build()?;

    let mut batch = Vec::new();
    for i in 0..10 {
        batch.push(message(
            &format!("noise-{i}"),
            "Nina Patel",
            "nina@y",
            &format!("quarterly metrics review draft number {i} for the board"),
            false,
        ));
    }
    let mut target = message(
        "target",
        "Sam Ortiz",
        "sam@z",
        "Let's meet at Blue Bottle Coffee on Valencia St",
        false,
    );
    // The recency tie-break between equal RRF scores must favour the target.
    target.timestamp = Utc::now() + Duration::seconds(60);
    batch.push(target);
    assert_eq!(engram.ingest(&batch).ingested, 11);

    // The worker embeds message bodies into the vector index.
    let cycle = engram.run_processing_cycle().await?;
    assert_eq!(cycle.messages_processed, 11);

    let results = engram.search("quarterly review location", 10)?;
    let target_rank = results
        .iter()
        .position(|r| {
            r.payload["body_text"]
                .as_str()
                .unwrap_or_default()
                .contains("Blue Bottle")
        })
        .expect("target message present in results");
    assert!(
        target_rank < 3,
        "vector scorer should lift the target into the top 3, got rank {target_rank}"
    );
    Ok(())
}

// ── Scenario 6: screen-capture recall ─────────────────────────────────────────

#[test]
fn screen_capture_recall_finds_the_wifi_password() -> Result<()> {
    init_logging();
    let engram = Engram::open(EngineConfig::default())?;

    let mut capture = message(
        "cap-1",
        "Screen Capture",
        "capture@local",
        "Settings  Network  WiFi Password: BlueElephant2024!",
        false,
    );
    capture.source_kind = SourceKind::ScreenCapture;
    engram.ingest(&[
        capture,
        message("m1", "Nina Patel", "nina@y", "password reset for the portal is done", false),
    ]);

    let results = engram.search_screens("office WiFi password", 5)?;
    assert!(!results.is_empty());
    let top = &results[0];
    assert_eq!(top.kind, ResultKind::ScreenCapture);
    assert!(
        top.payload["body_text"]
            .as_str()
            .unwrap_or_default()
            .contains("BlueElephant2024"),
    );
    Ok(())
}

// ── Cross-component invariants ────────────────────────────────────────────────

#[test]
fn ingestion_is_idempotent_at_the_facade() -> Result<()> {
    init_logging();
    let engram = Engram::open(EngineConfig::default())?;
    let batch = [message("dup-1", "Jake Miller", "jake@x", "hello there", false)];

    let first = engram.ingest(&batch);
    assert_eq!((first.ingested, first.skipped), (1, 0));
    let second = engram.ingest(&batch);
    assert_eq!((second.ingested, second.skipped), (0, 1));

    let stats = engram.get_stats()?;
    assert_eq!(stats.messages, 1);
    assert_eq!(stats.events, 1);
    Ok(())
}

#[test]
fn resolution_is_stable_across_calls() -> Result<()> {
    init_logging();
    let engram = Engram::open(EngineConfig::default())?;
    let probe = Probe::person(Some("Dana Wu"), Some("dana@q"), None);
    let first = engram.resolve_entity(&probe)?;
    let second = engram.resolve_entity(&probe)?;
    assert_eq!(first.entity_id, second.entity_id);
    assert!(first.created && !second.created);
    assert_eq!(engram.get_stats()?.entities, 1);
    Ok(())
}

#[tokio::test]
async fn assertions_are_bitemporal_through_supersession() -> Result<()> {
    init_logging();
    let engram = Engram::open(EngineConfig::default())?;

    let t0 = Utc::now();
    engram.ingest(&[message(
        "job-1",
        "Jake Miller",
        "jake@x",
        "I work at Acme as a data analyst",
        false,
    )]);
    engram.run_processing_cycle().await?;
    let t1 = Utc::now();

    let jake = engram
        .find_entities("Jake Miller")?
        .into_iter()
        .next()
        .expect("jake exists");

    // Before extraction: nothing. After: the title fact is visible.
    assert!(engram.get_assertions_as_of(jake.id, t0)?.is_empty());
    let at_t1 = engram.get_assertions_as_of(jake.id, t1)?;
    assert!(
        at_t1.iter().any(|a| a.predicate == "has_title"),
        "expected has_title at t1, got {at_t1:?}"
    );

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let mut promotion = message(
        "job-2",
        "Jake Miller",
        "jake@x",
        "I work at Acme as a staff engineer",
        false,
    );
    promotion.timestamp = Utc::now();
    engram.ingest(&[promotion]);
    engram.run_processing_cycle().await?;
    let t2 = Utc::now();

    let current = engram.get_assertions_as_of(jake.id, t2)?;
    let titles: Vec<&str> = current
        .iter()
        .filter(|a| a.predicate == "has_title")
        .filter_map(|a| match &a.object {
            engram_store::types::AssertionObject::Literal(s) => Some(s.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(titles, vec!["staff engineer"], "only the newest title is current");

    // Just before the supersession instant, the old title still shows.
    let old_title = engram
        .get_assertions_as_of(jake.id, t1)?
        .into_iter()
        .find(|a| a.predicate == "has_title")
        .expect("old title visible at t1");
    match old_title.object {
        engram_store::types::AssertionObject::Literal(ref s) => assert_eq!(s, "data analyst"),
        _ => panic!("expected literal object"),
    }
    Ok(())
}

#[test]
fn merge_preservation_through_the_facade() -> Result<()> {
    init_logging();
    let engram = Engram::open(EngineConfig::default())?;
    engram.ingest(&[
        message("a", "Will Howe", "will@x", "drinks friday?", false),
        message("b", "William Howe", "w.howe@corp.io", "board deck attached", false),
    ]);

    // "Will" vs "William" with matching surname collapses via the nickname
    // table, so one live entity remains with both emails.
    let howes: Vec<_> = engram.find_entities("Howe")?;
    assert_eq!(howes.len(), 1, "got {howes:?}");
    let view = engram.get_entity(howes[0].id)?;
    let emails: Vec<&str> = view
        .attributes
        .iter()
        .filter(|a| a.kind.as_str() == "email")
        .map(|a| a.value.as_str())
        .collect();
    assert!(emails.contains(&"will@x") && emails.contains(&"w.howe@corp.io"));
    Ok(())
}

#[test]
fn mirror_prompt_blends_toward_a_formal_recipient() -> Result<()> {
    init_logging();
    let engram = Engram::open(EngineConfig::default())?;
    for i in 0..3 {
        engram.ingest(&[message(
            &format!("f-{i}"),
            "Maria Santos",
            "maria@corp.io",
            "Dear Alex,\n\nPlease find the revised contract enclosed for your review and \
             signature at your earliest convenience.\n\nKind regards,\nMaria",
            false,
        )]);
    }
    let maria = engram.find_entities("Maria")?.into_iter().next().expect("maria");
    let prompt = engram.generate_mirror_prompt(maria.id)?;
    let user = engram.get_user_style()?;
    assert!(prompt.formality > user.formality, "blend pulled toward Maria");
    assert!((0.6..=0.8).contains(&prompt.mirror_level));
    Ok(())
}

#[test]
fn persists_across_reopen() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("engram.db");
    let config = EngineConfig {
        db_path: db_path.to_str().unwrap().to_string(),
        vector_dir: Some(dir.path().join("vectors").to_str().unwrap().to_string()),
        ..EngineConfig::default()
    };

    {
        let engram = Engram::open(config.clone())?;
        engram.ingest(&[message("p-1", "Jake Miller", "jake@x", "persistent note", false)]);
    }

    let reopened = Engram::open(config)?;
    assert_eq!(reopened.get_stats()?.messages, 1);
    let results = reopened.search("persistent note", 5)?;
    assert!(!results.is_empty());
    Ok(())
}

#[test]
fn quarantined_probe_shows_in_stats_and_is_not_merged() -> Result<()> {
    init_logging();
    let engram = Engram::open(EngineConfig::default())?;
    // A near-identical name with no disambiguating context hits the
    // ambiguous band; the distinct surname stays clear of it.
    engram.resolve_entity(&Probe::person(Some("Sara Chen"), Some("sara@a"), None))?;
    engram.resolve_entity(&Probe::person(Some("Sarah Chambers"), Some("chambers@b"), None))?;
    let resolved = engram.resolve_entity(&Probe::person(Some("Sarah Chen"), None, None))?;
    assert!(resolved.quarantined);

    let stats = engram.get_stats()?;
    assert_eq!(stats.pending_probes, 1);
    assert_eq!(stats.entities, 3, "conservative: a stand-in entity, no merge");
    Ok(())
}

#[test]
fn onboarding_requires_a_corpus_then_completes_once() -> Result<()> {
    init_logging();
    let mut config = EngineConfig::default();
    config.minimum_onboarding_messages = 5;
    let engram = Engram::open(config)?;

    assert!(engram.run_onboarding(|_, _| {}).is_err(), "empty corpus refused");

    let batch: Vec<NormalizedMessage> = (0..6)
        .map(|i| {
            let mut m = message(
                &format!("ob-{i}"),
                "Alex Reed",
                "me@self.io",
                "Morning! Sending over the notes from yesterday, thanks.",
                true,
            );
            m.recipients[0].participant = Participant {
                email: Some("maria@corp.io".to_string()),
                phone: None,
                name: Some("Maria Santos".to_string()),
            };
            m
        })
        .collect();
    engram.ingest(&batch);

    let mut seen = Vec::new();
    let report = engram.run_onboarding(|step, _| seen.push(step.to_string()))?;
    assert_eq!(report.messages_analysed, 6);
    assert!(seen.contains(&"user-style".to_string()));
    assert!(seen.contains(&"cognitive-profile".to_string()));

    assert!(engram.run_onboarding(|_, _| {}).is_err(), "marker blocks re-runs");
    engram.reset_onboarding()?;
    assert!(engram.run_onboarding(|_, _| {}).is_ok());
    Ok(())
}
