//! Rule-based fallback extractor.
//!
//! Keeps the engine functional with no LLM configured: a handful of regex
//! patterns over the message body catch first-person statements about
//! employment, location, family, and meetings. Recall is intentionally low;
//! precision matters more because everything extracted here becomes an
//! assertion.

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use engram_store::Result;
use engram_store::types::Message;

use crate::extractor::{
    ExtractedEntity, ExtractedFact, ExtractedRelationship, ExtractionOutcome, FactExtractor,
};

/// Confidence for facts matched by an explicit first-person pattern.
const RULE_CONFIDENCE: f64 = 0.7;
/// Confidence for softer mention patterns (meetings, titles).
const MENTION_CONFIDENCE: f64 = 0.6;

pub struct RuleBasedExtractor {
    works_at: Regex,
    lives_in: Regex,
    married_to: Regex,
    met_with: Regex,
    title: Regex,
}

impl Default for RuleBasedExtractor {
    fn default() -> Self {
        // A proper-noun run: capitalised word, optionally followed by more.
        const NAME: &str = r"([A-Z][\w&.']*(?:[ ][A-Z][\w&.']*)*)";
        Self {
            works_at: Regex::new(&format!(
                r"\b(?:started|work|works|working|joined)(?:[ ]a[ ]job)?[ ]at[ ]{NAME}"
            ))
            .expect("static regex"),
            lives_in: Regex::new(&format!(
                r"\b(?:live|lives|living|moved)[ ](?:in|to)[ ]{NAME}"
            ))
            .expect("static regex"),
            married_to: Regex::new(&format!(
                r"\b(?:married[ ]to|my[ ](?:wife|husband|spouse),?)[ ]{NAME}"
            ))
            .expect("static regex"),
            met_with: Regex::new(&format!(
                r"\b(?:met(?:[ ]up)?[ ]with|had[ ](?:lunch|coffee|dinner)[ ]with|talked[ ](?:to|with)|spoke[ ](?:to|with))[ ]{NAME}"
            ))
            .expect("static regex"),
            title: Regex::new(r"\bas[ ]an?[ ]([a-z][a-z ]{2,40}?)(?:[.,;!?]|$)")
                .expect("static regex"),
        }
    }
}

impl RuleBasedExtractor {
    fn evidence(body: &str, start: usize, end: usize) -> String {
        let from = body[..start].rfind(['.', '\n']).map(|i| i + 1).unwrap_or(0);
        let to = body[end..]
            .find(['.', '\n'])
            .map(|i| end + i + 1)
            .unwrap_or(body.len());
        body[from..to].trim().to_string()
    }
}

#[async_trait]
impl FactExtractor for RuleBasedExtractor {
    async fn extract(&self, message: &Message) -> Result<ExtractionOutcome> {
        let body = &message.body_text;
        let mut outcome = ExtractionOutcome::default();

        for captures in self.works_at.captures_iter(body) {
            let m = captures.get(1).expect("group 1 always present");
            let org = m.as_str().to_string();
            outcome.entities.push(ExtractedEntity {
                name: org.clone(),
                kind: "organisation".to_string(),
                attributes: Vec::new(),
                confidence: RULE_CONFIDENCE,
                mention_text: m.as_str().to_string(),
            });
            outcome.facts.push(ExtractedFact {
                subject: None,
                predicate: "works_at".to_string(),
                object: org,
                object_is_entity: true,
                confidence: RULE_CONFIDENCE,
                evidence_text: Self::evidence(body, m.start(), m.end()),
            });
        }

        for captures in self.lives_in.captures_iter(body) {
            let m = captures.get(1).expect("group 1 always present");
            let place = m.as_str().to_string();
            outcome.entities.push(ExtractedEntity {
                name: place.clone(),
                kind: "place".to_string(),
                attributes: Vec::new(),
                confidence: RULE_CONFIDENCE,
                mention_text: m.as_str().to_string(),
            });
            outcome.facts.push(ExtractedFact {
                subject: None,
                predicate: "lives_in".to_string(),
                object: place,
                object_is_entity: true,
                confidence: RULE_CONFIDENCE,
                evidence_text: Self::evidence(body, m.start(), m.end()),
            });
        }

        for captures in self.married_to.captures_iter(body) {
            let m = captures.get(1).expect("group 1 always present");
            let partner = m.as_str().to_string();
            outcome.entities.push(ExtractedEntity {
                name: partner.clone(),
                kind: "person".to_string(),
                attributes: Vec::new(),
                confidence: RULE_CONFIDENCE,
                mention_text: m.as_str().to_string(),
            });
            outcome.relationships.push(ExtractedRelationship {
                from: None,
                to: partner,
                kind: "is_married_to".to_string(),
                confidence: RULE_CONFIDENCE,
                evidence_text: Self::evidence(body, m.start(), m.end()),
            });
        }

        for captures in self.met_with.captures_iter(body) {
            let m = captures.get(1).expect("group 1 always present");
            let person = m.as_str().to_string();
            outcome.entities.push(ExtractedEntity {
                name: person.clone(),
                kind: "person".to_string(),
                attributes: Vec::new(),
                confidence: MENTION_CONFIDENCE,
                mention_text: m.as_str().to_string(),
            });
            outcome.relationships.push(ExtractedRelationship {
                from: None,
                to: person,
                kind: "knows".to_string(),
                confidence: MENTION_CONFIDENCE,
                evidence_text: Self::evidence(body, m.start(), m.end()),
            });
        }

        for captures in self.title.captures_iter(body) {
            let m = captures.get(1).expect("group 1 always present");
            outcome.facts.push(ExtractedFact {
                subject: None,
                predicate: "has_title".to_string(),
                object: m.as_str().trim().to_string(),
                object_is_entity: false,
                confidence: MENTION_CONFIDENCE,
                evidence_text: Self::evidence(body, m.start(), m.end()),
            });
        }

        debug!(
            message = %message.id,
            entities = outcome.entities.len(),
            facts = outcome.facts.len(),
            relationships = outcome.relationships.len(),
            "rule-based extraction complete"
        );
        Ok(outcome)
    }
}
