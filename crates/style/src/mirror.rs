//! Mirror prompt generation — blend user style with recipient style for the
//! downstream composer.

use serde::{Deserialize, Serialize};

use engram_store::types::{RecipientStyleProfile, StyleDimension, UserStyleProfile};

/// Tone targets and exemplars handed to the composer (which is not part of
/// the core).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorPrompt {
    pub formality: f64,
    pub verbosity: f64,
    pub emoji_density: f64,
    pub warmth: f64,
    pub mirror_level: f64,
    pub greetings: Vec<String>,
    pub signoffs: Vec<String>,
    pub exemplar_phrases: Vec<String>,
    pub description: String,
}

fn register(value: f64, low: &'static str, mid: &'static str, high: &'static str) -> &'static str {
    if value < 0.34 {
        low
    } else if value < 0.67 {
        mid
    } else {
        high
    }
}

fn blend(user: f64, recipient: f64, mirror_level: f64) -> f64 {
    ((1.0 - mirror_level) * user + mirror_level * recipient).clamp(0.0, 1.0)
}

/// mirrored = (1 − m) · user + m · recipient, m clamped to [0.6, 0.8].
/// With no recipient profile the user's own style is returned unblended.
pub fn generate_mirror_prompt(
    user: &UserStyleProfile,
    recipient: Option<&RecipientStyleProfile>,
    mirror_level: f64,
) -> MirrorPrompt {
    let m = mirror_level.clamp(0.6, 0.8);

    let (formality, verbosity, emoji_density, warmth, exemplar_phrases) = match recipient {
        Some(r) => (
            blend(user.formality, r.dimension(StyleDimension::Formality), m),
            blend(user.verbosity, r.dimension(StyleDimension::Verbosity), m),
            blend(user.emoji_density, r.dimension(StyleDimension::EmojiDensity), m),
            r.warmth,
            r.examples.clone(),
        ),
        None => (
            user.formality,
            user.verbosity,
            user.emoji_density,
            0.5,
            Vec::new(),
        ),
    };

    let tone = register(formality, "casual", "conversational", "formal");
    let length = register(verbosity, "brief", "moderate-length", "detailed");
    let warmth_word = register(warmth, "matter-of-fact", "friendly", "warm");
    let emoji_note = if emoji_density > 0.01 {
        "Emoji are in register."
    } else {
        "Avoid emoji."
    };

    let relationship_note = recipient
        .map(|r| format!(" The recipient is a {}.", r.relationship))
        .unwrap_or_default();

    let description = format!(
        "Write in a {tone}, {warmth_word} tone with {length} messages. {emoji_note}{relationship_note}"
    );

    MirrorPrompt {
        formality,
        verbosity,
        emoji_density,
        warmth,
        mirror_level: m,
        greetings: user.greetings.clone(),
        signoffs: user.signoffs.clone(),
        exemplar_phrases,
        description,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn user(formality: f64) -> UserStyleProfile {
        UserStyleProfile {
            formality,
            verbosity: 0.4,
            emoji_density: 0.0,
            avg_message_len: 200,
            greetings: vec!["hi maria,".to_string()],
            signoffs: vec!["best, alex".to_string()],
            signatures: Vec::new(),
            interaction_count: 0,
            updated_at: Utc::now(),
        }
    }

    fn recipient(formality: f64) -> RecipientStyleProfile {
        RecipientStyleProfile {
            entity_id: Uuid::new_v4(),
            formality,
            verbosity: 0.8,
            emoji_density: 0.0,
            avg_message_len: 500,
            relationship: "colleague".to_string(),
            warmth: 0.7,
            emoji_usage: 0.0,
            avg_response_hours: 3.0,
            examples: vec!["Looking forward to it.".to_string()],
            message_count: 9,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn blend_weights_recipient_by_mirror_level() {
        let prompt = generate_mirror_prompt(&user(0.2), Some(&recipient(0.9)), 0.7);
        let expected = 0.3 * 0.2 + 0.7 * 0.9;
        assert!((prompt.formality - expected).abs() < 1e-9);
        assert_eq!(prompt.mirror_level, 0.7);
    }

    #[test]
    fn mirror_level_is_clamped_to_contract_range() {
        let prompt = generate_mirror_prompt(&user(0.2), Some(&recipient(0.9)), 0.99);
        assert_eq!(prompt.mirror_level, 0.8);
    }

    #[test]
    fn missing_recipient_returns_user_style() {
        let prompt = generate_mirror_prompt(&user(0.33), None, 0.7);
        assert_eq!(prompt.formality, 0.33);
        assert!(prompt.exemplar_phrases.is_empty());
        assert_eq!(prompt.greetings, vec!["hi maria,".to_string()]);
    }

    #[test]
    fn description_names_the_register() {
        let prompt = generate_mirror_prompt(&user(0.9), Some(&recipient(0.95)), 0.8);
        assert!(prompt.description.contains("formal"));
        assert!(prompt.description.contains("colleague"));
    }
}
