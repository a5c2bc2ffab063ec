//! Text heuristics shared by the style analysers.
//!
//! Keyword tables and scoring are intentionally rough signals, not models.

use regex::Regex;
use std::sync::OnceLock;

const FORMAL_GREETINGS: &[&str] = &[
    "dear", "hello", "good morning", "good afternoon", "good evening", "greetings",
];
const INFORMAL_GREETINGS: &[&str] = &["hey", "hi", "yo", "sup", "heya", "hiya"];

const FORMAL_SIGNOFFS: &[&str] = &[
    "sincerely", "regards", "best regards", "kind regards", "best wishes", "respectfully",
];
const INFORMAL_SIGNOFFS: &[&str] = &["cheers", "thanks", "thx", "later", "ttyl", "xoxo", "best"];

const POSITIVE_WORDS: &[&str] = &[
    "great", "love", "excited", "happy", "amazing", "wonderful", "fantastic",
    "glad", "pleased", "awesome", "enjoy", "like", "good", "nice", "thanks",
    "appreciate", "congrats", "congratulations", "perfect", "brilliant",
];

fn contraction_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b\w+'(?:s|t|re|ve|ll|d|m)\b").expect("static regex"))
}

pub fn words(text: &str) -> Vec<&str> {
    text.split_whitespace().collect()
}

pub fn is_emoji(c: char) -> bool {
    matches!(
        u32::from(c),
        0x1F300..=0x1FAFF | 0x2600..=0x27BF | 0x1F1E6..=0x1F1FF | 0x2B00..=0x2BFF
    )
}

/// Emoji-to-character ratio in [0, 1].
pub fn emoji_density(text: &str) -> f64 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }
    let emoji = text.chars().filter(|c| is_emoji(*c)).count();
    (emoji as f64 / total as f64).clamp(0.0, 1.0)
}

/// Proportion of all-caps words (alphabetic only, length ≥ 3) among all
/// words.
pub fn caps_ratio(text: &str) -> f64 {
    let words = words(text);
    if words.is_empty() {
        return 0.0;
    }
    let caps = words
        .iter()
        .filter(|word| {
            let alpha: String = word.chars().filter(|c| c.is_alphabetic()).collect();
            alpha.len() >= 3 && alpha == alpha.to_uppercase()
        })
        .count();
    caps as f64 / words.len() as f64
}

/// Positive-word rate scaled into [0, 1].
pub fn warmth(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    if words.is_empty() {
        return 0.5;
    }
    let hits = words.iter().filter(|w| POSITIVE_WORDS.contains(*w)).count();
    // One warm word per 20 ordinary ones already reads as warm prose.
    (0.5 + hits as f64 / words.len() as f64 * 10.0).clamp(0.0, 1.0)
}

fn first_line(text: &str) -> &str {
    text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}

fn last_line(text: &str) -> &str {
    text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}

fn starts_with_any(line: &str, table: &[&str]) -> bool {
    let lower = line.to_lowercase();
    table.iter().any(|phrase| lower.starts_with(phrase))
}

/// Formality in [0, 1] from greeting/sign-off register, sentence length, and
/// contraction rate.
pub fn formality(text: &str) -> f64 {
    let mut score: f64 = 0.5;

    let opening = first_line(text);
    if starts_with_any(opening, FORMAL_GREETINGS) {
        score += 0.15;
    } else if starts_with_any(opening, INFORMAL_GREETINGS) {
        score -= 0.15;
    }

    let closing = last_line(text);
    if starts_with_any(closing, FORMAL_SIGNOFFS) {
        score += 0.15;
    } else if starts_with_any(closing, INFORMAL_SIGNOFFS) {
        score -= 0.10;
    }

    let word_list = words(text);
    if !word_list.is_empty() {
        let contractions = contraction_pattern().find_iter(text).count();
        let rate = contractions as f64 / word_list.len() as f64;
        if rate > 0.04 {
            score -= 0.15;
        } else if rate == 0.0 && word_list.len() >= 12 {
            score += 0.10;
        }

        let sentences = text
            .split(['.', '!', '?'])
            .filter(|s| !s.trim().is_empty())
            .count()
            .max(1);
        let words_per_sentence = word_list.len() as f64 / sentences as f64;
        if words_per_sentence >= 20.0 {
            score += 0.10;
        } else if words_per_sentence < 7.0 {
            score -= 0.05;
        }
    }

    score.clamp(0.0, 1.0)
}

/// Verbosity in [0, 1] from message length; saturates around 800 characters.
pub fn verbosity(char_len: usize) -> f64 {
    (char_len as f64 / 800.0).clamp(0.0, 1.0)
}

/// Recurring boundary phrases across a corpus: phrases seen at least
/// `min_count` times, most frequent first, capped at `max_phrases`.
pub fn recurring_phrases<'a, I>(lines: I, min_count: usize, max_phrases: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for line in lines {
        let phrase = line.trim();
        if phrase.is_empty() || phrase.len() > 60 {
            continue;
        }
        *counts.entry(phrase.to_lowercase()).or_default() += 1;
    }
    let mut recurring: Vec<(String, usize)> = counts
        .into_iter()
        .filter(|(_, count)| *count >= min_count)
        .collect();
    recurring.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    recurring.truncate(max_phrases);
    recurring.into_iter().map(|(phrase, _)| phrase).collect()
}

/// Greeting candidate of one message: its first non-empty line.
pub fn greeting_candidate(text: &str) -> Option<&str> {
    let line = first_line(text);
    (!line.is_empty() && line.len() <= 60).then_some(line)
}

/// Sign-off candidate of one message: its last non-empty line.
pub fn signoff_candidate(text: &str) -> Option<&str> {
    let line = last_line(text);
    (!line.is_empty() && line.len() <= 60).then_some(line)
}
