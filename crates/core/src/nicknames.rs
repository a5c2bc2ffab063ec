//! Name normalisation and fuzzy similarity for the identity resolver.
//!
//! Normalisation lowercases, folds common diacritics, and strips honorifics.
//! Similarity combines a Levenshtein ratio with a static nickname table of
//! common English hypocorisms; coverage is English-only and unknown pairs
//! fall through to the ratio alone.

/// Honorific tokens removed during normalisation.
const HONORIFICS: &[&str] = &[
    "mr", "mrs", "ms", "mx", "dr", "prof", "professor", "sir", "madam", "rev", "fr",
];

/// Symmetric nickname pairs `(formal, short)`.
const NICKNAMES: &[(&str, &str)] = &[
    ("william", "bill"),
    ("william", "will"),
    ("william", "billy"),
    ("robert", "bob"),
    ("robert", "rob"),
    ("robert", "bobby"),
    ("richard", "rick"),
    ("richard", "dick"),
    ("richard", "rich"),
    ("elizabeth", "liz"),
    ("elizabeth", "beth"),
    ("elizabeth", "lizzie"),
    ("elizabeth", "eliza"),
    ("katherine", "kate"),
    ("katherine", "kathy"),
    ("katherine", "katie"),
    ("catherine", "cathy"),
    ("catherine", "kate"),
    ("margaret", "maggie"),
    ("margaret", "meg"),
    ("margaret", "peggy"),
    ("michael", "mike"),
    ("michael", "mikey"),
    ("christopher", "chris"),
    ("christina", "chris"),
    ("christina", "tina"),
    ("jennifer", "jen"),
    ("jennifer", "jenny"),
    ("jonathan", "jon"),
    ("jonathan", "johnny"),
    ("john", "jack"),
    ("john", "johnny"),
    ("james", "jim"),
    ("james", "jimmy"),
    ("jacob", "jake"),
    ("joseph", "joe"),
    ("joseph", "joey"),
    ("daniel", "dan"),
    ("daniel", "danny"),
    ("david", "dave"),
    ("samantha", "sam"),
    ("samuel", "sam"),
    ("alexander", "alex"),
    ("alexandra", "alex"),
    ("alexandra", "sandra"),
    ("andrew", "andy"),
    ("anthony", "tony"),
    ("benjamin", "ben"),
    ("charles", "charlie"),
    ("charles", "chuck"),
    ("edward", "ed"),
    ("edward", "eddie"),
    ("edward", "ted"),
    ("matthew", "matt"),
    ("nicholas", "nick"),
    ("patricia", "pat"),
    ("patricia", "trish"),
    ("patrick", "pat"),
    ("rebecca", "becky"),
    ("sarah", "sally"),
    ("stephen", "steve"),
    ("steven", "steve"),
    ("susan", "sue"),
    ("susan", "susie"),
    ("theodore", "ted"),
    ("theodore", "theo"),
    ("thomas", "tom"),
    ("thomas", "tommy"),
    ("timothy", "tim"),
    ("victoria", "vicky"),
    ("zachary", "zach"),
];

/// Lowercase, fold diacritics, drop honorifics and punctuation, collapse
/// whitespace.
pub fn normalize_name(raw: &str) -> String {
    let folded: String = raw.chars().map(fold_diacritic).collect();
    folded
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty() && !HONORIFICS.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

fn fold_diacritic(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' | 'Á' | 'À' | 'Â' | 'Ä' | 'Ã' | 'Å' => 'a',
        'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' | 'Ê' | 'Ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' | 'Í' | 'Ì' | 'Î' | 'Ï' => 'i',
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' | 'ø' | 'Ó' | 'Ò' | 'Ô' | 'Ö' | 'Õ' | 'Ø' => 'o',
        'ú' | 'ù' | 'û' | 'ü' | 'Ú' | 'Ù' | 'Û' | 'Ü' => 'u',
        'ñ' | 'Ñ' => 'n',
        'ç' | 'Ç' => 'c',
        'ý' | 'ÿ' | 'Ý' => 'y',
        'ß' => 's',
        other => other,
    }
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Levenshtein ratio in [0, 1]; 1.0 means identical.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 0.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

fn is_nickname_pair(a: &str, b: &str) -> bool {
    NICKNAMES
        .iter()
        .any(|(formal, short)| (a == *formal && b == *short) || (a == *short && b == *formal))
}

/// Combined similarity over two raw names. Both sides are normalised first.
///
/// Token-aware: a nickname first-name pair with an equal surname scores like
/// a near-exact match; a bare first name against a full name scores on the
/// first token alone, discounted for the missing surname evidence.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let a_tokens: Vec<&str> = a.split(' ').collect();
    let b_tokens: Vec<&str> = b.split(' ').collect();
    let (a_first, b_first) = (a_tokens[0], b_tokens[0]);
    let (a_last, b_last) = (*a_tokens.last().expect("non-empty"), *b_tokens.last().expect("non-empty"));

    let first_similarity = if a_first == b_first || is_nickname_pair(a_first, b_first) {
        1.0
    } else {
        similarity_ratio(a_first, b_first)
    };

    let whole_ratio = similarity_ratio(&a, &b);

    if a_tokens.len() > 1 && b_tokens.len() > 1 {
        let last_similarity = similarity_ratio(a_last, b_last);
        let token_score = 0.6 * first_similarity + 0.4 * last_similarity;
        token_score.max(whole_ratio)
    } else {
        // One side is a bare first name; surname evidence is missing.
        (first_similarity * 0.8).max(whole_ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalisation_strips_honorifics_and_diacritics() {
        assert_eq!(normalize_name("Dr. José Núñez"), "jose nunez");
        assert_eq!(normalize_name("  Mrs Sarah  Chen "), "sarah chen");
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn identical_names_score_one() {
        assert_eq!(name_similarity("Sarah Chen", "sarah chen"), 1.0);
    }

    #[test]
    fn nickname_with_matching_surname_scores_high() {
        let score = name_similarity("William Howe", "Bill Howe");
        assert!(score >= 0.95, "expected ≥0.95, got {score}");
    }

    #[test]
    fn different_people_score_low() {
        let score = name_similarity("Sarah Chen", "Marcus Webb");
        assert!(score < 0.5, "expected <0.5, got {score}");
    }

    #[test]
    fn bare_first_name_is_discounted() {
        let score = name_similarity("Jake", "Jake Miller");
        assert!(score >= 0.7 && score < 0.93, "expected partial score, got {score}");
    }
}
