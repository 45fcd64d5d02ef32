//! Diacritic-insensitive tokenization shared by the interpreter and concept matcher.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

const STOPWORDS: &[&str] = &[
    // Croatian
    "koja", "koji", "koje", "kojeg", "kojem", "sto", "kako", "kada", "gdje", "zasto", "koliko",
    "li", "je", "su", "sam", "smo", "ste", "biti", "bio", "bila", "ima", "imam", "imati", "za",
    "na", "od", "do", "iz", "pod", "nad", "ali", "ili", "te", "pa", "jer", "da", "ne", "se", "to",
    "taj", "ta", "ovo", "ovaj", "ova", "moj", "moja", "moje", "mog", "mojeg", "mojoj", "trebam",
    "moram", "mogu", "vec", "jos", "sve", "svi", "bez", "kod", "prema", "oko", "nakon", "prije",
    // English
    "the", "what", "which", "how", "when", "where", "why", "who", "is", "are", "was", "were",
    "for", "and", "or", "not", "with", "from", "into", "does", "do", "can", "should", "would",
    "my", "our", "your", "their", "this", "that", "these", "those", "have", "has", "had",
];

/// Lowercase, NFD-decompose and drop combining marks. `đ` has no decomposition and maps to `d`.
#[must_use]
pub fn normalize(input: &str) -> String {
    input
        .nfd()
        .filter(|ch| !is_combining_mark(*ch))
        .flat_map(char::to_lowercase)
        .map(|ch| if ch == 'đ' { 'd' } else { ch })
        .collect()
}

/// Normalized tokens of length >= 2.
#[must_use]
pub fn general_tokens(input: &str) -> Vec<String> {
    normalize(input)
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| token.chars().count() >= 2)
        .map(ToString::to_string)
        .collect()
}

/// Normalized tokens of length >= 3 with stopwords removed.
#[must_use]
pub fn match_tokens(input: &str) -> Vec<String> {
    general_tokens(input)
        .into_iter()
        .filter(|token| token.chars().count() >= 3 && !is_stopword(token))
        .collect()
}

#[must_use]
pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}
