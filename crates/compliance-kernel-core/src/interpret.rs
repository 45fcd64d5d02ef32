//! Query interpretation: topic, intent, jurisdiction, entities and a retrieval gate.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::text::{general_tokens, match_tokens, normalize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Topic {
    Regulatory,
    Product,
    Support,
}

impl Topic {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regulatory => "REGULATORY",
            Self::Product => "PRODUCT",
            Self::Support => "SUPPORT",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    Explain,
    Calculate,
    Deadline,
    Procedure,
    Rate,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Jurisdiction {
    Hr,
    Eu,
    Other,
    Unknown,
}

/// What the interpretation allows the pipeline to do next.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalGate {
    Proceed,
    ProceedStrict,
    Clarify,
    Nonsense,
    OutOfScope,
    UnsupportedJurisdiction,
}

impl RetrievalGate {
    #[must_use]
    pub fn allows_retrieval(self) -> bool {
        matches!(self, Self::Proceed | Self::ProceedStrict)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InterpreterThresholds {
    pub nonsense_ratio: f64,
    pub clarify_below: f64,
    pub strict_below: f64,
    pub strict_min_entities: usize,
}

impl Default for InterpreterThresholds {
    fn default() -> Self {
        Self { nonsense_ratio: 0.6, clarify_below: 0.6, strict_below: 0.75, strict_min_entities: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Interpretation {
    pub topic: Topic,
    pub topic_matched: bool,
    pub intent: Intent,
    pub jurisdiction: Jurisdiction,
    pub entities: Vec<String>,
    pub needs_personalization: bool,
    pub nonsense_ratio: f64,
    pub is_nonsense: bool,
    pub foreign_jurisdiction: Option<String>,
    pub confidence: f64,
    pub needs_clarification: bool,
    pub gate: RetrievalGate,
    pub suggested_clarifications: Vec<String>,
}

struct Pattern<L> {
    label: L,
    regex: Regex,
    weight: f64,
}

fn compile<L: Copy>(table: &[(L, &str, f64)]) -> Vec<Pattern<L>> {
    table
        .iter()
        .filter_map(|(label, pattern, weight)| match Regex::new(pattern) {
            Ok(regex) => Some(Pattern { label: *label, regex, weight: *weight }),
            Err(err) => {
                tracing::error!(pattern, error = %err, "interpreter pattern failed to compile");
                None
            }
        })
        .collect()
}

const TOPIC_TABLE: &[(Topic, &str, f64)] = &[
    (Topic::Regulatory, r"\bpdv|\bvat\b|porez|\btax", 2.0),
    (Topic::Regulatory, r"doprinos|contribution|joppd|\bjop\b", 2.0),
    (Topic::Regulatory, r"pausal|lump.sum|\bobrt|\bd\.?o\.?o\b|j\.?d\.?o\.?o", 1.5),
    (Topic::Regulatory, r"fiskaliz|fiscaliz|\bracun|faktur|invoice", 1.0),
    (Topic::Regulatory, r"zakon|pravilnik|propis|\blaw\b|regulation|porezn", 1.0),
    (Topic::Regulatory, r"\bstop[aeiu]\b|\bprag|threshold|\brok\b|rokovi|deadline", 1.0),
    (Topic::Regulatory, r"\bplac[aeiu]\b|\bplaca|salary|payroll|minimaln", 1.0),
    (Topic::Product, r"aplikacij|\bapp\b|funkcij|feature|dashboard|nadzorn", 2.0),
    (Topic::Product, r"pretplat|subscription|pricing|paket|\bplan\b|integracij|export", 1.5),
    (Topic::Support, r"lozink|password|login|prijav\w* se|ne radi|\bbug\b|greska|error", 2.0),
    (Topic::Support, r"podrsk|support|korisnick\w* racun|account|kontakt", 1.5),
];

const INTENT_TABLE: &[(Intent, &str, f64)] = &[
    (Intent::Rate, r"\bstop[aeiu]\b|\bstopom\b|koliko iznosi|\biznos|\bprag|\blimit|\brate\b|threshold|postot", 1.0),
    (Intent::Calculate, r"izracun|kalkul|koliko (cu|moram|trebam) plat|calculate|how much", 1.2),
    (Intent::Deadline, r"\brok\b|rokovi|do kada|deadline|kada (moram|treba|se)|\bdue\b", 1.0),
    (Intent::Procedure, r"kako (se )?(prijav|registr|otvor|podn|izda|zatvor)|postupak|procedur|how (do i|to) ", 1.0),
    (Intent::Explain, r"sto je|sto znaci|what is|what does|objasn|explain|definic", 0.8),
];

const HR_PATTERNS: &str = r"hrvatsk|croatia|\bzagreb|\bhr\b|republika hrvatska";
const EU_PATTERNS: &str = r"\beu\b|europsk|european union|\beuropa";

const FOREIGN_TABLE: &[(&str, &str, f64)] = &[
    ("germany", r"njemack|germany|german|deutschland", 1.0),
    ("slovenia", r"slovenij|slovenia", 1.0),
    ("austria", r"austrij|austria|osterreich", 1.0),
    ("serbia", r"\bsrbij|serbia", 1.0),
    ("bosnia", r"\bbosn|\bbih\b", 1.0),
    ("italy", r"italij|\bitaly|italia", 1.0),
    ("usa", r"\busa\b|americ|sjedinjen", 1.0),
    ("united kingdom", r"britanij|britain|\buk\b|england|engleskoj", 1.0),
    ("france", r"francusk|france", 1.0),
    ("hungary", r"madarsk|hungary", 1.0),
    ("montenegro", r"crnoj gori|crna gora|montenegro", 1.0),
    ("switzerland", r"svicarsk|switzerland", 1.0),
];

const ENTITY_TABLE: &[(&str, &str, f64)] = &[
    ("VAT", r"\bpdv|\bvat\b|porez na dodanu", 1.0),
    ("TAX", r"porez|\btax", 1.0),
    ("RATE", r"\bstop[aeiu]\b|\bstopom\b|\brate\b|postot", 1.0),
    ("HR", r"hrvatsk|croatia", 1.0),
    ("CONTRIBUTIONS", r"doprinos|contribution", 1.0),
    ("LUMP_SUM", r"pausal|lump.sum", 1.0),
    ("CRAFT", r"\bobrt", 1.0),
    ("LLC", r"\bd\.?o\.?o\b|j\.?d\.?o\.?o|drustv\w* s ogranicen", 1.0),
    ("INVOICE", r"\bracun|faktur|invoice", 1.0),
    ("FISCALIZATION", r"fiskaliz|fiscaliz", 1.0),
    ("SALARY", r"\bplac[aeiu]\b|\bplaca|salary|payroll|joppd", 1.0),
    ("THRESHOLD", r"\bprag|threshold|\blimit", 1.0),
    ("DEADLINE", r"\brok\b|rokovi|deadline", 1.0),
];

const PERSONALIZATION_PATTERNS: &str =
    r"\bmoj[aeiu]?\b|\bmog\b|\bmojeg|trebam li|moram li|\bmy\b|should i|do i (need|have)";

static TOPICS: Lazy<Vec<Pattern<Topic>>> = Lazy::new(|| compile(TOPIC_TABLE));
static INTENTS: Lazy<Vec<Pattern<Intent>>> = Lazy::new(|| compile(INTENT_TABLE));
static FOREIGN: Lazy<Vec<Pattern<&'static str>>> = Lazy::new(|| compile(FOREIGN_TABLE));
static ENTITIES: Lazy<Vec<Pattern<&'static str>>> = Lazy::new(|| compile(ENTITY_TABLE));
static HR: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(HR_PATTERNS).ok());
static EU: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(EU_PATTERNS).ok());
static PERSONAL: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(PERSONALIZATION_PATTERNS).ok());
static PLAUSIBLE_SHAPE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[a-z]{3,20}$").ok());

const SHORT_VALID_WORDS: &[&str] = &[
    "je", "li", "da", "ne", "se", "na", "za", "od", "do", "iz", "pa", "te", "to", "su", "mi",
    "ti", "on", "hr", "eu", "ii", "is", "it", "of", "in", "or", "my", "an", "as", "at", "be",
    "by", "if", "me", "no", "so", "up", "we", "pdv", "doo", "oib", "vat", "tax", "jop",
];

const KEYBOARD_MASH: &[&str] = &[
    "qwer", "asdf", "zxcv", "hjkl", "uiop", "sdfg", "dfgh", "fghj", "ghjk", "xcvb", "cvbn",
    "vbnm", "wasd",
];

const VOWELS: &[char] = &['a', 'e', 'i', 'o', 'u', 'y'];

fn has_triple_run(token: &str) -> bool {
    let chars = token.chars().collect::<Vec<_>>();
    chars.windows(3).any(|window| window[0] == window[1] && window[1] == window[2])
}

#[allow(clippy::cast_precision_loss)]
fn vowel_ratio(token: &str) -> f64 {
    let total = token.chars().count();
    if total == 0 {
        return 0.0;
    }
    let vowels = token.chars().filter(|ch| VOWELS.contains(ch)).count();
    vowels as f64 / total as f64
}

/// Whether a normalized token looks like a real word.
#[must_use]
pub fn is_plausible_token(token: &str) -> bool {
    if SHORT_VALID_WORDS.contains(&token) {
        return true;
    }
    if !token.is_empty() && token.chars().all(|ch| ch.is_ascii_digit()) {
        return true;
    }
    let shaped = PLAUSIBLE_SHAPE.as_ref().is_some_and(|regex| regex.is_match(token));
    if !shaped || has_triple_run(token) {
        return false;
    }
    if KEYBOARD_MASH.iter().any(|mash| token.contains(mash)) {
        return false;
    }
    token.chars().count() < 4 || vowel_ratio(token) >= 0.15
}

/// Fraction of general tokens failing plausibility. A query without tokens counts as fully implausible.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn nonsense_ratio(text: &str) -> f64 {
    let tokens = general_tokens(text);
    if tokens.is_empty() {
        return 1.0;
    }
    let implausible = tokens.iter().filter(|token| !is_plausible_token(token)).count();
    implausible as f64 / tokens.len() as f64
}

fn score_families<L: Copy + PartialEq>(patterns: &[Pattern<L>], text: &str) -> Vec<(L, f64)> {
    let mut scores: Vec<(L, f64)> = Vec::new();
    for pattern in patterns {
        let hits = pattern.regex.find_iter(text).count();
        if hits == 0 {
            continue;
        }
        #[allow(clippy::cast_precision_loss)]
        let score = pattern.weight * hits as f64;
        match scores.iter_mut().find(|(label, _)| *label == pattern.label) {
            Some((_, total)) => *total += score,
            None => scores.push((pattern.label, score)),
        }
    }
    scores
}

fn classify_topic(text: &str) -> (Topic, bool) {
    let scores = score_families(&TOPICS, text);
    let score_of = |topic: Topic| {
        scores.iter().find(|(label, _)| *label == topic).map_or(0.0, |(_, score)| *score)
    };
    let regulatory = score_of(Topic::Regulatory);
    let product = score_of(Topic::Product);
    let support = score_of(Topic::Support);

    if regulatory == 0.0 && product == 0.0 && support == 0.0 {
        return (Topic::Regulatory, false);
    }
    if regulatory >= product && regulatory >= support {
        (Topic::Regulatory, true)
    } else if product >= support {
        (Topic::Product, true)
    } else {
        (Topic::Support, true)
    }
}

fn classify_intent(text: &str) -> Intent {
    let mut best = (Intent::Unknown, 0.0);
    for (intent, score) in score_families(&INTENTS, text) {
        if score > best.1 {
            best = (intent, score);
        }
    }
    best.0
}

fn detect_foreign(text: &str) -> Option<String> {
    FOREIGN
        .iter()
        .find(|pattern| pattern.regex.is_match(text))
        .map(|pattern| pattern.label.to_string())
}

fn classify_jurisdiction(text: &str, foreign: Option<&String>) -> Jurisdiction {
    if foreign.is_some() {
        return Jurisdiction::Other;
    }
    if HR.as_ref().is_some_and(|regex| regex.is_match(text)) {
        return Jurisdiction::Hr;
    }
    if EU.as_ref().is_some_and(|regex| regex.is_match(text)) {
        return Jurisdiction::Eu;
    }
    Jurisdiction::Unknown
}

fn extract_entities(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ENTITIES
        .iter()
        .filter(|pattern| pattern.regex.is_match(text))
        .filter(|pattern| seen.insert(pattern.label))
        .map(|pattern| pattern.label.to_string())
        .collect()
}

fn base_confidence(meaningful_tokens: usize) -> f64 {
    match meaningful_tokens {
        0 => 0.0,
        1 => 0.25,
        2 => 0.45,
        3 => 0.55,
        _ => 0.65,
    }
}

#[must_use]
pub fn default_clarifications(topic: Topic) -> Vec<String> {
    let suggestions: &[&str] = match topic {
        Topic::Regulatory => &[
            "Koja je opća stopa PDV-a u Hrvatskoj?",
            "Koji je prag prihoda za paušalni obrt?",
            "Do kada moram predati JOPPD obrazac?",
        ],
        Topic::Product => &["Koje funkcije aplikacije vas zanimaju?"],
        Topic::Support => &["Opišite problem s kojim se susrećete u aplikaciji."],
    };
    suggestions.iter().map(ToString::to_string).collect()
}

/// Interpret a raw question. Deterministic and free of external calls.
#[must_use]
pub fn interpret_query(text: &str, thresholds: &InterpreterThresholds) -> Interpretation {
    let normalized = normalize(text);
    let nonsense_ratio = nonsense_ratio(text);
    let is_nonsense = nonsense_ratio >= thresholds.nonsense_ratio;

    let (topic, topic_matched) = classify_topic(&normalized);
    let intent = classify_intent(&normalized);
    let foreign_jurisdiction = detect_foreign(&normalized);
    let jurisdiction = classify_jurisdiction(&normalized, foreign_jurisdiction.as_ref());
    let entities = extract_entities(&normalized);
    let needs_personalization =
        PERSONAL.as_ref().is_some_and(|regex| regex.is_match(&normalized));

    let mut confidence = base_confidence(match_tokens(text).len());
    if topic_matched {
        confidence += if topic == Topic::Regulatory { 0.10 } else { 0.05 };
    }
    if intent != Intent::Unknown {
        confidence += 0.10;
    }
    #[allow(clippy::cast_precision_loss)]
    let entity_boost = (0.08 * entities.len() as f64).min(0.24);
    confidence += entity_boost;
    if entities.len() >= 2 {
        confidence += 0.05;
    }
    if topic == Topic::Regulatory && jurisdiction == Jurisdiction::Unknown {
        confidence -= 0.10;
    }
    if foreign_jurisdiction.is_some() {
        confidence -= 0.20;
    }
    let confidence = if is_nonsense { 0.0 } else { confidence.clamp(0.0, 0.95) };

    let gate = if is_nonsense {
        RetrievalGate::Nonsense
    } else if foreign_jurisdiction.is_some() {
        RetrievalGate::UnsupportedJurisdiction
    } else if topic != Topic::Regulatory {
        RetrievalGate::OutOfScope
    } else if confidence < thresholds.clarify_below {
        RetrievalGate::Clarify
    } else if confidence < thresholds.strict_below {
        if entities.len() >= thresholds.strict_min_entities {
            RetrievalGate::ProceedStrict
        } else {
            RetrievalGate::Clarify
        }
    } else {
        RetrievalGate::Proceed
    };
    let needs_clarification = matches!(gate, RetrievalGate::Clarify | RetrievalGate::Nonsense);

    tracing::debug!(
        topic = topic.as_str(),
        ?intent,
        ?jurisdiction,
        confidence,
        nonsense_ratio,
        ?gate,
        "query interpreted"
    );

    Interpretation {
        topic,
        topic_matched,
        intent,
        jurisdiction,
        entities,
        needs_personalization,
        nonsense_ratio,
        is_nonsense,
        foreign_jurisdiction,
        confidence,
        needs_clarification,
        gate,
        suggested_clarifications: if needs_clarification {
            default_clarifications(topic)
        } else {
            Vec::new()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interpret(text: &str) -> Interpretation {
        interpret_query(text, &InterpreterThresholds::default())
    }

    #[test]
    fn all_pattern_tables_compile() {
        assert_eq!(TOPICS.len(), TOPIC_TABLE.len());
        assert_eq!(INTENTS.len(), INTENT_TABLE.len());
        assert_eq!(FOREIGN.len(), FOREIGN_TABLE.len());
        assert_eq!(ENTITIES.len(), ENTITY_TABLE.len());
        assert!(HR.is_some() && EU.is_some() && PERSONAL.is_some() && PLAUSIBLE_SHAPE.is_some());
    }

    #[test]
    fn gibberish_is_nonsense_with_zero_confidence() {
        let interpretation = interpret("xyz123 asdfghjkl qwerty");
        assert!(interpretation.is_nonsense);
        assert!((interpretation.confidence - 0.0).abs() < f64::EPSILON);
        assert_eq!(interpretation.gate, RetrievalGate::Nonsense);
        assert!(!interpretation.gate.allows_retrieval());
        assert!(!interpretation.suggested_clarifications.is_empty());
    }

    #[test]
    fn single_token_needs_clarification() {
        let interpretation = interpret("porez");
        assert!(interpretation.confidence < 0.6);
        assert!(interpretation.needs_clarification);
        assert_eq!(interpretation.gate, RetrievalGate::Clarify);
    }

    #[test]
    fn specific_vat_question_is_retrievable() {
        let single = interpret("porez");
        let interpretation = interpret("Koja je stopa PDV-a u Hrvatskoj?");
        assert!(interpretation.confidence > single.confidence);
        assert!(interpretation.entities.len() >= 2);
        assert_eq!(interpretation.topic, Topic::Regulatory);
        assert_eq!(interpretation.intent, Intent::Rate);
        assert_eq!(interpretation.jurisdiction, Jurisdiction::Hr);
        assert!(interpretation.gate.allows_retrieval());
        assert!(interpretation.confidence <= 0.95);
    }

    #[test]
    fn foreign_country_sets_other_jurisdiction() {
        let interpretation = interpret("Koja je stopa PDV-a u Njemačkoj?");
        assert_eq!(interpretation.jurisdiction, Jurisdiction::Other);
        assert_eq!(interpretation.foreign_jurisdiction.as_deref(), Some("germany"));
        assert_eq!(interpretation.gate, RetrievalGate::UnsupportedJurisdiction);
    }

    #[test]
    fn product_questions_are_out_of_scope() {
        let interpretation = interpret("Kako izvesti dashboard iz aplikacije u export?");
        assert_eq!(interpretation.topic, Topic::Product);
        assert_eq!(interpretation.gate, RetrievalGate::OutOfScope);
    }

    #[test]
    fn personalization_is_detected() {
        assert!(interpret("Moram li ja platiti PDV za moj obrt?").needs_personalization);
        assert!(!interpret("Koja je stopa PDV-a u Hrvatskoj?").needs_personalization);
    }

    #[test]
    fn plausibility_rules() {
        assert!(is_plausible_token("je"));
        assert!(is_plausible_token("2025"));
        assert!(is_plausible_token("stopa"));
        assert!(!is_plausible_token("xyz123"));
        assert!(!is_plausible_token("aaab"));
        assert!(!is_plausible_token("qwerty"));
        assert!(!is_plausible_token("bcdfg"));
    }

    #[test]
    fn empty_query_has_no_confidence() {
        let interpretation = interpret("   ");
        assert!(interpretation.is_nonsense);
        assert!((interpretation.confidence - 0.0).abs() < f64::EPSILON);
    }
}
