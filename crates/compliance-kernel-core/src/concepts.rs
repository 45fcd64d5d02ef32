//! Query-to-concept matching: keyword overlap, embedding similarity, or a weighted hybrid.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::ConceptRecord;
use crate::text::match_tokens;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EmbedError {
    #[error("embedding request timed out")]
    Timeout,
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),
}

/// Produces a query embedding in the same space as stored concept embeddings.
pub trait QueryEmbedder: Send + Sync {
    /// # Errors
    /// Returns [`EmbedError`] when the embedding cannot be produced in time.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    Keyword,
    Semantic,
    Hybrid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Keyword,
    Semantic,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConceptMatch {
    pub concept_id: String,
    pub slug: String,
    pub name: String,
    pub score: f64,
    pub matched_tokens: Vec<String>,
    pub method: MatchMethod,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MatchSettings {
    pub mode: MatchMode,
    pub min_score: f64,
    pub keyword_weight: f64,
    pub semantic_weight: f64,
    pub semantic_floor: f64,
    pub top_k: usize,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            mode: MatchMode::Keyword,
            min_score: 0.25,
            keyword_weight: 0.3,
            semantic_weight: 0.7,
            semantic_floor: 0.5,
            top_k: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatchOutcome {
    pub matches: Vec<ConceptMatch>,
    pub semantic_fallback: bool,
}

/// Cosine similarity; zero when either vector is empty, zero-length or the dimensions differ.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum();
    let norm_a = a.iter().map(|x| f64::from(*x) * f64::from(*x)).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| f64::from(*x) * f64::from(*x)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn concept_tokens(concept: &ConceptRecord) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    tokens.extend(match_tokens(&concept.slug.replace('-', " ")));
    tokens.extend(match_tokens(&concept.name));
    for alias in &concept.aliases {
        tokens.extend(match_tokens(alias));
    }
    tokens
}

struct KeywordHit {
    score: f64,
    tokens: Vec<String>,
}

#[allow(clippy::cast_precision_loss)]
fn keyword_scores(query: &str, concepts: &[ConceptRecord], min_score: f64) -> BTreeMap<String, KeywordHit> {
    let query_tokens = match_tokens(query).into_iter().collect::<BTreeSet<_>>();
    let mut hits = BTreeMap::new();
    if query_tokens.is_empty() {
        return hits;
    }

    for concept in concepts {
        let vocabulary = concept_tokens(concept);
        let matched = query_tokens
            .iter()
            .filter(|token| vocabulary.contains(*token))
            .cloned()
            .collect::<Vec<_>>();
        if matched.is_empty() {
            continue;
        }
        let score = matched.len() as f64 / query_tokens.len() as f64;
        if score >= min_score {
            hits.insert(concept.id.clone(), KeywordHit { score, tokens: matched });
        }
    }
    hits
}

fn semantic_scores(
    query: &str,
    concepts: &[ConceptRecord],
    embedder: &dyn QueryEmbedder,
    floor: f64,
) -> Result<BTreeMap<String, f64>, EmbedError> {
    let query_embedding = embedder.embed(query)?;
    let mut scores = BTreeMap::new();
    for concept in concepts {
        let Some(embedding) = concept.embedding.as_deref() else {
            continue;
        };
        let similarity = cosine_similarity(&query_embedding, embedding);
        if similarity >= floor {
            scores.insert(concept.id.clone(), similarity);
        }
    }
    Ok(scores)
}

fn rank(mut matches: Vec<ConceptMatch>, top_k: usize) -> Vec<ConceptMatch> {
    matches.sort_by(|left, right| {
        right.score.total_cmp(&left.score).then_with(|| left.slug.cmp(&right.slug))
    });
    matches.truncate(top_k);
    matches
}

/// Rank concepts for a query. Semantic failures fall back to keyword matching and set
/// [`MatchOutcome::semantic_fallback`].
#[must_use]
pub fn match_concepts(
    query: &str,
    concepts: &[ConceptRecord],
    settings: &MatchSettings,
    embedder: Option<&dyn QueryEmbedder>,
) -> MatchOutcome {
    let keyword = keyword_scores(query, concepts, settings.min_score);
    let by_id = concepts
        .iter()
        .map(|concept| (concept.id.as_str(), concept))
        .collect::<BTreeMap<_, _>>();

    let keyword_only = |keyword: BTreeMap<String, KeywordHit>, semantic_fallback: bool| {
        let matches = keyword
            .into_iter()
            .filter_map(|(id, hit)| {
                by_id.get(id.as_str()).map(|concept| ConceptMatch {
                    concept_id: id.clone(),
                    slug: concept.slug.clone(),
                    name: concept.name.clone(),
                    score: hit.score,
                    matched_tokens: hit.tokens,
                    method: MatchMethod::Keyword,
                })
            })
            .collect();
        MatchOutcome { matches: rank(matches, settings.top_k), semantic_fallback }
    };

    if settings.mode == MatchMode::Keyword {
        return keyword_only(keyword, false);
    }

    let Some(embedder) = embedder else {
        tracing::warn!(mode = ?settings.mode, "no embedder configured; using keyword matching");
        return keyword_only(keyword, true);
    };

    let semantic = match semantic_scores(query, concepts, embedder, settings.semantic_floor) {
        Ok(scores) => scores,
        Err(err) => {
            tracing::warn!(error = %err, "semantic matching failed; falling back to keyword matching");
            return keyword_only(keyword, true);
        }
    };

    let mut matches = Vec::new();
    if settings.mode == MatchMode::Semantic {
        for (id, similarity) in semantic {
            if similarity < settings.min_score {
                continue;
            }
            if let Some(concept) = by_id.get(id.as_str()) {
                matches.push(ConceptMatch {
                    concept_id: id.clone(),
                    slug: concept.slug.clone(),
                    name: concept.name.clone(),
                    score: similarity,
                    matched_tokens: keyword.get(&id).map(|hit| hit.tokens.clone()).unwrap_or_default(),
                    method: MatchMethod::Semantic,
                });
            }
        }
        return MatchOutcome { matches: rank(matches, settings.top_k), semantic_fallback: false };
    }

    let ids = keyword.keys().chain(semantic.keys()).cloned().collect::<BTreeSet<_>>();
    for id in ids {
        let Some(concept) = by_id.get(id.as_str()) else {
            continue;
        };
        let keyword_hit = keyword.get(&id);
        let similarity = semantic.get(&id).copied();
        let keyword_score = keyword_hit.map_or(0.0, |hit| hit.score);
        let score = keyword_score * settings.keyword_weight
            + similarity.unwrap_or(0.0) * settings.semantic_weight;
        if score < settings.min_score {
            continue;
        }
        let method = match (keyword_hit.is_some(), similarity.is_some()) {
            (true, true) => MatchMethod::Hybrid,
            (false, true) => MatchMethod::Semantic,
            _ => MatchMethod::Keyword,
        };
        matches.push(ConceptMatch {
            concept_id: id.clone(),
            slug: concept.slug.clone(),
            name: concept.name.clone(),
            score,
            matched_tokens: keyword_hit.map(|hit| hit.tokens.clone()).unwrap_or_default(),
            method,
        });
    }

    MatchOutcome { matches: rank(matches, settings.top_k), semantic_fallback: false }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEmbedder(Vec<f32>);

    impl QueryEmbedder for FixedEmbedder {
        fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
            Ok(self.0.clone())
        }
    }

    struct FailingEmbedder;

    impl QueryEmbedder for FailingEmbedder {
        fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
            Err(EmbedError::Timeout)
        }
    }

    fn concept(id: &str, slug: &str, name: &str, aliases: &[&str], embedding: Option<Vec<f32>>) -> ConceptRecord {
        ConceptRecord {
            id: id.to_string(),
            slug: slug.to_string(),
            name: name.to_string(),
            aliases: aliases.iter().map(ToString::to_string).collect(),
            embedding,
        }
    }

    fn corpus() -> Vec<ConceptRecord> {
        vec![
            concept("c-vat", "pdv-stopa", "Stopa PDV-a", &["porez na dodanu vrijednost", "vat rate"], Some(vec![1.0, 0.0])),
            concept("c-lump", "pausalni-obrt-prag", "Prag za paušalni obrt", &["pausalist"], Some(vec![0.0, 1.0])),
        ]
    }

    #[test]
    fn keyword_match_scores_token_overlap() {
        let outcome = match_concepts(
            "Koja je stopa PDV-a u Hrvatskoj?",
            &corpus(),
            &MatchSettings::default(),
            None,
        );
        assert_eq!(outcome.matches.len(), 1);
        let top = &outcome.matches[0];
        assert_eq!(top.slug, "pdv-stopa");
        assert_eq!(top.method, MatchMethod::Keyword);
        assert!((top.score - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(top.matched_tokens, vec!["pdv".to_string(), "stopa".to_string()]);
    }

    #[test]
    fn keyword_match_ignores_diacritics() {
        let outcome = match_concepts("paušalni prag", &corpus(), &MatchSettings::default(), None);
        assert_eq!(outcome.matches.first().map(|m| m.slug.as_str()), Some("pausalni-obrt-prag"));
    }

    #[test]
    fn hybrid_combines_weights_and_marks_method() {
        let settings = MatchSettings { mode: MatchMode::Hybrid, ..MatchSettings::default() };
        let embedder = FixedEmbedder(vec![0.0, 1.0]);
        let outcome = match_concepts("stopa pdv", &corpus(), &settings, Some(&embedder));
        assert_eq!(outcome.matches.len(), 2);
        assert_eq!(outcome.matches[0].slug, "pausalni-obrt-prag");
        assert_eq!(outcome.matches[0].method, MatchMethod::Semantic);
        assert!((outcome.matches[0].score - 0.7).abs() < 1e-9);
        assert_eq!(outcome.matches[1].slug, "pdv-stopa");
        assert!((outcome.matches[1].score - 0.3).abs() < 1e-9);
    }

    #[test]
    fn semantic_failure_falls_back_to_keyword() {
        let settings = MatchSettings { mode: MatchMode::Hybrid, ..MatchSettings::default() };
        let outcome = match_concepts("stopa pdv", &corpus(), &settings, Some(&FailingEmbedder));
        assert!(outcome.semantic_fallback);
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].method, MatchMethod::Keyword);
    }

    #[test]
    fn ties_break_by_slug_and_truncate_to_top_k() {
        let concepts = (0..8)
            .map(|index| concept(&format!("c{index}"), &format!("pdv-{index}"), "PDV", &[], None))
            .collect::<Vec<_>>();
        let outcome = match_concepts("pdv", &concepts, &MatchSettings::default(), None);
        let slugs = outcome.matches.iter().map(|m| m.slug.as_str()).collect::<Vec<_>>();
        assert_eq!(slugs, vec!["pdv-0", "pdv-1", "pdv-2", "pdv-3", "pdv-4"]);
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert!((cosine_similarity(&[], &[]) - 0.0).abs() < f64::EPSILON);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0]) - 0.0).abs() < f64::EPSILON);
        assert!((cosine_similarity(&[2.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
    }
}
