//! Repository seam and candidate rule retrieval.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{ConceptRecord, EvidenceRecord, RuleCandidate, RuleRecord, RuleStatus};
use crate::KernelError;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RepositoryError {
    #[error("repository call timed out after {0:?}")]
    Timeout(Duration),
    #[error("repository is busy: {0}")]
    Busy(String),
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("repository returned corrupt data: {0}")]
    Corrupt(String),
}

impl RepositoryError {
    #[must_use]
    pub fn retriable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Busy(_) | Self::Unavailable(_))
    }
}

/// Read-only access to concepts, rules and evidence.
pub trait RuleRepository {
    /// # Errors
    /// Returns [`RepositoryError`] when the backing store cannot be read.
    fn find_concepts(&self) -> Result<Vec<ConceptRecord>, RepositoryError>;

    /// # Errors
    /// Returns [`RepositoryError`] when the backing store cannot be read.
    fn find_rules(&self, concept_slugs: &[String], status: RuleStatus) -> Result<Vec<RuleRecord>, RepositoryError>;

    /// # Errors
    /// Returns [`RepositoryError`] when the backing store cannot be read.
    fn find_evidence(&self, evidence_ids: &[String]) -> Result<Vec<EvidenceRecord>, RepositoryError>;
}

/// Concepts, rules and evidence exchanged as one JSON document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CorpusBundle {
    #[serde(default)]
    pub concepts: Vec<ConceptRecord>,
    #[serde(default)]
    pub rules: Vec<RuleRecord>,
    #[serde(default)]
    pub evidence: Vec<EvidenceRecord>,
}

impl CorpusBundle {
    /// Check every rule and its references before the bundle is accepted.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for the first rule that is invalid, lacks a
    /// source pointer, or references an unknown concept or evidence record.
    pub fn validate(&self) -> Result<(), KernelError> {
        let slugs = self.concepts.iter().map(|concept| concept.slug.as_str()).collect::<BTreeSet<_>>();
        let evidence_ids = self.evidence.iter().map(|record| record.id.as_str()).collect::<BTreeSet<_>>();

        for concept in &self.concepts {
            if concept.id.trim().is_empty() || concept.slug.trim().is_empty() {
                return Err(KernelError::Validation(
                    "concept id and slug MUST be provided".to_string(),
                ));
            }
        }

        for rule in &self.rules {
            rule.validate()?;
            if rule.sources.is_empty() {
                return Err(KernelError::Validation(format!(
                    "rule {} MUST carry at least one source pointer",
                    rule.id
                )));
            }
            if !slugs.contains(rule.concept_slug.as_str()) {
                return Err(KernelError::Validation(format!(
                    "rule {} references unknown concept {}",
                    rule.id, rule.concept_slug
                )));
            }
            for source in &rule.sources {
                if !evidence_ids.contains(source.evidence_id.as_str()) {
                    return Err(KernelError::Validation(format!(
                        "rule {} references unknown evidence {}",
                        rule.id, source.evidence_id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Repository held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    concepts: Vec<ConceptRecord>,
    rules: Vec<RuleRecord>,
    evidence: BTreeMap<String, EvidenceRecord>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_bundle(bundle: CorpusBundle) -> Self {
        let mut repository = Self::new();
        repository.concepts = bundle.concepts;
        repository.rules = bundle.rules;
        for record in bundle.evidence {
            repository.evidence.insert(record.id.clone(), record);
        }
        repository
    }

    #[must_use]
    pub fn with_concept(mut self, concept: ConceptRecord) -> Self {
        self.concepts.push(concept);
        self
    }

    #[must_use]
    pub fn with_rule(mut self, rule: RuleRecord) -> Self {
        self.rules.push(rule);
        self
    }

    #[must_use]
    pub fn with_evidence(mut self, evidence: EvidenceRecord) -> Self {
        self.evidence.insert(evidence.id.clone(), evidence);
        self
    }
}

impl RuleRepository for InMemoryRepository {
    fn find_concepts(&self) -> Result<Vec<ConceptRecord>, RepositoryError> {
        Ok(self.concepts.clone())
    }

    fn find_rules(&self, concept_slugs: &[String], status: RuleStatus) -> Result<Vec<RuleRecord>, RepositoryError> {
        Ok(self
            .rules
            .iter()
            .filter(|rule| rule.status == status && concept_slugs.contains(&rule.concept_slug))
            .cloned()
            .collect())
    }

    fn find_evidence(&self, evidence_ids: &[String]) -> Result<Vec<EvidenceRecord>, RepositoryError> {
        Ok(evidence_ids.iter().filter_map(|id| self.evidence.get(id).cloned()).collect())
    }
}

/// Deterministic pre-sort: authority rank, confidence desc, effective-from desc, id.
#[must_use]
pub fn retrieval_order(left: &RuleCandidate, right: &RuleCandidate) -> Ordering {
    left.authority
        .rank()
        .cmp(&right.authority.rank())
        .then_with(|| right.confidence.total_cmp(&left.confidence))
        .then_with(|| right.effective_from.cmp(&left.effective_from))
        .then_with(|| left.id.cmp(&right.id))
}

/// Fetch published rules for the matched concepts with their evidence resolved.
///
/// # Errors
/// Propagates [`RepositoryError`] from either repository call.
pub fn retrieve_candidates(
    repository: &dyn RuleRepository,
    concept_slugs: &[String],
) -> Result<Vec<RuleCandidate>, RepositoryError> {
    if concept_slugs.is_empty() {
        return Ok(Vec::new());
    }

    let records = repository
        .find_rules(concept_slugs, RuleStatus::Published)?
        .into_iter()
        .filter(|record| record.status == RuleStatus::Published)
        .collect::<Vec<_>>();

    let evidence_ids = records
        .iter()
        .flat_map(|record| record.sources.iter().map(|source| source.evidence_id.clone()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();
    let evidence = if evidence_ids.is_empty() {
        BTreeMap::new()
    } else {
        repository
            .find_evidence(&evidence_ids)?
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect::<BTreeMap<_, _>>()
    };

    let mut candidates = records
        .into_iter()
        .map(|record| RuleCandidate::from_record(record, &evidence))
        .collect::<Vec<_>>();
    candidates.sort_by(retrieval_order);
    tracing::debug!(concepts = concept_slugs.len(), rules = candidates.len(), "rules retrieved");
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dates::parse_date;
    use crate::model::{Authority, SourcePointerRecord, ValueType};

    fn rule(id: &str, authority: Authority, confidence: f32, from: &str, status: RuleStatus) -> RuleRecord {
        RuleRecord {
            id: id.to_string(),
            concept_slug: "pdv-stopa".to_string(),
            title: format!("rule {id}"),
            law_reference: None,
            authority,
            status,
            effective_from: parse_date(from),
            effective_until: None,
            confidence,
            value: "25".to_string(),
            value_type: ValueType::Percentage,
            applies_if: None,
            sources: vec![SourcePointerRecord {
                exact_quote: "Stopa PDV-a iznosi 25 %".to_string(),
                evidence_id: "ev-1".to_string(),
            }],
        }
    }

    fn evidence() -> EvidenceRecord {
        EvidenceRecord {
            id: "ev-1".to_string(),
            url: "https://narodne-novine.nn.hr/clanci/sluzbeni/2013_06_73_1451.html".to_string(),
            fetched_at: None,
            source: "narodne-novine".to_string(),
            title: None,
        }
    }

    #[test]
    fn retrieval_filters_status_and_sorts_deterministically() {
        let repository = InMemoryRepository::new()
            .with_rule(rule("b", Authority::Law, 0.9, "2020-01-01", RuleStatus::Published))
            .with_rule(rule("a", Authority::Law, 0.9, "2020-01-01", RuleStatus::Published))
            .with_rule(rule("c", Authority::Law, 0.9, "2023-01-01", RuleStatus::Published))
            .with_rule(rule("d", Authority::Law, 0.95, "2019-01-01", RuleStatus::Published))
            .with_rule(rule("e", Authority::Guidance, 1.0, "2024-01-01", RuleStatus::Published))
            .with_rule(rule("f", Authority::Law, 1.0, "2024-01-01", RuleStatus::Draft))
            .with_evidence(evidence());

        let candidates = match retrieve_candidates(&repository, &["pdv-stopa".to_string()]) {
            Ok(candidates) => candidates,
            Err(err) => panic!("retrieval failed: {err}"),
        };
        let ids = candidates.iter().map(|candidate| candidate.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["d", "c", "a", "b", "e"]);
        assert!(candidates.iter().all(|candidate| candidate.sources[0].evidence.is_some()));
    }

    #[test]
    fn empty_slug_set_skips_repository() {
        let candidates = retrieve_candidates(&InMemoryRepository::new(), &[]).unwrap_or_else(|err| panic!("{err}"));
        assert!(candidates.is_empty());
    }

    #[test]
    fn bundle_validation_requires_sources_and_known_evidence() {
        let concept = ConceptRecord {
            id: "c-vat".to_string(),
            slug: "pdv-stopa".to_string(),
            name: "Stopa PDV-a".to_string(),
            aliases: vec![],
            embedding: None,
        };
        let mut bundle = CorpusBundle {
            concepts: vec![concept],
            rules: vec![rule("a", Authority::Law, 0.9, "2020-01-01", RuleStatus::Published)],
            evidence: vec![],
        };
        let err = match bundle.validate() {
            Ok(()) => panic!("unknown evidence should be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("unknown evidence ev-1"));

        bundle.evidence.push(evidence());
        assert!(bundle.validate().is_ok());

        bundle.rules[0].sources.clear();
        assert!(bundle.validate().is_err());
    }
}
