//! Citations. A [`PrimaryCitation`] can only be built from complete provenance.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::dates::serde_date;
use crate::model::{Authority, RuleCandidate, SourcePointer};

pub const MAX_SUPPORTING_CITATIONS: usize = 3;

/// Text that is non-empty after trimming.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct NonEmptyText(String);

impl NonEmptyText {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            None
        } else {
            Some(Self(value))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NonEmptyText {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| "text MUST be non-empty".to_string())
    }
}

impl From<NonEmptyText> for String {
    fn from(value: NonEmptyText) -> Self {
        value.0
    }
}

impl Display for NonEmptyText {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Supporting citation; provenance fields may be missing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceCard {
    pub id: String,
    pub title: String,
    pub authority: Authority,
    #[serde(default)]
    pub law_reference: Option<String>,
    #[serde(default)]
    pub quote: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, with = "serde_date::option")]
    pub effective_from: Option<Date>,
    pub confidence: f32,
    #[serde(default)]
    pub evidence_id: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub fetched_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", try_from = "SourceCard")]
pub struct PrimaryCitation {
    id: String,
    title: String,
    authority: Authority,
    law_reference: Option<String>,
    quote: NonEmptyText,
    url: NonEmptyText,
    #[serde(with = "serde_date::option")]
    effective_from: Option<Date>,
    confidence: f32,
    evidence_id: NonEmptyText,
    #[serde(with = "time::serde::rfc3339")]
    fetched_at: OffsetDateTime,
}

impl TryFrom<SourceCard> for PrimaryCitation {
    type Error = String;

    fn try_from(card: SourceCard) -> Result<Self, Self::Error> {
        let quote = card.quote.and_then(NonEmptyText::new).ok_or("primary citation quote MUST be non-empty")?;
        let url = card.url.and_then(NonEmptyText::new).ok_or("primary citation url MUST be non-empty")?;
        let evidence_id = card
            .evidence_id
            .and_then(NonEmptyText::new)
            .ok_or("primary citation evidenceId MUST be non-empty")?;
        let fetched_at = card.fetched_at.ok_or("primary citation fetchedAt MUST be present")?;
        Ok(Self {
            id: card.id,
            title: card.title,
            authority: card.authority,
            law_reference: card.law_reference,
            quote,
            url,
            effective_from: card.effective_from,
            confidence: card.confidence,
            evidence_id,
            fetched_at,
        })
    }
}

impl PrimaryCitation {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn authority(&self) -> Authority {
        self.authority
    }

    #[must_use]
    pub fn law_reference(&self) -> Option<&str> {
        self.law_reference.as_deref()
    }

    #[must_use]
    pub fn quote(&self) -> &NonEmptyText {
        &self.quote
    }

    #[must_use]
    pub fn url(&self) -> &NonEmptyText {
        &self.url
    }

    #[must_use]
    pub fn evidence_id(&self) -> &NonEmptyText {
        &self.evidence_id
    }

    #[must_use]
    pub fn fetched_at(&self) -> OffsetDateTime {
        self.fetched_at
    }

    #[must_use]
    pub fn with_quote(mut self, quote: NonEmptyText) -> Self {
        self.quote = quote;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CitationSet {
    pub primary: PrimaryCitation,
    #[serde(default)]
    pub supporting: Vec<SourceCard>,
}

impl CitationSet {
    #[must_use]
    pub fn len(&self) -> usize {
        1 + self.supporting.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

fn card(rule: &RuleCandidate, pointer: Option<&SourcePointer>) -> SourceCard {
    let evidence = pointer.and_then(|pointer| pointer.evidence.as_ref());
    SourceCard {
        id: rule.id.clone(),
        title: rule.title.clone(),
        authority: rule.authority,
        law_reference: rule.law_reference.clone(),
        quote: pointer.map(|pointer| pointer.exact_quote.clone()).filter(|quote| !quote.trim().is_empty()),
        url: evidence.map(|evidence| evidence.url.clone()).filter(|url| !url.trim().is_empty()),
        effective_from: rule.effective_from,
        confidence: rule.confidence,
        evidence_id: pointer.map(|pointer| pointer.evidence_id.clone()),
        fetched_at: evidence.and_then(|evidence| evidence.fetched_at),
    }
}

fn primary_for(rule: &RuleCandidate) -> Option<PrimaryCitation> {
    rule.sources
        .iter()
        .find_map(|pointer| PrimaryCitation::try_from(card(rule, Some(pointer))).ok())
}

/// Primary citation from the first sourced rule, plus up to three supporting cards.
/// `None` when no complete primary citation can be formed.
#[must_use]
pub fn build_citations(rules: &[RuleCandidate]) -> Option<CitationSet> {
    let mut sourced = rules.iter().filter(|rule| !rule.sources.is_empty());
    let first = sourced.next()?;
    let primary = primary_for(first)?;
    let supporting = sourced
        .take(MAX_SUPPORTING_CITATIONS)
        .map(|rule| {
            let pointer = rule
                .sources
                .iter()
                .find(|pointer| !pointer.exact_quote.trim().is_empty())
                .or_else(|| rule.sources.first());
            card(rule, pointer)
        })
        .collect();
    Some(CitationSet { primary, supporting })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EvidenceRecord, RuleStatus, ValueType};

    fn fetched() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(1_740_000_000)
    }

    fn rule(id: &str, sources: Vec<SourcePointer>) -> RuleCandidate {
        RuleCandidate {
            id: id.to_string(),
            concept_slug: "pdv-stopa".to_string(),
            title: format!("Rule {id}"),
            law_reference: Some("Zakon o PDV-u, čl. 38".to_string()),
            authority: Authority::Law,
            status: RuleStatus::Published,
            effective_from: None,
            effective_until: None,
            confidence: 0.9,
            value: "25".to_string(),
            value_type: ValueType::Percentage,
            applicability: None,
            sources,
        }
    }

    fn pointer(quote: &str, url: &str, fetched_at: Option<OffsetDateTime>) -> SourcePointer {
        SourcePointer {
            exact_quote: quote.to_string(),
            evidence_id: "ev-1".to_string(),
            evidence: Some(EvidenceRecord {
                id: "ev-1".to_string(),
                url: url.to_string(),
                fetched_at,
                source: "narodne-novine".to_string(),
                title: None,
            }),
        }
    }

    #[test]
    fn empty_inputs_yield_none() {
        assert!(build_citations(&[]).is_none());
        assert!(build_citations(&[rule("a", vec![]), rule("b", vec![])]).is_none());
    }

    #[test]
    fn incomplete_primary_yields_none() {
        let missing_fetch = rule("a", vec![pointer("Stopa iznosi 25 %", "https://nn.hr/1", None)]);
        assert!(build_citations(&[missing_fetch]).is_none());
        let missing_quote = rule("a", vec![pointer(" ", "https://nn.hr/1", Some(fetched()))]);
        assert!(build_citations(&[missing_quote]).is_none());
        let missing_url = rule("a", vec![pointer("Stopa", "", Some(fetched()))]);
        assert!(build_citations(&[missing_url]).is_none());
    }

    #[test]
    fn primary_uses_first_complete_pointer_and_caps_supporting() {
        let primary = rule(
            "a",
            vec![
                pointer("", "https://nn.hr/0", Some(fetched())),
                pointer("Stopa iznosi 25 %", "https://nn.hr/1", Some(fetched())),
            ],
        );
        let mut rules = vec![primary, rule("no-sources", vec![])];
        for index in 0..5 {
            rules.push(rule(&format!("s{index}"), vec![pointer("q", "https://nn.hr/s", None)]));
        }
        let citations = match build_citations(&rules) {
            Some(citations) => citations,
            None => panic!("a complete primary citation should exist"),
        };
        assert_eq!(citations.primary.quote().as_str(), "Stopa iznosi 25 %");
        assert_eq!(citations.primary.url().as_str(), "https://nn.hr/1");
        assert_eq!(citations.supporting.len(), 3);
        assert_eq!(citations.supporting[0].id, "s0");
        assert_eq!(citations.len(), 4);
    }

    #[test]
    fn primary_cannot_deserialize_without_provenance() {
        let json = serde_json::json!({
            "id": "a",
            "title": "Rule a",
            "authority": "LAW",
            "lawReference": null,
            "quote": "",
            "url": "https://nn.hr/1",
            "effectiveFrom": null,
            "confidence": 0.9,
            "evidenceId": "ev-1",
            "fetchedAt": "2025-02-19T21:20:00Z"
        });
        assert!(serde_json::from_value::<PrimaryCitation>(json).is_err());
    }
}
