//! Reproducible evidence quality and the combined answer confidence.

use serde::{Deserialize, Serialize};
use time::Date;

use crate::dates::days_between;
use crate::model::{Authority, RuleCandidate};

pub const FRESHNESS_WEIGHT: f64 = 0.25;
pub const SOURCE_COUNT_WEIGHT: f64 = 0.20;
pub const AUTHORITY_WEIGHT: f64 = 0.30;
pub const QUOTE_WEIGHT: f64 = 0.15;
pub const TEMPORAL_MARGIN_WEIGHT: f64 = 0.10;

pub const INTERPRETATION_SHARE: f64 = 0.3;
pub const EVIDENCE_SHARE: f64 = 0.7;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl ConfidenceLevel {
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            Self::High
        } else if score >= 0.6 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceScore {
    pub freshness: f64,
    pub source_count: f64,
    pub authority: f64,
    pub quote_quality: f64,
    pub temporal_margin: f64,
    pub total: f64,
}

#[must_use]
pub fn freshness_factor(days_since_fetch: Option<i64>) -> f64 {
    match days_since_fetch {
        None => 0.3,
        Some(days) if days <= 30 => 1.0,
        Some(days) if days <= 90 => 0.95,
        Some(days) if days <= 180 => 0.9,
        Some(days) if days <= 365 => 0.8,
        Some(days) if days <= 730 => 0.7,
        Some(_) => 0.5,
    }
}

#[must_use]
pub fn source_count_factor(count: usize) -> f64 {
    match count {
        0 => 0.0,
        1 => 0.6,
        2 => 0.8,
        3 => 0.95,
        _ => 1.0,
    }
}

#[must_use]
pub fn authority_factor(authority: Authority) -> f64 {
    match authority {
        Authority::Law => 1.0,
        Authority::Regulation => 0.9,
        Authority::Guidance => 0.75,
        Authority::Practice => 0.6,
        Authority::Procedure => 0.5,
    }
}

#[must_use]
pub fn temporal_margin_factor(days_until_expiry: Option<i64>) -> f64 {
    match days_until_expiry {
        None => 1.0,
        Some(days) if days >= 365 => 1.0,
        Some(days) if days >= 180 => 0.95,
        Some(days) if days >= 90 => 0.9,
        Some(days) if days >= 30 => 0.8,
        Some(days) if days >= 7 => 0.7,
        Some(days) if days >= 0 => 0.5,
        Some(_) => 0.0,
    }
}

/// Weighted quality of a rule's evidence as of `as_of`.
#[must_use]
pub fn evidence_score(rule: &RuleCandidate, as_of: Date) -> EvidenceScore {
    let days_since_fetch =
        rule.latest_fetch().map(|fetched| days_between(fetched.date(), as_of).max(0));
    let days_until_expiry = rule.effective_until.map(|until| days_between(as_of, until));

    let freshness = freshness_factor(days_since_fetch);
    let source_count = source_count_factor(rule.sources.len());
    let authority = authority_factor(rule.authority);
    let quote_quality = if rule.has_exact_quote() { 1.0 } else { 0.7 };
    let temporal_margin = temporal_margin_factor(days_until_expiry);

    let total = freshness * FRESHNESS_WEIGHT
        + source_count * SOURCE_COUNT_WEIGHT
        + authority * AUTHORITY_WEIGHT
        + quote_quality * QUOTE_WEIGHT
        + temporal_margin * TEMPORAL_MARGIN_WEIGHT;

    EvidenceScore { freshness, source_count, authority, quote_quality, temporal_margin, total }
}

#[must_use]
pub fn evidence_quality(rule: &RuleCandidate, as_of: Date) -> f64 {
    evidence_score(rule, as_of).total
}

/// `0.3 * interpretation + 0.7 * max(evidence quality)`; no rules means no evidence share.
#[must_use]
pub fn final_confidence(interpretation: f64, qualities: &[f64]) -> f64 {
    let best = qualities.iter().copied().fold(0.0_f64, f64::max);
    (INTERPRETATION_SHARE * interpretation + EVIDENCE_SHARE * best).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EvidenceRecord, RuleStatus, SourcePointer, ValueType};
    use time::{Duration, Month, OffsetDateTime, Time};

    fn date(year: i32, month: Month, day: u8) -> Date {
        match Date::from_calendar_date(year, month, day) {
            Ok(date) => date,
            Err(err) => panic!("invalid fixture date: {err}"),
        }
    }

    fn pointer(index: usize, fetched_at: Option<OffsetDateTime>, quote: &str) -> SourcePointer {
        SourcePointer {
            exact_quote: quote.to_string(),
            evidence_id: format!("ev-{index}"),
            evidence: Some(EvidenceRecord {
                id: format!("ev-{index}"),
                url: format!("https://example.hr/{index}"),
                fetched_at,
                source: "narodne-novine".to_string(),
                title: None,
            }),
        }
    }

    fn candidate(authority: Authority, sources: Vec<SourcePointer>, until: Option<Date>) -> RuleCandidate {
        RuleCandidate {
            id: "r1".to_string(),
            concept_slug: "pdv-stopa".to_string(),
            title: "Opća stopa PDV-a".to_string(),
            law_reference: Some("Zakon o PDV-u, čl. 38".to_string()),
            authority,
            status: RuleStatus::Published,
            effective_from: None,
            effective_until: until,
            confidence: 0.9,
            value: "25".to_string(),
            value_type: ValueType::Percentage,
            applicability: None,
            sources,
        }
    }

    #[test]
    fn strongest_evidence_scores_one() {
        let as_of = date(2025, Month::March, 11);
        let fetched = date(2025, Month::March, 1).with_time(Time::MIDNIGHT).assume_utc();
        let sources = (0..4).map(|index| pointer(index, Some(fetched), "Stopa iznosi 25 %")).collect();
        let score = evidence_score(&candidate(Authority::Law, sources, None), as_of);
        assert!((score.total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_fetch_and_missing_quote_lower_quality() {
        let as_of = date(2025, Month::March, 11);
        let rule = candidate(Authority::Guidance, vec![pointer(0, None, "  ")], None);
        let score = evidence_score(&rule, as_of);
        assert!((score.freshness - 0.3).abs() < f64::EPSILON);
        assert!((score.quote_quality - 0.7).abs() < f64::EPSILON);
        let expected = 0.3 * 0.25 + 0.6 * 0.20 + 0.75 * 0.30 + 0.7 * 0.15 + 1.0 * 0.10;
        assert!((score.total - expected).abs() < 1e-9);
    }

    #[test]
    fn temporal_margin_steps() {
        assert!((temporal_margin_factor(Some(10)) - 0.7).abs() < f64::EPSILON);
        assert!((temporal_margin_factor(Some(0)) - 0.5).abs() < f64::EPSILON);
        assert!((temporal_margin_factor(Some(-1)) - 0.0).abs() < f64::EPSILON);
        let as_of = date(2025, Month::March, 11);
        let rule = candidate(Authority::Law, vec![pointer(0, None, "q")], Some(as_of + Duration::days(200)));
        assert!((evidence_score(&rule, as_of).temporal_margin - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn combined_confidence_levels() {
        assert_eq!(ConfidenceLevel::from_score(final_confidence(0.95, &[0.5, 1.0])), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_score(final_confidence(0.6, &[0.7])), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_score(final_confidence(0.6, &[])), ConfidenceLevel::Low);
    }
}
