//! Answer wording. External phrasers may restate a decided answer; the template never fails.

use serde::{Deserialize, Serialize};
use time::Date;

use crate::dates::format_date;
use crate::interpret::{default_clarifications, Topic};
use crate::model::RuleCandidate;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PhrasingError {
    #[error("phrasing request timed out")]
    Timeout,
    #[error("phrasing service unavailable: {0}")]
    Unavailable(String),
    #[error("phrased answer rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy)]
pub struct PhrasingRequest<'a> {
    pub question: &'a str,
    pub rules: &'a [RuleCandidate],
    pub as_of: Date,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PhrasedAnswer {
    pub headline: String,
    pub direct_answer: String,
    #[serde(default)]
    pub key_details: Vec<String>,
}

pub trait AnswerPhraser {
    /// # Errors
    /// Returns [`PhrasingError`] when no wording can be produced.
    fn phrase(&self, request: &PhrasingRequest<'_>) -> Result<PhrasedAnswer, PhrasingError>;

    /// # Errors
    /// Returns [`PhrasingError`] when no suggestions can be produced.
    fn suggest_clarifications(&self, question: &str, topic: Topic) -> Result<Vec<String>, PhrasingError>;
}

/// Deterministic wording built from the primary rule alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplatePhraser;

impl AnswerPhraser for TemplatePhraser {
    fn phrase(&self, request: &PhrasingRequest<'_>) -> Result<PhrasedAnswer, PhrasingError> {
        let rule = request
            .rules
            .first()
            .ok_or_else(|| PhrasingError::Rejected("no rule to phrase".to_string()))?;
        let value = rule.display_value();

        let mut direct_answer = format!("{}: {value}", rule.title);
        if let Some(reference) = rule.law_reference.as_deref() {
            direct_answer.push_str(&format!(" ({reference})"));
        }
        direct_answer.push_str(&format!(", stanje na dan {}.", format_date(request.as_of)));

        let mut key_details = Vec::new();
        if let Some(from) = rule.effective_from {
            key_details.push(format!("Primjenjuje se od {}.", format_date(from)));
        }
        if let Some(until) = rule.effective_until {
            key_details.push(format!("Vrijedi do {}.", format_date(until)));
        }
        key_details.push(format!("Razina izvora: {}.", rule.authority.as_str()));

        Ok(PhrasedAnswer { headline: format!("{}: {value}", rule.title), direct_answer, key_details })
    }

    fn suggest_clarifications(&self, _question: &str, topic: Topic) -> Result<Vec<String>, PhrasingError> {
        Ok(default_clarifications(topic))
    }
}

fn digits(text: &str) -> String {
    text.chars().filter(char::is_ascii_digit).collect()
}

/// A phrased answer must repeat the primary rule's value.
#[must_use]
pub fn restates_value(phrased: &PhrasedAnswer, rule: &RuleCandidate) -> bool {
    let value_digits = digits(&rule.value);
    if value_digits.is_empty() {
        let value = rule.value.trim().to_lowercase();
        return phrased.direct_answer.to_lowercase().contains(&value);
    }
    digits(&phrased.direct_answer).contains(&value_digits)
}

/// Phrase with `phraser`, falling back to the template on failure or when the wording drops the
/// value. The flag reports whether the fallback was used.
#[must_use]
pub fn phrase_or_template(phraser: Option<&dyn AnswerPhraser>, request: &PhrasingRequest<'_>) -> (Option<PhrasedAnswer>, bool) {
    let template = || TemplatePhraser.phrase(request).ok();
    let Some(phraser) = phraser else {
        return (template(), false);
    };
    let Some(primary) = request.rules.first() else {
        return (None, false);
    };
    match phraser.phrase(request) {
        Ok(phrased) if restates_value(&phrased, primary) => (Some(phrased), false),
        Ok(_) => {
            tracing::warn!(rule_id = %primary.id, "phrased answer dropped the rule value; using template");
            (template(), true)
        }
        Err(err) => {
            tracing::warn!(error = %err, "phrasing failed; using template");
            (template(), true)
        }
    }
}

/// Clarification suggestions from `phraser`, or the fixed list for the topic.
#[must_use]
pub fn clarifications_or_default(phraser: Option<&dyn AnswerPhraser>, question: &str, topic: Topic) -> (Vec<String>, bool) {
    let Some(phraser) = phraser else {
        return (default_clarifications(topic), false);
    };
    match phraser.suggest_clarifications(question, topic) {
        Ok(suggestions) if !suggestions.is_empty() => (suggestions, false),
        Ok(_) => (default_clarifications(topic), true),
        Err(err) => {
            tracing::warn!(error = %err, "clarification suggestions failed; using defaults");
            (default_clarifications(topic), true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Authority, RuleStatus, ValueType};
    use time::Month;

    struct Inventive;

    impl AnswerPhraser for Inventive {
        fn phrase(&self, _request: &PhrasingRequest<'_>) -> Result<PhrasedAnswer, PhrasingError> {
            Ok(PhrasedAnswer {
                headline: "PDV".to_string(),
                direct_answer: "Stopa je 13 %.".to_string(),
                key_details: vec![],
            })
        }

        fn suggest_clarifications(&self, _question: &str, _topic: Topic) -> Result<Vec<String>, PhrasingError> {
            Err(PhrasingError::Timeout)
        }
    }

    fn as_of() -> Date {
        match Date::from_calendar_date(2025, Month::March, 1) {
            Ok(date) => date,
            Err(err) => panic!("invalid fixture date: {err}"),
        }
    }

    fn rule() -> RuleCandidate {
        RuleCandidate {
            id: "r1".to_string(),
            concept_slug: "pdv-stopa".to_string(),
            title: "Opća stopa PDV-a".to_string(),
            law_reference: Some("Zakon o PDV-u, čl. 38".to_string()),
            authority: Authority::Law,
            status: RuleStatus::Published,
            effective_from: Date::from_calendar_date(2013, Month::March, 1).ok(),
            effective_until: None,
            confidence: 0.95,
            value: "25".to_string(),
            value_type: ValueType::Percentage,
            applicability: None,
            sources: vec![],
        }
    }

    #[test]
    fn template_restates_value_and_reference() {
        let rules = vec![rule()];
        let request = PhrasingRequest { question: "Koja je stopa PDV-a?", rules: &rules, as_of: as_of() };
        let (phrased, fallback) = phrase_or_template(None, &request);
        let phrased = phrased.unwrap_or_else(|| panic!("template should phrase"));
        assert!(!fallback);
        assert_eq!(phrased.headline, "Opća stopa PDV-a: 25%");
        assert!(phrased.direct_answer.contains("Zakon o PDV-u, čl. 38"));
        assert!(phrased.key_details[0].contains("2013-03-01"));
    }

    #[test]
    fn wording_that_changes_the_value_falls_back() {
        let rules = vec![rule()];
        let request = PhrasingRequest { question: "Koja je stopa PDV-a?", rules: &rules, as_of: as_of() };
        let (phrased, fallback) = phrase_or_template(Some(&Inventive), &request);
        assert!(fallback);
        assert_eq!(phrased.map(|answer| answer.headline), Some("Opća stopa PDV-a: 25%".to_string()));
    }

    #[test]
    fn clarification_failure_uses_topic_defaults() {
        let (suggestions, fallback) = clarifications_or_default(Some(&Inventive), "porez", Topic::Regulatory);
        assert!(fallback);
        assert_eq!(suggestions, default_clarifications(Topic::Regulatory));
    }
}
