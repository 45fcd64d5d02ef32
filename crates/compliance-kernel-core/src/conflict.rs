//! Cross-source disagreement detection and authority-based resolution.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::eligibility::EligibleRule;
use crate::model::{RuleCandidate, ValueType};
use crate::text::normalize;

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedValue {
    Number(f64),
    Text(String),
}

impl NormalizedValue {
    fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => (a - b).abs() < 1e-9,
            (Self::Text(a), Self::Text(b)) => a == b,
            _ => false,
        }
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    let mut cleaned = raw
        .to_lowercase()
        .replace(['%', '€', ' ', '\u{a0}'], "")
        .replace("eur", "")
        .replace("hrk", "")
        .replace("kn", "");
    if cleaned.contains(',') && cleaned.contains('.') {
        cleaned = cleaned.replace('.', "").replace(',', ".");
    } else if cleaned.contains(',') {
        cleaned = cleaned.replace(',', ".");
    }
    cleaned.parse::<f64>().ok().filter(|value| value.is_finite())
}

/// Normalize a rule value so equivalent spellings compare equal.
#[must_use]
pub fn normalize_value(rule: &RuleCandidate) -> NormalizedValue {
    let numeric = matches!(rule.value_type, ValueType::Percentage | ValueType::Currency | ValueType::Number);
    if numeric {
        if let Some(mut number) = parse_number(&rule.value) {
            if rule.value_type == ValueType::Percentage && number.abs() <= 1.0 && !rule.value.contains('%') {
                number *= 100.0;
            }
            return NormalizedValue::Number(number);
        }
    }
    NormalizedValue::Text(normalize(rule.value.trim()))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResult {
    pub has_conflict: bool,
    pub can_resolve: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub conflicting_rule_ids: Vec<String>,
    pub superseded_rule_ids: Vec<String>,
    pub warnings: Vec<String>,
}

fn describe(rules: &[&RuleCandidate]) -> String {
    let values = rules
        .iter()
        .map(|rule| format!("{} ({}): {}", rule.id, rule.authority.as_str(), rule.display_value()))
        .collect::<Vec<_>>();
    format!("sources disagree on {}: {}", rules[0].concept_slug, values.join("; "))
}

/// Detect material disagreement per concept. Equal normalized values never conflict; different
/// values conflict only when their validity windows overlap.
#[must_use]
pub fn detect_conflicts(rules: &[EligibleRule]) -> ConflictResult {
    let mut groups: BTreeMap<&str, Vec<&RuleCandidate>> = BTreeMap::new();
    for entry in rules {
        groups.entry(entry.rule.concept_slug.as_str()).or_default().push(&entry.rule);
    }

    let mut result = ConflictResult { can_resolve: true, ..ConflictResult::default() };
    let mut descriptions = Vec::new();

    for group in groups.values() {
        let values = group.iter().map(|rule| normalize_value(rule)).collect::<Vec<_>>();
        let mut disagreeing = BTreeSet::new();
        for (left, left_value) in values.iter().enumerate() {
            for (right, right_value) in values.iter().enumerate().skip(left + 1) {
                if !left_value.same_as(right_value) && group[left].window().overlaps(&group[right].window()) {
                    disagreeing.insert(left);
                    disagreeing.insert(right);
                }
            }
        }
        if disagreeing.is_empty() {
            continue;
        }

        result.has_conflict = true;
        let involved = disagreeing.iter().map(|index| group[*index]).collect::<Vec<_>>();
        result.conflicting_rule_ids.extend(involved.iter().map(|rule| rule.id.clone()));
        let description = describe(&involved);

        let best_rank = involved.iter().map(|rule| rule.authority.rank()).min().unwrap_or(u8::MAX);
        let best = disagreeing
            .iter()
            .copied()
            .filter(|index| group[*index].authority.rank() == best_rank)
            .collect::<Vec<_>>();

        if let [winner] = best.as_slice() {
            let winner_value = &values[*winner];
            let superseded = disagreeing
                .iter()
                .copied()
                .filter(|index| !values[*index].same_as(winner_value))
                .map(|index| group[index].id.clone())
                .collect::<Vec<_>>();
            result.warnings.push(format!(
                "{description}; resolved in favour of {} ({})",
                group[*winner].id,
                group[*winner].authority.as_str()
            ));
            result.superseded_rule_ids.extend(superseded);
        } else {
            result.can_resolve = false;
        }
        descriptions.push(description);
    }

    if result.has_conflict {
        result.description = Some(descriptions.join(" | "));
        tracing::debug!(
            conflicting = result.conflicting_rule_ids.len(),
            resolvable = result.can_resolve,
            "conflict detected"
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::EvidenceScore;
    use crate::model::{Authority, RuleStatus};
    use time::{Date, Month};

    fn date(year: i32, month: Month, day: u8) -> Date {
        match Date::from_calendar_date(year, month, day) {
            Ok(date) => date,
            Err(err) => panic!("invalid fixture date: {err}"),
        }
    }

    fn entry(id: &str, authority: Authority, value: &str, from: Option<Date>, until: Option<Date>) -> EligibleRule {
        EligibleRule {
            rule: RuleCandidate {
                id: id.to_string(),
                concept_slug: "pdv-stopa".to_string(),
                title: format!("rule {id}"),
                law_reference: None,
                authority,
                status: RuleStatus::Published,
                effective_from: from,
                effective_until: until,
                confidence: 0.9,
                value: value.to_string(),
                value_type: ValueType::Percentage,
                applicability: None,
                sources: vec![],
            },
            evidence: EvidenceScore {
                freshness: 1.0,
                source_count: 1.0,
                authority: 1.0,
                quote_quality: 1.0,
                temporal_margin: 1.0,
                total: 1.0,
            },
            ranking_score: 1.0,
            malformed_predicate: false,
        }
    }

    #[test]
    fn equivalent_spellings_do_not_conflict() {
        let rules = vec![
            entry("a", Authority::Law, "25", None, None),
            entry("b", Authority::Guidance, "25 %", None, None),
            entry("c", Authority::Practice, "0.25", None, None),
            entry("d", Authority::Practice, "25,0", None, None),
        ];
        assert!(!detect_conflicts(&rules).has_conflict);
    }

    #[test]
    fn disjoint_windows_do_not_conflict() {
        let split = date(2013, Month::January, 1);
        let rules = vec![
            entry("old", Authority::Law, "23", None, Some(split)),
            entry("new", Authority::Law, "25", Some(split), None),
        ];
        assert!(!detect_conflicts(&rules).has_conflict);
    }

    #[test]
    fn unique_best_authority_resolves() {
        let rules = vec![
            entry("law", Authority::Law, "25", None, None),
            entry("blog", Authority::Practice, "13", None, None),
        ];
        let result = detect_conflicts(&rules);
        assert!(result.has_conflict);
        assert!(result.can_resolve);
        assert_eq!(result.superseded_rule_ids, vec!["blog".to_string()]);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn tied_authority_is_unresolved() {
        let rules = vec![
            entry("a", Authority::Regulation, "25", None, None),
            entry("b", Authority::Regulation, "13", None, None),
            entry("c", Authority::Guidance, "25", None, None),
        ];
        let result = detect_conflicts(&rules);
        assert!(result.has_conflict);
        assert!(!result.can_resolve);
        assert!(result.description.is_some_and(|text| text.contains("pdv-stopa")));
    }

    #[test]
    fn practice_and_procedure_tie() {
        let mut procedure = entry("p", Authority::Procedure, "5", None, None);
        procedure.rule.value_type = ValueType::Number;
        let mut practice = entry("q", Authority::Practice, "6", None, None);
        practice.rule.value_type = ValueType::Number;
        let result = detect_conflicts(&[procedure, practice]);
        assert!(result.has_conflict && !result.can_resolve);
    }
}
