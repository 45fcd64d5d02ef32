//! Temporal and conditional eligibility of candidate rules.

use serde::{Deserialize, Serialize};
use time::Date;

use crate::evidence::{evidence_score, EvidenceScore};
use crate::model::RuleCandidate;
use crate::predicate::{Applicability, EvaluationContext};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExclusionReason {
    Expired,
    Future,
    ConditionFalse,
    MissingContext,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EligibilityOutcome {
    Eligible,
    Ineligible {
        reason: ExclusionReason,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        missing_fields: Vec<String>,
    },
}

impl EligibilityOutcome {
    fn ineligible(reason: ExclusionReason) -> Self {
        Self::Ineligible { reason, missing_fields: Vec::new() }
    }

    #[must_use]
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Eligible)
    }
}

/// What to do with a rule whose applicability document could not be parsed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPredicatePolicy {
    #[default]
    FailOpen,
    FailClosed,
}

/// Day-granularity validity: FUTURE when `from > as_of`, EXPIRED when `until <= as_of`.
#[must_use]
pub fn check_temporal_eligibility(
    effective_from: Option<Date>,
    effective_until: Option<Date>,
    as_of: Date,
) -> EligibilityOutcome {
    if effective_from.is_some_and(|from| from > as_of) {
        return EligibilityOutcome::ineligible(ExclusionReason::Future);
    }
    if effective_until.is_some_and(|until| until <= as_of) {
        return EligibilityOutcome::ineligible(ExclusionReason::Expired);
    }
    EligibilityOutcome::Eligible
}

/// Applicability check. Returns the outcome and whether a malformed predicate was let through.
#[must_use]
pub fn check_conditional_eligibility(
    rule: &RuleCandidate,
    context: &EvaluationContext,
    policy: MalformedPredicatePolicy,
) -> (EligibilityOutcome, bool) {
    match &rule.applicability {
        None => (EligibilityOutcome::Eligible, false),
        Some(Applicability::Malformed { error, .. }) => match policy {
            MalformedPredicatePolicy::FailOpen => {
                tracing::warn!(rule_id = %rule.id, error = %error, "malformed applicability predicate; rule kept");
                (EligibilityOutcome::Eligible, true)
            }
            MalformedPredicatePolicy::FailClosed => {
                tracing::warn!(rule_id = %rule.id, error = %error, "malformed applicability predicate; rule excluded");
                (EligibilityOutcome::ineligible(ExclusionReason::ConditionFalse), false)
            }
        },
        Some(Applicability::Parsed { predicate }) => {
            let missing_fields = context.missing_fields(predicate);
            if !missing_fields.is_empty() {
                return (
                    EligibilityOutcome::Ineligible { reason: ExclusionReason::MissingContext, missing_fields },
                    false,
                );
            }
            if predicate.evaluate(context, &rule.window()) {
                (EligibilityOutcome::Eligible, false)
            } else {
                (EligibilityOutcome::ineligible(ExclusionReason::ConditionFalse), false)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EligibleRule {
    pub rule: RuleCandidate,
    pub evidence: EvidenceScore,
    pub ranking_score: f64,
    pub malformed_predicate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Exclusion {
    pub rule_id: String,
    pub reason: ExclusionReason,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityReport {
    pub eligible: Vec<EligibleRule>,
    pub excluded: Vec<Exclusion>,
}

impl EligibilityReport {
    /// Union of missing fields across MISSING_CONTEXT exclusions, sorted and deduplicated.
    #[must_use]
    pub fn missing_fields(&self) -> Vec<String> {
        let mut fields = self
            .excluded
            .iter()
            .filter(|exclusion| exclusion.reason == ExclusionReason::MissingContext)
            .flat_map(|exclusion| exclusion.missing_fields.iter().cloned())
            .collect::<Vec<_>>();
        fields.sort();
        fields.dedup();
        fields
    }

    #[must_use]
    pub fn count(&self, reason: ExclusionReason) -> usize {
        self.excluded.iter().filter(|exclusion| exclusion.reason == reason).count()
    }
}

/// Gate every candidate, then order survivors by authority rank, blended score desc, id.
#[must_use]
pub fn evaluate_eligibility(
    candidates: Vec<RuleCandidate>,
    context: &EvaluationContext,
    as_of: Date,
    policy: MalformedPredicatePolicy,
) -> EligibilityReport {
    let mut report = EligibilityReport::default();

    for rule in candidates {
        let temporal = check_temporal_eligibility(rule.effective_from, rule.effective_until, as_of);
        let (outcome, malformed_predicate) = if temporal.is_eligible() {
            check_conditional_eligibility(&rule, context, policy)
        } else {
            (temporal, false)
        };

        match outcome {
            EligibilityOutcome::Eligible => {
                let evidence = evidence_score(&rule, as_of);
                let ranking_score = 0.3 * f64::from(rule.confidence) + 0.7 * evidence.total;
                report.eligible.push(EligibleRule { rule, evidence, ranking_score, malformed_predicate });
            }
            EligibilityOutcome::Ineligible { reason, missing_fields } => {
                tracing::debug!(rule_id = %rule.id, ?reason, "rule excluded");
                report.excluded.push(Exclusion { rule_id: rule.id, reason, missing_fields });
            }
        }
    }

    report.eligible.sort_by(|left, right| {
        left.rule
            .authority
            .rank()
            .cmp(&right.rule.authority.rank())
            .then_with(|| right.ranking_score.total_cmp(&left.ranking_score))
            .then_with(|| left.rule.id.cmp(&right.rule.id))
    });
    report
}
