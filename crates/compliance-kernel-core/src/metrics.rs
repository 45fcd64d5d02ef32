//! Append-only counters shared across pipeline runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::event::{RefusalReason, TerminalPayload};

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    requests: AtomicU64,
    answers: AtomicU64,
    conditional_answers: AtomicU64,
    refusals: AtomicU64,
    errors: AtomicU64,
    refusal_reasons: [AtomicU64; 8],
    semantic_fallbacks: AtomicU64,
    phrasing_fallbacks: AtomicU64,
    malformed_predicates: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub answers: u64,
    pub conditional_answers: u64,
    pub refusals: u64,
    pub errors: u64,
    pub refusal_reasons: BTreeMap<String, u64>,
    pub semantic_fallbacks: u64,
    pub phrasing_fallbacks: u64,
    pub malformed_predicates: u64,
}

fn reason_index(reason: RefusalReason) -> usize {
    RefusalReason::ALL.iter().position(|candidate| *candidate == reason).unwrap_or(0)
}

impl PipelineMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, payload: &TerminalPayload) {
        let counter = match payload {
            TerminalPayload::Answer(_) => &self.answers,
            TerminalPayload::ConditionalAnswer(_) => &self.conditional_answers,
            TerminalPayload::Refusal(refusal) => {
                self.refusal_reasons[reason_index(refusal.reason)].fetch_add(1, Ordering::Relaxed);
                &self.refusals
            }
            TerminalPayload::Error(_) => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_semantic_fallback(&self) {
        self.semantic_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_phrasing_fallback(&self) {
        self.phrasing_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_predicate(&self) {
        self.malformed_predicates.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let refusal_reasons = RefusalReason::ALL
            .iter()
            .zip(self.refusal_reasons.iter())
            .map(|(reason, counter)| (reason.as_str().to_string(), counter.load(Ordering::Relaxed)))
            .filter(|(_, count)| *count > 0)
            .collect();
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            answers: self.answers.load(Ordering::Relaxed),
            conditional_answers: self.conditional_answers.load(Ordering::Relaxed),
            refusals: self.refusals.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            refusal_reasons,
            semantic_fallbacks: self.semantic_fallbacks.load(Ordering::Relaxed),
            phrasing_fallbacks: self.phrasing_fallbacks.load(Ordering::Relaxed),
            malformed_predicates: self.malformed_predicates.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ErrorCode;

    #[test]
    fn counts_outcomes_and_reasons() {
        let metrics = PipelineMetrics::new();
        metrics.record_request();
        metrics.record_outcome(&TerminalPayload::refusal(RefusalReason::OutOfScope, "nope"));
        metrics.record_outcome(&TerminalPayload::refusal(RefusalReason::OutOfScope, "nope"));
        metrics.record_outcome(&TerminalPayload::error(ErrorCode::Internal, "boom", "req", false));
        metrics.record_semantic_fallback();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 1);
        assert_eq!(snapshot.refusals, 2);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.refusal_reasons.get("OUT_OF_SCOPE"), Some(&2));
        assert_eq!(snapshot.refusal_reasons.len(), 1);
        assert_eq!(snapshot.semantic_fallbacks, 1);
    }
}
