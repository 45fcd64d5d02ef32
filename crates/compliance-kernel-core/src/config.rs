use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::concepts::MatchSettings;
use crate::coverage::{DimensionRegistry, DimensionSpec};
use crate::eligibility::MalformedPredicatePolicy;
use crate::interpret::InterpreterThresholds;
use crate::KernelError;

/// Tunables for one pipeline. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub interpreter: InterpreterThresholds,
    pub matching: MatchSettings,
    pub malformed_predicates: MalformedPredicatePolicy,
    /// Dimension schemas added to, or replacing, the built-in topics.
    pub extra_dimensions: BTreeMap<String, Vec<DimensionSpec>>,
}

impl PipelineConfig {
    /// # Errors
    /// Returns [`KernelError::Validation`] when thresholds or weights are out of range.
    pub fn validate(&self) -> Result<(), KernelError> {
        let thresholds = &self.interpreter;
        for (name, value) in [
            ("interpreter.nonsense_ratio", thresholds.nonsense_ratio),
            ("interpreter.clarify_below", thresholds.clarify_below),
            ("interpreter.strict_below", thresholds.strict_below),
            ("matching.min_score", self.matching.min_score),
            ("matching.keyword_weight", self.matching.keyword_weight),
            ("matching.semantic_weight", self.matching.semantic_weight),
            ("matching.semantic_floor", self.matching.semantic_floor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(KernelError::Validation(format!("{name} MUST be in [0.0, 1.0]")));
            }
        }
        if thresholds.clarify_below > thresholds.strict_below {
            return Err(KernelError::Validation(
                "interpreter.clarify_below MUST NOT exceed interpreter.strict_below".to_string(),
            ));
        }
        if self.matching.top_k == 0 {
            return Err(KernelError::Validation("matching.top_k MUST be at least 1".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn registry(&self) -> DimensionRegistry {
        let mut registry = DimensionRegistry::default();
        for (topic, dimensions) in &self.extra_dimensions {
            registry.register(topic.clone(), dimensions.clone());
        }
        registry
    }
}
