//! Fail-closed reasoning pipeline for regulatory-compliance questions.
//!
//! A question flows through interpretation, concept matching, rule retrieval,
//! eligibility, conflict detection, evidence scoring and decision coverage. Each
//! step emits one [`ReasoningEvent`]; every run ends in exactly one
//! [`TerminalPayload`]. An answer without a complete primary citation cannot be
//! constructed.

pub mod budget;
pub mod citation;
pub mod concepts;
pub mod config;
pub mod conflict;
pub mod coverage;
pub mod dates;
pub mod eligibility;
pub mod event;
pub mod evidence;
pub mod interpret;
pub mod metrics;
pub mod model;
pub mod phrasing;
pub mod pipeline;
pub mod predicate;
pub mod retrieval;
pub mod text;

pub use citation::{build_citations, CitationSet, NonEmptyText, PrimaryCitation, SourceCard};
pub use concepts::{
    match_concepts, ConceptMatch, EmbedError, MatchMethod, MatchMode, MatchOutcome, MatchSettings,
    QueryEmbedder,
};
pub use config::PipelineConfig;
pub use conflict::{detect_conflicts, ConflictResult};
pub use coverage::{
    calculate_decision_coverage, CoverageOutcome, DecisionCoverageResult, DimensionRegistry,
    DimensionSpec,
};
pub use eligibility::{
    check_temporal_eligibility, evaluate_eligibility, EligibilityOutcome, EligibilityReport,
    EligibleRule, ExclusionReason, MalformedPredicatePolicy,
};
pub use event::{
    AnswerPayload, ConditionalAnswerPayload, ConfidenceSummary, ErrorCode, ErrorPayload,
    ReasoningEvent, ReasoningStage, RefusalPayload, RefusalReason, Severity, StageStatus,
    TerminalPayload, REASONING_SCHEMA_VERSION,
};
pub use evidence::{evidence_quality, final_confidence, ConfidenceLevel};
pub use interpret::{
    interpret_query, Interpretation, InterpreterThresholds, Intent, Jurisdiction, RetrievalGate,
    Topic,
};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use model::{
    Authority, ClientContext, ConceptRecord, EffectiveWindow, EvidenceRecord, Query, RequestId,
    RuleCandidate, RuleRecord, RuleStatus, SourcePointer, SourcePointerRecord, Surface, ValueType,
};
pub use phrasing::{AnswerPhraser, PhrasedAnswer, PhrasingError, PhrasingRequest, TemplatePhraser};
pub use pipeline::{PipelineError, ReasoningPipeline, Step, MAX_QUERY_BYTES};
pub use predicate::{Applicability, Comparator, EvaluationContext, Predicate, PredicateError};
pub use retrieval::{
    retrieve_candidates, CorpusBundle, InMemoryRepository, RepositoryError, RuleRepository,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("query error: {0}")]
    Query(String),
}
