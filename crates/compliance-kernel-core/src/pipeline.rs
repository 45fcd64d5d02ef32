//! The reasoning state machine.
//!
//! A [`ReasoningPipeline`] is pulled one [`ReasoningEvent`] at a time. Each pull runs exactly
//! one [`Step`]; nothing happens between pulls, so dropping a pipeline mid-run is safe. The
//! first event is always `question_intake/started` and the last is always the single terminal
//! event. A failing or panicking step is converted into an ERROR terminal.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::json;
use time::{Date, OffsetDateTime};

use crate::budget::enforce_budgets;
use crate::citation::{build_citations, CitationSet};
use crate::concepts::{match_concepts, ConceptMatch, QueryEmbedder};
use crate::config::PipelineConfig;
use crate::conflict::detect_conflicts;
use crate::coverage::{calculate_decision_coverage, CoverageOutcome, DecisionCoverageResult, DimensionRegistry};
use crate::eligibility::{evaluate_eligibility, EligibleRule, ExclusionReason};
use crate::event::{
    AnswerPayload, ConditionalAnswerPayload, ConfidenceSummary, ErrorCode, ReasoningEvent, ReasoningStage,
    RefusalPayload, RefusalReason, Severity, StageStatus, TerminalPayload,
};
use crate::evidence::{final_confidence, ConfidenceLevel};
use crate::interpret::{interpret_query, Interpretation, RetrievalGate};
use crate::metrics::PipelineMetrics;
use crate::model::{Query, RequestId, RuleCandidate, Surface};
use crate::phrasing::{clarifications_or_default, phrase_or_template, AnswerPhraser, PhrasingRequest};
use crate::predicate::EvaluationContext;
use crate::retrieval::{retrieve_candidates, RepositoryError, RuleRepository};

pub const MAX_QUERY_BYTES: usize = 10_000;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Error code and retriable flag reported in the ERROR terminal.
    ///
    /// A store that stays locked past its busy wait reports CAPACITY; TIMEOUT is
    /// reserved for the repository's own query deadline.
    #[must_use]
    pub fn classify(&self) -> (ErrorCode, bool) {
        match self {
            Self::Repository(RepositoryError::Timeout(_)) => (ErrorCode::Timeout, true),
            Self::Repository(RepositoryError::Busy(_)) => (ErrorCode::Capacity, true),
            Self::Repository(err) => (ErrorCode::Internal, err.retriable()),
            Self::Validation(_) => (ErrorCode::ValidationFailed, false),
            Self::Internal(_) => (ErrorCode::Internal, true),
        }
    }
}

/// Position of the state machine. Each variant emits exactly one event when run.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    IntakeStarted,
    Interpret,
    ContextStarted,
    ResolveContext,
    Clarify,
    DiscoveryStarted,
    Discover,
    RetrievalStarted,
    Retrieve,
    ApplicabilityStarted,
    Applicability,
    ConflictsStarted,
    Conflicts,
    AnalysisStarted,
    Analyze,
    ConfidenceStarted,
    Confidence,
    Terminal(Box<TerminalPayload>),
    Finished,
}

#[derive(Debug, Default)]
struct RunState {
    interpretation: Option<Interpretation>,
    context: Option<EvaluationContext>,
    concepts: Vec<ConceptMatch>,
    candidates: Vec<RuleCandidate>,
    eligible: Vec<EligibleRule>,
    conflict_warnings: Vec<String>,
    malformed_rules: Vec<String>,
    citations: Option<CitationSet>,
    coverage: Option<DecisionCoverageResult>,
}

pub struct ReasoningPipeline<'a> {
    request_id: String,
    query: Query,
    as_of: Date,
    config: PipelineConfig,
    registry: DimensionRegistry,
    repository: &'a dyn RuleRepository,
    embedder: Option<&'a dyn QueryEmbedder>,
    phraser: Option<&'a dyn AnswerPhraser>,
    metrics: Option<&'a PipelineMetrics>,
    sequence: u32,
    step: Step,
    state: RunState,
    terminal: Option<TerminalPayload>,
}

fn missing<T>(what: &str) -> Result<T, PipelineError> {
    Err(PipelineError::Internal(format!("{what} missing before use")))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "step panicked".to_string()
    }
}

impl<'a> ReasoningPipeline<'a> {
    #[must_use]
    pub fn new(query: Query, repository: &'a dyn RuleRepository, config: PipelineConfig) -> Self {
        let as_of = query.as_of.unwrap_or_else(OffsetDateTime::now_utc).date();
        let registry = config.registry();
        Self {
            request_id: RequestId::new().to_string(),
            query,
            as_of,
            config,
            registry,
            repository,
            embedder: None,
            phraser: None,
            metrics: None,
            sequence: 0,
            step: Step::IntakeStarted,
            state: RunState::default(),
            terminal: None,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    #[must_use]
    pub fn with_embedder(mut self, embedder: &'a dyn QueryEmbedder) -> Self {
        self.embedder = Some(embedder);
        self
    }

    #[must_use]
    pub fn with_phraser(mut self, phraser: &'a dyn AnswerPhraser) -> Self {
        self.phraser = Some(phraser);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: &'a PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    #[must_use]
    pub fn as_of(&self) -> Date {
        self.as_of
    }

    #[must_use]
    pub fn current_step(&self) -> &Step {
        &self.step
    }

    /// The terminal payload, once the terminal event has been emitted.
    #[must_use]
    pub fn terminal(&self) -> Option<&TerminalPayload> {
        self.terminal.as_ref()
    }

    /// Run the next step. Returns `None` once the terminal event has been emitted.
    pub fn next_event(&mut self) -> Option<ReasoningEvent> {
        if self.step == Step::Finished {
            return None;
        }
        if self.sequence == 0 {
            if let Some(metrics) = self.metrics {
                metrics.record_request();
            }
        }

        let step = std::mem::replace(&mut self.step, Step::Finished);
        let outcome = catch_unwind(AssertUnwindSafe(|| self.run_step(step)));
        let (event, next) = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                tracing::error!(request_id = %self.request_id, error = %err, "pipeline step failed");
                let (code, retriable) = err.classify();
                self.terminal_event(TerminalPayload::error(code, err.to_string(), &self.request_id, retriable))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(request_id = %self.request_id, panic = %message, "pipeline step panicked");
                self.terminal_event(TerminalPayload::error(
                    ErrorCode::Internal,
                    "internal error while reasoning",
                    &self.request_id,
                    true,
                ))
            }
        };
        self.step = next;
        self.sequence += 1;
        Some(event)
    }

    /// Drain the pipeline, returning every event and the terminal payload.
    #[must_use]
    pub fn run_to_completion(mut self) -> (Vec<ReasoningEvent>, TerminalPayload) {
        let mut events = Vec::new();
        while let Some(event) = self.next_event() {
            events.push(event);
        }
        let terminal = self.terminal.take().unwrap_or_else(|| {
            TerminalPayload::error(ErrorCode::Internal, "run ended without outcome", &self.request_id, false)
        });
        (events, terminal)
    }

    fn event(&self, stage: ReasoningStage, status: StageStatus) -> ReasoningEvent {
        ReasoningEvent::new(&self.request_id, self.sequence, stage, status)
    }

    fn started(&self, stage: ReasoningStage, message: &str, next: Step) -> (ReasoningEvent, Step) {
        (self.event(stage, StageStatus::Started).with_message(message), next)
    }

    fn terminal_event(&mut self, payload: TerminalPayload) -> (ReasoningEvent, Step) {
        let payload = enforce_budgets(payload);
        let data = serde_json::to_value(&payload).unwrap_or_else(|err| {
            json!({ "outcome": "ERROR", "code": "INTERNAL", "message": err.to_string(),
                    "correlationId": self.request_id, "retriable": false })
        });
        let severity = match &payload {
            TerminalPayload::Error(_) => Severity::Critical,
            TerminalPayload::Refusal(_) | TerminalPayload::ConditionalAnswer(_) => Severity::Warning,
            TerminalPayload::Answer(_) => Severity::Info,
        };
        let event = self
            .event(payload.stage(), StageStatus::Complete)
            .with_severity(severity)
            .with_progress(1.0)
            .with_data(data);
        if let Some(metrics) = self.metrics {
            metrics.record_outcome(&payload);
        }
        tracing::debug!(request_id = %self.request_id, outcome = payload.outcome(), "run finished");
        self.terminal = Some(payload);
        (event, Step::Finished)
    }

    fn refuse(&self, reason: RefusalReason, message: &str) -> Step {
        let mut payload = RefusalPayload {
            reason,
            message: message.to_string(),
            related_topics: self.state.concepts.iter().map(|concept| concept.slug.clone()).collect(),
            missing_fields: Vec::new(),
            suggested_clarifications: Vec::new(),
            requires_human_review: false,
        };
        if reason == RefusalReason::UnresolvedConflict {
            payload.requires_human_review = true;
        }
        Step::Terminal(Box::new(TerminalPayload::Refusal(payload)))
    }

    fn refuse_with(&self, reason: RefusalReason, message: &str, edit: impl FnOnce(&mut RefusalPayload)) -> Step {
        let mut step = self.refuse(reason, message);
        if let Step::Terminal(payload) = &mut step {
            if let TerminalPayload::Refusal(refusal) = payload.as_mut() {
                edit(refusal);
            }
        }
        step
    }

    fn run_step(&mut self, step: Step) -> Result<(ReasoningEvent, Step), PipelineError> {
        match step {
            Step::IntakeStarted => {
                Ok(self.started(ReasoningStage::QuestionIntake, "Analiziram pitanje", Step::Interpret))
            }
            Step::Interpret => self.interpret(),
            Step::ContextStarted => {
                Ok(self.started(ReasoningStage::ContextResolution, "Utvrđujem kontekst", Step::ResolveContext))
            }
            Step::ResolveContext => self.resolve_context(),
            Step::Clarify => self.clarify(),
            Step::DiscoveryStarted => {
                Ok(self.started(ReasoningStage::SourceDiscovery, "Tražim relevantne pojmove", Step::Discover))
            }
            Step::Discover => self.discover(),
            Step::RetrievalStarted => {
                Ok(self.started(ReasoningStage::Retrieval, "Dohvaćam pravila", Step::Retrieve))
            }
            Step::Retrieve => self.retrieve(),
            Step::ApplicabilityStarted => Ok(self.started(
                ReasoningStage::Applicability,
                "Provjeravam primjenjivost pravila",
                Step::Applicability,
            )),
            Step::Applicability => self.applicability(),
            Step::ConflictsStarted => {
                Ok(self.started(ReasoningStage::Conflicts, "Provjeravam proturječja izvora", Step::Conflicts))
            }
            Step::Conflicts => self.conflicts(),
            Step::AnalysisStarted => {
                Ok(self.started(ReasoningStage::Analysis, "Analiziram izvore", Step::Analyze))
            }
            Step::Analyze => self.analyze(),
            Step::ConfidenceStarted => {
                Ok(self.started(ReasoningStage::Confidence, "Procjenjujem pouzdanost", Step::Confidence))
            }
            Step::Confidence => self.confidence(),
            Step::Terminal(payload) => Ok(self.terminal_event(*payload)),
            Step::Finished => missing("runnable step"),
        }
    }

    fn interpret(&mut self) -> Result<(ReasoningEvent, Step), PipelineError> {
        self.config.validate().map_err(|err| PipelineError::Validation(err.to_string()))?;
        let text = self.query.text.trim();
        if text.is_empty() {
            return Err(PipelineError::Validation("query text MUST be non-empty".to_string()));
        }
        if self.query.text.len() > MAX_QUERY_BYTES {
            return Err(PipelineError::Validation(format!(
                "query text MUST be at most {MAX_QUERY_BYTES} bytes"
            )));
        }

        let interpretation = interpret_query(text, &self.config.interpreter);
        let data = serde_json::to_value(&interpretation).map_err(|err| PipelineError::Internal(err.to_string()))?;
        let event = self
            .event(ReasoningStage::QuestionIntake, StageStatus::Complete)
            .with_progress(0.1)
            .with_data(data);

        let next = match interpretation.gate {
            RetrievalGate::Nonsense => {
                let (suggestions, fallback) =
                    clarifications_or_default(self.phraser, text, interpretation.topic);
                self.record_phrasing_fallback(fallback);
                self.refuse_with(
                    RefusalReason::NeedsClarification,
                    "Pitanje nije razumljivo. Molimo preformulirajte ga.",
                    |refusal| refusal.suggested_clarifications = suggestions,
                )
            }
            RetrievalGate::UnsupportedJurisdiction => {
                let country = interpretation.foreign_jurisdiction.clone().unwrap_or_default();
                self.refuse_with(
                    RefusalReason::UnsupportedJurisdiction,
                    "Odgovaramo samo na pitanja o hrvatskim propisima.",
                    |refusal| refusal.related_topics = vec![country],
                )
            }
            RetrievalGate::OutOfScope => self.refuse(
                RefusalReason::OutOfScope,
                "Pitanje nije regulatorno pa na njega ne odgovaramo s citatima.",
            ),
            RetrievalGate::Clarify | RetrievalGate::Proceed | RetrievalGate::ProceedStrict => Step::ContextStarted,
        };
        self.state.interpretation = Some(interpretation);
        Ok((event, next))
    }

    fn resolve_context(&mut self) -> Result<(ReasoningEvent, Step), PipelineError> {
        let Some(interpretation) = self.state.interpretation.as_ref() else {
            return missing("interpretation");
        };
        let client = match self.query.surface {
            Surface::Marketing => None,
            Surface::InApp => self.query.client.as_ref(),
        };
        let context = EvaluationContext::from_client(client, self.as_of);
        let next = if interpretation.gate == RetrievalGate::Clarify {
            Step::Clarify
        } else {
            Step::DiscoveryStarted
        };
        let event = self
            .event(ReasoningStage::ContextResolution, StageStatus::Complete)
            .with_progress(0.2)
            .with_data(json!({
                "surface": self.query.surface,
                "personalized": client.is_some(),
                "needsPersonalization": interpretation.needs_personalization,
                "context": context.as_value(),
            }));
        self.state.context = Some(context);
        Ok((event, next))
    }

    fn clarify(&mut self) -> Result<(ReasoningEvent, Step), PipelineError> {
        let Some(interpretation) = self.state.interpretation.as_ref() else {
            return missing("interpretation");
        };
        let (suggestions, fallback) =
            clarifications_or_default(self.phraser, self.query.text.trim(), interpretation.topic);
        let event = self
            .event(ReasoningStage::Clarification, StageStatus::AwaitingInput)
            .with_message("Pitanje je preopćenito za pouzdan odgovor.")
            .with_severity(Severity::Warning)
            .with_data(json!({
                "confidence": interpretation.confidence,
                "suggestions": suggestions,
            }));
        self.record_phrasing_fallback(fallback);
        let next = self.refuse_with(
            RefusalReason::NeedsClarification,
            "Molimo precizirajte pitanje.",
            |refusal| refusal.suggested_clarifications = suggestions,
        );
        Ok((event, next))
    }

    fn discover(&mut self) -> Result<(ReasoningEvent, Step), PipelineError> {
        let concepts = self.repository.find_concepts()?;
        let outcome = match_concepts(self.query.text.trim(), &concepts, &self.config.matching, self.embedder);
        if outcome.semantic_fallback {
            if let Some(metrics) = self.metrics {
                metrics.record_semantic_fallback();
            }
        }
        let event = self
            .event(ReasoningStage::SourceDiscovery, StageStatus::Complete)
            .with_progress(0.35)
            .with_data(json!({
                "matches": outcome.matches,
                "mode": self.config.matching.mode,
                "semanticFallback": outcome.semantic_fallback,
            }));
        self.state.concepts = outcome.matches;
        let next = if self.state.concepts.is_empty() {
            self.refuse(RefusalReason::UnsupportedDomain, "Za ovo pitanje nemamo pokrivene propise.")
        } else {
            Step::RetrievalStarted
        };
        Ok((event, next))
    }

    fn retrieve(&mut self) -> Result<(ReasoningEvent, Step), PipelineError> {
        let slugs = self.state.concepts.iter().map(|concept| concept.slug.clone()).collect::<Vec<_>>();
        let candidates = retrieve_candidates(self.repository, &slugs)?;
        let event = self
            .event(ReasoningStage::Retrieval, StageStatus::Complete)
            .with_progress(0.5)
            .with_data(json!({
                "conceptSlugs": slugs,
                "ruleIds": candidates.iter().map(|rule| rule.id.as_str()).collect::<Vec<_>>(),
            }));
        let next = if candidates.is_empty() {
            self.refuse(RefusalReason::NoCitableRules, "Nismo pronašli objavljena pravila s izvorom.")
        } else {
            Step::ApplicabilityStarted
        };
        self.state.candidates = candidates;
        Ok((event, next))
    }

    fn applicability(&mut self) -> Result<(ReasoningEvent, Step), PipelineError> {
        let Some(context) = self.state.context.as_ref() else {
            return missing("evaluation context");
        };
        let candidates = std::mem::take(&mut self.state.candidates);
        let report = evaluate_eligibility(candidates, context, self.as_of, self.config.malformed_predicates);

        let malformed = report
            .eligible
            .iter()
            .filter(|entry| entry.malformed_predicate)
            .map(|entry| entry.rule.id.clone())
            .collect::<Vec<_>>();
        if let Some(metrics) = self.metrics {
            for _ in &malformed {
                metrics.record_malformed_predicate();
            }
        }

        let mut event = self
            .event(ReasoningStage::Applicability, StageStatus::Complete)
            .with_progress(0.6)
            .with_data(json!({
                "eligibleRuleIds": report.eligible.iter().map(|entry| entry.rule.id.as_str()).collect::<Vec<_>>(),
                "excluded": report.excluded,
                "malformedPredicateRuleIds": malformed,
            }));
        if !malformed.is_empty() {
            event = event
                .with_severity(Severity::Warning)
                .with_message("Uvjet primjene nekih pravila nije moguće provjeriti.");
        }

        let next = if report.eligible.is_empty() {
            if report.count(ExclusionReason::MissingContext) > 0 {
                let fields = report.missing_fields();
                self.refuse_with(
                    RefusalReason::MissingClientData,
                    "Za odgovor su potrebni dodatni podaci o vašem poslovanju.",
                    |refusal| refusal.missing_fields = fields,
                )
            } else {
                self.refuse(RefusalReason::NoCitableRules, "Nijedno pravilo se ne primjenjuje na ovaj slučaj.")
            }
        } else {
            Step::ConflictsStarted
        };
        self.state.eligible = report.eligible;
        self.state.malformed_rules = malformed;
        Ok((event, next))
    }

    fn conflicts(&mut self) -> Result<(ReasoningEvent, Step), PipelineError> {
        let result = detect_conflicts(&self.state.eligible);
        let data = serde_json::to_value(&result).map_err(|err| PipelineError::Internal(err.to_string()))?;
        let mut event = self
            .event(ReasoningStage::Conflicts, StageStatus::Complete)
            .with_progress(0.7)
            .with_data(data);
        if result.has_conflict {
            event = event.with_severity(Severity::Warning);
        }

        let next = if result.has_conflict && !result.can_resolve {
            let description = result.description.clone().unwrap_or_default();
            let conflicting = result.conflicting_rule_ids.clone();
            self.refuse_with(
                RefusalReason::UnresolvedConflict,
                "Izvori si proturječe; pitanje je proslijeđeno na stručnu provjeru.",
                |refusal| {
                    refusal.related_topics.extend(conflicting);
                    if !description.is_empty() {
                        refusal.message = format!("{} {description}", refusal.message);
                    }
                },
            )
        } else {
            self.state
                .eligible
                .retain(|entry| !result.superseded_rule_ids.contains(&entry.rule.id));
            self.state.conflict_warnings = result.warnings;
            Step::AnalysisStarted
        };
        Ok((event, next))
    }

    fn analyze(&mut self) -> Result<(ReasoningEvent, Step), PipelineError> {
        let rules = self.state.eligible.iter().map(|entry| entry.rule.clone()).collect::<Vec<_>>();
        let citations = build_citations(&rules);
        let Some(primary_rule) = rules.iter().find(|rule| !rule.sources.is_empty()) else {
            let event = self
                .event(ReasoningStage::Analysis, StageStatus::Complete)
                .with_data(json!({ "citable": false }));
            return Ok((event, self.refuse(RefusalReason::NoCitableRules, "Pravila nemaju provjerljiv izvor.")));
        };

        let topic = primary_rule.concept_slug.clone();
        let coverage = if self.registry.contains(&topic) {
            let Some(context) = self.state.context.as_ref() else {
                return missing("evaluation context");
            };
            Some(calculate_decision_coverage(&topic, self.query.text.trim(), context, self.as_of, &self.registry))
        } else {
            None
        };

        let event = self
            .event(ReasoningStage::Analysis, StageStatus::Complete)
            .with_progress(0.85)
            .with_data(json!({
                "citable": citations.is_some(),
                "primaryRuleId": citations.as_ref().map(|set| set.primary.id().to_string()),
                "citationCount": citations.as_ref().map_or(0, CitationSet::len),
                "coverage": coverage,
            }));

        let next = if citations.is_none() {
            self.refuse(RefusalReason::NoCitableRules, "Nedostaje potpun citat izvora za odgovor.")
        } else if let Some(coverage) = coverage.as_ref().filter(|result| result.outcome == CoverageOutcome::Refusal) {
            let fields = coverage
                .unresolved
                .iter()
                .filter(|dimension| dimension.required)
                .map(|dimension| dimension.name.clone())
                .collect::<Vec<_>>();
            self.refuse_with(
                RefusalReason::MissingRequiredDimension,
                "Za odgovor nedostaju ključni podaci.",
                |refusal| refusal.missing_fields = fields,
            )
        } else {
            Step::ConfidenceStarted
        };
        self.state.citations = citations;
        self.state.coverage = coverage;
        Ok((event, next))
    }

    fn confidence(&mut self) -> Result<(ReasoningEvent, Step), PipelineError> {
        let Some(interpretation) = self.state.interpretation.as_ref() else {
            return missing("interpretation");
        };
        let qualities = self.state.eligible.iter().map(|entry| entry.evidence.total).collect::<Vec<_>>();
        let score = final_confidence(interpretation.confidence, &qualities);
        let level = ConfidenceLevel::from_score(score);
        let event = self
            .event(ReasoningStage::Confidence, StageStatus::Complete)
            .with_progress(0.95)
            .with_data(json!({
                "score": score,
                "level": level,
                "interpretationConfidence": interpretation.confidence,
                "evidenceQuality": qualities,
            }));
        let payload = self.compose(ConfidenceSummary { score, level })?;
        Ok((event, Step::Terminal(Box::new(payload))))
    }

    fn compose(&mut self, confidence: ConfidenceSummary) -> Result<TerminalPayload, PipelineError> {
        let Some(citations) = self.state.citations.take() else {
            return missing("citations");
        };
        let rules = self.state.eligible.iter().map(|entry| entry.rule.clone()).collect::<Vec<_>>();
        let request = PhrasingRequest { question: self.query.text.trim(), rules: &rules, as_of: self.as_of };
        let (phrased, fallback) = phrase_or_template(self.phraser, &request);
        self.record_phrasing_fallback(fallback);
        let Some(phrased) = phrased else {
            return Err(PipelineError::Internal("no wording for a cited answer".to_string()));
        };

        let mut caveats = Vec::new();
        if confidence.level == ConfidenceLevel::Low {
            caveats.push("Pouzdanost odgovora je niska; provjerite navedeni izvor.".to_string());
        }
        if !self.state.malformed_rules.is_empty() {
            caveats.push(format!(
                "Uvjet primjene nije provjeren za pravila: {}.",
                self.state.malformed_rules.join(", ")
            ));
        }
        let branches = self
            .state
            .coverage
            .as_ref()
            .filter(|coverage| coverage.outcome == CoverageOutcome::ConditionalAnswer)
            .map(|coverage| coverage.branches.clone())
            .unwrap_or_default();
        if let Some(coverage) = self.state.coverage.as_ref() {
            if coverage.outcome == CoverageOutcome::ConditionalAnswer {
                let open = coverage
                    .unresolved
                    .iter()
                    .map(|dimension| dimension.name.as_str())
                    .collect::<Vec<_>>();
                caveats.push(format!("Odgovor ovisi o podacima koji nisu navedeni: {}.", open.join(", ")));
            }
        }
        let conflict_warnings = std::mem::take(&mut self.state.conflict_warnings);

        if caveats.is_empty() && conflict_warnings.is_empty() && branches.is_empty() {
            return Ok(TerminalPayload::Answer(AnswerPayload {
                as_of_date: self.as_of,
                headline: phrased.headline,
                direct_answer: phrased.direct_answer,
                key_details: phrased.key_details,
                citations,
                confidence,
            }));
        }
        Ok(TerminalPayload::ConditionalAnswer(ConditionalAnswerPayload {
            as_of_date: self.as_of,
            headline: phrased.headline,
            direct_answer: phrased.direct_answer,
            key_details: phrased.key_details,
            citations,
            confidence,
            conflict_warnings,
            caveats,
            branches,
        }))
    }

    fn record_phrasing_fallback(&self, fallback: bool) {
        if fallback {
            if let Some(metrics) = self.metrics {
                metrics.record_phrasing_fallback();
            }
        }
    }
}

impl Iterator for ReasoningPipeline<'_> {
    type Item = ReasoningEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event()
    }
}
