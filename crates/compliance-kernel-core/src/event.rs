//! Reasoning events and the terminal payload that closes every run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Date, OffsetDateTime};

use crate::citation::CitationSet;
use crate::coverage::ConditionalBranch;
use crate::dates::serde_date;
use crate::evidence::ConfidenceLevel;

pub const REASONING_SCHEMA_VERSION: &str = "reasoning.v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningStage {
    QuestionIntake,
    ContextResolution,
    Clarification,
    SourceDiscovery,
    Retrieval,
    Applicability,
    Conflicts,
    Analysis,
    Confidence,
    Answer,
    ConditionalAnswer,
    Refusal,
    Error,
}

impl ReasoningStage {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Answer | Self::ConditionalAnswer | Self::Refusal | Self::Error)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QuestionIntake => "question_intake",
            Self::ContextResolution => "context_resolution",
            Self::Clarification => "clarification",
            Self::SourceDiscovery => "source_discovery",
            Self::Retrieval => "retrieval",
            Self::Applicability => "applicability",
            Self::Conflicts => "conflicts",
            Self::Analysis => "analysis",
            Self::Confidence => "confidence",
            Self::Answer => "answer",
            Self::ConditionalAnswer => "conditional_answer",
            Self::Refusal => "refusal",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Started,
    Progress,
    Checkpoint,
    Complete,
    AwaitingInput,
}

impl StageStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Progress => "progress",
            Self::Checkpoint => "checkpoint",
            Self::Complete => "complete",
            Self::AwaitingInput => "awaiting_input",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningEvent {
    pub schema_version: String,
    pub id: String,
    pub request_id: String,
    pub sequence: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub stage: ReasoningStage,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ReasoningEvent {
    #[must_use]
    pub fn new(request_id: &str, sequence: u32, stage: ReasoningStage, status: StageStatus) -> Self {
        Self {
            schema_version: REASONING_SCHEMA_VERSION.to_string(),
            id: format!("{request_id}_{sequence:03}"),
            request_id: request_id.to_string(),
            sequence,
            timestamp: OffsetDateTime::now_utc(),
            stage,
            status,
            message: None,
            severity: Severity::Info,
            progress: None,
            data: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: f32) -> Self {
        self.progress = Some(progress.clamp(0.0, 1.0));
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Terminal payload carried by a terminal event.
    #[must_use]
    pub fn terminal_payload(&self) -> Option<TerminalPayload> {
        if !self.is_terminal() {
            return None;
        }
        self.data.clone().and_then(|data| serde_json::from_value(data).ok())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefusalReason {
    NoCitableRules,
    OutOfScope,
    MissingClientData,
    UnresolvedConflict,
    NeedsClarification,
    UnsupportedJurisdiction,
    UnsupportedDomain,
    MissingRequiredDimension,
}

impl RefusalReason {
    pub const ALL: [Self; 8] = [
        Self::NoCitableRules,
        Self::OutOfScope,
        Self::MissingClientData,
        Self::UnresolvedConflict,
        Self::NeedsClarification,
        Self::UnsupportedJurisdiction,
        Self::UnsupportedDomain,
        Self::MissingRequiredDimension,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoCitableRules => "NO_CITABLE_RULES",
            Self::OutOfScope => "OUT_OF_SCOPE",
            Self::MissingClientData => "MISSING_CLIENT_DATA",
            Self::UnresolvedConflict => "UNRESOLVED_CONFLICT",
            Self::NeedsClarification => "NEEDS_CLARIFICATION",
            Self::UnsupportedJurisdiction => "UNSUPPORTED_JURISDICTION",
            Self::UnsupportedDomain => "UNSUPPORTED_DOMAIN",
            Self::MissingRequiredDimension => "MISSING_REQUIRED_DIMENSION",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Internal,
    ValidationFailed,
    Capacity,
    Timeout,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "INTERNAL",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::Capacity => "CAPACITY",
            Self::Timeout => "TIMEOUT",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceSummary {
    pub score: f64,
    pub level: ConfidenceLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    #[serde(with = "serde_date")]
    pub as_of_date: Date,
    pub headline: String,
    pub direct_answer: String,
    pub key_details: Vec<String>,
    pub citations: CitationSet,
    pub confidence: ConfidenceSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalAnswerPayload {
    #[serde(with = "serde_date")]
    pub as_of_date: Date,
    pub headline: String,
    pub direct_answer: String,
    pub key_details: Vec<String>,
    pub citations: CitationSet,
    pub confidence: ConfidenceSummary,
    pub conflict_warnings: Vec<String>,
    pub caveats: Vec<String>,
    pub branches: Vec<ConditionalBranch>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefusalPayload {
    pub reason: RefusalReason,
    pub message: String,
    #[serde(default)]
    pub related_topics: Vec<String>,
    #[serde(default)]
    pub missing_fields: Vec<String>,
    #[serde(default)]
    pub suggested_clarifications: Vec<String>,
    #[serde(default)]
    pub requires_human_review: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    pub correlation_id: String,
    pub retriable: bool,
}

/// The single outcome of a run. An answer variant always carries a primary citation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalPayload {
    Answer(AnswerPayload),
    ConditionalAnswer(ConditionalAnswerPayload),
    Refusal(RefusalPayload),
    Error(ErrorPayload),
}

impl TerminalPayload {
    #[must_use]
    pub fn refusal(reason: RefusalReason, message: impl Into<String>) -> Self {
        Self::Refusal(RefusalPayload {
            reason,
            message: message.into(),
            related_topics: Vec::new(),
            missing_fields: Vec::new(),
            suggested_clarifications: Vec::new(),
            requires_human_review: false,
        })
    }

    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>, correlation_id: &str, retriable: bool) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
            correlation_id: correlation_id.to_string(),
            retriable,
        })
    }

    #[must_use]
    pub fn stage(&self) -> ReasoningStage {
        match self {
            Self::Answer(_) => ReasoningStage::Answer,
            Self::ConditionalAnswer(_) => ReasoningStage::ConditionalAnswer,
            Self::Refusal(_) => ReasoningStage::Refusal,
            Self::Error(_) => ReasoningStage::Error,
        }
    }

    #[must_use]
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Answer(_) => "ANSWER",
            Self::ConditionalAnswer(_) => "CONDITIONAL_ANSWER",
            Self::Refusal(_) => "REFUSAL",
            Self::Error(_) => "ERROR",
        }
    }

    #[must_use]
    pub fn citations(&self) -> Option<&CitationSet> {
        match self {
            Self::Answer(payload) => Some(&payload.citations),
            Self::ConditionalAnswer(payload) => Some(&payload.citations),
            Self::Refusal(_) | Self::Error(_) => None,
        }
    }

    #[must_use]
    pub fn refusal_reason(&self) -> Option<RefusalReason> {
        match self {
            Self::Refusal(payload) => Some(payload.reason),
            _ => None,
        }
    }
}
