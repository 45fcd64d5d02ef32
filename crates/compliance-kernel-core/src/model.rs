use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use ulid::Ulid;

use crate::dates::serde_date;
use crate::predicate::Applicability;
use crate::KernelError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RequestId(pub Ulid);

impl RequestId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Authority {
    Law,
    Regulation,
    Guidance,
    Practice,
    Procedure,
}

impl Authority {
    /// Precedence rank, lower is stronger. Practice and procedure share a rank.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Law => 1,
            Self::Regulation => 2,
            Self::Guidance => 3,
            Self::Practice | Self::Procedure => 4,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Law => "LAW",
            Self::Regulation => "REGULATION",
            Self::Guidance => "GUIDANCE",
            Self::Practice => "PRACTICE",
            Self::Procedure => "PROCEDURE",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "LAW" => Some(Self::Law),
            "REGULATION" => Some(Self::Regulation),
            "GUIDANCE" => Some(Self::Guidance),
            "PRACTICE" => Some(Self::Practice),
            "PROCEDURE" => Some(Self::Procedure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Draft,
    Published,
    Deprecated,
}

impl RuleStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Deprecated => "deprecated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "published" => Some(Self::Published),
            "deprecated" => Some(Self::Deprecated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Percentage,
    Currency,
    Number,
    Text,
    Boolean,
    Date,
}

impl ValueType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Percentage => "percentage",
            Self::Currency => "currency",
            Self::Number => "number",
            Self::Text => "text",
            Self::Boolean => "boolean",
            Self::Date => "date",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "percentage" => Some(Self::Percentage),
            "currency" => Some(Self::Currency),
            "number" => Some(Self::Number),
            "text" => Some(Self::Text),
            "boolean" => Some(Self::Boolean),
            "date" => Some(Self::Date),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConceptRecord {
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EvidenceRecord {
    pub id: String,
    pub url: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub fetched_at: Option<OffsetDateTime>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SourcePointerRecord {
    pub exact_quote: String,
    pub evidence_id: String,
}

/// A rule row as stored by the repository, before evidence resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleRecord {
    pub id: String,
    pub concept_slug: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub law_reference: Option<String>,
    pub authority: Authority,
    pub status: RuleStatus,
    #[serde(default, with = "serde_date::option")]
    pub effective_from: Option<Date>,
    #[serde(default, with = "serde_date::option")]
    pub effective_until: Option<Date>,
    pub confidence: f32,
    pub value: String,
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applies_if: Option<serde_json::Value>,
    #[serde(default)]
    pub sources: Vec<SourcePointerRecord>,
}

impl RuleRecord {
    /// Validate one rule row against corpus invariants.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when identity, confidence, window, or source
    /// pointer constraints are violated.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.id.trim().is_empty() {
            return Err(KernelError::Validation("rule id MUST be provided".to_string()));
        }

        if self.concept_slug.trim().is_empty() {
            return Err(KernelError::Validation(format!(
                "rule {} MUST reference a concept slug",
                self.id
            )));
        }

        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(KernelError::Validation(format!(
                "rule {} confidence MUST be in [0.0, 1.0]",
                self.id
            )));
        }

        if let (Some(from), Some(until)) = (self.effective_from, self.effective_until) {
            if until <= from {
                return Err(KernelError::Validation(format!(
                    "rule {} effective_until MUST be after effective_from",
                    self.id
                )));
            }
        }

        for source in &self.sources {
            if source.evidence_id.trim().is_empty() {
                return Err(KernelError::Validation(format!(
                    "rule {} source pointers MUST reference evidence",
                    self.id
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SourcePointer {
    pub exact_quote: String,
    pub evidence_id: String,
    pub evidence: Option<EvidenceRecord>,
}

/// Half-open validity window `[from, until)` at day granularity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct EffectiveWindow {
    #[serde(with = "serde_date::option")]
    pub from: Option<Date>,
    #[serde(with = "serde_date::option")]
    pub until: Option<Date>,
}

impl EffectiveWindow {
    #[must_use]
    pub fn contains(&self, date: Date) -> bool {
        self.from.map_or(true, |from| from <= date) && self.until.map_or(true, |until| until > date)
    }

    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        let starts_before_other_ends = match (self.from, other.until) {
            (Some(from), Some(until)) => from < until,
            _ => true,
        };
        let other_starts_before_self_ends = match (other.from, self.until) {
            (Some(from), Some(until)) => from < until,
            _ => true,
        };
        starts_before_other_ends && other_starts_before_self_ends
    }
}

/// A rule fetched for one request, with evidence resolved. Never mutated after retrieval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleCandidate {
    pub id: String,
    pub concept_slug: String,
    pub title: String,
    pub law_reference: Option<String>,
    pub authority: Authority,
    pub status: RuleStatus,
    #[serde(with = "serde_date::option")]
    pub effective_from: Option<Date>,
    #[serde(with = "serde_date::option")]
    pub effective_until: Option<Date>,
    pub confidence: f32,
    pub value: String,
    pub value_type: ValueType,
    pub applicability: Option<Applicability>,
    pub sources: Vec<SourcePointer>,
}

impl RuleCandidate {
    #[must_use]
    pub fn from_record(record: RuleRecord, evidence: &BTreeMap<String, EvidenceRecord>) -> Self {
        let applicability = record.applies_if.as_ref().map(Applicability::from_json);
        let sources = record
            .sources
            .into_iter()
            .map(|pointer| SourcePointer {
                evidence: evidence.get(&pointer.evidence_id).cloned(),
                exact_quote: pointer.exact_quote,
                evidence_id: pointer.evidence_id,
            })
            .collect();

        Self {
            id: record.id,
            concept_slug: record.concept_slug,
            title: record.title,
            law_reference: record.law_reference,
            authority: record.authority,
            status: record.status,
            effective_from: record.effective_from,
            effective_until: record.effective_until,
            confidence: record.confidence,
            value: record.value,
            value_type: record.value_type,
            applicability,
            sources,
        }
    }

    #[must_use]
    pub fn window(&self) -> EffectiveWindow {
        EffectiveWindow { from: self.effective_from, until: self.effective_until }
    }

    /// Most recent fetch instant across resolved evidence.
    #[must_use]
    pub fn latest_fetch(&self) -> Option<OffsetDateTime> {
        self.sources
            .iter()
            .filter_map(|pointer| pointer.evidence.as_ref().and_then(|evidence| evidence.fetched_at))
            .max()
    }

    #[must_use]
    pub fn has_exact_quote(&self) -> bool {
        self.sources.iter().any(|pointer| !pointer.exact_quote.trim().is_empty())
    }

    /// Value as shown to users, verbatim apart from a percent sign for percentages.
    #[must_use]
    pub fn display_value(&self) -> String {
        let value = self.value.trim();
        if self.value_type == ValueType::Percentage && !value.ends_with('%') {
            format!("{value}%")
        } else {
            value.to_string()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Surface {
    Marketing,
    #[default]
    InApp,
}

/// Caller-supplied company and transaction data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClientContext {
    #[serde(default)]
    pub legal_form: Option<String>,
    #[serde(default)]
    pub vat_status: Option<String>,
    #[serde(default)]
    pub revenue_ytd: Option<f64>,
    #[serde(default)]
    pub employees: Option<u32>,
    #[serde(default)]
    pub jurisdiction: Option<String>,
    #[serde(default)]
    pub transaction: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Query {
    pub text: String,
    #[serde(default)]
    pub surface: Surface,
    #[serde(default)]
    pub company_id: Option<String>,
    #[serde(default)]
    pub client: Option<ClientContext>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub as_of: Option<OffsetDateTime>,
}

impl Query {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), surface: Surface::InApp, company_id: None, client: None, as_of: None }
    }

    #[must_use]
    pub fn with_client(mut self, client: ClientContext) -> Self {
        self.client = Some(client);
        self
    }

    #[must_use]
    pub fn with_surface(mut self, surface: Surface) -> Self {
        self.surface = surface;
        self
    }

    #[must_use]
    pub fn with_as_of(mut self, as_of: OffsetDateTime) -> Self {
        self.as_of = Some(as_of);
        self
    }
}
