//! Decision coverage: which dimensions of a topic are known, and what that allows.

use std::collections::BTreeMap;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::Date;

use crate::dates::format_date;
use crate::predicate::EvaluationContext;
use crate::text::normalize;

pub const QUERY_SOURCE_CONFIDENCE: f64 = 0.9;
pub const PROFILE_SOURCE_CONFIDENCE: f64 = 0.95;
pub const DEFAULT_SOURCE_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Requirement {
    Required,
    Optional,
    RequiredIf { depends_on: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DimensionDefault {
    Today,
    CurrentYear,
    Value(String),
}

/// Maps a pattern match in the normalized query to a value. An empty value takes capture group 1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueryPattern {
    pub pattern: String,
    #[serde(default)]
    pub value: String,
}

impl QueryPattern {
    fn new(pattern: &str, value: &str) -> Self {
        Self { pattern: pattern.to_string(), value: value.to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DimensionSpec {
    pub name: String,
    pub requirement: Requirement,
    #[serde(default)]
    pub possible_values: Vec<String>,
    #[serde(default)]
    pub query_patterns: Vec<QueryPattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DimensionDefault>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DimensionSource {
    Query,
    Profile,
    Default,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedDimension {
    pub name: String,
    pub value: String,
    pub source: DimensionSource,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnresolvedDimension {
    pub name: String,
    pub required: bool,
    pub possible_values: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConditionalBranch {
    pub dimension: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoverageOutcome {
    Answer,
    ConditionalAnswer,
    Refusal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecisionCoverageResult {
    pub topic: String,
    pub required_score: f64,
    pub total_score: f64,
    pub resolved: Vec<ResolvedDimension>,
    pub unresolved: Vec<UnresolvedDimension>,
    pub outcome: CoverageOutcome,
    pub branches: Vec<ConditionalBranch>,
}

/// Dimension schemas per topic, keyed by concept slug.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DimensionRegistry {
    topics: BTreeMap<String, Vec<DimensionSpec>>,
}

impl DimensionRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self { topics: BTreeMap::new() }
    }

    pub fn register(&mut self, topic: impl Into<String>, dimensions: Vec<DimensionSpec>) {
        self.topics.insert(topic.into(), dimensions);
    }

    #[must_use]
    pub fn get(&self, topic: &str) -> Option<&[DimensionSpec]> {
        self.topics.get(topic).map(Vec::as_slice)
    }

    #[must_use]
    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn extend(&mut self, other: Self) {
        self.topics.extend(other.topics);
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

impl Default for DimensionRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(
            "pdv-stopa",
            vec![
                DimensionSpec {
                    name: "jurisdiction".to_string(),
                    requirement: Requirement::Required,
                    possible_values: strings(&["HR"]),
                    query_patterns: vec![QueryPattern::new(r"hrvatsk|croatia", "HR")],
                    profile_field: Some("entity.jurisdiction".to_string()),
                    default: Some(DimensionDefault::Value("HR".to_string())),
                },
                DimensionSpec {
                    name: "tax_year".to_string(),
                    requirement: Requirement::Required,
                    possible_values: Vec::new(),
                    query_patterns: vec![QueryPattern::new(r"\b(20\d\d)\b", "")],
                    profile_field: None,
                    default: Some(DimensionDefault::CurrentYear),
                },
                DimensionSpec {
                    name: "item_category".to_string(),
                    requirement: Requirement::Optional,
                    possible_values: strings(&["standard", "food", "books", "medicine", "accommodation", "newspapers"]),
                    query_patterns: vec![
                        QueryPattern::new(r"hran|namirnic|\bfood", "food"),
                        QueryPattern::new(r"knjig|\bbook", "books"),
                        QueryPattern::new(r"lijek|medic", "medicine"),
                        QueryPattern::new(r"smjestaj|hotel|accommodation", "accommodation"),
                        QueryPattern::new(r"novin|newspaper", "newspapers"),
                        QueryPattern::new(r"\bopc\w*|standard", "standard"),
                    ],
                    profile_field: Some("txn.itemCategory".to_string()),
                    default: None,
                },
                DimensionSpec {
                    name: "buyer_type".to_string(),
                    requirement: Requirement::Optional,
                    possible_values: strings(&["business", "consumer"]),
                    query_patterns: vec![
                        QueryPattern::new(r"tvrtk|poduzec|\bb2b\b|business", "business"),
                        QueryPattern::new(r"potrosac|gradan|\bb2c\b|consumer", "consumer"),
                    ],
                    profile_field: Some("txn.buyerType".to_string()),
                    default: None,
                },
                DimensionSpec {
                    name: "buyer_vat_id".to_string(),
                    requirement: Requirement::RequiredIf {
                        depends_on: "buyer_type".to_string(),
                        value: "business".to_string(),
                    },
                    possible_values: Vec::new(),
                    query_patterns: vec![QueryPattern::new(r"\b([a-z]{2}\d{8,12})\b", "")],
                    profile_field: Some("txn.buyerVatId".to_string()),
                    default: None,
                },
            ],
        );
        registry.register(
            "pausalni-obrt-prag",
            vec![DimensionSpec {
                name: "entity_type".to_string(),
                requirement: Requirement::Required,
                possible_values: strings(&[
                    "sole_trader",
                    "lump_sum_sole_trader",
                    "limited_company",
                    "simple_limited_company",
                ]),
                query_patterns: vec![
                    QueryPattern::new(r"pausal", "lump_sum_sole_trader"),
                    QueryPattern::new(r"j\.?d\.?o\.?o", "simple_limited_company"),
                    QueryPattern::new(r"\bd\.?o\.?o\b", "limited_company"),
                    QueryPattern::new(r"\bobrt", "sole_trader"),
                ],
                profile_field: Some("entity.type".to_string()),
                default: None,
            }],
        );
        registry
    }
}

fn from_query(spec: &DimensionSpec, normalized_query: &str) -> Option<String> {
    for pattern in &spec.query_patterns {
        let regex = match Regex::new(&pattern.pattern) {
            Ok(regex) => regex,
            Err(err) => {
                tracing::warn!(dimension = %spec.name, pattern = %pattern.pattern, error = %err, "dimension pattern skipped");
                continue;
            }
        };
        let Some(captures) = regex.captures(normalized_query) else {
            continue;
        };
        if !pattern.value.is_empty() {
            return Some(pattern.value.clone());
        }
        if let Some(group) = captures.get(1).or_else(|| captures.get(0)) {
            return Some(group.as_str().to_string());
        }
    }
    None
}

fn from_profile(spec: &DimensionSpec, profile: &EvaluationContext) -> Option<String> {
    let field = spec.profile_field.as_deref()?;
    match profile.lookup(field)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn from_default(spec: &DimensionSpec, as_of: Date) -> Option<String> {
    match spec.default.as_ref()? {
        DimensionDefault::Today => Some(format_date(as_of)),
        DimensionDefault::CurrentYear => Some(as_of.year().to_string()),
        DimensionDefault::Value(value) => Some(value.clone()),
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(resolved: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        resolved as f64 / total as f64
    }
}

/// Resolve a topic's dimensions from the query, then the client profile, then defaults.
#[must_use]
pub fn calculate_decision_coverage(
    topic: &str,
    query_text: &str,
    profile: &EvaluationContext,
    as_of: Date,
    registry: &DimensionRegistry,
) -> DecisionCoverageResult {
    let Some(dimensions) = registry.get(topic) else {
        return DecisionCoverageResult {
            topic: topic.to_string(),
            required_score: 0.0,
            total_score: 0.0,
            resolved: Vec::new(),
            unresolved: Vec::new(),
            outcome: CoverageOutcome::Refusal,
            branches: Vec::new(),
        };
    };

    let normalized_query = normalize(query_text);
    let mut values: BTreeMap<&str, ResolvedDimension> = BTreeMap::new();
    for spec in dimensions {
        let resolved = from_query(spec, &normalized_query)
            .map(|value| (value, DimensionSource::Query, QUERY_SOURCE_CONFIDENCE))
            .or_else(|| {
                from_profile(spec, profile).map(|value| (value, DimensionSource::Profile, PROFILE_SOURCE_CONFIDENCE))
            })
            .or_else(|| {
                from_default(spec, as_of).map(|value| (value, DimensionSource::Default, DEFAULT_SOURCE_CONFIDENCE))
            });
        if let Some((value, source, confidence)) = resolved {
            values.insert(spec.name.as_str(), ResolvedDimension { name: spec.name.clone(), value, source, confidence });
        }
    }

    let mut resolved = Vec::new();
    let mut unresolved = Vec::new();
    let (mut required_total, mut required_resolved) = (0_usize, 0_usize);
    let (mut applicable, mut applicable_resolved) = (0_usize, 0_usize);

    for spec in dimensions {
        let required = match &spec.requirement {
            Requirement::Required => true,
            Requirement::Optional => false,
            Requirement::RequiredIf { depends_on, value } => {
                let met = values
                    .get(depends_on.as_str())
                    .is_some_and(|dependency| dependency.value.eq_ignore_ascii_case(value));
                if !met {
                    continue;
                }
                true
            }
        };

        applicable += 1;
        if required {
            required_total += 1;
        }
        match values.get(spec.name.as_str()).cloned() {
            Some(dimension) => {
                applicable_resolved += 1;
                if required {
                    required_resolved += 1;
                }
                resolved.push(dimension);
            }
            None => unresolved.push(UnresolvedDimension {
                name: spec.name.clone(),
                required,
                possible_values: spec.possible_values.clone(),
            }),
        }
    }

    let required_score = ratio(required_resolved, required_total);
    let total_score = ratio(applicable_resolved, applicable);
    let (outcome, branches) = if required_score < 1.0 {
        (CoverageOutcome::Refusal, Vec::new())
    } else if total_score < 1.0 {
        let branches = unresolved
            .iter()
            .filter(|dimension| !dimension.required)
            .flat_map(|dimension| {
                dimension.possible_values.iter().map(|value| ConditionalBranch {
                    dimension: dimension.name.clone(),
                    value: value.clone(),
                })
            })
            .collect();
        (CoverageOutcome::ConditionalAnswer, branches)
    } else {
        (CoverageOutcome::Answer, Vec::new())
    };

    DecisionCoverageResult {
        topic: topic.to_string(),
        required_score,
        total_score,
        resolved,
        unresolved,
        outcome,
        branches,
    }
}
