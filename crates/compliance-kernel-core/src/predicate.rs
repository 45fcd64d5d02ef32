//! Applicability predicates: a small JSON AST evaluated against a frozen context.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use time::Date;

use crate::dates::{format_date, parse_date};
use crate::model::{ClientContext, EffectiveWindow};
use crate::text::normalize;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PredicateError {
    #[error("predicate shape is invalid: {0}")]
    InvalidShape(String),
    #[error("predicate pattern `{pattern}` does not compile: {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("predicate field path is empty")]
    EmptyField,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
}

fn default_date_field() -> String {
    "date".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    True,
    False,
    Cmp { field: String, cmp: Comparator, value: Value },
    In { field: String, values: Vec<Value> },
    Exists { field: String },
    Between { field: String, min: Value, max: Value },
    Matches { field: String, pattern: String },
    And { args: Vec<Predicate> },
    Or { args: Vec<Predicate> },
    Not { arg: Box<Predicate> },
    DateInEffect {
        #[serde(rename = "dateField", default = "default_date_field")]
        date_field: String,
    },
}

impl Predicate {
    /// Parse and check a predicate document.
    ///
    /// # Errors
    /// Returns [`PredicateError`] when the JSON does not match the AST, a field path is
    /// empty, or a `matches` pattern does not compile.
    pub fn parse(raw: &Value) -> Result<Self, PredicateError> {
        let predicate = serde_json::from_value::<Self>(raw.clone())
            .map_err(|err| PredicateError::InvalidShape(err.to_string()))?;
        predicate.check()?;
        Ok(predicate)
    }

    fn check(&self) -> Result<(), PredicateError> {
        match self {
            Self::True | Self::False => Ok(()),
            Self::Cmp { field, .. }
            | Self::In { field, .. }
            | Self::Exists { field }
            | Self::Between { field, .. }
            | Self::DateInEffect { date_field: field } => check_field(field),
            Self::Matches { field, pattern } => {
                check_field(field)?;
                Regex::new(pattern).map(|_| ()).map_err(|err| PredicateError::InvalidPattern {
                    pattern: pattern.clone(),
                    message: err.to_string(),
                })
            }
            Self::And { args } | Self::Or { args } => args.iter().try_for_each(Self::check),
            Self::Not { arg } => arg.check(),
        }
    }

    /// Field paths whose absence prevents evaluation. Paths only tested by `exists` are excluded.
    #[must_use]
    pub fn required_fields(&self) -> BTreeSet<String> {
        let mut fields = BTreeSet::new();
        self.collect_required(&mut fields);
        fields
    }

    fn collect_required(&self, fields: &mut BTreeSet<String>) {
        match self {
            Self::True | Self::False | Self::Exists { .. } => {}
            Self::Cmp { field, .. }
            | Self::In { field, .. }
            | Self::Between { field, .. }
            | Self::Matches { field, .. }
            | Self::DateInEffect { date_field: field } => {
                fields.insert(field.clone());
            }
            Self::And { args } | Self::Or { args } => {
                for arg in args {
                    arg.collect_required(fields);
                }
            }
            Self::Not { arg } => arg.collect_required(fields),
        }
    }

    /// Evaluate against the context. Missing fields make leaf comparisons false.
    #[must_use]
    pub fn evaluate(&self, context: &EvaluationContext, window: &EffectiveWindow) -> bool {
        match self {
            Self::True => true,
            Self::False => false,
            Self::Cmp { field, cmp, value } => {
                context.lookup(field).is_some_and(|actual| compare(actual, *cmp, value))
            }
            Self::In { field, values } => context
                .lookup(field)
                .is_some_and(|actual| values.iter().any(|candidate| values_equal(actual, candidate))),
            Self::Exists { field } => context.lookup(field).is_some(),
            Self::Between { field, min, max } => context.lookup(field).is_some_and(|actual| {
                matches!(order(actual, min), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(order(actual, max), Some(Ordering::Less | Ordering::Equal))
            }),
            Self::Matches { field, pattern } => context.lookup(field).is_some_and(|actual| {
                let Ok(regex) = Regex::new(pattern) else {
                    return false;
                };
                match actual {
                    Value::String(text) => regex.is_match(text),
                    other => regex.is_match(&other.to_string()),
                }
            }),
            Self::And { args } => args.iter().all(|arg| arg.evaluate(context, window)),
            Self::Or { args } => args.iter().any(|arg| arg.evaluate(context, window)),
            Self::Not { arg } => !arg.evaluate(context, window),
            Self::DateInEffect { date_field } => context
                .lookup(date_field)
                .and_then(Value::as_str)
                .and_then(parse_date)
                .is_some_and(|date| window.contains(date)),
        }
    }
}

fn check_field(field: &str) -> Result<(), PredicateError> {
    if field.trim().is_empty() || field.split('.').any(str::is_empty) {
        return Err(PredicateError::EmptyField);
    }
    Ok(())
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_number(left), as_number(right)) {
            (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
            _ => false,
        },
        _ => left == right,
    }
}

fn order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => as_number(left)?.partial_cmp(&as_number(right)?),
    }
}

fn compare(actual: &Value, comparator: Comparator, expected: &Value) -> bool {
    match comparator {
        Comparator::Eq => values_equal(actual, expected),
        Comparator::Neq => !values_equal(actual, expected),
        Comparator::Gt => order(actual, expected) == Some(Ordering::Greater),
        Comparator::Lt => order(actual, expected) == Some(Ordering::Less),
        Comparator::Gte => matches!(order(actual, expected), Some(Ordering::Greater | Ordering::Equal)),
        Comparator::Lte => matches!(order(actual, expected), Some(Ordering::Less | Ordering::Equal)),
    }
}

/// A rule's applicability condition: either a checked predicate or the raw document that failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Applicability {
    Parsed { predicate: Predicate },
    Malformed { raw: Value, error: String },
}

impl Applicability {
    #[must_use]
    pub fn from_json(raw: &Value) -> Self {
        match Predicate::parse(raw) {
            Ok(predicate) => Self::Parsed { predicate },
            Err(err) => Self::Malformed { raw: raw.clone(), error: err.to_string() },
        }
    }
}

/// Caller data mapped to the predicate vocabulary. Built once per request and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationContext {
    root: Value,
}

impl EvaluationContext {
    /// Context carrying only the evaluation date.
    #[must_use]
    pub fn for_date(as_of: Date) -> Self {
        Self::from_client(None, as_of)
    }

    #[must_use]
    pub fn from_client(client: Option<&ClientContext>, as_of: Date) -> Self {
        let mut entity = Map::new();
        let mut counters = Map::new();
        let mut txn = Map::new();

        if let Some(client) = client {
            if let Some(kind) = client.legal_form.as_deref().and_then(entity_type) {
                entity.insert("type".to_string(), json!(kind));
            }
            if let Some(status) = client.vat_status.as_deref().and_then(vat_status) {
                entity.insert("vat".to_string(), json!({ "status": status }));
            }
            if let Some(jurisdiction) = client.jurisdiction.as_deref() {
                entity.insert("jurisdiction".to_string(), json!(jurisdiction.trim().to_uppercase()));
            }
            if let Some(employees) = client.employees {
                entity.insert("employees".to_string(), json!(employees));
            }
            if let Some(revenue) = client.revenue_ytd {
                counters.insert("revenueYtd".to_string(), json!(revenue));
            }
            if let Some(transaction) = &client.transaction {
                txn.extend(transaction.clone());
            }
        }

        let root = json!({
            "entity": entity,
            "counters": counters,
            "txn": txn,
            "date": format_date(as_of),
        });
        Self { root }
    }

    /// Resolve a dot path. Null values count as absent.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut current = &self.root;
        for segment in path.split('.') {
            current = current.as_object()?.get(segment)?;
        }
        if current.is_null() {
            None
        } else {
            Some(current)
        }
    }

    #[must_use]
    pub fn missing_fields(&self, predicate: &Predicate) -> Vec<String> {
        predicate
            .required_fields()
            .into_iter()
            .filter(|field| self.lookup(field).is_none())
            .collect()
    }

    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.root
    }
}

fn vocabulary_key(raw: &str) -> String {
    normalize(raw.trim()).replace(['.', ' ', '-'], "_").trim_matches('_').to_string()
}

fn entity_type(raw: &str) -> Option<&'static str> {
    let key = vocabulary_key(raw);
    let mapped = match key.as_str() {
        "obrt" | "obrt_dohodak" | "sole_trader" | "craft" => "sole_trader",
        "pausalni_obrt" | "pausal" | "pausalist" | "obrt_pausal" | "lump_sum_sole_trader" => {
            "lump_sum_sole_trader"
        }
        "d_o_o" | "doo" | "limited_company" | "llc" => "limited_company",
        "j_d_o_o" | "jdoo" | "simple_limited_company" => "simple_limited_company",
        "udruga" | "nonprofit" | "association" => "nonprofit",
        "fizicka_osoba" | "individual" | "person" => "individual",
        _ => {
            tracing::warn!(legal_form = raw, "legal form outside predicate vocabulary; treated as missing");
            return None;
        }
    };
    Some(mapped)
}

fn vat_status(raw: &str) -> Option<&'static str> {
    let key = vocabulary_key(raw);
    let mapped = match key.as_str() {
        "registered" | "vat_registered" | "u_sustavu_pdv" | "u_sustavu_pdv_a" | "obveznik" | "yes" | "true" => {
            "registered"
        }
        "not_registered" | "nije_u_sustavu" | "nije_u_sustavu_pdv" | "neobveznik" | "no" | "false" => {
            "not_registered"
        }
        "exempt" | "oslobodjen" | "osloboden" => "exempt",
        _ => {
            tracing::warn!(vat_status = raw, "VAT status outside predicate vocabulary; treated as missing");
            return None;
        }
    };
    Some(mapped)
}
