//! Blocking HTTP adapters for answer phrasing and query embeddings.
//!
//! Both clients carry a bounded timeout. Every failure is reported through the
//! core error types so the pipeline can fall back to templates or keyword matching.

use std::error::Error as _;
use std::io;
use std::time::Duration;

use compliance_kernel_core::dates::format_date;
use compliance_kernel_core::{
    AnswerPhraser, EmbedError, PhrasedAnswer, PhrasingError, PhrasingRequest, QueryEmbedder, Topic,
};
use serde::{Deserialize, Serialize};

use crate::config::EndpointConfig;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PhraseBody<'a> {
    question: &'a str,
    as_of: String,
    rules: Vec<PhraseRule<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PhraseRule<'a> {
    id: &'a str,
    title: &'a str,
    value: String,
    law_reference: Option<&'a str>,
    quotes: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct ClarifyBody<'a> {
    question: &'a str,
    topic: Topic,
}

#[derive(Debug, Deserialize)]
struct ClarifyResponse {
    #[serde(default)]
    suggestions: Vec<String>,
}

#[derive(Debug, Serialize)]
struct EmbedBody<'a> {
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

enum CallError {
    Timeout,
    Failed(String),
}

fn agent(endpoint: &EndpointConfig) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(Duration::from_millis(endpoint.timeout_ms)).build()
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

fn post_json<B: Serialize, R: for<'de> Deserialize<'de>>(
    agent: &ureq::Agent,
    url: &str,
    body: &B,
) -> Result<R, CallError> {
    let response = agent.post(url).send_json(body).map_err(|err| match &err {
        ureq::Error::Transport(transport)
            if transport
                .source()
                .and_then(|source| source.downcast_ref::<io::Error>())
                .is_some_and(is_timeout) =>
        {
            CallError::Timeout
        }
        _ => CallError::Failed(err.to_string()),
    })?;
    response.into_json::<R>().map_err(|err| {
        if is_timeout(&err) {
            CallError::Timeout
        } else {
            CallError::Failed(format!("invalid response body from {url}: {err}"))
        }
    })
}

/// Phrases answers through an external language-model gateway.
///
/// `POST {url}/phrase` receives the question and the cited rules; `POST {url}/clarify`
/// returns follow-up questions.
pub struct HttpPhraser {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpPhraser {
    #[must_use]
    pub fn new(endpoint: &EndpointConfig) -> Self {
        Self { agent: agent(endpoint), base_url: endpoint.url.trim_end_matches('/').to_string() }
    }
}

impl AnswerPhraser for HttpPhraser {
    fn phrase(&self, request: &PhrasingRequest<'_>) -> Result<PhrasedAnswer, PhrasingError> {
        let body = PhraseBody {
            question: request.question,
            as_of: format_date(request.as_of),
            rules: request
                .rules
                .iter()
                .map(|rule| PhraseRule {
                    id: &rule.id,
                    title: &rule.title,
                    value: rule.display_value(),
                    law_reference: rule.law_reference.as_deref(),
                    quotes: rule.sources.iter().map(|source| source.exact_quote.as_str()).collect(),
                })
                .collect(),
        };
        post_json(&self.agent, &format!("{}/phrase", self.base_url), &body).map_err(|err| match err {
            CallError::Timeout => PhrasingError::Timeout,
            CallError::Failed(message) => PhrasingError::Unavailable(message),
        })
    }

    fn suggest_clarifications(&self, question: &str, topic: Topic) -> Result<Vec<String>, PhrasingError> {
        let response: ClarifyResponse =
            post_json(&self.agent, &format!("{}/clarify", self.base_url), &ClarifyBody { question, topic })
                .map_err(|err| match err {
                    CallError::Timeout => PhrasingError::Timeout,
                    CallError::Failed(message) => PhrasingError::Unavailable(message),
                })?;
        if response.suggestions.is_empty() {
            return Err(PhrasingError::Rejected("no clarification suggestions returned".to_string()));
        }
        Ok(response.suggestions)
    }
}

/// Fetches query embeddings: `POST {url}` with `{"input": text}`, answered by `{"embedding": [..]}`.
pub struct HttpEmbedder {
    agent: ureq::Agent,
    url: String,
}

impl HttpEmbedder {
    #[must_use]
    pub fn new(endpoint: &EndpointConfig) -> Self {
        Self { agent: agent(endpoint), url: endpoint.url.clone() }
    }
}

impl QueryEmbedder for HttpEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let response: EmbedResponse =
            post_json(&self.agent, &self.url, &EmbedBody { input: text }).map_err(|err| match err {
                CallError::Timeout => EmbedError::Timeout,
                CallError::Failed(message) => EmbedError::Unavailable(message),
            })?;
        if response.embedding.is_empty() {
            return Err(EmbedError::Unavailable("empty embedding".to_string()));
        }
        Ok(response.embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compliance_kernel_core::{Authority, RuleCandidate, RuleStatus, ValueType};
    use time::{Date, Month};

    fn unreachable() -> EndpointConfig {
        EndpointConfig { url: "http://127.0.0.1:9/".to_string(), timeout_ms: 200 }
    }

    #[test]
    fn unreachable_embedder_reports_failure() {
        let embedder = HttpEmbedder::new(&unreachable());
        assert!(embedder.embed("stopa pdv-a").is_err());
    }

    #[test]
    fn unreachable_phraser_reports_failure() {
        let phraser = HttpPhraser::new(&unreachable());
        assert_eq!(phraser.base_url, "http://127.0.0.1:9");

        let rules = vec![RuleCandidate {
            id: "vat-25".to_string(),
            concept_slug: "pdv-stopa".to_string(),
            title: "Opća stopa PDV-a".to_string(),
            law_reference: None,
            authority: Authority::Law,
            status: RuleStatus::Published,
            effective_from: None,
            effective_until: None,
            confidence: 0.9,
            value: "25".to_string(),
            value_type: ValueType::Percentage,
            applicability: None,
            sources: Vec::new(),
        }];
        let as_of = match Date::from_calendar_date(2025, Month::March, 1) {
            Ok(date) => date,
            Err(err) => panic!("invalid fixture date: {err}"),
        };
        let request = PhrasingRequest { question: "Koja je stopa PDV-a?", rules: &rules, as_of };
        assert!(phraser.phrase(&request).is_err());
        assert!(phraser.suggest_clarifications("porez", Topic::Regulatory).is_err());
    }
}
