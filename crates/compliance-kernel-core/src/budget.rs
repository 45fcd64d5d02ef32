//! Length budgets applied to every terminal payload before it leaves the pipeline.

use crate::citation::{CitationSet, NonEmptyText};
use crate::event::TerminalPayload;

pub const HEADLINE_MAX_CHARS: usize = 120;
pub const DIRECT_ANSWER_MAX_CHARS: usize = 240;
pub const KEY_DETAILS_MAX: usize = 3;
pub const CITATIONS_MAX: usize = 4;
pub const QUOTE_MAX_CHARS: usize = 240;

const ELLIPSIS: char = '…';

/// Truncate on a char boundary, ending with an ellipsis when anything was cut.
#[must_use]
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }
    let mut truncated = text.chars().take(max_chars - 1).collect::<String>().trim_end().to_string();
    truncated.push(ELLIPSIS);
    truncated
}

fn budget_citations(citations: &mut CitationSet) {
    citations.supporting.truncate(CITATIONS_MAX - 1);
    let quote = citations.primary.quote().as_str();
    if quote.chars().count() > QUOTE_MAX_CHARS {
        if let Some(shorter) = NonEmptyText::new(truncate_chars(quote, QUOTE_MAX_CHARS)) {
            citations.primary = citations.primary.clone().with_quote(shorter);
        }
    }
    for card in &mut citations.supporting {
        if let Some(quote) = card.quote.as_mut() {
            *quote = truncate_chars(quote, QUOTE_MAX_CHARS);
        }
    }
}

fn budget_answer(headline: &mut String, direct_answer: &mut String, key_details: &mut Vec<String>) {
    *headline = truncate_chars(headline, HEADLINE_MAX_CHARS);
    *direct_answer = truncate_chars(direct_answer, DIRECT_ANSWER_MAX_CHARS);
    key_details.truncate(KEY_DETAILS_MAX);
    for detail in key_details.iter_mut() {
        *detail = truncate_chars(detail, DIRECT_ANSWER_MAX_CHARS);
    }
}

#[must_use]
pub fn enforce_budgets(mut payload: TerminalPayload) -> TerminalPayload {
    match &mut payload {
        TerminalPayload::Answer(answer) => {
            budget_answer(&mut answer.headline, &mut answer.direct_answer, &mut answer.key_details);
            budget_citations(&mut answer.citations);
        }
        TerminalPayload::ConditionalAnswer(answer) => {
            budget_answer(&mut answer.headline, &mut answer.direct_answer, &mut answer.key_details);
            budget_citations(&mut answer.citations);
        }
        TerminalPayload::Refusal(refusal) => {
            refusal.message = truncate_chars(&refusal.message, DIRECT_ANSWER_MAX_CHARS);
        }
        TerminalPayload::Error(error) => {
            error.message = truncate_chars(&error.message, DIRECT_ANSWER_MAX_CHARS);
        }
    }
    payload
}
