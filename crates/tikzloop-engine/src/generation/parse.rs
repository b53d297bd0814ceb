//! Response parsing at the adapter boundary.
//!
//! JSON operations either yield a validated typed value or `MalformedResponse`;
//! code operations always yield a string (the fenced block, else the whole text).

use serde::de::DeserializeOwned;
use tikzloop_contracts::figure::{Critique, FigurePlan};

use crate::error::GenerationError;

const FENCE: &str = "```";

pub fn parse_plan(text: &str) -> Result<FigurePlan, GenerationError> {
    let plan: FigurePlan = parse_json("plan", text)?;
    plan.validate()
        .map_err(|reason| malformed("plan", reason))?;
    Ok(plan)
}

pub fn parse_critique(text: &str) -> Result<Critique, GenerationError> {
    let critique: Critique = parse_json("critique", text)?;
    critique
        .normalized()
        .map_err(|reason| malformed("critique", reason))
}

pub fn parse_json<T: DeserializeOwned>(
    operation: &'static str,
    text: &str,
) -> Result<T, GenerationError> {
    let stripped = strip_json_fences(text);
    let object = extract_json_object(stripped)
        .ok_or_else(|| malformed(operation, "response contains no JSON object".to_string()))?;
    serde_json::from_str(object).map_err(|err| malformed(operation, err.to_string()))
}

/// Removes a surrounding ```json fence, if any.
pub fn strip_json_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix(FENCE) else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end().trim_end_matches(FENCE).trim()
}

/// The outermost `{...}` span of `text`.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// First fenced code block, else the trimmed response.
pub fn extract_code_block(text: &str) -> String {
    let Some(open) = text.find(FENCE) else {
        return text.trim().to_string();
    };
    let after_fence = &text[open + FENCE.len()..];
    let body = skip_info_string(after_fence);
    match body.find(FENCE) {
        Some(close) => body[..close].trim().to_string(),
        None => body.trim().to_string(),
    }
}

fn skip_info_string(after_fence: &str) -> &str {
    let line_end = after_fence.find('\n').unwrap_or(after_fence.len());
    let info = after_fence[..line_end].trim();
    let is_tag = !info.is_empty()
        && info
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if info.is_empty() || is_tag {
        after_fence.get(line_end + 1..).unwrap_or("")
    } else {
        after_fence
    }
}

fn malformed(operation: &'static str, reason: String) -> GenerationError {
    GenerationError::MalformedResponse { operation, reason }
}
