//! Code and analysis generation.
//!
//! The [`CodeGenerator`] seam has two implementations:
//! - [`LlmClient`]: OpenAI-compatible chat completions over HTTP
//! - [`TemplateCodeGenerator`]: deterministic offline templates
//!
//! [`Planner`] turns a generation into an executable [`Plan`].

mod client;
mod planner;
mod template;
mod types;

pub use client::LlmClient;
pub use planner::{Plan, PlanFeedback, Planner};
pub use template::TemplateCodeGenerator;
pub use types::{ChatRequest, ChatResponse, Choice, Generation, Message, MessageRole, Usage};

use async_trait::async_trait;

use crate::error::LlmResult;

/// Anything that can turn an instruction plus context into text.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Generate a completion for `context` under the system `instruction`.
    async fn generate(&self, instruction: &str, context: &str) -> LlmResult<Generation>;
}

/// Extract JSON from a completion, handling markdown code blocks.
///
/// Tries raw JSON first, then a ```json block, then any ``` block.
pub(crate) fn extract_json_from_completion(completion: &str) -> Result<&str, String> {
    let trimmed = completion.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    if completion.contains("```json") {
        return completion
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ```json block but content was empty or malformed".to_string());
    }

    if completion.contains("```") {
        return completion
            .split("```")
            .nth(1)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ``` block but content was empty or malformed".to_string());
    }

    Err(format!(
        "No JSON found in response. First 100 chars: '{}'",
        completion.chars().take(100).collect::<String>()
    ))
}

/// Body of the first fenced code block, without its language tag.
pub(crate) fn extract_code_block(completion: &str) -> Option<String> {
    let body = completion.split("```").nth(1)?;
    let body = match body.split_once('\n') {
        Some((tag, rest))
            if !tag.trim().is_empty()
                && tag.trim().chars().all(|c| c.is_ascii_alphanumeric() || c == '-') =>
        {
            rest
        }
        _ => body,
    };
    let code = body.trim();
    (!code.is_empty()).then(|| format!("{code}\n"))
}
