//! Thin wrapper over a hosted language model: classify a post into a
//! category, or fill a named prompt template and return the completion.
//! Nothing here retries; callers decide what a failure means.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::entities::feed_item::Category;

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
pub const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";

#[derive(Error, Debug)]
pub enum TextError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("model answered with no known category: {0:?}")]
    Unclassifiable(String),

    #[error("template {template} needs variable {variable}")]
    MissingVariable { template: String, variable: String },

    #[error("model returned an empty completion")]
    Empty,
}

/// A named prompt with `{{variable}}` placeholders in its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    pub name: &'static str,
    pub system: &'static str,
    pub body: &'static str,
}

impl PromptTemplate {
    pub fn find(name: &str) -> Option<&'static PromptTemplate> {
        TEMPLATES.iter().find(|t| t.name == name)
    }

    /// Substitute every placeholder. Unknown placeholders are an error,
    /// unused variables are ignored.
    pub fn render(&self, variables: &HashMap<String, String>) -> Result<String, TextError> {
        let mut out = String::with_capacity(self.body.len());
        let mut rest = self.body;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                out.push_str(&rest[start..]);
                return Ok(out);
            };

            let name = after[..end].trim();
            let value = variables
                .get(name)
                .ok_or_else(|| TextError::MissingVariable {
                    template: self.name.to_string(),
                    variable: name.to_string(),
                })?;
            out.push_str(value);
            rest = &after[end + 2..];
        }

        out.push_str(rest);
        Ok(out)
    }
}

pub static TEMPLATES: &[PromptTemplate] = &[
    PromptTemplate {
        name: "encouragement",
        system: "You write short, warm encouragement for members of a faith community. \
                 Reply with JSON: {\"message\": string}.",
        body: "Write a few sentences of encouragement for someone who shared:\n\n{{text}}",
    },
    PromptTemplate {
        name: "scripture",
        system: "You suggest Bible passages. Reply with JSON: \
                 {\"references\": [{\"reference\": string, \"summary\": string}]}.",
        body: "Suggest up to three passages that speak to this request:\n\n{{text}}",
    },
    PromptTemplate {
        name: "chat",
        system: "You are a kind, concise companion in a faith community app.",
        body: "{{message}}",
    },
];

const CLASSIFY_SYSTEM: &str = "You sort community posts into exactly one category. \
Answer with the category name only, in lowercase.";

fn classify_prompt(text: &str) -> String {
    let names: Vec<&str> = Category::ALL.iter().map(Category::as_str).collect();
    format!(
        "Categories: {}.\n\nPost:\n{}\n\nCategory:",
        names.join(", "),
        text
    )
}

/// Find the first category named in a model answer.
pub fn parse_category(answer: &str) -> Result<Category, TextError> {
    let lowered = answer.to_ascii_lowercase();
    lowered
        .split(|c: char| !c.is_ascii_alphabetic())
        .find_map(|word| word.parse::<Category>().ok())
        .ok_or_else(|| TextError::Unclassifiable(answer.trim().to_string()))
}

/// Completions are JSON when the model followed its instructions, plain
/// text otherwise.
fn completion_value(text: &str) -> Value {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);
    serde_json::from_str(unfenced).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[async_trait]
pub trait TextService: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Category, TextError>;

    async fn complete(
        &self,
        template: &PromptTemplate,
        variables: &HashMap<String, String>,
    ) -> Result<Value, TextError>;
}

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: [RequestMessage<'a>; 1],
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

pub struct AnthropicTextService {
    config: AnthropicConfig,
    client: Client,
}

impl AnthropicTextService {
    pub fn new(config: AnthropicConfig) -> Result<Self, TextError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    async fn send(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String, TextError> {
        let request = MessagesRequest {
            model: &self.config.model,
            max_tokens,
            system,
            messages: [RequestMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/messages", ANTHROPIC_API_BASE))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TextError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: MessagesResponse = response.json().await?;
        let text: String = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        if text.trim().is_empty() {
            return Err(TextError::Empty);
        }
        Ok(text)
    }
}

#[async_trait]
impl TextService for AnthropicTextService {
    async fn classify(&self, text: &str) -> Result<Category, TextError> {
        let answer = self.send(CLASSIFY_SYSTEM, &classify_prompt(text), 16).await?;
        let category = parse_category(&answer)?;
        debug!("Classified post as {}", category.as_str());
        Ok(category)
    }

    async fn complete(
        &self,
        template: &PromptTemplate,
        variables: &HashMap<String, String>,
    ) -> Result<Value, TextError> {
        let prompt = template.render(variables)?;
        let text = self
            .send(template.system, &prompt, self.config.max_tokens)
            .await?;
        Ok(completion_value(&text))
    }
}
