//! Structured extraction through an OpenAI-compatible chat completions API.
//!
//! The document URL is handed to the model together with the target schema
//! as a `json_schema` response format. The model's answer is parsed at this
//! boundary into [`ExtractedContent`], which fills every missing section with
//! an empty default.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};
use url::Url;
use worldforge_shared::{ExtractedContent, Result, WorldforgeError};

use crate::{Extractor, USER_AGENT, status_error};

const SYSTEM_PROMPT: &str = "You read tabletop roleplaying game rulebooks and return their \
content as JSON matching the provided schema. Leave out anything the document does not cover.";

/// Connection settings for [`OpenRouterExtractor`].
#[derive(Debug, Clone)]
pub struct OpenRouterOptions {
    /// API root, e.g. `https://openrouter.ai/api/v1`.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

/// Extractor backed by a chat completions endpoint.
pub struct OpenRouterExtractor {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenRouterExtractor {
    pub fn new(options: OpenRouterOptions) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(options.timeout)
            .build()
            .map_err(|e| WorldforgeError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", options.base_url.trim_end_matches('/')),
            api_key: options.api_key,
            model: options.model,
        })
    }

    fn request_body(&self, document_url: &Url, schema: &Value) -> Value {
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                {
                    "role": "user",
                    "content": format!("Extract the game content of the rulebook at {document_url}")
                }
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "rulebook_content",
                    "strict": false,
                    "schema": schema
                }
            }
        })
    }
}

#[async_trait]
impl Extractor for OpenRouterExtractor {
    fn name(&self) -> &str {
        "openrouter"
    }

    #[instrument(skip_all, fields(model = %self.model, url = %document_url))]
    async fn extract(&self, document_url: &Url, schema: &Value) -> Result<ExtractedContent> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(document_url, schema))
            .send()
            .await
            .map_err(|e| WorldforgeError::Network(format!("extract {document_url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&format!("extract {document_url}"), status, &body));
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| WorldforgeError::parse(format!("completion response: {e}")))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| WorldforgeError::parse("completion has no message content"))?;

        let extracted = parse_content(&content)?;
        debug!(entries = extracted.entry_count(), "extraction parsed");
        Ok(extracted)
    }
}

/// Parse the model's answer, tolerating a Markdown code fence around it.
fn parse_content(raw: &str) -> Result<ExtractedContent> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);

    serde_json::from_str(body.trim()).map_err(|e| {
        WorldforgeError::parse(format!(
            "extracted content is not valid JSON: {e} (got: {})",
            &body.chars().take(200).collect::<String>()
        ))
    })
}
