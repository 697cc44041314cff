//! Pluggable language-model backend, abstracted to a single operation.
//!
//! Grounded on `esence/essence/providers/base.py`'s `BaseProvider` ABC and
//! concretely implemented the way `freeq-bots/src/llm.rs`'s `LlmClient`
//! talks to the Anthropic Messages API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response shape: {0}")]
    UnexpectedResponse(String),
    #[error("unsupported provider: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Completion {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// A language-model backend: one completion operation, a name for logging.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        history: &[HistoryTurn],
        max_tokens: u32,
    ) -> Result<Completion, ProviderError>;

    fn name(&self) -> &'static str;
}

/// Anthropic Messages API client, mirroring `freeq-bots/src/llm.rs`.
pub struct AnthropicProvider {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [HistoryTurn],
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn complete(
        &self,
        system: &str,
        history: &[HistoryTurn],
        max_tokens: u32,
    ) -> Result<Completion, ProviderError> {
        let request = AnthropicRequest {
            model: &self.model,
            max_tokens,
            system,
            messages: history,
        };
        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json::<AnthropicResponse>()
            .await?;

        let text = response
            .content
            .into_iter()
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(ProviderError::UnexpectedResponse("empty content blocks".into()));
        }

        Ok(Completion {
            text,
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        })
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

/// A provider that echoes the last user turn, used in tests.
pub struct NullProvider;

#[async_trait]
impl Provider for NullProvider {
    async fn complete(
        &self,
        _system: &str,
        history: &[HistoryTurn],
        _max_tokens: u32,
    ) -> Result<Completion, ProviderError> {
        let text = history.last().map(|t| t.content.clone()).unwrap_or_default();
        Ok(Completion {
            text,
            input_tokens: 0,
            output_tokens: 0,
        })
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

/// Select a concrete provider by configuration name.
pub fn by_name(name: &str, api_key: Option<String>, model: &str) -> Result<Box<dyn Provider>, ProviderError> {
    match name {
        "anthropic" | "auto" => {
            let key = api_key.ok_or_else(|| ProviderError::Unsupported("anthropic requires an api key".into()))?;
            Ok(Box::new(AnthropicProvider::new(key, model)))
        }
        "null" => Ok(Box::new(NullProvider)),
        other => Err(ProviderError::Unsupported(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_provider_echoes_last_turn() {
        let provider = NullProvider;
        let history = vec![HistoryTurn {
            role: Role::User,
            content: "hi there".into(),
        }];
        let completion = provider.complete("system", &history, 128).await.unwrap();
        assert_eq!(completion.text, "hi there");
        assert_eq!(completion.total_tokens(), 0);
    }

    #[test]
    fn by_name_rejects_unknown_provider() {
        assert!(matches!(by_name("ollama", None, "x"), Err(ProviderError::Unsupported(_))));
    }

    #[test]
    fn by_name_requires_api_key_for_anthropic() {
        assert!(matches!(
            by_name("anthropic", None, "claude"),
            Err(ProviderError::Unsupported(_))
        ));
    }
}
