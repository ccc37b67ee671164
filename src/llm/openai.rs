//! OpenAI-compatible chat client (SSE streaming via eventsource-stream).

use crate::error::LlmError;
use crate::llm::provider::{LlmParams, LlmProvider, Message, TokenStream};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

impl ChatCompletionRequest {
    fn new(model: &str, messages: Vec<Message>, stream: bool, options: Option<LlmParams>) -> Self {
        let params = options.unwrap_or_default();
        Self {
            model: model.to_string(),
            messages,
            stream,
            temperature: params.temperature,
            top_p: params.top_p,
            presence_penalty: params.presence_penalty,
            frequency_penalty: params.frequency_penalty,
            max_tokens: params.max_tokens,
            response_format: params.json_mode.then(|| json!({"type": "json_object"})),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

pub struct OpenAIClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    provider_id: String,
}

impl OpenAIClient {
    pub fn new(api_key: String, base_url: Option<String>, model: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: model.unwrap_or_else(|| "gpt-4".to_string()),
            provider_id: "openai".to_string(),
        }
    }

    pub fn with_id(mut self, id: String) -> Self {
        self.provider_id = id;
        self
    }

    async fn post_request(
        &self,
        request_body: &ChatCompletionRequest,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request_body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(error_text));
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for OpenAIClient {
    async fn chat(
        &self,
        messages: Vec<Message>,
        options: Option<LlmParams>,
    ) -> Result<String, LlmError> {
        let request_body = ChatCompletionRequest::new(&self.model, messages, false, options);
        let response = self.post_request(&request_body).await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Transport(format!("Failed to parse response: {}", e)))?;

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        Ok(content)
    }

    async fn chat_stream(
        &self,
        messages: Vec<Message>,
        options: Option<LlmParams>,
    ) -> Result<TokenStream, LlmError> {
        let request_body = ChatCompletionRequest::new(&self.model, messages, true, options);
        let response = self.post_request(&request_body).await?;

        let stream = response
            .bytes_stream()
            .eventsource()
            .map(|result| match result {
                Ok(event) => {
                    if event.data == "[DONE]" {
                        return Ok(None);
                    }
                    match serde_json::from_str::<OpenAIStreamResponse>(&event.data) {
                        Ok(parsed) => {
                            if let Some(choice) = parsed.choices.first() {
                                if let Some(content) = &choice.delta.content {
                                    return Ok(Some(content.clone()));
                                }
                            }
                            Ok(None)
                        }
                        // Ignore parse errors for keep-alives etc
                        Err(_) => Ok(None),
                    }
                }
                Err(e) => Err(LlmError::Stream(e.to_string())),
            })
            .filter_map(|res| async {
                match res {
                    Ok(Some(content)) => Some(Ok(content)),
                    Ok(None) => None,
                    Err(e) => Some(Err(e)),
                }
            });

        Ok(Box::pin(stream))
    }

    fn id(&self) -> &str {
        &self.provider_id
    }
}
