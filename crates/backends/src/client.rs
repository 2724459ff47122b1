use crate::error::{BackendError, Result};
use crate::instance::ModelInstance;
use async_trait::async_trait;
use desk_protocol::GenerationParams;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Abstract contract the orchestrator requires from a generation backend.
/// One implementation serves every registered instance; the instance carries
/// the base URL and model roster.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(
        &self,
        instance: &ModelInstance,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String>;

    /// Lightweight "list available models" call used by health probes.
    async fn list_models(&self, instance: &ModelInstance) -> Result<Vec<String>>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// HTTP client speaking the OpenAI-style chat-completions wire format, which
/// most local inference servers expose.
pub struct HttpGenerationClient {
    http: reqwest::Client,
}

impl HttpGenerationClient {
    /// `request_timeout` is the transport-level ceiling; the dispatcher
    /// applies its own per-call deadline on top.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| BackendError::Http(err.to_string()))?;
        Ok(Self { http })
    }

    fn map_request_error(instance: &ModelInstance, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout {
                instance: instance.id().to_string(),
                timeout_ms: 0,
            }
        } else if err.is_connect() {
            BackendError::Connection {
                instance: instance.id().to_string(),
                message: err.to_string(),
            }
        } else {
            BackendError::Http(err.to_string())
        }
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationClient {
    async fn generate(
        &self,
        instance: &ModelInstance,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String> {
        let model = params
            .model
            .as_deref()
            .or_else(|| instance.capabilities().models.first().map(String::as_str))
            .ok_or_else(|| {
                BackendError::InvalidResponse(format!(
                    "instance {} declares no models",
                    instance.id()
                ))
            })?;

        let body = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };

        let url = format!("{}/v1/chat/completions", instance.base_url().trim_end_matches('/'));
        log::debug!("POST {} (model {})", url, model);

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| Self::map_request_error(instance, err))?
            .error_for_status()
            .map_err(|err| BackendError::Http(err.to_string()))?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| BackendError::InvalidResponse(err.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| BackendError::InvalidResponse("response carried no choices".to_string()))
    }

    async fn list_models(&self, instance: &ModelInstance) -> Result<Vec<String>> {
        let url = format!("{}/v1/models", instance.base_url().trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| Self::map_request_error(instance, err))?
            .error_for_status()
            .map_err(|err| BackendError::Http(err.to_string()))?;

        let parsed: ModelsResponse = response
            .json()
            .await
            .map_err(|err| BackendError::InvalidResponse(err.to_string()))?;
        Ok(parsed.data.into_iter().map(|m| m.id).collect())
    }
}
