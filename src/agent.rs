use crate::ai_sdk::{MessageRequest, SseDecoder, StreamStep, conversation_params, stream_step};
use crate::protocol::Message;
use crate::updater::Utf8ChunkDecoder;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-haiku-4-5-20251001";

const MAX_TOKENS: u32 = 1024;
const SYSTEM_PROMPT: &str = "You are a travel health assistant. Help travellers with \
symptoms, medication, vaccinations, insurance and finding medical care while abroad. \
Keep answers short and practical, and tell the user to contact local emergency \
services whenever a situation sounds urgent. Answer in the language the user writes in.";

pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, AgentError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("no user message to answer")]
    EmptyConversation,
    #[error("api request failed: {0}")]
    ApiRequestFailed(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Produces the assistant's reply to a conversation as a stream of text.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn stream_reply(&self, conversation: &[Message]) -> Result<TextStream, AgentError>;
}

pub struct Agent {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl Agent {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: DEFAULT_ANTHROPIC_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }
}

#[async_trait]
impl ChatBackend for Agent {
    async fn stream_reply(&self, conversation: &[Message]) -> Result<TextStream, AgentError> {
        let messages = conversation_params(conversation);
        if messages.is_empty() {
            return Err(AgentError::EmptyConversation);
        }

        let request = MessageRequest {
            model: self.model.clone(),
            max_tokens: MAX_TOKENS,
            system: SYSTEM_PROMPT.to_string(),
            messages,
            stream: true,
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| AgentError::ApiRequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AgentError::ApiRequestFailed(format!(
                "{} - {}",
                status, error_text
            )));
        }

        let (sender, receiver) = mpsc::channel(64);
        let mut body = response.bytes_stream();
        tokio::spawn(async move {
            let mut text = Utf8ChunkDecoder::new();
            let mut events = SseDecoder::new();

            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = sender
                            .send(Err(AgentError::ApiRequestFailed(e.to_string())))
                            .await;
                        return;
                    }
                };

                for event in events.push(&text.decode(&chunk)) {
                    tracing::trace!(event = ?event.event, "upstream event");
                    let item = match stream_step(&event.data) {
                        StreamStep::Text(delta) => Ok(delta),
                        StreamStep::Skip => continue,
                        StreamStep::Stop => return,
                        StreamStep::Error(message) => Err(AgentError::InvalidResponse(message)),
                    };
                    let failed = item.is_err();
                    // The caller hung up; dropping the body closes the upstream request.
                    if sender.send(item).await.is_err() || failed {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(receiver)))
    }
}
