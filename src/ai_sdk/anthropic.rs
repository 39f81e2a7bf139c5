use crate::protocol::Message;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub(crate) struct MessageRequest {
    pub(crate) model: String,
    pub(crate) max_tokens: u32,
    pub(crate) system: String,
    pub(crate) messages: Vec<MessageParam>,
    pub(crate) stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageParam {
    pub role: Role,
    pub content: String,
}

impl MessageParam {
    pub(crate) fn user(text: String) -> Self {
        Self {
            role: Role::User,
            content: text,
        }
    }

    pub(crate) fn assistant(text: String) -> Self {
        Self {
            role: Role::Assistant,
            content: text,
        }
    }
}

/// Maps the chat transcript onto API message params. Blank messages are
/// dropped and the list starts at the first user message, which the API
/// requires.
pub(crate) fn conversation_params(messages: &[Message]) -> Vec<MessageParam> {
    messages
        .iter()
        .filter(|message| !message.text.trim().is_empty())
        .skip_while(|message| !message.is_user_message)
        .map(|message| {
            if message.is_user_message {
                MessageParam::user(message.text.clone())
            } else {
                MessageParam::assistant(message.text.clone())
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum StreamEvent {
    ContentBlockDelta { delta: ContentDelta },
    MessageStop,
    Error { error: ApiError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ContentDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiError {
    #[serde(rename = "type")]
    pub(crate) kind: String,
    pub(crate) message: String,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StreamStep {
    Text(String),
    Stop,
    Error(String),
    Skip,
}

/// Interprets the `data` payload of one server-sent event.
pub(crate) fn stream_step(data: &str) -> StreamStep {
    match serde_json::from_str::<StreamEvent>(data) {
        Ok(StreamEvent::ContentBlockDelta {
            delta: ContentDelta::TextDelta { text },
        }) => StreamStep::Text(text),
        Ok(StreamEvent::MessageStop) => StreamStep::Stop,
        Ok(StreamEvent::Error { error }) => {
            StreamStep::Error(format!("{}: {}", error.kind, error.message))
        }
        Ok(_) => StreamStep::Skip,
        Err(e) => StreamStep::Error(format!("malformed stream event: {}", e)),
    }
}
