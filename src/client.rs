use crate::places::Place;
use crate::protocol::{Message, SendMessageRequest};
use crate::store::{MessageStore, StoreError};
use crate::updater::{StreamOutcome, TranscriptUpdater, UpdaterError};
use reqwest::Client as HttpClient;
use std::error::Error;
use tokio::sync::watch;

pub struct ClientConfig {
    pub base_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("a response is still streaming")]
    Busy,
    #[error("failed to send message: {0}")]
    Network(String),
    #[error("response stream broke: {0}")]
    Stream(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<UpdaterError> for SendError {
    fn from(err: UpdaterError) -> Self {
        match err {
            UpdaterError::Busy => SendError::Busy,
            UpdaterError::Stream { reason, .. } => SendError::Stream(reason),
            UpdaterError::Store(err) => SendError::Store(err),
        }
    }
}

/// One conversation with a trekmate server. Cloning shares the store.
#[derive(Clone)]
pub struct ChatSession {
    base_url: String,
    http: HttpClient,
    store: MessageStore,
}

type ClientResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

impl ChatSession {
    pub fn new(config: ClientConfig, store: MessageStore) -> Self {
        Self {
            base_url: normalize_base_url(&config.base_url),
            http: HttpClient::new(),
            store,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Sends `text` and streams the reply into the store. The streaming flag
    /// is claimed first and held from the request through the reply, so only
    /// one send is in flight. The user message is inserted up front and taken
    /// back out if no reply placeholder is ever created.
    pub async fn send(
        &self,
        text: String,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<StreamOutcome, SendError> {
        if !self.store.try_claim_streaming() {
            return Err(SendError::Busy);
        }

        let pending = match self.store.begin(Message::user(text)) {
            Ok(pending) => pending,
            Err(err) => {
                self.store.set_streaming(false);
                return Err(err.into());
            }
        };
        let request = SendMessageRequest {
            messages: self.store.snapshot(),
        };

        let response = match self.post_message(&request).await {
            Ok(response) => response,
            Err(reason) => {
                tracing::warn!(
                    message_id = %pending.message().id,
                    error = %reason,
                    "send failed, rolling back"
                );
                pending.rollback();
                self.store.set_streaming(false);
                return Err(SendError::Network(reason));
            }
        };

        let mut updater = TranscriptUpdater::new(self.store.clone());
        if let Some(cancel) = cancel {
            updater = updater.with_cancel(cancel);
        }
        let message_id = match updater.open_claimed() {
            Ok(message_id) => message_id,
            Err(err) => {
                pending.rollback();
                return Err(err.into());
            }
        };
        pending.commit();

        Ok(updater
            .stream_claimed(message_id, response.bytes_stream())
            .await?)
    }

    pub async fn nearby(&self, latitude: &str, longitude: &str) -> ClientResult<Vec<Place>> {
        let response = self
            .http
            .get(reqwest::Url::parse_with_params(
                &format!("{}/nearby", self.base_url),
                &[("latitude", latitude), ("longitude", longitude)],
            )?)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Nearby search failed: {} - {}", status, body).into());
        }

        Ok(response.json().await?)
    }

    async fn post_message(&self, request: &SendMessageRequest) -> Result<reqwest::Response, String> {
        let response = self
            .http
            .post(format!("{}/message", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("{} - {}", status, body));
        }

        Ok(response)
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}
