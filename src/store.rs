use crate::protocol::Message;
use futures::{Stream, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    Complete,
    Streaming,
    Failed(String),
}

/// Mutations in the order they were applied to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Added(Message),
    Updated { id: String, text: String },
    Removed { id: String },
    StatusChanged { id: String, status: MessageStatus },
    Streaming(bool),
    Cleared,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("message id already exists: {0}")]
    DuplicateId(String),
    #[error("no message with id: {0}")]
    NotFound(String),
}

struct Entry {
    message: Message,
    status: MessageStatus,
}

#[derive(Default)]
struct Transcript {
    entries: Vec<Entry>,
    streaming: bool,
}

impl Transcript {
    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.message.id == id)
    }
}

/// Shared handle to one conversation. Clones observe and mutate the same
/// transcript.
#[derive(Clone)]
pub struct MessageStore {
    inner: Arc<Mutex<Transcript>>,
    events: broadcast::Sender<StoreEvent>,
}

impl MessageStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Transcript::default())),
            events,
        }
    }

    pub fn add(&self, message: Message) -> Result<(), StoreError> {
        self.add_with_status(message, MessageStatus::Complete)
    }

    /// Inserts `message` already carrying `status`, so no reader ever sees it
    /// in another state first.
    pub fn add_with_status(
        &self,
        message: Message,
        status: MessageStatus,
    ) -> Result<(), StoreError> {
        let mut transcript = self.lock();
        if transcript.position(&message.id).is_some() {
            return Err(StoreError::DuplicateId(message.id));
        }

        transcript.entries.push(Entry {
            message: message.clone(),
            status,
        });
        self.emit(StoreEvent::Added(message));
        Ok(())
    }

    pub fn update<F>(&self, id: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&str) -> String,
    {
        let mut transcript = self.lock();
        let idx = transcript
            .position(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let entry = &mut transcript.entries[idx];
        entry.message.text = f(&entry.message.text);
        let text = entry.message.text.clone();
        self.emit(StoreEvent::Updated {
            id: id.to_string(),
            text,
        });
        Ok(())
    }

    /// Removing an absent id is a no-op.
    pub fn remove(&self, id: &str) {
        let mut transcript = self.lock();
        if let Some(idx) = transcript.position(id) {
            transcript.entries.remove(idx);
            self.emit(StoreEvent::Removed { id: id.to_string() });
        }
    }

    pub fn set_streaming(&self, streaming: bool) {
        let mut transcript = self.lock();
        if transcript.streaming != streaming {
            transcript.streaming = streaming;
            self.emit(StoreEvent::Streaming(streaming));
        }
    }

    /// Sets the streaming flag only if it was clear. Returns `false` when
    /// another send already holds it.
    pub fn try_claim_streaming(&self) -> bool {
        let mut transcript = self.lock();
        if transcript.streaming {
            return false;
        }
        transcript.streaming = true;
        self.emit(StoreEvent::Streaming(true));
        true
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming
    }

    pub fn set_status(&self, id: &str, status: MessageStatus) -> Result<(), StoreError> {
        let mut transcript = self.lock();
        let idx = transcript
            .position(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        transcript.entries[idx].status = status.clone();
        self.emit(StoreEvent::StatusChanged {
            id: id.to_string(),
            status,
        });
        Ok(())
    }

    pub fn mark_failed(&self, id: &str, reason: impl Into<String>) -> Result<(), StoreError> {
        self.set_status(id, MessageStatus::Failed(reason.into()))
    }

    pub fn status(&self, id: &str) -> Option<MessageStatus> {
        let transcript = self.lock();
        transcript
            .position(id)
            .map(|idx| transcript.entries[idx].status.clone())
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<Message> {
        let transcript = self.lock();
        transcript
            .position(id)
            .map(|idx| transcript.entries[idx].message.clone())
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.lock()
            .entries
            .iter()
            .map(|entry| entry.message.clone())
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the whole conversation, e.g. when the view that owns it goes away.
    pub fn clear(&self) {
        let mut transcript = self.lock();
        transcript.entries.clear();
        transcript.streaming = false;
        self.emit(StoreEvent::Cleared);
    }

    /// Optimistically inserts `message`. The returned handle either keeps it
    /// (`commit`) or takes it back out (`rollback`).
    pub fn begin(&self, message: Message) -> Result<PendingSend, StoreError> {
        self.add(message.clone())?;
        Ok(PendingSend {
            store: self.clone(),
            message,
        })
    }

    /// Events for every mutation applied after this call. A subscriber that
    /// falls too far behind skips the missed events and should re-read
    /// `snapshot`.
    pub fn subscribe(&self) -> impl Stream<Item = StoreEvent> + Send + use<> {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|item| async move { item.ok() })
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, Transcript> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[must_use = "a pending send must be committed or rolled back"]
pub struct PendingSend {
    store: MessageStore,
    message: Message,
}

impl PendingSend {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn commit(self) -> Message {
        self.message
    }

    pub fn rollback(self) {
        self.store.remove(&self.message.id);
    }
}
