use crate::protocol::Message;
use crate::store::{MessageStatus, MessageStore, StoreError};
use futures::{Stream, StreamExt};
use std::fmt::Display;
use tokio::sync::watch;

/// Turns raw response bytes into text without splitting a character that
/// straddles two chunks.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            let (valid, invalid_len) = match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => (err.valid_up_to(), err.error_len()),
            };

            out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
            match invalid_len {
                Some(len) => {
                    out.push(char::REPLACEMENT_CHARACTER);
                    self.pending.drain(..valid + len);
                }
                // Incomplete sequence at the end, wait for the next chunk.
                None => {
                    self.pending.drain(..valid);
                    return out;
                }
            }
        }
    }

    /// Whatever is still buffered once the stream has ended.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    pub message_id: String,
    pub updates: usize,
    pub cancelled: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum UpdaterError {
    #[error("a response is already streaming")]
    Busy,
    #[error("stream for message {message_id} broke after {updates} updates: {reason}")]
    Stream {
        message_id: String,
        updates: usize,
        reason: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

enum Step<T> {
    Next(Option<T>),
    Cancelled,
}

struct Interrupted {
    updates: usize,
    error: PumpError,
}

enum PumpError {
    Stream(String),
    Store(StoreError),
}

pub struct TranscriptUpdater {
    store: MessageStore,
    cancel: Option<watch::Receiver<bool>>,
}

impl TranscriptUpdater {
    pub fn new(store: MessageStore) -> Self {
        Self {
            store,
            cancel: None,
        }
    }

    /// Stop reading once `cancel` flips to `true`. Text received so far stays.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Streams `body` into a fresh assistant message and returns once the body
    /// ends, breaks, or is cancelled. Refuses with `Busy` if another stream
    /// holds the streaming flag.
    pub async fn apply<S, B, E>(&self, body: S) -> Result<StreamOutcome, UpdaterError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        if !self.store.try_claim_streaming() {
            return Err(UpdaterError::Busy);
        }
        let message_id = self.open_claimed()?;
        self.stream_claimed(message_id, body).await
    }

    /// Adds the assistant placeholder, already `Streaming`, for a caller that
    /// holds the streaming flag. The flag is released if the insert fails.
    pub fn open_claimed(&self) -> Result<String, UpdaterError> {
        let placeholder = Message::assistant_placeholder();
        let message_id = placeholder.id.clone();
        if let Err(err) = self
            .store
            .add_with_status(placeholder, MessageStatus::Streaming)
        {
            self.store.set_streaming(false);
            return Err(err.into());
        }
        Ok(message_id)
    }

    /// Streams `body` into the placeholder created by `open_claimed`. The
    /// streaming flag is always cleared before this returns.
    pub async fn stream_claimed<S, B, E>(
        &self,
        message_id: String,
        body: S,
    ) -> Result<StreamOutcome, UpdaterError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        tracing::debug!(message_id = %message_id, "streaming response started");
        let result = self.pump(&message_id, body).await;

        match result {
            Ok((updates, cancelled)) => {
                let status = self.store.set_status(&message_id, MessageStatus::Complete);
                self.store.set_streaming(false);
                status?;
                tracing::debug!(
                    message_id = %message_id,
                    updates,
                    cancelled,
                    "streaming response finished"
                );
                Ok(StreamOutcome {
                    message_id,
                    updates,
                    cancelled,
                })
            }
            Err(Interrupted {
                updates,
                error: PumpError::Stream(reason),
            }) => {
                let marked = self.store.mark_failed(&message_id, reason.clone());
                self.store.set_streaming(false);
                marked?;
                tracing::warn!(
                    message_id = %message_id,
                    updates,
                    error = %reason,
                    "streaming response broke"
                );
                Err(UpdaterError::Stream {
                    message_id,
                    updates,
                    reason,
                })
            }
            Err(Interrupted {
                error: PumpError::Store(err),
                ..
            }) => {
                self.store.set_streaming(false);
                tracing::error!(message_id = %message_id, error = %err, "transcript update failed");
                Err(err.into())
            }
        }
    }

    async fn pump<S, B, E>(&self, message_id: &str, body: S) -> Result<(usize, bool), Interrupted>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        let mut body = std::pin::pin!(body);
        let mut cancel = self.cancel.clone();
        let mut decoder = Utf8ChunkDecoder::new();
        let mut updates = 0usize;

        loop {
            let step = match cancel.as_mut() {
                Some(cancel) => tokio::select! {
                    biased;
                    _ = cancelled(cancel) => Step::Cancelled,
                    item = body.next() => Step::Next(item),
                },
                None => Step::Next(body.next().await),
            };

            let bytes = match step {
                Step::Cancelled => return Ok((updates, true)),
                Step::Next(None) => break,
                Step::Next(Some(Ok(bytes))) => bytes,
                Step::Next(Some(Err(err))) => {
                    return Err(Interrupted {
                        updates,
                        error: PumpError::Stream(err.to_string()),
                    });
                }
            };

            let chunk = decoder.decode(bytes.as_ref());
            if chunk.is_empty() {
                continue;
            }
            self.append(message_id, &chunk).map_err(|err| Interrupted {
                updates,
                error: PumpError::Store(err),
            })?;
            updates += 1;
        }

        let tail = decoder.finish();
        if !tail.is_empty() {
            self.append(message_id, &tail).map_err(|err| Interrupted {
                updates,
                error: PumpError::Store(err),
            })?;
            updates += 1;
        }

        Ok((updates, false))
    }

    fn append(&self, message_id: &str, chunk: &str) -> Result<(), StoreError> {
        self.store
            .update(message_id, |prev| format!("{}{}", prev, chunk))
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        // Sender gone without cancelling: never fires.
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreEvent;
    use futures::stream;
    use std::convert::Infallible;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    type Chunks = stream::Iter<std::vec::IntoIter<Result<Vec<u8>, Infallible>>>;

    fn chunks(parts: &[&str]) -> Chunks {
        stream::iter(
            parts
                .iter()
                .map(|part| Ok(part.as_bytes().to_vec()))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn decoder_joins_characters_split_across_chunks() {
        let bytes = "¡Olé ñandú!".as_bytes();
        let mut decoder = Utf8ChunkDecoder::new();
        let mut text = String::new();
        for byte in bytes {
            text.push_str(&decoder.decode(std::slice::from_ref(byte)));
        }
        text.push_str(&decoder.finish());
        assert_eq!(text, "¡Olé ñandú!");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8ChunkDecoder::new();
        assert_eq!(decoder.decode(b"ok\xffgo"), "ok\u{FFFD}go");
        assert_eq!(decoder.decode(&[0xE2, 0x82]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[tokio::test]
    async fn chunks_are_concatenated_in_arrival_order() {
        let store = MessageStore::new();
        let events = store.subscribe();
        let updater = TranscriptUpdater::new(store.clone());

        let outcome = updater
            .apply(chunks(&["Hel", "lo, ", "world"]))
            .await
            .unwrap();

        assert_eq!(outcome.updates, 3);
        assert!(!outcome.cancelled);
        let message = store.get(&outcome.message_id).unwrap();
        assert_eq!(message.text, "Hello, world");
        assert!(!message.is_user_message);
        assert_eq!(
            store.status(&outcome.message_id),
            Some(MessageStatus::Complete)
        );
        assert!(!store.is_streaming());

        drop(updater);
        drop(store);
        let updates: Vec<String> = events
            .filter_map(|event| async move {
                match event {
                    StoreEvent::Updated { text, .. } => Some(text),
                    _ => None,
                }
            })
            .collect()
            .await;
        assert_eq!(updates, vec!["Hel", "Hello, ", "Hello, world"]);
    }

    #[tokio::test]
    async fn one_at_a_time_equals_all_at_once() {
        let parts = ["a", "bc", "", "def", "g"];

        let split = MessageStore::new();
        let outcome = TranscriptUpdater::new(split.clone())
            .apply(chunks(&parts))
            .await
            .unwrap();

        let whole = MessageStore::new();
        let joined = parts.concat();
        let single = TranscriptUpdater::new(whole.clone())
            .apply(chunks(&[joined.as_str()]))
            .await
            .unwrap();

        assert_eq!(
            split.get(&outcome.message_id).unwrap().text,
            whole.get(&single.message_id).unwrap().text
        );
        // The empty chunk does not produce an update.
        assert_eq!(outcome.updates, 4);
    }

    #[tokio::test]
    async fn empty_stream_leaves_empty_placeholder() {
        let store = MessageStore::new();
        let outcome = TranscriptUpdater::new(store.clone())
            .apply(chunks(&[]))
            .await
            .unwrap();

        assert_eq!(outcome.updates, 0);
        assert_eq!(store.get(&outcome.message_id).unwrap().text, "");
        assert!(!store.is_streaming());
    }

    #[tokio::test]
    async fn mid_stream_error_marks_message_failed() {
        let store = MessageStore::new();
        let body = stream::iter(vec![
            Ok(b"partial ".to_vec()),
            Err("connection reset"),
            Ok(b"never seen".to_vec()),
        ]);

        let err = TranscriptUpdater::new(store.clone())
            .apply(body)
            .await
            .unwrap_err();

        let message_id = match err {
            UpdaterError::Stream {
                message_id,
                updates,
                reason,
            } => {
                assert_eq!(updates, 1);
                assert_eq!(reason, "connection reset");
                message_id
            }
            other => panic!("expected stream error, got {other:?}"),
        };

        assert_eq!(store.get(&message_id).unwrap().text, "partial ");
        assert_eq!(
            store.status(&message_id),
            Some(MessageStatus::Failed("connection reset".to_string()))
        );
        assert!(!store.is_streaming());
    }

    #[tokio::test]
    async fn refuses_to_start_while_streaming() {
        let store = MessageStore::new();
        store.set_streaming(true);

        let err = TranscriptUpdater::new(store.clone())
            .apply(chunks(&["x"]))
            .await
            .unwrap_err();

        assert!(matches!(err, UpdaterError::Busy));
        assert!(store.is_empty());
        assert!(store.is_streaming());
    }

    #[tokio::test]
    async fn placeholder_is_streaming_from_the_moment_it_appears() {
        let store = MessageStore::new();
        let events = store.subscribe();
        let updater = TranscriptUpdater::new(store.clone());

        assert!(store.try_claim_streaming());
        let message_id = updater.open_claimed().unwrap();
        assert_eq!(store.status(&message_id), Some(MessageStatus::Streaming));

        updater
            .stream_claimed(message_id.clone(), chunks(&["ok"]))
            .await
            .unwrap();
        drop(updater);
        drop(store);

        // The only status change is the final one.
        let statuses: Vec<MessageStatus> = events
            .filter_map(|event| async move {
                match event {
                    StoreEvent::StatusChanged { status, .. } => Some(status),
                    _ => None,
                }
            })
            .collect()
            .await;
        assert_eq!(statuses, vec![MessageStatus::Complete]);
    }

    #[tokio::test]
    async fn second_stream_is_refused_while_first_is_open() {
        let store = MessageStore::new();
        let first = TranscriptUpdater::new(store.clone());
        let second = TranscriptUpdater::new(store.clone());
        let (tx, rx) = mpsc::channel::<Result<Vec<u8>, Infallible>>(1);

        let (outcome, refused) = tokio::join!(
            first.apply(ReceiverStream::new(rx)),
            async move {
                let refused = second.apply(chunks(&["two"])).await;
                tx.send(Ok(b"one".to_vec())).await.unwrap();
                refused
            }
        );

        let outcome = outcome.unwrap();
        assert!(matches!(refused, Err(UpdaterError::Busy)));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].text, "one");
        assert_eq!(
            store.status(&outcome.message_id),
            Some(MessageStatus::Complete)
        );
        assert!(!store.is_streaming());
    }

    #[tokio::test]
    async fn cancel_keeps_partial_text() {
        let store = MessageStore::new();
        let (tx, rx) = mpsc::channel::<Result<Vec<u8>, Infallible>>(4);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let updater = TranscriptUpdater::new(store.clone()).with_cancel(cancel_rx);

        let mut events = Box::pin(store.subscribe());
        let task = tokio::spawn(async move { updater.apply(ReceiverStream::new(rx)).await });

        tx.send(Ok(b"first".to_vec())).await.unwrap();
        while let Some(event) = events.next().await {
            if matches!(event, StoreEvent::Updated { .. }) {
                break;
            }
        }
        cancel_tx.send(true).unwrap();

        let outcome = task.await.unwrap().unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.updates, 1);
        assert_eq!(store.get(&outcome.message_id).unwrap().text, "first");
        assert_eq!(
            store.status(&outcome.message_id),
            Some(MessageStatus::Complete)
        );
        assert!(!store.is_streaming());
        drop(tx);
    }

    #[tokio::test]
    async fn sequential_streams_do_not_interleave() {
        let store = MessageStore::new();
        let updater = TranscriptUpdater::new(store.clone());

        let first = updater.apply(chunks(&["one", "-1"])).await.unwrap();
        let second = updater.apply(chunks(&["two", "-2"])).await.unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, first.message_id);
        assert_eq!(snapshot[0].text, "one-1");
        assert_eq!(snapshot[1].id, second.message_id);
        assert_eq!(snapshot[1].text, "two-2");
    }
}
