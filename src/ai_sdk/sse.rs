#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Splits a text/event-stream body into events. Input may arrive in
/// arbitrary pieces; an event is emitted once its blank-line terminator has
/// been seen.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        if chunk.contains('\r') {
            self.buffer.push_str(&chunk.replace("\r\n", "\n"));
        } else {
            self.buffer.push_str(chunk);
        }

        let mut events = Vec::new();
        while let Some(idx) = self.buffer.find("\n\n") {
            let raw_event: String = self.buffer.drain(..idx + 2).collect();
            if let Some(event) = parse_event(&raw_event[..idx]) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.trim_start().to_string());
        } else if let Some(name) = line.strip_prefix("event:") {
            event = Some(name.trim().to_string());
        }
    }

    if data_lines.is_empty() {
        None
    } else {
        Some(SseEvent {
            event,
            data: data_lines.join("\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_split_across_pushes_are_reassembled() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push("event: ping\nda").is_empty());
        let events = decoder.push("ta: {\"type\":\"ping\"}\n\nevent: x\ndata: 1\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("ping".to_string()),
                data: "{\"type\":\"ping\"}".to_string(),
            }]
        );

        let events = decoder.push("\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "1");
    }

    #[test]
    fn crlf_and_comment_only_blocks() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(": keep-alive\r\n\r\ndata: a\r\ndata: b\r\n\r\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: None,
                data: "a\nb".to_string(),
            }]
        );
    }
}
