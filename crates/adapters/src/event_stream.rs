use chq_core::transport::ServerEvent;

pub const DEFAULT_EVENT: &str = "message";

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// Incremental `text/event-stream` decoder.
///
/// Bytes may be pushed in arbitrary chunks; lines are only decoded once
/// complete, so multi-byte characters split across chunks survive. An event
/// left unterminated when the body ends is never dispatched, and neither is
/// one carrying a line that is not valid UTF-8.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    line: Vec<u8>,
    after_cr: bool,
    seen_first_line: bool,
    event: Option<String>,
    data: String,
    malformed: bool,
    last_event_id: Option<String>,
    retry_ms: Option<u64>,
}

impl EventStreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        for &byte in chunk {
            if self.after_cr {
                self.after_cr = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' => self.end_line(&mut events),
                b'\r' => {
                    self.after_cr = true;
                    self.end_line(&mut events);
                }
                other => self.line.push(other),
            }
        }
        events
    }

    #[must_use]
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Reconnection delay announced by the server, in milliseconds.
    #[must_use]
    pub fn retry_ms(&self) -> Option<u64> {
        self.retry_ms
    }

    fn end_line(&mut self, events: &mut Vec<ServerEvent>) {
        let raw = std::mem::take(&mut self.line);
        let mut bytes = raw.as_slice();
        if !self.seen_first_line {
            self.seen_first_line = true;
            bytes = bytes.strip_prefix(BOM).unwrap_or(bytes);
        }

        if bytes.is_empty() {
            self.dispatch(events);
            return;
        }
        if bytes.starts_with(b":") {
            return;
        }
        let Ok(line) = std::str::from_utf8(bytes) else {
            self.malformed = true;
            return;
        };

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            "id" if !value.contains('\0') => self.last_event_id = Some(value.to_string()),
            "retry" => {
                if let Ok(retry_ms) = value.parse() {
                    self.retry_ms = Some(retry_ms);
                }
            }
            _ => tracing::trace!(field, "ignored event stream field"),
        }
    }

    fn dispatch(&mut self, events: &mut Vec<ServerEvent>) {
        let event = self.event.take();
        if std::mem::take(&mut self.malformed) {
            self.data.clear();
            tracing::warn!(event = ?event, "dropped event with invalid UTF-8");
            return;
        }
        if self.data.is_empty() {
            return;
        }
        let mut data = std::mem::take(&mut self.data);
        data.pop();

        events.push(ServerEvent {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data,
            id: self.last_event_id.clone(),
        });
    }
}
