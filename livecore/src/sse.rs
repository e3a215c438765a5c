//! Line-oriented decoder for server-sent event streams.
//!
//! Feed it one line at a time (without the trailing newline); a blank line
//! completes the event and yields its joined `data:` payload. Data still
//! pending when the stream ends belongs to an incomplete event and is
//! discarded.

/// Accumulates `data:` lines until the blank line that ends an event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line. Returns the event payload when `line` completes an
    /// event that carried data.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(data) = extract_data(line) {
            self.data.push(data.to_string());
        }
        None
    }

    /// Whether `data:` lines are buffered for an event not yet completed.
    pub fn has_pending(&self) -> bool {
        !self.data.is_empty()
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        let joined = self.data.join("\n");
        self.data.clear();
        Some(joined)
    }
}

/// Extracts the value of a `data` field. Other fields (`event`, `id`,
/// `retry`) are not used by the notification stream.
fn extract_data(line: &str) -> Option<&str> {
    let value = line.strip_prefix("data")?;
    if value.is_empty() {
        return Some("");
    }
    let value = value.strip_prefix(':')?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}
