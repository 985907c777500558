//! Bounded aggregation of per-subtask failure messages.

/// Appended when a summary had to be cut short.
pub const TRUNCATION_MARKER: &str = "\n... (truncated)";

/// Collects `(index, message)` pairs and renders one capped summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorMessageCollector {
    messages: Vec<(usize, String)>,
}

impl ErrorMessageCollector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the failure message of subtask `index`.
    pub fn collect(&mut self, index: usize, message: impl Into<String>) {
        self.messages.push((index, message.into()));
    }

    /// Returns the number of collected messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Renders the collected messages in collection order, at most `max_length` bytes long.
    ///
    /// Each entry renders as `[index]: message` on its own line. When the
    /// rendering would exceed `max_length`, it is cut at a character boundary
    /// and [`TRUNCATION_MARKER`] is appended if there is room for it.
    #[must_use]
    pub fn summary(&self, max_length: usize) -> String {
        let mut out = String::new();
        for (index, message) in &self.messages {
            out.push_str(&format!("[{index}]: {message}\n"));
            if out.len() > max_length {
                return truncate(out, max_length);
            }
        }
        out
    }
}

fn truncate(mut text: String, max_length: usize) -> String {
    if max_length >= TRUNCATION_MARKER.len() {
        text.truncate(floor_char_boundary(&text, max_length - TRUNCATION_MARKER.len()));
        text.push_str(TRUNCATION_MARKER);
    } else {
        text.truncate(floor_char_boundary(&text, max_length));
    }
    text
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    (0..=index)
        .rev()
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(0)
}
