use std::time::Instant;

/// Collects the chunk fragments of one assistant turn
#[derive(Debug)]
pub struct TurnAccumulator {
    content: String,
    fragments: usize,
    started_at: Option<Instant>,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self {
            content: String::new(),
            fragments: 0,
            started_at: None,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
        self.content.push_str(chunk);
        self.fragments += 1;
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn fragments(&self) -> usize {
        self.fragments
    }

    /// Milliseconds since the first chunk
    pub fn duration_ms(&self) -> Option<u64> {
        self.started_at.map(|start| start.elapsed().as_millis() as u64)
    }

    /// Content the turn ends with: a non-empty final text replaces what was accumulated
    pub fn finalize(&mut self, final_content: Option<&str>) -> String {
        match final_content {
            Some(text) => text.to_string(),
            None => std::mem::take(&mut self.content),
        }
    }

    /// Start over, e.g. when the request is re-issued after a dropped connection
    pub fn reset(&mut self) {
        self.content.clear();
        self.fragments = 0;
        self.started_at = None;
    }
}

impl Default for TurnAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_concatenate_in_order() {
        let mut acc = TurnAccumulator::new();
        acc.push("Hel");
        acc.push("lo");
        assert_eq!(acc.content(), "Hello");
        assert_eq!(acc.fragments(), 2);
        assert!(acc.duration_ms().is_some());
    }

    #[test]
    fn test_final_content_wins() {
        let mut acc = TurnAccumulator::new();
        acc.push("Hel");
        assert_eq!(acc.finalize(Some("Hello!")), "Hello!");

        let mut acc = TurnAccumulator::new();
        acc.push("Hel");
        assert_eq!(acc.finalize(None), "Hel");
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut acc = TurnAccumulator::new();
        acc.push("partial");
        acc.reset();
        assert!(acc.is_empty());
        assert_eq!(acc.fragments(), 0);
        assert!(acc.duration_ms().is_none());
    }
}
