use serde::de::DeserializeOwned;

use crate::buffer::{LineBuffer, LineError};
use crate::diagnostics::{DiagnosticKind, DiagnosticLog};
use crate::event::StreamEvent;

const DONE_MARKER: &str = "[DONE]";

/// Incremental server-sent events parser
///
/// Feed it raw chunks in arrival order; it returns the events for every line
/// completed so far. A line split across any number of chunks parses exactly
/// as if it had arrived whole.
pub struct SseParser {
    buffer: LineBuffer,
    pending_event: Option<String>,
    diagnostics: DiagnosticLog,
}

impl SseParser {
    pub fn new(diagnostics: DiagnosticLog) -> Self {
        Self {
            buffer: LineBuffer::default(),
            pending_event: None,
            diagnostics,
        }
    }

    /// Append a chunk and process all complete lines in buffer
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend(chunk);

        let mut events = Vec::new();
        while let Some(line) = self.buffer.next_line() {
            self.handle(line, &mut events);
        }
        events
    }

    /// Flush an unterminated trailing line at end of stream
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if let Some(line) = self.buffer.take_remainder() {
            self.handle(line, &mut events);
        }
        self.pending_event = None;
        events
    }

    /// Drop buffered state before reusing the parser on a new connection
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pending_event = None;
    }

    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    /// Bytes still waiting for a line terminator
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn handle(&mut self, line: Result<String, LineError>, events: &mut Vec<StreamEvent>) {
        match line {
            Ok(line) => self.classify(&line, events),
            Err(LineError::InvalidUtf8(invalid)) => self.diagnostics.record(
                DiagnosticKind::InvalidUtf8,
                invalid.error.to_string(),
                &invalid.lossy,
                self.pending_event.as_deref(),
            ),
            Err(LineError::TooLong { limit, prefix }) => self.diagnostics.record(
                DiagnosticKind::LineTooLong,
                format!("line longer than {} bytes", limit),
                &prefix,
                self.pending_event.as_deref(),
            ),
        }
    }

    fn classify(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        // A blank line closes the current event block.
        if line.is_empty() {
            self.pending_event = None;
            return;
        }

        if let Some(comment) = line.strip_prefix(':') {
            events.push(StreamEvent::comment(comment.trim_start()));
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => {
                if value == DONE_MARKER {
                    events.push(StreamEvent::done());
                } else {
                    events.push(StreamEvent::data(value, self.pending_event.clone()));
                }
            }
            "event" => {
                let name = value.trim();
                if name.is_empty() {
                    self.pending_event = None;
                } else {
                    self.pending_event = Some(name.to_string());
                    events.push(StreamEvent::named(name));
                }
            }
            "retry" => match value.trim().parse::<u64>() {
                Ok(millis) => events.push(StreamEvent::retry(millis)),
                Err(e) => self.diagnostics.record(
                    DiagnosticKind::InvalidRetry,
                    e.to_string(),
                    line,
                    None,
                ),
            },
            other => {
                tracing::trace!(field = other, "Ignoring unsupported SSE field");
            }
        }
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new(DiagnosticLog::new())
    }
}

/// Decode the structured payload of a data event.
///
/// Failures are recorded as diagnostics and yield `None`; they never reach the caller
/// as errors.
pub fn decode_payload<T: DeserializeOwned>(event: &StreamEvent, diagnostics: &DiagnosticLog) -> Option<T> {
    match serde_json::from_str::<T>(&event.payload) {
        Ok(value) => Some(value),
        Err(e) => {
            diagnostics.record(
                DiagnosticKind::MalformedPayload,
                e.to_string(),
                &event.payload,
                event.event_name.as_deref(),
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StreamEventKind;

    fn parse_all(chunks: &[&[u8]]) -> Vec<StreamEvent> {
        let mut parser = SseParser::default();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(parser.feed(chunk));
        }
        events.extend(parser.finish());
        events
    }

    #[test]
    fn test_data_line() {
        let events = parse_all(&[b"data: {\"type\":\"chunk\"}\n\n"]);
        assert_eq!(events, vec![StreamEvent::data("{\"type\":\"chunk\"}", None)]);
    }

    #[test]
    fn test_done_marker_is_not_data() {
        let events = parse_all(&[b"data: [DONE]\n"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, StreamEventKind::Done);
    }

    #[test]
    fn test_event_name_applies_to_following_data() {
        let events = parse_all(&[b"event: job_progress\ndata: {\"jobId\":\"j1\"}\n\ndata: plain\n"]);
        assert_eq!(events[0], StreamEvent::named("job_progress"));
        assert_eq!(events[1].event_name.as_deref(), Some("job_progress"));
        // The blank line ended the block, so the name does not leak.
        assert_eq!(events[2].event_name, None);
    }

    #[test]
    fn test_comment_and_blank_lines() {
        let events = parse_all(&[b": keep-alive\n\n\n"]);
        assert_eq!(events, vec![StreamEvent::comment("keep-alive")]);
    }

    #[test]
    fn test_retry_directive() {
        let events = parse_all(&[b"retry: 2500\n"]);
        assert_eq!(events[0].retry_delay(), Some(std::time::Duration::from_millis(2500)));
    }

    #[test]
    fn test_invalid_retry_is_diagnostic() {
        let mut parser = SseParser::default();
        let events = parser.feed(b"retry: soon\n");
        assert!(events.is_empty());
        assert_eq!(parser.diagnostics().last().unwrap().kind, DiagnosticKind::InvalidRetry);
    }

    #[test]
    fn test_data_without_space_and_unknown_fields() {
        let events = parse_all(&[b"id: 7\ndata:compact\n"]);
        assert_eq!(events, vec![StreamEvent::data("compact", None)]);
    }

    #[test]
    fn test_line_split_across_chunks_matches_single_chunk() {
        let whole: &[u8] = b"event: job_update\ndata: {\"jobId\":\"a\",\"progress\":10}\n\n";
        let expected = parse_all(&[whole]);

        for split in 1..whole.len() {
            let (a, b) = whole.split_at(split);
            assert_eq!(parse_all(&[a, b]), expected, "split at {}", split);
        }

        let bytewise: Vec<&[u8]> = whole.chunks(1).collect();
        assert_eq!(parse_all(&bytewise), expected);
    }

    #[test]
    fn test_trailing_line_flushed_on_finish() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b"data: tail").is_empty());
        assert_eq!(parser.buffered(), 10);
        assert_eq!(parser.finish(), vec![StreamEvent::data("tail", None)]);
    }

    #[test]
    fn test_oversized_line_is_dropped_with_diagnostic() {
        let mut parser = SseParser::default();
        let mut runaway = b"data: ".to_vec();
        runaway.resize(crate::buffer::DEFAULT_MAX_LINE + 1, b'x');

        assert!(parser.feed(&runaway).is_empty());
        assert_eq!(parser.buffered(), 0);
        let last = parser.diagnostics().last().unwrap();
        assert_eq!(last.kind, DiagnosticKind::LineTooLong);
        assert!(last.excerpt.starts_with("data: xxx"));

        assert!(parser.feed(b"xxxx\n").is_empty());
        assert_eq!(parser.feed(b"data: next\n"), vec![StreamEvent::data("next", None)]);
    }

    #[test]
    fn test_decode_payload_failure_is_recorded() {
        let log = DiagnosticLog::new();
        let event = StreamEvent::data("not-json", Some("job_progress".to_string()));
        let decoded: Option<serde_json::Value> = decode_payload(&event, &log);
        assert!(decoded.is_none());
        let last = log.last().unwrap();
        assert_eq!(last.kind, DiagnosticKind::MalformedPayload);
        assert_eq!(last.excerpt, "not-json");
        assert_eq!(last.event_name.as_deref(), Some("job_progress"));
    }
}
