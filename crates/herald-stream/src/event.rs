use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEventKind {
    Data,
    NamedEvent,
    RetryDirective,
    Comment,
    /// Synthetic completion produced by `data: [DONE]`
    Done,
}

/// One classified protocol line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    /// For data events: the name set by the latest `event:` line of the same block
    pub event_name: Option<String>,
    pub payload: String,
}

impl StreamEvent {
    pub fn data(payload: impl Into<String>, event_name: Option<String>) -> Self {
        Self {
            kind: StreamEventKind::Data,
            event_name,
            payload: payload.into(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            kind: StreamEventKind::NamedEvent,
            event_name: Some(name.into()),
            payload: String::new(),
        }
    }

    pub fn retry(millis: u64) -> Self {
        Self {
            kind: StreamEventKind::RetryDirective,
            event_name: None,
            payload: millis.to_string(),
        }
    }

    pub fn comment(text: impl Into<String>) -> Self {
        Self {
            kind: StreamEventKind::Comment,
            event_name: None,
            payload: text.into(),
        }
    }

    pub fn done() -> Self {
        Self {
            kind: StreamEventKind::Done,
            event_name: None,
            payload: String::new(),
        }
    }

    pub fn is_data(&self) -> bool {
        self.kind == StreamEventKind::Data
    }

    /// Suggested reconnection delay carried by a `retry:` line
    pub fn retry_delay(&self) -> Option<Duration> {
        if self.kind != StreamEventKind::RetryDirective {
            return None;
        }
        self.payload.parse::<u64>().ok().map(Duration::from_millis)
    }
}
