use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const DEFAULT_CAPACITY: usize = 64;
const EXCERPT_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    InvalidUtf8,
    InvalidRetry,
    MalformedPayload,
    LineTooLong,
}

/// Record of one protocol line or payload that was dropped
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub reason: String,
    pub excerpt: String,
    pub event_name: Option<String>,
    pub at: DateTime<Utc>,
}

struct Ring {
    entries: VecDeque<Diagnostic>,
    capacity: usize,
    total: u64,
}

/// Shared, bounded log of decode diagnostics
///
/// Decode failures never propagate past the parser. They are logged here and
/// through `tracing`, and the stream carries on.
#[derive(Clone)]
pub struct DiagnosticLog {
    ring: Arc<Mutex<Ring>>,
}

impl DiagnosticLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: Arc::new(Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                total: 0,
            })),
        }
    }

    pub fn record(
        &self,
        kind: DiagnosticKind,
        reason: impl Into<String>,
        raw: &str,
        event_name: Option<&str>,
    ) {
        let diagnostic = Diagnostic {
            kind,
            reason: reason.into(),
            excerpt: excerpt(raw),
            event_name: event_name.map(str::to_string),
            at: Utc::now(),
        };

        tracing::warn!(
            kind = ?diagnostic.kind,
            event = diagnostic.event_name.as_deref().unwrap_or(""),
            excerpt = %diagnostic.excerpt,
            "Dropped stream payload: {}",
            diagnostic.reason
        );

        let mut ring = self.lock();
        if ring.entries.len() == ring.capacity {
            ring.entries.pop_front();
        }
        ring.entries.push_back(diagnostic);
        ring.total += 1;
    }

    /// Retained diagnostics, oldest first
    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<Diagnostic> {
        self.lock().entries.back().cloned()
    }

    /// Number of diagnostics ever recorded, including evicted ones
    pub fn total(&self) -> u64 {
        self.lock().total
    }

    pub fn is_empty(&self) -> bool {
        self.lock().total == 0
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DiagnosticLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DiagnosticLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticLog")
            .field("total", &self.total())
            .finish()
    }
}

fn excerpt(raw: &str) -> String {
    if raw.chars().count() <= EXCERPT_CHARS {
        return raw.to_string();
    }
    let mut cut: String = raw.chars().take(EXCERPT_CHARS).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let log = DiagnosticLog::new();
        assert!(log.is_empty());

        log.record(DiagnosticKind::MalformedPayload, "expected value", "not-json", None);

        let last = log.last().unwrap();
        assert_eq!(last.kind, DiagnosticKind::MalformedPayload);
        assert_eq!(last.excerpt, "not-json");
        assert_eq!(log.total(), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let log = DiagnosticLog::with_capacity(2);
        for i in 0..3 {
            log.record(DiagnosticKind::InvalidRetry, "bad", &format!("retry: x{}", i), None);
        }
        let entries = log.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].excerpt, "retry: x1");
        assert_eq!(log.total(), 3);
    }

    #[test]
    fn test_long_payload_is_truncated() {
        let log = DiagnosticLog::new();
        let raw = "x".repeat(500);
        log.record(DiagnosticKind::MalformedPayload, "too long", &raw, Some("job_update"));
        let last = log.last().unwrap();
        assert_eq!(last.excerpt.chars().count(), EXCERPT_CHARS + 1);
        assert_eq!(last.event_name.as_deref(), Some("job_update"));
    }
}
