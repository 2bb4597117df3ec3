use futures::StreamExt;
use herald_types::ConnectionState;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::diagnostics::DiagnosticLog;
use crate::error::StreamError;
use crate::event::{StreamEvent, StreamEventKind};
use crate::parser::SseParser;
use crate::transport::{StreamRequest, StreamTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Always wait the base delay
    Fixed,
    /// base × attempt
    Linear,
    /// base × 2^(attempt - 1)
    Exponential,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Linear
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Automatic retries after a failed attempt (0 = never retry)
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    /// Bound on waiting for the first byte of a new connection
    pub connect_timeout: Duration,
    /// Reconnect when the server ends the stream cleanly
    pub retry_on_close: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Linear,
            connect_timeout: Duration::from_secs(10),
            retry_on_close: false,
        }
    }
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_retry_on_close(mut self, enabled: bool) -> Self {
        self.retry_on_close = enabled;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// `recommended` is the last `retry:` directive of the stream and replaces
    /// the configured base delay.
    pub fn delay_for(&self, attempt: u32, recommended: Option<Duration>) -> Duration {
        let base = recommended.unwrap_or(self.base_delay);
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Linear => base.saturating_mul(attempt),
            Backoff::Exponential => base.saturating_mul(1u32 << (attempt - 1).min(16)),
        };
        delay.min(self.max_delay)
    }
}

/// Phase of the reconnection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
    /// Retry budget spent; only a manual `connect()` starts again
    Exhausted,
}

impl ReconnectPhase {
    pub fn connection_state(self) -> ConnectionState {
        match self {
            Self::Idle | Self::Disconnected => ConnectionState::Disconnected,
            Self::Connecting => ConnectionState::Connecting,
            Self::Connected => ConnectionState::Connected,
            Self::Error | Self::Exhausted => ConnectionState::Error,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exhausted)
    }
}

/// What a [`ReconnectingStream`] delivers to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Event(StreamEvent),
    /// An attempt failed; the next one starts after `delay`
    Retrying {
        attempt: u32,
        delay: Duration,
        error: StreamError,
    },
    /// The server ended the stream and the policy does not reconnect on close
    Closed,
    /// No further automatic attempts will be made
    Failed(StreamError),
}

struct Inner {
    generation: u64,
    active: bool,
    retry_count: u32,
    recommended_delay: Option<Duration>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    inner: Mutex<Inner>,
    phase: watch::Sender<ReconnectPhase>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Every write from a worker is checked against its generation under the
    // lock, so nothing from a cancelled attempt lands after `disconnect()`.

    fn set_phase(&self, generation: u64, phase: ReconnectPhase) -> bool {
        let inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        self.phase.send_replace(phase);
        true
    }

    fn emit(&self, generation: u64, event: SessionEvent) -> bool {
        let inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        self.events.send(event).is_ok()
    }

    fn mark_connected(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        inner.retry_count = 0;
        self.phase.send_replace(ReconnectPhase::Connected);
        true
    }

    fn set_recommended_delay(&self, generation: u64, delay: Duration) {
        let mut inner = self.lock();
        if inner.generation == generation {
            inner.recommended_delay = Some(delay);
        }
    }

    /// Claim the next retry, or report how many consecutive attempts failed
    fn next_retry(&self, generation: u64, max_retries: u32) -> Option<Result<(u32, Option<Duration>), u32>> {
        let mut inner = self.lock();
        if inner.generation != generation {
            return None;
        }
        if inner.retry_count >= max_retries {
            return Some(Err(inner.retry_count + 1));
        }
        inner.retry_count += 1;
        Some(Ok((inner.retry_count, inner.recommended_delay)))
    }

    fn finish(&self, generation: u64, phase: ReconnectPhase, last: Option<SessionEvent>) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.active = false;
        inner.cancel = None;
        inner.task = None;
        self.phase.send_replace(phase);
        if let Some(event) = last {
            let _ = self.events.send(event);
        }
    }
}

/// Stream transport + parser wrapped in bounded retry-with-backoff
///
/// Owns at most one open connection and one pending retry timer; both are
/// released by [`disconnect`](Self::disconnect) and on drop.
pub struct ReconnectingStream {
    transport: Arc<dyn StreamTransport>,
    request: StreamRequest,
    policy: ReconnectPolicy,
    diagnostics: DiagnosticLog,
    shared: Arc<Shared>,
}

impl ReconnectingStream {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        request: StreamRequest,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (phase_tx, _) = watch::channel(ReconnectPhase::Idle);

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                generation: 0,
                active: false,
                retry_count: 0,
                recommended_delay: None,
                cancel: None,
                task: None,
            }),
            phase: phase_tx,
            events: events_tx,
        });

        let stream = Self {
            transport,
            request,
            policy,
            diagnostics: DiagnosticLog::new(),
            shared,
        };
        (stream, events_rx)
    }

    /// Share a diagnostics log with other components
    pub fn with_diagnostics(mut self, diagnostics: DiagnosticLog) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Start connecting. No-op (returns `false`) while an attempt, a live
    /// connection or a pending retry already exists.
    pub fn connect(&self) -> bool {
        let mut inner = self.shared.lock();
        if inner.active {
            tracing::debug!(endpoint = %self.request.endpoint, "connect() ignored, stream already active");
            return false;
        }

        inner.generation += 1;
        inner.active = true;
        inner.retry_count = 0;
        let generation = inner.generation;
        let cancel = CancellationToken::new();
        inner.cancel = Some(cancel.clone());
        self.shared.phase.send_replace(ReconnectPhase::Connecting);

        let worker = Worker {
            transport: Arc::clone(&self.transport),
            request: self.request.clone(),
            policy: self.policy.clone(),
            diagnostics: self.diagnostics.clone(),
            shared: Arc::clone(&self.shared),
        };
        inner.task = Some(tokio::spawn(worker.run(generation, cancel)));
        true
    }

    /// Cancel any in-flight attempt or retry timer and reset the retry counter.
    /// The phase is `Disconnected` when this returns.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        inner.generation += 1;
        inner.active = false;
        inner.retry_count = 0;
        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        self.shared.phase.send_replace(ReconnectPhase::Disconnected);
    }

    /// Manual reconnect: tear down whatever is running and start over
    pub fn reconnect(&self) -> bool {
        self.disconnect();
        self.connect()
    }

    pub fn phase(&self) -> ReconnectPhase {
        *self.shared.phase.borrow()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.phase().connection_state()
    }

    /// Watch phase transitions; the receiver starts at the current phase
    pub fn subscribe(&self) -> watch::Receiver<ReconnectPhase> {
        self.shared.phase.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.shared.lock().active
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.lock().retry_count
    }

    /// Last delay suggested by the server through `retry:`
    pub fn recommended_delay(&self) -> Option<Duration> {
        self.shared.lock().recommended_delay
    }

    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    pub fn request(&self) -> &StreamRequest {
        &self.request
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}

impl Drop for ReconnectingStream {
    fn drop(&mut self) {
        self.disconnect();
    }
}

enum Attempt {
    Closed,
    Cancelled,
    Failed(StreamError),
}

struct Worker {
    transport: Arc<dyn StreamTransport>,
    request: StreamRequest,
    policy: ReconnectPolicy,
    diagnostics: DiagnosticLog,
    shared: Arc<Shared>,
}

impl Worker {
    async fn run(self, generation: u64, cancel: CancellationToken) {
        let mut parser = SseParser::new(self.diagnostics.clone());

        loop {
            parser.reset();
            let error = match self.attempt(generation, &cancel, &mut parser).await {
                Attempt::Cancelled => {
                    self.shared.finish(generation, ReconnectPhase::Disconnected, None);
                    return;
                }
                Attempt::Closed if !self.policy.retry_on_close => {
                    tracing::debug!(endpoint = %self.request.endpoint, "Stream closed by server");
                    self.shared.finish(generation, ReconnectPhase::Disconnected, Some(SessionEvent::Closed));
                    return;
                }
                Attempt::Closed => StreamError::Transport("stream closed by server".to_string()),
                Attempt::Failed(error) => error,
            };

            if !self.shared.set_phase(generation, ReconnectPhase::Error) {
                return;
            }

            if !error.is_retryable() {
                tracing::error!(endpoint = %self.request.endpoint, "Stream failed: {}", error);
                self.shared.finish(generation, ReconnectPhase::Exhausted, Some(SessionEvent::Failed(error)));
                return;
            }

            let (attempt, recommended) = match self.shared.next_retry(generation, self.policy.max_retries) {
                None => return,
                Some(Ok(next)) => next,
                Some(Err(attempts)) => {
                    tracing::error!(
                        endpoint = %self.request.endpoint,
                        attempts,
                        "Retry budget exhausted: {}",
                        error
                    );
                    let exhausted = StreamError::Exhausted {
                        attempts,
                        last: Box::new(error),
                    };
                    self.shared.finish(generation, ReconnectPhase::Exhausted, Some(SessionEvent::Failed(exhausted)));
                    return;
                }
            };

            let delay = self.policy.delay_for(attempt, recommended);
            tracing::warn!(
                endpoint = %self.request.endpoint,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Stream attempt failed, retrying: {}",
                error
            );
            if !self.shared.emit(generation, SessionEvent::Retrying { attempt, delay, error }) {
                return;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            if !self.shared.set_phase(generation, ReconnectPhase::Connecting) {
                return;
            }
        }
    }

    async fn attempt(&self, generation: u64, cancel: &CancellationToken, parser: &mut SseParser) -> Attempt {
        let timeout = self.policy.connect_timeout;
        let deadline = Instant::now() + timeout;

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Attempt::Cancelled,
            opened = tokio::time::timeout_at(deadline, self.transport.open(&self.request, cancel.child_token())) => opened,
        };
        let mut chunks = match opened {
            Err(_) => return Attempt::Failed(StreamError::Timeout(timeout)),
            Ok(Err(StreamError::Cancelled)) => return Attempt::Cancelled,
            Ok(Err(error)) => return Attempt::Failed(error),
            Ok(Ok(chunks)) => chunks,
        };

        let mut connected = false;
        loop {
            let next = if connected {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Attempt::Cancelled,
                    next = chunks.next() => next,
                }
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Attempt::Cancelled,
                    next = tokio::time::timeout_at(deadline, chunks.next()) => match next {
                        Ok(next) => next,
                        Err(_) => return Attempt::Failed(StreamError::Timeout(timeout)),
                    },
                }
            };

            match next {
                None => {
                    for event in parser.finish() {
                        if !self.deliver(generation, event) {
                            return Attempt::Cancelled;
                        }
                    }
                    return Attempt::Closed;
                }
                Some(Err(StreamError::Cancelled)) => return Attempt::Cancelled,
                Some(Err(error)) => return Attempt::Failed(error),
                Some(Ok(bytes)) => {
                    if !connected {
                        if !self.shared.mark_connected(generation) {
                            return Attempt::Cancelled;
                        }
                        connected = true;
                        tracing::debug!(endpoint = %self.request.endpoint, "Stream connected");
                    }
                    for event in parser.feed(&bytes) {
                        if !self.deliver(generation, event) {
                            return Attempt::Cancelled;
                        }
                    }
                }
            }
        }
    }

    fn deliver(&self, generation: u64, event: StreamEvent) -> bool {
        if event.kind == StreamEventKind::RetryDirective {
            if let Some(delay) = event.retry_delay() {
                self.shared.set_recommended_delay(generation, delay);
            }
        }
        self.shared.emit(generation, SessionEvent::Event(event))
    }
}
