use herald_stream::{
    CancellationToken, DiagnosticKind, DiagnosticLog, ReconnectPhase, ReconnectPolicy, ReconnectingStream,
    SessionEvent, StreamEvent, StreamEventKind, StreamRequest, StreamTransport,
};
use herald_types::{ConnectionState, JobEvent};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::store::JobStore;

#[derive(Debug, Clone)]
pub struct JobRouterConfig {
    pub endpoint: String,
    pub policy: ReconnectPolicy,
    pub bearer_token: Option<String>,
}

impl JobRouterConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// The job stream is meant to stay open, so a clean close always reconnects
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy.with_retry_on_close(true);
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

impl Default for JobRouterConfig {
    fn default() -> Self {
        Self {
            endpoint: "/api/jobs/events".to_string(),
            policy: ReconnectPolicy::new()
                .with_max_retries(5)
                .with_max_delay(Duration::from_secs(60))
                .with_retry_on_close(true),
            bearer_token: None,
        }
    }
}

struct Running {
    stream: ReconnectingStream,
    cancel: CancellationToken,
    consumer: JoinHandle<()>,
}

/// Long-lived job event subscription feeding a [`JobStore`].
///
/// Independent of any chat stream: it owns its own connection, retry budget
/// and cancellation token.
pub struct JobEventRouter {
    transport: Arc<dyn StreamTransport>,
    config: JobRouterConfig,
    store: JobStore,
    diagnostics: DiagnosticLog,
    running: Mutex<Option<Running>>,
}

impl JobEventRouter {
    pub fn new(transport: Arc<dyn StreamTransport>, store: JobStore, config: JobRouterConfig) -> Self {
        Self {
            transport,
            config,
            store,
            diagnostics: DiagnosticLog::new(),
            running: Mutex::new(None),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: DiagnosticLog) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    /// Open the subscription. Returns `false` if it is already running.
    pub fn start(&self) -> bool {
        let mut running = self.lock();
        if running.is_some() {
            return false;
        }

        let mut request = StreamRequest::get(self.config.endpoint.clone());
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer(token);
        }

        let policy = self.config.policy.clone().with_retry_on_close(true);
        let (stream, events) = ReconnectingStream::new(Arc::clone(&self.transport), request, policy);
        let stream = stream.with_diagnostics(self.diagnostics.clone());
        let cancel = CancellationToken::new();

        let consumer = tokio::spawn(consume(
            events,
            self.store.clone(),
            self.diagnostics.clone(),
            cancel.clone(),
        ));
        stream.connect();
        tracing::info!(endpoint = %self.config.endpoint, "Job event router started");

        *running = Some(Running {
            stream,
            cancel,
            consumer,
        });
        true
    }

    /// Close the subscription; the state reads `Disconnected` when this returns
    pub fn stop(&self) {
        let Some(running) = self.lock().take() else {
            return;
        };
        running.cancel.cancel();
        running.stream.disconnect();
        running.consumer.abort();
        tracing::info!(endpoint = %self.config.endpoint, "Job event router stopped");
    }

    /// Start over with a fresh retry budget, e.g. after the budget ran out
    pub fn reconnect(&self) -> bool {
        if let Some(running) = self.lock().as_ref() {
            return running.stream.reconnect();
        }
        self.start()
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock()
            .as_ref()
            .map(|running| running.stream.connection_state())
            .unwrap_or_default()
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.lock()
            .as_ref()
            .map(|running| running.stream.phase())
            .unwrap_or(ReconnectPhase::Idle)
    }

    /// Phase changes of the current subscription, if one is running
    pub fn subscribe_phase(&self) -> Option<watch::Receiver<ReconnectPhase>> {
        self.lock().as_ref().map(|running| running.stream.subscribe())
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for JobEventRouter {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn consume(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    store: JobStore,
    diagnostics: DiagnosticLog,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };

        match event {
            Some(SessionEvent::Event(event)) if event.kind == StreamEventKind::Data => {
                route(&event, &store, &diagnostics);
            }
            Some(SessionEvent::Event(_)) => {}
            Some(SessionEvent::Retrying { attempt, delay, .. }) => {
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Job stream reconnect scheduled");
            }
            Some(SessionEvent::Closed) => {
                tracing::debug!("Job stream closed");
            }
            Some(SessionEvent::Failed(error)) => {
                // stays idle until reconnect() or stop()
                tracing::error!("Job stream gave up: {}", error);
            }
            None => return,
        }
    }
}

fn route(event: &StreamEvent, store: &JobStore, diagnostics: &DiagnosticLog) {
    let name = event.event_name.as_deref();
    if let Some(name) = name {
        if !JobEvent::is_job_event_name(name) {
            tracing::trace!(event = name, "Ignoring non-job event");
            return;
        }
    }

    match JobEvent::decode(name, &event.payload) {
        Ok(Some(job_event)) => {
            tracing::debug!(job_id = job_event.job_id(), event = ?name, "Job event");
            store.apply(job_event);
        }
        Ok(None) => tracing::debug!(event = ?name, "Unrecognised job event"),
        Err(err) => diagnostics.record(DiagnosticKind::MalformedPayload, err.to_string(), &event.payload, name),
    }
}
