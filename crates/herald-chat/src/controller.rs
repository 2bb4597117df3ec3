//! Chat turns driven by a fragment stream.
//!
//! `send_message` appends the user message and an empty assistant placeholder,
//! opens one [`ReconnectingStream`] for the turn and writes every fragment into
//! the placeholder until the turn completes, fails or is stopped. At most one
//! turn runs per conversation.

use herald_stream::{
    decode_payload, CancellationToken, DiagnosticKind, DiagnosticLog, ReconnectPolicy, ReconnectingStream,
    SessionEvent, StreamEvent, StreamEventKind, StreamRequest, StreamTransport,
};
use herald_types::{ChatFragment, ConnectionState, FragmentType, JobEvent, JobEventSink, Message};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use crate::accumulator::TurnAccumulator;
use crate::credentials::{CredentialProvider, NoCredentials};
use crate::error::{ChatError, Result};
use crate::store::{ConversationStore, ConversationUpdate};

#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Endpoint the turn is POSTed to, resolved against the transport's base URL
    pub endpoint: String,
    pub policy: ReconnectPolicy,
}

impl ChatConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint: "/api/chat/stream".to_string(),
            policy: ReconnectPolicy::new().with_max_retries(2),
        }
    }
}

/// How a turn that did not fail ended
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The assistant message holds its final content
    Completed(Message),
    /// Ended by `stop_streaming`; carries the partial message when one was kept
    Stopped(Option<Message>),
}

struct ActiveTurn {
    cancel: CancellationToken,
    placeholder_id: String,
    stream: Arc<ReconnectingStream>,
}

struct TurnContext {
    conversation_id: String,
    placeholder_id: String,
    cancel: CancellationToken,
    accumulator: TurnAccumulator,
}

/// Releases the turn if `send_message` is dropped while it is being driven
struct TurnGuard<'a> {
    controller: &'a ChatStreamController,
    conversation_id: String,
    placeholder_id: String,
    armed: bool,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.controller.abandon_turn(&self.conversation_id, &self.placeholder_id);
        }
    }
}

#[derive(Clone)]
pub struct ChatStreamController {
    transport: Arc<dyn StreamTransport>,
    store: ConversationStore,
    config: ChatConfig,
    credentials: Arc<dyn CredentialProvider>,
    job_sink: Option<Arc<dyn JobEventSink>>,
    diagnostics: DiagnosticLog,
    turns: Arc<Mutex<HashMap<String, ActiveTurn>>>,
    last_states: Arc<Mutex<HashMap<String, ConnectionState>>>,
}

impl ChatStreamController {
    pub fn new(transport: Arc<dyn StreamTransport>, store: ConversationStore, config: ChatConfig) -> Self {
        Self {
            transport,
            store,
            config,
            credentials: Arc::new(NoCredentials),
            job_sink: None,
            diagnostics: DiagnosticLog::new(),
            turns: Arc::new(Mutex::new(HashMap::new())),
            last_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Forward `job_*` events that arrive on chat streams
    pub fn with_job_sink(mut self, sink: Arc<dyn JobEventSink>) -> Self {
        self.job_sink = Some(sink);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: DiagnosticLog) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    /// Send `text` and stream the assistant's answer into a placeholder message.
    ///
    /// Fails with [`ChatError::StreamActive`] before touching the conversation
    /// when a turn is already running for it. On `Err` the placeholder has been
    /// removed; the user message stays.
    pub async fn send_message(&self, conversation_id: &str, text: &str) -> Result<TurnOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let (stream, mut events, mut turn) = self.begin_turn(conversation_id, text)?;
        let mut guard = TurnGuard {
            controller: self,
            conversation_id: turn.conversation_id.clone(),
            placeholder_id: turn.placeholder_id.clone(),
            armed: true,
        };
        let result = self.drive(&mut events, &mut turn).await;
        guard.armed = false;
        drop(guard);

        let state = match stream.connection_state() {
            ConnectionState::Error => ConnectionState::Error,
            _ => ConnectionState::Disconnected,
        };
        stream.disconnect();
        self.end_turn(&turn, state);

        if let Err(err) = &result {
            tracing::warn!(conversation_id = %conversation_id, error = %err, "Chat turn failed");
        }
        result
    }

    /// Stop the running turn of a conversation.
    ///
    /// The transport is closed and the state reads `Disconnected` when this
    /// returns. A placeholder with partial content is kept and returned; an
    /// empty one is removed. Returns `None` when nothing was kept or no turn
    /// was running.
    pub fn stop_streaming(&self, conversation_id: &str) -> Option<Message> {
        let turn = self.lock_turns().remove(conversation_id)?;
        let kept = self.release_turn(conversation_id, turn);
        tracing::info!(conversation_id = %conversation_id, kept_partial = kept.is_some(), "Chat turn stopped");
        kept
    }

    /// Release a turn whose `send_message` future was dropped before it finished
    fn abandon_turn(&self, conversation_id: &str, placeholder_id: &str) {
        let turn = {
            let mut turns = self.lock_turns();
            let owned = turns
                .get(conversation_id)
                .map_or(false, |active| active.placeholder_id == placeholder_id);
            if !owned {
                return;
            }
            turns.remove(conversation_id)
        };
        if let Some(turn) = turn {
            let kept = self.release_turn(conversation_id, turn);
            tracing::info!(conversation_id = %conversation_id, kept_partial = kept.is_some(), "Chat turn abandoned");
        }
    }

    /// Close the turn's stream, then keep a placeholder with content or remove an empty one
    fn release_turn(&self, conversation_id: &str, turn: ActiveTurn) -> Option<Message> {
        turn.cancel.cancel();
        turn.stream.disconnect();
        self.lock_states()
            .insert(conversation_id.to_string(), ConnectionState::Disconnected);

        let placeholder_id = turn.placeholder_id.as_str();
        let (kept, removed) = self
            .store
            .update(conversation_id, |c| {
                let has_content = c.message(placeholder_id).map(|m| !m.content.is_empty());
                match has_content {
                    Some(true) => {
                        c.update_message(placeholder_id, |m| m.is_streaming = false);
                        (c.message(placeholder_id).cloned(), false)
                    }
                    Some(false) => (None, c.remove_message(placeholder_id).is_some()),
                    None => (None, false),
                }
            })
            .unwrap_or((None, false));

        if kept.is_some() {
            self.notify_message(conversation_id, placeholder_id, MessageChange::Updated);
        } else if removed {
            self.notify_message(conversation_id, placeholder_id, MessageChange::Removed);
        }
        kept
    }

    /// Stop every running turn
    pub fn shutdown(&self) {
        let active: Vec<String> = self.lock_turns().keys().cloned().collect();
        for conversation_id in active {
            self.stop_streaming(&conversation_id);
        }
    }

    pub fn connection_state(&self, conversation_id: &str) -> ConnectionState {
        if let Some(turn) = self.lock_turns().get(conversation_id) {
            return turn.stream.connection_state();
        }
        self.lock_states()
            .get(conversation_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.lock_turns().contains_key(conversation_id)
    }

    fn begin_turn(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<(Arc<ReconnectingStream>, mpsc::UnboundedReceiver<SessionEvent>, TurnContext)> {
        let mut turns = self.lock_turns();
        if turns.contains_key(conversation_id) {
            return Err(ChatError::StreamActive(conversation_id.to_string()));
        }

        let user = Message::user(text);
        let placeholder = Message::assistant_placeholder();
        let user_id = user.id.clone();
        let placeholder_id = placeholder.id.clone();

        self.store
            .update(conversation_id, |c| {
                c.push(user);
                c.push(placeholder);
            })
            .ok_or_else(|| ChatError::ConversationNotFound(conversation_id.to_string()))?;
        self.notify_message(conversation_id, &user_id, MessageChange::Added);
        self.notify_message(conversation_id, &placeholder_id, MessageChange::Added);

        let (stream, events) = ReconnectingStream::new(
            Arc::clone(&self.transport),
            self.build_request(conversation_id, text),
            self.config.policy.clone(),
        );
        let stream = Arc::new(stream.with_diagnostics(self.diagnostics.clone()));
        let cancel = CancellationToken::new();

        turns.insert(
            conversation_id.to_string(),
            ActiveTurn {
                cancel: cancel.clone(),
                placeholder_id: placeholder_id.clone(),
                stream: Arc::clone(&stream),
            },
        );
        drop(turns);

        stream.connect();
        tracing::debug!(conversation_id = %conversation_id, placeholder_id = %placeholder_id, "Chat turn started");

        let turn = TurnContext {
            conversation_id: conversation_id.to_string(),
            placeholder_id,
            cancel,
            accumulator: TurnAccumulator::new(),
        };
        Ok((stream, events, turn))
    }

    fn build_request(&self, conversation_id: &str, text: &str) -> StreamRequest {
        let body = json!({
            "message": text,
            "conversation_id": conversation_id,
        });
        let request = StreamRequest::post(self.config.endpoint.clone(), body);
        match self.credentials.bearer_token() {
            Some(token) => request.bearer(&token),
            None => request,
        }
    }

    async fn drive(
        &self,
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
        turn: &mut TurnContext,
    ) -> Result<TurnOutcome> {
        loop {
            let event = tokio::select! {
                biased;
                _ = turn.cancel.cancelled() => return Ok(self.stopped_outcome(turn)),
                event = events.recv() => event,
            };

            match event {
                Some(SessionEvent::Event(event)) => {
                    if let Some(outcome) = self.handle_event(&event, turn)? {
                        return Ok(outcome);
                    }
                }
                Some(SessionEvent::Retrying { attempt, delay, error }) => {
                    tracing::warn!(
                        conversation_id = %turn.conversation_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Chat stream dropped, re-issuing turn"
                    );
                    if !self.restart_turn(turn) {
                        return Ok(self.stopped_outcome(turn));
                    }
                }
                Some(SessionEvent::Closed) | None => return self.finish_on_close(turn),
                Some(SessionEvent::Failed(error)) => {
                    self.discard_placeholder(turn);
                    return Err(ChatError::Transport(error));
                }
            }
        }
    }

    fn handle_event(&self, event: &StreamEvent, turn: &mut TurnContext) -> Result<Option<TurnOutcome>> {
        match event.kind {
            StreamEventKind::Data => {}
            StreamEventKind::Done => return self.complete(turn, None).map(Some),
            StreamEventKind::NamedEvent | StreamEventKind::RetryDirective | StreamEventKind::Comment => {
                return Ok(None)
            }
        }

        if let Some(name) = event.event_name.as_deref() {
            if JobEvent::is_job_event_name(name) {
                self.forward_job_event(name, event);
                return Ok(None);
            }
        }

        let Some(fragment) = decode_payload::<ChatFragment>(event, &self.diagnostics) else {
            return Ok(None);
        };

        match fragment.fragment_type {
            FragmentType::Chunk => {
                if self.apply_chunk(turn, &fragment.content) {
                    Ok(None)
                } else {
                    Ok(Some(self.stopped_outcome(turn)))
                }
            }
            FragmentType::Complete => self.complete(turn, Some(fragment)).map(Some),
            FragmentType::Error => {
                self.discard_placeholder(turn);
                let reason = if fragment.content.is_empty() {
                    "unknown error".to_string()
                } else {
                    fragment.content
                };
                Err(ChatError::Application(reason))
            }
        }
    }

    /// Returns `false` when the turn was stopped or its placeholder is gone
    fn apply_chunk(&self, turn: &mut TurnContext, content: &str) -> bool {
        let TurnContext {
            conversation_id,
            placeholder_id,
            cancel,
            accumulator,
        } = turn;

        let applied = self
            .store
            .update(conversation_id.as_str(), |c| {
                if cancel.is_cancelled() {
                    return false;
                }
                accumulator.push(content);
                let text = accumulator.content();
                c.update_message(placeholder_id.as_str(), |m| m.content = text.to_string())
            })
            .unwrap_or(false);

        if applied {
            self.notify_message(conversation_id, placeholder_id, MessageChange::Updated);
        }
        applied
    }

    fn complete(&self, turn: &mut TurnContext, fragment: Option<ChatFragment>) -> Result<TurnOutcome> {
        let final_content = fragment
            .as_ref()
            .and_then(ChatFragment::final_content)
            .map(str::to_string);
        let metadata = fragment.and_then(|f| f.metadata);
        let fragments = turn.accumulator.fragments();
        let duration_ms = turn.accumulator.duration_ms();
        let content = turn.accumulator.finalize(final_content.as_deref());

        let cancel = &turn.cancel;
        let placeholder_id = turn.placeholder_id.as_str();
        let finished = self
            .store
            .update(&turn.conversation_id, |c| {
                if cancel.is_cancelled() {
                    return None;
                }
                c.update_message(placeholder_id, |m| {
                    m.content = content;
                    m.is_streaming = false;
                    if metadata.is_some() {
                        m.metadata = metadata;
                    }
                });
                c.message(placeholder_id).cloned()
            })
            .flatten();

        match finished {
            Some(message) => {
                self.notify_message(&turn.conversation_id, placeholder_id, MessageChange::Updated);
                tracing::info!(
                    conversation_id = %turn.conversation_id,
                    fragments,
                    duration_ms = duration_ms.unwrap_or(0),
                    "Chat turn completed"
                );
                Ok(TurnOutcome::Completed(message))
            }
            None => Ok(self.stopped_outcome(turn)),
        }
    }

    fn finish_on_close(&self, turn: &mut TurnContext) -> Result<TurnOutcome> {
        if turn.cancel.is_cancelled() {
            return Ok(self.stopped_outcome(turn));
        }
        if turn.accumulator.is_empty() {
            self.discard_placeholder(turn);
            return Err(ChatError::Closed);
        }
        self.complete(turn, None)
    }

    /// A re-issued request is a new logical turn: drop what the lost one wrote
    fn restart_turn(&self, turn: &mut TurnContext) -> bool {
        let TurnContext {
            conversation_id,
            placeholder_id,
            cancel,
            accumulator,
        } = turn;

        let reset = self
            .store
            .update(conversation_id.as_str(), |c| {
                if cancel.is_cancelled() {
                    return false;
                }
                accumulator.reset();
                c.update_message(placeholder_id.as_str(), |m| {
                    m.content.clear();
                    m.is_streaming = true;
                })
            })
            .unwrap_or(false);

        if reset {
            self.notify_message(conversation_id, placeholder_id, MessageChange::Updated);
        }
        reset
    }

    fn discard_placeholder(&self, turn: &TurnContext) {
        let cancel = &turn.cancel;
        let placeholder_id = turn.placeholder_id.as_str();
        let removed = self
            .store
            .update(&turn.conversation_id, |c| {
                !cancel.is_cancelled() && c.remove_message(placeholder_id).is_some()
            })
            .unwrap_or(false);

        if removed {
            self.notify_message(&turn.conversation_id, placeholder_id, MessageChange::Removed);
        }
    }

    fn stopped_outcome(&self, turn: &TurnContext) -> TurnOutcome {
        let kept = self
            .store
            .message(&turn.conversation_id, &turn.placeholder_id)
            .filter(|m| !m.is_streaming);
        TurnOutcome::Stopped(kept)
    }

    fn end_turn(&self, turn: &TurnContext, state: ConnectionState) {
        let mut turns = self.lock_turns();
        let owned = turns
            .get(&turn.conversation_id)
            .map_or(false, |active| active.placeholder_id == turn.placeholder_id);
        if !owned {
            // stop_streaming already released it
            return;
        }
        turns.remove(&turn.conversation_id);
        drop(turns);
        self.lock_states().insert(turn.conversation_id.clone(), state);
    }

    fn forward_job_event(&self, name: &str, event: &StreamEvent) {
        let Some(sink) = &self.job_sink else {
            tracing::debug!(event = name, "Job event on chat stream ignored, no sink attached");
            return;
        };

        match JobEvent::decode(Some(name), &event.payload) {
            Ok(Some(job_event)) => sink.dispatch(job_event),
            Ok(None) => tracing::debug!(event = name, "Unrecognised job event on chat stream"),
            Err(err) => self.diagnostics.record(
                DiagnosticKind::MalformedPayload,
                err.to_string(),
                &event.payload,
                Some(name),
            ),
        }
    }

    fn notify_message(&self, conversation_id: &str, message_id: &str, change: MessageChange) {
        let conversation_id = conversation_id.to_string();
        let message_id = message_id.to_string();
        self.store.notify(match change {
            MessageChange::Added => ConversationUpdate::MessageAdded { conversation_id, message_id },
            MessageChange::Updated => ConversationUpdate::MessageUpdated { conversation_id, message_id },
            MessageChange::Removed => ConversationUpdate::MessageRemoved { conversation_id, message_id },
        });
    }

    fn lock_turns(&self) -> MutexGuard<'_, HashMap<String, ActiveTurn>> {
        self.turns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_states(&self) -> MutexGuard<'_, HashMap<String, ConnectionState>> {
        self.last_states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Copy)]
enum MessageChange {
    Added,
    Updated,
    Removed,
}
