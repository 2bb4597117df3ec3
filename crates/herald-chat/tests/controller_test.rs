use herald_chat::{ChatConfig, ChatError, ChatStreamController, ConversationStore, StaticToken, TurnOutcome};
use herald_stream::testing::ScriptedTransport;
use herald_stream::{ReconnectPolicy, StreamError};
use herald_types::{ConnectionState, Conversation, JobEvent, JobEventSink, MessageRole};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn chunk(text: &str) -> String {
    format!("data: {{\"type\":\"chunk\",\"content\":\"{}\"}}\n\n", text)
}

fn complete(text: &str) -> String {
    format!("data: {{\"type\":\"complete\",\"content\":\"{}\"}}\n\n", text)
}

fn controller(transport: &ScriptedTransport) -> ChatStreamController {
    let store = ConversationStore::new();
    store.insert(Conversation::new("c1"));
    ChatStreamController::new(Arc::new(transport.clone()), store, ChatConfig::default())
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<JobEvent>>,
}

impl JobEventSink for CollectingSink {
    fn dispatch(&self, event: JobEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[tokio::test]
async fn test_chunks_accumulate_into_placeholder() {
    let transport = ScriptedTransport::new();
    transport.respond([chunk("Hel"), chunk("lo"), complete("")]);
    let chat = controller(&transport);

    let outcome = chat.send_message("c1", "hi").await.unwrap();

    let TurnOutcome::Completed(message) = outcome else {
        panic!("expected a completed turn");
    };
    assert_eq!(message.content, "Hello");
    assert!(!message.is_streaming);

    let conversation = chat.store().get("c1").unwrap();
    assert_eq!(conversation.messages.len(), 2);
    assert_eq!(conversation.messages[0].role, MessageRole::User);
    assert_eq!(conversation.messages[0].content, "hi");
    assert_eq!(conversation.messages[1].content, "Hello");
    assert!(conversation.streaming_message().is_none());
    assert_eq!(chat.connection_state("c1"), ConnectionState::Disconnected);
    assert!(!chat.is_streaming("c1"));
}

#[tokio::test]
async fn test_complete_content_replaces_accumulated_text() {
    let transport = ScriptedTransport::new();
    transport.respond([
        chunk("Hel"),
        "data: {\"type\":\"complete\",\"content\":\"Hello!\",\"metadata\":{\"model\":\"m-1\"}}\n\n".to_string(),
    ]);
    let chat = controller(&transport);

    let TurnOutcome::Completed(message) = chat.send_message("c1", "hi").await.unwrap() else {
        panic!("expected a completed turn");
    };
    assert_eq!(message.content, "Hello!");
    let metadata = message.metadata.unwrap();
    assert_eq!(metadata["model"], "m-1");
}

#[tokio::test]
async fn test_done_sentinel_finalizes_turn() {
    let transport = ScriptedTransport::new();
    transport.respond_then_hang([chunk("All done"), "data: [DONE]\n\n".to_string()]);
    let chat = controller(&transport);

    let TurnOutcome::Completed(message) = chat.send_message("c1", "hi").await.unwrap() else {
        panic!("expected a completed turn");
    };
    assert_eq!(message.content, "All done");
    assert!(!message.is_streaming);
}

#[tokio::test]
async fn test_error_fragment_removes_placeholder() {
    let transport = ScriptedTransport::new();
    transport.respond([
        chunk("Hel"),
        "data: {\"type\":\"error\",\"content\":\"rate limited\"}\n\n".to_string(),
    ]);
    let chat = controller(&transport);

    let err = chat.send_message("c1", "hi").await.unwrap_err();

    assert_eq!(err, ChatError::Application("rate limited".to_string()));
    assert!(err.is_retryable());
    let conversation = chat.store().get("c1").unwrap();
    assert_eq!(conversation.messages.len(), 1);
    assert_eq!(conversation.messages[0].role, MessageRole::User);
}

#[tokio::test]
async fn test_clean_close_finalizes_with_accumulated_text() {
    let transport = ScriptedTransport::new();
    transport.respond([chunk("Partial "), chunk("answer")]);
    let chat = controller(&transport);

    let TurnOutcome::Completed(message) = chat.send_message("c1", "hi").await.unwrap() else {
        panic!("expected a completed turn");
    };
    assert_eq!(message.content, "Partial answer");
}

#[tokio::test]
async fn test_close_without_content_removes_placeholder() {
    let transport = ScriptedTransport::new();
    transport.respond(Vec::<String>::new());
    let chat = controller(&transport);

    let err = chat.send_message("c1", "hi").await.unwrap_err();

    assert_eq!(err, ChatError::Closed);
    assert_eq!(chat.store().get("c1").unwrap().messages.len(), 1);
}

#[tokio::test]
async fn test_one_turn_per_conversation() {
    let transport = ScriptedTransport::new();
    let feed = transport.channel();
    let chat = controller(&transport);

    let first = tokio::spawn({
        let chat = chat.clone();
        async move { chat.send_message("c1", "first").await }
    });
    wait_until(|| chat.is_streaming("c1")).await;

    let err = chat.send_message("c1", "second").await.unwrap_err();
    assert_eq!(err, ChatError::StreamActive("c1".to_string()));
    assert_eq!(chat.store().get("c1").unwrap().messages.len(), 2);

    feed.send(Ok(complete("done").into_bytes())).unwrap();
    let outcome = first.await.unwrap().unwrap();
    assert!(matches!(outcome, TurnOutcome::Completed(ref m) if m.content == "done"));
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test]
async fn test_stop_keeps_partial_content_and_ignores_late_fragments() {
    let transport = ScriptedTransport::new();
    let feed = transport.channel();
    let chat = controller(&transport);

    let turn = tokio::spawn({
        let chat = chat.clone();
        async move { chat.send_message("c1", "hi").await }
    });
    feed.send(Ok(chunk("Partial").into_bytes())).unwrap();
    wait_until(|| {
        chat.store()
            .get("c1")
            .and_then(|c| c.last_message().map(|m| m.content == "Partial"))
            .unwrap_or(false)
    })
    .await;

    let kept = chat.stop_streaming("c1").unwrap();
    assert_eq!(kept.content, "Partial");
    assert!(!kept.is_streaming);
    assert_eq!(chat.connection_state("c1"), ConnectionState::Disconnected);
    assert!(!chat.is_streaming("c1"));

    let _ = feed.send(Ok(chunk(" and more").into_bytes()));
    let outcome = turn.await.unwrap().unwrap();
    assert_eq!(outcome, TurnOutcome::Stopped(Some(kept)));

    let conversation = chat.store().get("c1").unwrap();
    assert_eq!(conversation.messages.len(), 2);
    assert_eq!(conversation.messages[1].content, "Partial");
}

#[tokio::test(start_paused = true)]
async fn test_dropped_turn_releases_conversation() {
    let transport = ScriptedTransport::new();
    let feed = transport.channel();
    transport.respond([complete("Second answer")]);
    let chat = controller(&transport);

    feed.send(Ok(chunk("Partial").into_bytes())).unwrap();
    let timed_out = tokio::time::timeout(Duration::from_secs(1), chat.send_message("c1", "hi")).await;
    assert!(timed_out.is_err());

    assert!(!chat.is_streaming("c1"));
    assert_eq!(chat.connection_state("c1"), ConnectionState::Disconnected);
    let conversation = chat.store().get("c1").unwrap();
    assert!(conversation.streaming_message().is_none());
    assert_eq!(conversation.messages[1].content, "Partial");
    wait_until(|| feed.is_closed()).await;

    let TurnOutcome::Completed(message) = chat.send_message("c1", "again").await.unwrap() else {
        panic!("expected a completed turn");
    };
    assert_eq!(message.content, "Second answer");
    assert_eq!(chat.store().get("c1").unwrap().messages.len(), 4);
}

#[tokio::test]
async fn test_stop_removes_empty_placeholder() {
    let transport = ScriptedTransport::new();
    let _feed = transport.channel();
    let chat = controller(&transport);

    let turn = tokio::spawn({
        let chat = chat.clone();
        async move { chat.send_message("c1", "hi").await }
    });
    wait_until(|| chat.is_streaming("c1")).await;

    assert!(chat.stop_streaming("c1").is_none());
    assert_eq!(turn.await.unwrap().unwrap(), TurnOutcome::Stopped(None));
    assert_eq!(chat.store().get("c1").unwrap().messages.len(), 1);
    assert!(chat.stop_streaming("c1").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_retry_starts_a_fresh_turn() {
    let transport = ScriptedTransport::new();
    transport
        .respond_then_fail([chunk("Par")], StreamError::Transport("connection reset".to_string()))
        .respond([chunk("Full answer"), complete("")]);
    let chat = controller(&transport);

    let TurnOutcome::Completed(message) = chat.send_message("c1", "hi").await.unwrap() else {
        panic!("expected a completed turn");
    };
    assert_eq!(message.content, "Full answer");
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_remove_placeholder() {
    let transport = ScriptedTransport::new();
    for _ in 0..3 {
        transport.refuse(StreamError::Transport("connection refused".to_string()));
    }
    let chat = controller(&transport);

    let err = chat.send_message("c1", "hi").await.unwrap_err();

    assert!(matches!(err, ChatError::Transport(StreamError::Exhausted { .. })));
    assert_eq!(chat.connection_state("c1"), ConnectionState::Error);
    assert_eq!(chat.store().get("c1").unwrap().messages.len(), 1);
    assert_eq!(transport.open_count(), 3);
}

#[tokio::test]
async fn test_unauthorized_fails_without_retry() {
    let transport = ScriptedTransport::new();
    transport.refuse(StreamError::HttpStatus {
        status: 401,
        body: "unauthorized".to_string(),
    });
    let chat = controller(&transport);

    let err = chat.send_message("c1", "hi").await.unwrap_err();

    assert!(!err.is_retryable());
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test]
async fn test_job_events_on_chat_stream_reach_sink() {
    let transport = ScriptedTransport::new();
    transport.respond([
        "event: job_progress\ndata: {\"jobId\":\"j1\",\"progress\":40,\"currentStep\":\"parsing\"}\n\n".to_string(),
        chunk("Working on it"),
        complete(""),
    ]);
    let sink = Arc::new(CollectingSink::default());
    let chat = controller(&transport).with_job_sink(sink.clone());

    let TurnOutcome::Completed(message) = chat.send_message("c1", "process file").await.unwrap() else {
        panic!("expected a completed turn");
    };
    assert_eq!(message.content, "Working on it");

    let events = sink.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    let JobEvent::Progress(patch) = &events[0] else {
        panic!("expected a progress event, got {:?}", events[0]);
    };
    assert_eq!(patch.job_id, "j1");
    assert_eq!(patch.progress, Some(40.0));
}

#[tokio::test]
async fn test_malformed_fragment_is_skipped() {
    let transport = ScriptedTransport::new();
    transport.respond(["data: {not json\n\n".to_string(), chunk("ok"), complete("")]);
    let chat = controller(&transport);

    let TurnOutcome::Completed(message) = chat.send_message("c1", "hi").await.unwrap() else {
        panic!("expected a completed turn");
    };
    assert_eq!(message.content, "ok");
    assert_eq!(chat.diagnostics().total(), 1);
}

#[tokio::test]
async fn test_request_carries_body_and_bearer_token() {
    let transport = ScriptedTransport::new();
    transport.respond([complete("hello")]);
    let chat = controller(&transport).with_credentials(Arc::new(StaticToken::new("secret")));

    chat.send_message("c1", "  hi there  ").await.unwrap();

    let requests = transport.requests();
    let request = &requests[0];
    let body = request.body.as_ref().unwrap();
    assert_eq!(body["message"], "hi there");
    assert_eq!(body["conversation_id"], "c1");
    assert!(request
        .headers
        .iter()
        .any(|(name, value)| name == "authorization" && value == "Bearer secret"));
}

#[tokio::test]
async fn test_rejects_empty_and_unknown() {
    let transport = ScriptedTransport::new();
    let chat = controller(&transport);

    assert_eq!(chat.send_message("c1", "   ").await.unwrap_err(), ChatError::EmptyMessage);
    assert_eq!(
        chat.send_message("nope", "hi").await.unwrap_err(),
        ChatError::ConversationNotFound("nope".to_string())
    );
    assert_eq!(transport.open_count(), 0);
    assert!(chat.store().get("c1").unwrap().messages.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_connection_state_while_streaming() {
    let transport = ScriptedTransport::new();
    let feed = transport.channel();
    let chat = controller(&transport);

    let turn = tokio::spawn({
        let chat = chat.clone();
        async move { chat.send_message("c1", "hi").await }
    });
    wait_until(|| chat.is_streaming("c1")).await;
    assert_eq!(chat.connection_state("c1"), ConnectionState::Connecting);

    feed.send(Ok(chunk("a").into_bytes())).unwrap();
    wait_until(|| chat.connection_state("c1") == ConnectionState::Connected).await;

    drop(feed);
    tokio::time::timeout(Duration::from_secs(5), turn).await.unwrap().unwrap().unwrap();
    assert_eq!(chat.connection_state("c1"), ConnectionState::Disconnected);
}
