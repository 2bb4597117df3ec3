//! # Herald
//!
//! Realtime streaming client for chat and job status backends that push
//! server-sent events.
//!
//! ## Overview
//!
//! - **Parse** the `data:` / `event:` / `retry:` line protocol incrementally,
//!   whatever the chunk boundaries
//! - **Reconnect** with bounded linear or exponential backoff, honouring
//!   server `retry:` hints
//! - **Stream chat turns** into a placeholder message, one turn per conversation,
//!   with stop and error cleanup
//! - **Track jobs** from a separate long-lived stream with upsert semantics
//! - **Monitor** network quality as online, offline or slow
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use herald::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport: Arc<dyn StreamTransport> =
//!         Arc::new(HttpTransport::new()?.with_base_url("http://localhost:8000"));
//!
//!     let jobs = JobStore::new();
//!     let conversations = ConversationStore::new();
//!     let conversation_id = conversations.create();
//!
//!     let chat = ChatStreamController::new(transport, conversations, ChatConfig::default())
//!         .with_job_sink(Arc::new(jobs.clone()));
//!
//!     match chat.send_message(&conversation_id, "Summarise the report").await {
//!         Ok(TurnOutcome::Completed(message)) => println!("{}", message.content),
//!         Ok(TurnOutcome::Stopped(_)) => println!("stopped"),
//!         Err(err) => eprintln!("{}", err.user_message()),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **`herald-types`**: messages, conversations, fragments, jobs, status enums
//! - **`herald-stream`**: transport trait, line parser, diagnostics, reconnecting stream
//! - **`herald-chat`**: conversation store and chat stream controller
//! - **`herald-jobs`**: job store, job monitor stream and job event router
//! - **`herald-monitor`**: connection quality monitor and probes
//!
//! ## License
//!
//! MIT

pub mod prelude;

pub use herald_types::{
    ChatFragment, ConnectionState, Conversation, Feedback, FragmentType, JobEvent, JobEventSink, JobPatch,
    JobStatus, Message, MessageRole, Metadata, NetworkStatus, ProcessingJob,
};

pub use herald_stream::{
    decode_payload, Backoff, CancellationToken, Diagnostic, DiagnosticKind, DiagnosticLog, HttpTransport, Method,
    ReconnectPhase, ReconnectPolicy, ReconnectingStream, SessionEvent, SseParser, StreamError, StreamEvent,
    StreamEventKind, StreamRequest, StreamTransport,
};

#[cfg(feature = "test-util")]
pub use herald_stream::testing;

pub use herald_chat::{
    ChatConfig, ChatError, ChatStreamController, ConversationStore, ConversationUpdate, CredentialProvider,
    NoCredentials, StaticToken, TurnOutcome,
};

pub use herald_jobs::{JobEventRouter, JobRouterConfig, JobStore, JobUpdate};

pub use herald_monitor::{ConnectionMonitor, HttpProber, MonitorConfig, ProbeError, Prober};
