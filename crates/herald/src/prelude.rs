//! Prelude module for convenient imports
//!
//! Import everything you need with:
//! ```rust
//! use herald::prelude::*;
//! ```

pub use crate::{
    ChatConfig, ChatError, ChatStreamController, ConversationStore, TurnOutcome,
    JobEventRouter, JobRouterConfig, JobStore,
    ConnectionMonitor, HttpProber, MonitorConfig,
    HttpTransport, StreamTransport, StreamRequest, ReconnectPolicy, Backoff, StreamError,
    Message, Conversation, ProcessingJob, JobStatus, ConnectionState, NetworkStatus,
};
