pub mod error;
pub mod event;
pub mod buffer;
pub mod parser;
pub mod diagnostics;
pub mod transport;
pub mod reconnect;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::StreamError;
pub use event::{StreamEvent, StreamEventKind};
pub use buffer::{InvalidLine, LineBuffer, LineError, DEFAULT_MAX_LINE};
pub use parser::{decode_payload, SseParser};
pub use diagnostics::{Diagnostic, DiagnosticKind, DiagnosticLog};
pub use transport::{ChunkStream, HttpTransport, Method, StreamRequest, StreamTransport};
pub use reconnect::{Backoff, ReconnectPhase, ReconnectPolicy, ReconnectingStream, SessionEvent};

pub use tokio_util::sync::CancellationToken;
