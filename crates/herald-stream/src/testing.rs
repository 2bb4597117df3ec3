//! In-memory transport for tests.
//!
//! Each call to `open` consumes the next scripted response, so a test can
//! describe a whole sequence of connection attempts up front.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StreamError};
use crate::transport::{ChunkStream, StreamRequest, StreamTransport};

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Chunk(Vec<u8>),
    Fail(StreamError),
    Sleep(Duration),
    /// Keep the connection open without sending anything
    Hang,
}

enum Script {
    Refuse(StreamError),
    Steps(Vec<ScriptStep>),
    Channel(mpsc::UnboundedReceiver<Result<Vec<u8>>>),
}

#[derive(Default)]
struct Scripted {
    scripts: VecDeque<Script>,
    requests: Vec<StreamRequest>,
}

#[derive(Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<Scripted>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next attempt fails before any byte is delivered
    pub fn refuse(&self, error: StreamError) -> &Self {
        self.lock().scripts.push_back(Script::Refuse(error));
        self
    }

    /// Next attempt delivers these chunks, then ends cleanly
    pub fn respond<I, C>(&self, chunks: I) -> &Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        let steps = chunks.into_iter().map(|c| ScriptStep::Chunk(c.into())).collect();
        self.script(steps)
    }

    /// Next attempt delivers these chunks, then fails with `error`
    pub fn respond_then_fail<I, C>(&self, chunks: I, error: StreamError) -> &Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        let mut steps: Vec<ScriptStep> = chunks.into_iter().map(|c| ScriptStep::Chunk(c.into())).collect();
        steps.push(ScriptStep::Fail(error));
        self.script(steps)
    }

    /// Next attempt delivers these chunks, then stays open
    pub fn respond_then_hang<I, C>(&self, chunks: I) -> &Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        let mut steps: Vec<ScriptStep> = chunks.into_iter().map(|c| ScriptStep::Chunk(c.into())).collect();
        steps.push(ScriptStep::Hang);
        self.script(steps)
    }

    pub fn script(&self, steps: Vec<ScriptStep>) -> &Self {
        self.lock().scripts.push_back(Script::Steps(steps));
        self
    }

    /// Next attempt is fed by hand through the returned sender.
    /// Dropping the sender ends the stream.
    pub fn channel(&self) -> mpsc::UnboundedSender<Result<Vec<u8>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().scripts.push_back(Script::Channel(rx));
        tx
    }

    pub fn open_count(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Scripted> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn open(&self, request: &StreamRequest, cancel: CancellationToken) -> Result<ChunkStream> {
        let script = {
            let mut inner = self.lock();
            inner.requests.push(request.clone());
            inner.scripts.pop_front()
        };

        let chunks: ChunkStream = match script {
            None => return Err(StreamError::Transport("connection refused".to_string())),
            Some(Script::Refuse(error)) => return Err(error),
            Some(Script::Steps(steps)) => Box::pin(async_stream::stream! {
                for step in steps {
                    match step {
                        ScriptStep::Chunk(bytes) => yield Ok(bytes),
                        ScriptStep::Fail(error) => {
                            yield Err(error);
                            break;
                        }
                        ScriptStep::Sleep(delay) => tokio::time::sleep(delay).await,
                        ScriptStep::Hang => futures::future::pending::<()>().await,
                    }
                }
            }),
            Some(Script::Channel(mut rx)) => Box::pin(async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            }),
        };

        Ok(Box::pin(chunks.take_until(cancel.cancelled_owned())))
    }
}
