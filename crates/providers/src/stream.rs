//! Pull-based completion stream.
//!
//! A transport pushes incremental deltas into a small bounded channel; the
//! consumer awaits [`CompletionStream::next`] and always receives the full text
//! accumulated so far.

use shared::agent_api::{StreamDelta, StreamSnapshot};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::transport::{CompletionRequest, ProviderError, Transport, DELTA_CHANNEL_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Requesting,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Failed | StreamState::Cancelled
        )
    }
}

/// Stops an in-flight stream from outside the consumer loop.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Running totals of content and reasoning text.
#[derive(Debug, Default)]
struct Accumulator {
    content: String,
    thinking: String,
}

impl Accumulator {
    /// Append a delta. Returns whether either total changed.
    fn apply(&mut self, delta: &StreamDelta) -> bool {
        let mut changed = false;
        if let Some(text) = delta.reasoning_content.as_deref().filter(|t| !t.is_empty()) {
            self.thinking.push_str(text);
            changed = true;
        }
        if let Some(text) = delta.content.as_deref().filter(|t| !t.is_empty()) {
            self.content.push_str(text);
            changed = true;
        }
        changed
    }

    fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            content: (!self.content.is_empty()).then(|| self.content.clone()),
            thinking_content: (!self.thinking.is_empty()).then(|| self.thinking.clone()),
        }
    }
}

pub struct CompletionStream {
    transport: Arc<dyn Transport>,
    request: Option<CompletionRequest>,
    rx: Option<mpsc::Receiver<Result<StreamDelta, ProviderError>>>,
    task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    state: StreamState,
    acc: Accumulator,
}

impl CompletionStream {
    pub(crate) fn new(transport: Arc<dyn Transport>, request: CompletionRequest) -> Self {
        Self {
            transport,
            request: Some(request),
            rx: None,
            task: None,
            cancel: CancellationToken::new(),
            state: StreamState::Idle,
            acc: Accumulator::default(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Latest accumulated output, whatever the state.
    pub fn snapshot(&self) -> StreamSnapshot {
        self.acc.snapshot()
    }

    fn start(&mut self) {
        let Some(request) = self.request.take() else {
            return;
        };
        let (tx, rx) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
        let transport = self.transport.clone();
        let cancel = self.cancel.clone();
        debug!(transport = transport.name(), model = %request.model, "opening completion stream");
        self.task = Some(tokio::spawn(async move {
            if let Err(e) = transport.stream(request, tx.clone(), cancel).await {
                let _ = tx.send(Err(e)).await;
            }
        }));
        self.rx = Some(rx);
        self.state = StreamState::Requesting;
    }

    fn finish(&mut self, state: StreamState) {
        self.state = state;
        self.rx = None;
        info!(state = ?state, "completion stream finished");
    }

    /// Next accumulated snapshot, or `None` once the stream is over.
    ///
    /// A snapshot is produced only when the accumulated text changed, plus once
    /// more when the terminator arrives. Errors are yielded once and end the
    /// stream.
    pub async fn next(&mut self) -> Option<Result<StreamSnapshot, ProviderError>> {
        if self.state == StreamState::Idle {
            self.start();
        }
        loop {
            if self.state.is_terminal() {
                return None;
            }
            let rx = self.rx.as_mut()?;
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                item = rx.recv() => Some(item),
            };
            let item = match item {
                None => {
                    self.finish(StreamState::Cancelled);
                    return None;
                }
                Some(item) => item,
            };
            match item {
                None => {
                    self.finish(StreamState::Completed);
                    return None;
                }
                Some(Err(ProviderError::Cancelled)) => {
                    self.finish(StreamState::Cancelled);
                    return None;
                }
                Some(Err(e)) => {
                    self.finish(StreamState::Failed);
                    return Some(Err(e));
                }
                Some(Ok(delta)) => {
                    self.state = StreamState::Streaming;
                    let changed = self.acc.apply(&delta);
                    if delta.done {
                        self.finish(StreamState::Completed);
                        return Some(Ok(self.acc.snapshot()));
                    }
                    if changed {
                        return Some(Ok(self.acc.snapshot()));
                    }
                }
            }
        }
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
