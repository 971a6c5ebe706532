use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;

use super::types::ExecutionResult;

/// One item of a streamed execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Status {
        message: String,
    },
    Output {
        data: String,
    },
    Error {
        kind: String,
        message: String,
        security: bool,
    },
    Result {
        result: ExecutionResult,
    },
}

impl ExecutionEvent {
    /// Event name used on the server-sent event channel.
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionEvent::Status { .. } => "status",
            ExecutionEvent::Output { .. } => "output",
            ExecutionEvent::Error { .. } => "error",
            ExecutionEvent::Result { .. } => "result",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::Error { .. } | ExecutionEvent::Result { .. }
        )
    }
}

/// Producer half of an [`ExecutionStream`].
///
/// Sends never fail loudly: a consumer that went away simply stops receiving.
#[derive(Clone)]
pub struct OutputSink {
    tx: mpsc::Sender<ExecutionEvent>,
}

impl OutputSink {
    pub async fn status(&self, message: impl Into<String>) {
        self.send(ExecutionEvent::Status {
            message: message.into(),
        })
        .await;
    }

    pub async fn output(&self, chunk: &[u8]) {
        self.send(ExecutionEvent::Output {
            data: String::from_utf8_lossy(chunk).into_owned(),
        })
        .await;
    }

    /// Sends already decoded output, skipping empty text.
    pub async fn text(&self, data: String) {
        if !data.is_empty() {
            self.send(ExecutionEvent::Output { data }).await;
        }
    }

    pub async fn send(&self, event: ExecutionEvent) {
        let _ = self.tx.send(event).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Finite sequence of [`ExecutionEvent`]s for one run.
///
/// The stream ends after its single `Result` or `Error` event. It is consumed
/// by value and cannot be restarted.
pub struct ExecutionStream {
    rx: mpsc::Receiver<ExecutionEvent>,
}

impl Stream for ExecutionStream {
    type Item = ExecutionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Decodes a byte stream chunk by chunk, holding back a UTF-8 sequence cut
/// at a chunk boundary until the rest of it arrives.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let keep = incomplete_tail(&self.pending);
        let tail = self.pending.split_off(self.pending.len() - keep);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        text
    }

    /// Whatever is still held back, invalid bytes replaced.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of an unfinished multi-byte sequence at the end of `bytes`.
fn incomplete_tail(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let b = bytes[len - back];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let needed = match b {
            0xF0.. => 4,
            0xE0.. => 3,
            0xC0.. => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

pub fn channel(capacity: usize) -> (OutputSink, ExecutionStream) {
    let (tx, rx) = mpsc::channel(capacity);
    (OutputSink { tx }, ExecutionStream { rx })
}
