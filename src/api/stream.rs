//! Consumer for the `/api/ask/stream` line protocol.
//!
//! ```text
//! data: <text>        one chunk, may repeat
//! event: done         terminal success
//! event: error        terminal failure, message on the next `data:` line
//! ```
//!
//! Any other line is ignored.

use crate::error::ClientError;
use futures::{Stream, StreamExt, stream};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;

const DATA_PREFIX: &str = "data:";
const DONE_MARKER: &str = "event: done";
const ERROR_MARKER: &str = "event: error";

pub const UNKNOWN_STREAM_ERROR: &str = "Unknown SSE error";
pub const STREAM_CANCELLED: &str = "Stream cancelled";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerStreamEvent {
    Chunk(String),
    Done,
    Error(String),
}

impl AnswerStreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk(_))
    }
}

/// Coarse progress of one stream, observable while it is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProgress {
    /// Request sent, no chunk yet
    Connecting,
    /// At least one chunk received
    Receiving,
    Finished,
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ClientError>> + Send>>;

/// Lazily reads an answer stream, one event per call to [`AnswerStream::next_event`].
pub struct AnswerStream {
    body: ByteStream,
    lines: LineBuffer,
    parser: FrameParser,
    aggregate: String,
    progress: watch::Sender<StreamProgress>,
    cancel: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    finished: bool,
}

impl AnswerStream {
    pub fn new<S>(body: S) -> Self
    where
        S: Stream<Item = Result<Vec<u8>, ClientError>> + Send + 'static,
    {
        let (progress, _) = watch::channel(StreamProgress::Connecting);
        let (cancel, cancel_rx) = watch::channel(false);
        Self {
            // Polled again after the buffered tail is parsed
            body: Box::pin(body.fuse()),
            lines: LineBuffer::default(),
            parser: FrameParser::default(),
            aggregate: String::new(),
            progress,
            cancel: Arc::new(cancel),
            cancel_rx,
            finished: false,
        }
    }

    /// Next event in arrival order, `None` once a terminal event has been returned.
    pub async fn next_event(&mut self) -> Option<AnswerStreamEvent> {
        if self.finished {
            return None;
        }

        loop {
            while let Some(line) = self.lines.next_line() {
                if let Some(event) = self.parser.feed(&line) {
                    return Some(self.record(event));
                }
            }

            let next = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel_rx) => {
                    tracing::debug!("Answer stream cancelled");
                    return Some(self.record(AnswerStreamEvent::Error(STREAM_CANCELLED.to_string())));
                }
                next = self.body.next() => next,
            };

            match next {
                Some(Ok(bytes)) => self.lines.push(&bytes),
                Some(Err(e)) => {
                    tracing::warn!("Answer stream read failed: {}", e);
                    return Some(self.record(AnswerStreamEvent::Error(e.to_string())));
                }
                None => {
                    if let Some(line) = self.lines.take_remainder() {
                        if let Some(event) = self.parser.feed(&line) {
                            return Some(self.record(event));
                        }
                    }
                    let event = self.parser.finish();
                    return Some(self.record(event));
                }
            }
        }
    }

    /// Concatenation of every chunk received so far.
    pub fn aggregate(&self) -> &str {
        &self.aggregate
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamProgress> {
        self.progress.subscribe()
    }

    pub fn canceller(&self) -> StreamCanceller {
        StreamCanceller(self.cancel.clone())
    }

    fn record(&mut self, event: AnswerStreamEvent) -> AnswerStreamEvent {
        if let AnswerStreamEvent::Chunk(text) = &event {
            self.aggregate.push_str(text);
            self.progress.send_if_modified(|p| {
                if *p == StreamProgress::Connecting {
                    *p = StreamProgress::Receiving;
                    true
                } else {
                    false
                }
            });
        }
        if event.is_terminal() {
            self.finished = true;
            // Dropping the body closes the connection.
            self.body = Box::pin(stream::empty());
            self.progress.send_replace(StreamProgress::Finished);
        }
        event
    }
}

/// Cancels an [`AnswerStream`] from outside the task reading it.
#[derive(Clone)]
pub struct StreamCanceller(Arc<watch::Sender<bool>>);

impl StreamCanceller {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    #[default]
    Reading,
    AwaitingErrorPayload,
    Finished,
}

/// Turns protocol lines into events.
#[derive(Debug, Default)]
pub struct FrameParser {
    state: FrameState,
}

impl FrameParser {
    pub fn feed(&mut self, line: &str) -> Option<AnswerStreamEvent> {
        match self.state {
            FrameState::Finished => None,
            FrameState::AwaitingErrorPayload => {
                self.state = FrameState::Finished;
                let message = data_payload(line)
                    .filter(|m| !m.is_empty())
                    .unwrap_or(UNKNOWN_STREAM_ERROR);
                Some(AnswerStreamEvent::Error(message.to_string()))
            }
            FrameState::Reading => {
                if let Some(data) = data_payload(line) {
                    (!data.is_empty()).then(|| AnswerStreamEvent::Chunk(data.to_string()))
                } else if line.starts_with(DONE_MARKER) {
                    self.state = FrameState::Finished;
                    Some(AnswerStreamEvent::Done)
                } else if line.starts_with(ERROR_MARKER) {
                    self.state = FrameState::AwaitingErrorPayload;
                    None
                } else {
                    None
                }
            }
        }
    }

    /// Terminal event for a body that ended without one.
    pub fn finish(&mut self) -> AnswerStreamEvent {
        let event = match self.state {
            FrameState::AwaitingErrorPayload => {
                AnswerStreamEvent::Error(UNKNOWN_STREAM_ERROR.to_string())
            }
            _ => AnswerStreamEvent::Done,
        };
        self.state = FrameState::Finished;
        event
    }
}

fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix(DATA_PREFIX)
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
}

/// Splits raw body bytes into lines.
///
/// Bytes are held until a full line is available, so a multi-byte character
/// split across network chunks decodes intact.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}
