use std::collections::VecDeque;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream;
use tracing::{debug, trace};

use crate::errors::StreamError;

/// Raw byte chunks in arrival order, as delivered by the transport.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, StreamError>> + Send + 'static>>;

/// One `event:` / `data:` pair, decoded but not yet interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    pub event_name: String,
    pub raw_payload: serde_json::Value,
}

/// Incremental line decoder for the `event: <name>` / `data: <json>` framing.
///
/// Bytes are buffered until a full line is available, so a chunk may end
/// anywhere, including inside a multi-byte character.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    pending_event: Option<String>,
    failed: bool,
}

impl FrameDecoder {
    /// Feeds one chunk and returns every frame completed by it, in order.
    ///
    /// A malformed payload yields a single trailing `Err`; after that the
    /// decoder is poisoned and ignores further input.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Result<StreamFrame, StreamError>> {
        let mut out = Vec::new();
        if self.failed {
            return out;
        }
        self.buf.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let decoded = decode_line(&mut self.pending_event, &self.buf[start..end]);
            start = end + 1;
            match decoded {
                Ok(Some(frame)) => out.push(Ok(frame)),
                Ok(None) => {}
                Err(err) => {
                    self.failed = true;
                    self.buf.clear();
                    out.push(Err(err));
                    return out;
                }
            }
        }
        self.buf.drain(..start);
        out
    }

    /// Bytes of an incomplete trailing line still held back.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

fn decode_line(
    pending_event: &mut Option<String>,
    raw: &[u8],
) -> Result<Option<StreamFrame>, StreamError> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches('\r');
    if line.is_empty() {
        *pending_event = None;
        return Ok(None);
    }
    if line.starts_with(':') {
        return Ok(None);
    }
    if let Some(rest) = line.strip_prefix("event:") {
        *pending_event = Some(rest.trim().to_string());
        return Ok(None);
    }
    if let Some(rest) = line.strip_prefix("data:") {
        let Some(event_name) = pending_event.take() else {
            trace!("data line without a preceding event line");
            return Ok(None);
        };
        let payload = rest.trim();
        let raw_payload = if payload.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(payload).map_err(|e| {
                StreamError::decode(format!("invalid JSON payload for `{event_name}`: {e}"))
            })?
        };
        return Ok(Some(StreamFrame {
            event_name,
            raw_payload,
        }));
    }
    Ok(None)
}

/// Lazily decodes a byte stream into frames.
///
/// Ends without error when the source ends, even if no terminal frame was
/// seen; the caller decides whether that was an abrupt disconnect. Ends after
/// yielding the first error.
pub fn decode_frames(
    bytes: ByteStream,
) -> impl futures::Stream<Item = Result<StreamFrame, StreamError>> + Send {
    struct State {
        bytes: ByteStream,
        decoder: FrameDecoder,
        pending: VecDeque<Result<StreamFrame, StreamError>>,
        done: bool,
    }

    stream::try_unfold(
        State {
            bytes,
            decoder: FrameDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(next) = state.pending.pop_front() {
                    return next.map(|frame| Some((frame, state)));
                }
                if state.done {
                    return Ok(None);
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        state.pending.extend(state.decoder.push_chunk(&chunk));
                    }
                    Some(Err(err)) => return Err(err),
                    None => {
                        let leftover = state.decoder.buffered_len();
                        if leftover > 0 {
                            debug!(leftover, "discarding incomplete trailing line at end of stream");
                        }
                        state.done = true;
                    }
                }
            }
        },
    )
}
