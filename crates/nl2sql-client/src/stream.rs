use std::pin::Pin;

use futures::TryStreamExt as _;

use crate::errors::StreamError;
use crate::event::{DomainEvent, interpret};
use crate::frame::{ByteStream, decode_frames};

/// Typed events of one turn, in arrival order.
pub type EventStream =
    Pin<Box<dyn futures::Stream<Item = Result<DomainEvent, StreamError>> + Send + 'static>>;

/// Decodes raw bytes into typed events, skipping unrecognized event names.
pub fn domain_events(bytes: ByteStream) -> EventStream {
    Box::pin(decode_frames(bytes).try_filter_map(|frame| async move { Ok(interpret(&frame)) }))
}
