//! Client for a streaming natural-language-to-SQL chat service.
//!
//! A message sent to a conversation comes back as an event stream that
//! reports pipeline stages as they start and finish, then settles on a
//! result, a clarifying question, or an error. [`ChatClient`] drives that
//! stream into a [`SessionState`] and publishes snapshots for rendering.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nl2sql_client::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ClientError> {
//! let backend = HttpChatBackend::new(ClientConfig::new("http://localhost:8000"))?;
//! let mut client = ChatClient::new(Arc::new(backend));
//!
//! client.create_conversation().await?;
//! match client.send_message("Top 5 customers by revenue").await? {
//!     TurnOutcome::Answered => println!("{:?}", client.state().last_result()),
//!     TurnOutcome::Clarification(question) => println!("{question}"),
//!     other => println!("{other:?}"),
//! }
//! # Ok(())
//! # }
//! ```

/// Storage and streaming contract the client talks to.
pub mod backend;
/// Async driver owning the selected conversation's session.
pub mod client;
/// Injectable wall clock for stage timing.
pub mod clock;
/// Connection settings and their `NL2SQL_*` environment variables.
pub mod config;
/// Stream and client error types.
pub mod errors;
/// Typed pipeline events and stage labels.
pub mod event;
/// Incremental decoding of the `event:`/`data:` wire format.
pub mod frame;
/// HTTP implementation of [`ChatBackend`].
pub mod http;
/// Conversations, messages and result rows as the service stores them.
pub mod model;
/// One-time `tracing` subscriber setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Stage step tracking and elapsed-time display.
pub mod progress;
/// Synchronous per-conversation state machine.
pub mod session;
/// Byte stream to typed event stream adapter.
pub mod stream;

pub use backend::ChatBackend;
pub use client::ChatClient;
pub use clock::{Clock, SystemClock};
pub use config::ClientConfig;
pub use errors::{ClientError, StreamError};
pub use event::{DomainEvent, QueryResult, stage_label};
pub use frame::{FrameDecoder, StreamFrame};
pub use http::HttpChatBackend;
pub use model::{
    Conversation, ConversationDetail, ConversationId, ConversationStatus, Message, Page, Role, Row,
};
pub use observability::{LogSettings, init_observability};
pub use progress::{ProgressTracker, StageStep, StepStatus, format_elapsed};
pub use session::{ChatSession, SessionPhase, SessionState, TurnOutcome, TurnTicket};
pub use stream::{EventStream, domain_events};
