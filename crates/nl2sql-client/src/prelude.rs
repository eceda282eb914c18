//! Common imports for driving a conversation.
pub use crate::{
    ChatBackend, ChatClient, ClientConfig, ClientError, ConversationId, DomainEvent,
    HttpChatBackend, Message, QueryResult, Role, SessionPhase, SessionState, StageStep,
    StepStatus, StreamError, TurnOutcome, format_elapsed,
};
