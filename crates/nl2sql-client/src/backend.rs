use crate::errors::{ClientError, StreamError};
use crate::model::{Conversation, ConversationDetail, ConversationId, Page};
use crate::stream::EventStream;

/// Server-side collaborator: conversation storage plus the streaming send call.
///
/// [`HttpChatBackend`](crate::http::HttpChatBackend) talks to the real
/// service; tests plug in fakes.
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    async fn create_conversation(&self) -> Result<Conversation, ClientError>;

    async fn list_conversations(
        &self,
        offset: u32,
        limit: u32,
    ) -> Result<Page<Conversation>, ClientError>;

    async fn conversation_detail(
        &self,
        id: ConversationId,
    ) -> Result<ConversationDetail, ClientError>;

    async fn delete_conversation(&self, id: ConversationId) -> Result<(), ClientError>;

    /// Opens the event stream for one turn.
    ///
    /// `Err` means the request failed before any byte of the stream arrived.
    async fn send_message(
        &self,
        id: ConversationId,
        content: &str,
    ) -> Result<EventStream, StreamError>;
}
