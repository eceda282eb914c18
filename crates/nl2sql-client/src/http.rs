use futures::StreamExt as _;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::backend::ChatBackend;
use crate::config::ClientConfig;
use crate::errors::{ClientError, StreamError};
use crate::frame::ByteStream;
use crate::model::{Conversation, ConversationDetail, ConversationId, Page};
use crate::stream::{EventStream, domain_events};

const CREATE_PATH: &str = "/chat/conversations/create";
const LIST_PATH: &str = "/chat/conversations/list";
const DETAIL_PATH: &str = "/chat/conversations/detail";
const DELETE_PATH: &str = "/chat/conversations/delete";
const SEND_PATH: &str = "/chat/conversations/messages/send";

#[derive(serde::Deserialize)]
struct Envelope<T> {
    code: i64,
    data: Option<T>,
    #[serde(default)]
    msg: String,
}

/// [`ChatBackend`] over the service's JSON + event-stream HTTP API.
pub struct HttpChatBackend {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpChatBackend {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates a backend from `NL2SQL_*` environment variables.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn post(&self, path: &str, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let mut request = self.client.post(self.config.endpoint(path)).json(body);
        if let Some(token) = self.config.access_token.as_deref() {
            request = request.bearer_auth(token);
        }
        request
    }

    async fn call<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<Option<T>, ClientError> {
        debug!(path, "api call");
        let response = self
            .post(path, &body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("request to {path} failed: {e}")))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ClientError::Transport(format!("reading {path} response failed: {e}")))?;
        parse_envelope(status, &bytes)
    }
}

fn parse_envelope<T: DeserializeOwned>(
    status: StatusCode,
    body: &[u8],
) -> Result<Option<T>, ClientError> {
    if status == StatusCode::UNAUTHORIZED {
        return Err(ClientError::Unauthorized);
    }
    let envelope: Envelope<T> = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(_) if !status.is_success() => {
            return Err(ClientError::Transport(format!(
                "request failed with status {status}"
            )));
        }
        Err(e) => return Err(ClientError::Decode(format!("invalid response body: {e}"))),
    };
    if envelope.code != 0 {
        let message = if envelope.msg.is_empty() {
            "request failed".to_string()
        } else {
            envelope.msg
        };
        return Err(ClientError::Api {
            code: envelope.code,
            message,
        });
    }
    Ok(envelope.data)
}

/// Whether a send response carries an event stream rather than an error body.
fn is_event_stream(status: StatusCode, content_type: Option<&str>) -> bool {
    status.is_success() && !content_type.is_some_and(|v| v.starts_with("application/json"))
}

/// Transport error for a send response that did not open a stream.
fn rejected_stream(status: StatusCode, body: &[u8]) -> StreamError {
    let message = match parse_envelope::<serde_json::Value>(status, body) {
        Err(err) => err.to_string(),
        Ok(_) => format!("expected an event stream, got status {status}"),
    };
    StreamError::transport(message, Some(status.as_u16()))
}

fn required<T>(data: Option<T>, path: &str) -> Result<T, ClientError> {
    data.ok_or_else(|| ClientError::Decode(format!("{path} response carried no data")))
}

#[async_trait::async_trait]
impl ChatBackend for HttpChatBackend {
    async fn create_conversation(&self) -> Result<Conversation, ClientError> {
        let data = self.call(CREATE_PATH, serde_json::json!({})).await?;
        required(data, CREATE_PATH)
    }

    async fn list_conversations(
        &self,
        offset: u32,
        limit: u32,
    ) -> Result<Page<Conversation>, ClientError> {
        let data = self
            .call(LIST_PATH, serde_json::json!({ "offset": offset, "limit": limit }))
            .await?;
        required(data, LIST_PATH)
    }

    async fn conversation_detail(
        &self,
        id: ConversationId,
    ) -> Result<ConversationDetail, ClientError> {
        let data = self
            .call(DETAIL_PATH, serde_json::json!({ "conversation_id": id }))
            .await?;
        required(data, DETAIL_PATH)
    }

    async fn delete_conversation(&self, id: ConversationId) -> Result<(), ClientError> {
        self.call::<serde_json::Value>(DELETE_PATH, serde_json::json!({ "conversation_id": id }))
            .await?;
        Ok(())
    }

    async fn send_message(
        &self,
        id: ConversationId,
        content: &str,
    ) -> Result<EventStream, StreamError> {
        debug!(conversation_id = %id, "opening event stream");
        let response = self
            .post(
                SEND_PATH,
                &serde_json::json!({ "conversation_id": id, "content": content }),
            )
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| StreamError::transport(format!("send request failed: {e}"), None))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        if !is_event_stream(status, content_type.as_deref()) {
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(err) => {
                    debug!(%status, error = %err, "could not read rejected send body");
                    bytes::Bytes::new()
                }
            };
            return Err(rejected_stream(status, &body));
        }

        let bytes: ByteStream = Box::pin(response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| StreamError::transport(format!("stream read failed: {e}"), None))
        }));
        Ok(domain_events(bytes))
    }
}
