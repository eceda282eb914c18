/// Errors raised while a single turn's event stream is being opened or read.
///
/// All three variants converge on the same recovery path in
/// [`ChatSession`](crate::session::ChatSession): the in-flight stage is marked
/// failed and one fixed error message is appended to the transcript.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// A frame could not be decoded (malformed JSON payload). Aborts the stream.
    #[error("malformed event frame: {message}")]
    Decode { message: String },
    /// Connection, timeout, or non-success HTTP status.
    #[error("network error: {message}")]
    Transport {
        message: String,
        status_code: Option<u16>,
    },
    /// The pipeline reported an explicit failure.
    #[error("pipeline error ({}): {}", code.as_deref().unwrap_or("unknown"), message.as_deref().unwrap_or("no detail"))]
    Pipeline {
        code: Option<String>,
        message: Option<String>,
    },
}

impl StreamError {
    /// Creates a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self::Transport {
            message: message.into(),
            status_code,
        }
    }

    /// Creates a pipeline error from the optional code/message of an `error` event.
    pub fn pipeline(code: Option<String>, message: Option<String>) -> Self {
        Self::Pipeline { code, message }
    }

    /// Returns the detail carried by this error, when there is one.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Decode { message } | Self::Transport { message, .. } => Some(message),
            Self::Pipeline { message, code } => message.as_deref().or(code.as_deref()),
        }
    }
}

/// Top-level error type for the public client API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid caller input.
    #[error("validation error: {0}")]
    Validation(String),
    /// A send was attempted with no conversation selected.
    #[error("no conversation selected")]
    NoConversationSelected,
    /// A send was attempted while another turn is still in flight.
    #[error("a message is already being sent")]
    SendInFlight,
    /// The server rejected the access token.
    #[error("unauthorized")]
    Unauthorized,
    /// The server answered with a non-zero envelope code.
    #[error("api error ({code}): {message}")]
    Api { code: i64, message: String },
    /// Transport failure outside a turn's event stream.
    #[error("transport error: {0}")]
    Transport(String),
    /// A response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
    /// Failure of a turn's event stream surfaced to the caller.
    #[error(transparent)]
    Stream(StreamError),
}

impl From<StreamError> for ClientError {
    fn from(value: StreamError) -> Self {
        ClientError::Stream(value)
    }
}
