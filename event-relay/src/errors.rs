use thiserror::Error;

/// Result type alias for event-relay operations
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Why a push envelope could not be turned into an event.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("request body is not a JSON push envelope: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("{0} must be a JSON object")]
    NotAnObject(&'static str),

    #[error("push envelope has no message.data")]
    MissingData,

    #[error("message.data is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("message.data is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("message.data is not a valid event: {0}")]
    InvalidEvent(#[source] serde_json::Error),

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("failed to read request body: {0}")]
    BodyRead(String),
}

impl EnvelopeError {
    /// Short tag for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            EnvelopeError::InvalidJson(_) => "invalid_json",
            EnvelopeError::NotAnObject(_) => "not_an_object",
            EnvelopeError::MissingData => "missing_data",
            EnvelopeError::InvalidBase64(_) => "invalid_base64",
            EnvelopeError::InvalidUtf8(_) => "invalid_utf8",
            EnvelopeError::InvalidEvent(_) => "invalid_event",
            EnvelopeError::BodyTooLarge { .. } => "body_too_large",
            EnvelopeError::BodyRead(_) => "body_read",
        }
    }
}

/// Why a normalized record did not make it into the warehouse table.
#[derive(Error, Debug)]
pub enum InsertError {
    #[error("record is missing required field {0}")]
    InvalidRecord(&'static str),

    #[error("failed to serialize event context: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("warehouse request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("warehouse rejected credentials ({status})")]
    Auth { status: http::StatusCode },

    #[error("warehouse responded with {status}: {body}")]
    Status {
        status: http::StatusCode,
        body: String,
    },

    #[error("warehouse rejected the row: {0}")]
    Rejected(String),

    #[error("warehouse insert timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("could not obtain access token: {0}")]
    Token(#[from] AuthError),
}

impl InsertError {
    /// Short tag for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            InsertError::InvalidRecord(_) => "invalid_record",
            InsertError::Serialize(_) => "serialize",
            InsertError::Transport(_) => "transport",
            InsertError::Auth { .. } => "auth",
            InsertError::Status { .. } => "status",
            InsertError::Rejected(_) => "rejected",
            InsertError::Timeout(_) => "timeout",
            InsertError::Token(_) => "token",
        }
    }
}

/// Failure to hand spans to the trace collector. Never surfaced to callers.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("trace collector request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("trace collector responded with {status}: {body}")]
    Status {
        status: http::StatusCode,
        body: String,
    },

    #[error("could not obtain access token: {0}")]
    Token(#[from] AuthError),

    #[error("span export timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("metadata server request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("metadata server responded with {0}")]
    Status(http::StatusCode),
}

/// Errors that stop the relay from starting or serving.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ValidationError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}
