use pipes_codec::FramingError;

use crate::message::MessageType;

/// Errors signalled to a connection context.
///
/// The `Display` text of each variant is what the peer sees in the error response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    #[error("framing error, {0}")]
    Framing(String),
    #[error("{0}: no matching registration")]
    NoMatchingRegistration(MessageType),
    #[error("unknown msg type: {0}")]
    UnknownMessageType(String),
    #[error("subscribe: {0} unknown")]
    UnknownRegistration(String),
    #[error("reply: message already replied or timed out")]
    AlreadyRepliedOrTimedOut,
    #[error("message timeout")]
    ConnectionTimeout,
    #[error("filter or router failed, {0}")]
    FilterOrRouter(String),
    #[error("unregister: {0}")]
    Unregistered(String),
    #[error("pipes shutdown")]
    Shutdown,
    #[error("Forbidden")]
    Forbidden,
    #[error("Not Found")]
    NotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error("delivery failed, {0}")]
    Delivery(String),
}

impl PipeError {
    /// HTTP status answered for this error.
    #[inline]
    pub fn status(&self) -> u16 {
        match self {
            PipeError::Forbidden => 403,
            PipeError::NotFound => 404,
            PipeError::Framing(_) | PipeError::BadRequest(_) => 400,
            PipeError::ConnectionTimeout => 504,
            _ => 500,
        }
    }
}

impl From<FramingError> for PipeError {
    #[inline]
    fn from(e: FramingError) -> Self {
        PipeError::Framing(e.to_string())
    }
}

impl From<serde_json::Error> for PipeError {
    #[inline]
    fn from(e: serde_json::Error) -> Self {
        PipeError::BadRequest(e.to_string())
    }
}
