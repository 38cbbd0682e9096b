use std::io;

/// Errors raised while reading or writing framed fields.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// The stream ended with bytes that never formed a complete frame.
    #[error("unrecognized trailing data: {0}")]
    TrailingData(String),
    /// The stream ended before a single frame was received.
    #[error("nothing received")]
    NothingReceived,
    #[error("malformed frame header: {0}")]
    Malformed(String),
    #[error("invalid field type: {0:?}")]
    InvalidFieldType(String),
    #[error("max frame size exceeded, {0} bytes")]
    MaxSizeExceeded(usize),
    #[error("utf8 error in field {0}")]
    Utf8Error(String),
    #[error("io error, {0:?}")]
    Io(io::Error),
}

impl From<io::Error> for FramingError {
    fn from(e: io::Error) -> FramingError {
        FramingError::Io(e)
    }
}
