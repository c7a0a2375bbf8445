use std::fmt;
use thiserror::Error;

/// Why an operation bound to a process was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    /// The process itself exited. Expected, never reported as an error.
    ProcessExited,
    /// The whole session is shutting down.
    Shutdown,
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelCause::ProcessExited => f.write_str("process exited"),
            CancelCause::Shutdown => f.write_str("session shutdown"),
        }
    }
}

/// Malformed or incompatible data on the agent channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload truncated: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("unknown payload type {0}")]
    UnknownPayloadType(u8),

    #[error("unexpected payload type {actual}, expected {expected}")]
    UnexpectedPayloadType { expected: u8, actual: u8 },

    #[error("unsupported {payload} version {version}")]
    UnsupportedVersion { payload: &'static str, version: u8 },

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("invalid boolean byte {0}")]
    InvalidBool(u8),

    #[error("unknown log severity {0}")]
    UnknownSeverity(u8),

    #[error("unknown logging level {0}")]
    UnknownLoggingLevel(u8),

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("empty frame")]
    EmptyFrame,

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Failure talking to one process. Any of these makes the client unusable.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("process reported that the update failed")]
    Rejected,

    #[error("runtime rude edit detected (code {code}): {message}")]
    RuntimeRudeEdit { code: i32, message: String },

    #[error("cancelled: {0}")]
    Cancelled(CancelCause),

    #[error("client is no longer usable after an earlier failure")]
    Unusable,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session has been disposed")]
    Disposed,

    #[error("session is shutting down")]
    Shutdown,

    #[error("failed to launch process: {0}")]
    Launch(#[source] std::io::Error),

    #[error("failed to create agent endpoint: {0}")]
    Endpoint(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
