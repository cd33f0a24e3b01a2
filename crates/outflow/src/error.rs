//! Error types for the output stage.
//!
//! Frame drops are deliberately absent: they are an expected, counted
//! condition reported through [`crate::stats::OutputStats`], never an error.

use thiserror::Error;

use crate::session::ConnectionState;

/// Fatal conditions surfaced to the caller of an [`crate::session::OutputSession`].
#[derive(Debug, Clone, Error)]
pub enum OutputError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("transport write failed: {0}")]
    TransportWriteFailed(String),

    /// `remaining` counts packets still in the packet buffer, `unsent_bytes`
    /// the bytes behind them (payload bytes, or the socket ring in buffered
    /// socket mode).
    #[error(
        "took longer than {seconds} second(s) to shut down, \
         {remaining} packet(s) / {unsent_bytes} byte(s) unsent"
    )]
    ShutdownTimeout {
        seconds: u64,
        remaining: usize,
        unsent_bytes: usize,
    },

    #[error("serializer failed: {0}")]
    SerializeFailed(String),

    #[error("operation not valid in state {0}")]
    InvalidState(ConnectionState),

    #[error("failed to spawn worker thread: {0}")]
    SpawnFailed(String),
}

/// Errors reported by a [`crate::transport::Transport`] implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect: {0}")]
    Connect(String),

    #[error("handshake: {0}")]
    Handshake(String),

    #[error("write: {0}")]
    Write(String),

    #[error("connection closed")]
    Closed,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Map a failure during session establishment to its typed reason.
    pub fn into_connect_error(self) -> OutputError {
        match self {
            TransportError::Handshake(msg) => OutputError::HandshakeFailed(msg),
            other => OutputError::ConnectFailed(other.to_string()),
        }
    }
}

impl From<TransportError> for OutputError {
    fn from(err: TransportError) -> Self {
        OutputError::TransportWriteFailed(err.to_string())
    }
}

/// Errors returned by the buffered socket writer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriterError {
    #[error("socket writer closed")]
    Closed,

    #[error("socket write failed: {0}")]
    Failed(String),

    #[error("drain deadline elapsed")]
    DeadlineElapsed,
}

/// Serializer failures are opaque; only the fact that framing failed matters.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct SerializeError(pub String);

impl From<SerializeError> for OutputError {
    fn from(err: SerializeError) -> Self {
        OutputError::SerializeFailed(err.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_errors_keep_their_reason() {
        let err = TransportError::Handshake("rejected key".into()).into_connect_error();
        assert!(matches!(err, OutputError::HandshakeFailed(ref m) if m == "rejected key"));
    }

    #[test]
    fn other_connect_errors_map_to_connect_failed() {
        let err = TransportError::Connect("refused".into()).into_connect_error();
        assert!(matches!(err, OutputError::ConnectFailed(_)));
        let err = TransportError::Closed.into_connect_error();
        assert!(matches!(err, OutputError::ConnectFailed(_)));
    }

    #[test]
    fn mid_stream_transport_errors_are_write_failures() {
        let err: OutputError = TransportError::Write("broken pipe".into()).into();
        assert!(matches!(err, OutputError::TransportWriteFailed(_)));
    }

    #[test]
    fn shutdown_timeout_message_names_the_deadline() {
        let err = OutputError::ShutdownTimeout {
            seconds: 5,
            remaining: 12,
            unsent_bytes: 48_000,
        };
        assert_eq!(
            err.to_string(),
            "took longer than 5 second(s) to shut down, 12 packet(s) / 48000 byte(s) unsent"
        );
    }
}
