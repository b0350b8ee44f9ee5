//! Error types for the pvdd client.
//!
//! Operational faults (connect failures, broken pipes, undecodable bytes) are
//! never fatal: the connection reports them as `error` events and, when
//! auto-reconnect is enabled, schedules another attempt. The same values are
//! returned from `send` so callers can react locally if they want to.

use std::sync::Arc;

use thiserror::Error;

use crate::protocol::FrameError;

/// Errors raised while talking to pvdd.
///
/// I/O errors are kept behind an `Arc` so the same value can be handed to
/// every `error` listener and returned to the caller.
#[derive(Debug, Clone, Error)]
pub enum PvddError {
    /// Failed to open the TCP connection to the daemon.
    #[error("Connection failed: {0}")]
    Connect(#[source] Arc<std::io::Error>),

    /// Writing a command to the socket failed.
    #[error("Send failed: {0}")]
    Send(#[source] Arc<std::io::Error>),

    /// Reading from the socket failed.
    #[error("Read failed: {0}")]
    Read(#[source] Arc<std::io::Error>),

    /// The peer closed the connection (zero-byte read or write).
    #[error("connection broken")]
    ConnectionClosed,

    /// A received line was not valid UTF-8.
    #[error("Protocol error: invalid UTF-8 in received line: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A line or multi-line block outgrew the framing limit.
    #[error("Protocol error: {0}")]
    Frame(#[from] FrameError),

    /// No socket is currently open.
    #[error("Not connected to pvdd")]
    NotConnected,
}

impl From<std::io::Error> for PvddError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                PvddError::Connect(Arc::new(err))
            }
            std::io::ErrorKind::WriteZero | std::io::ErrorKind::UnexpectedEof => {
                PvddError::ConnectionClosed
            }
            _ => PvddError::Send(Arc::new(err)),
        }
    }
}

impl PvddError {
    /// Classify a failed write. Unlike the `From` conversion, a refused or
    /// missing peer here still means the send failed, not the connect.
    pub fn from_write(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WriteZero => PvddError::ConnectionClosed,
            _ => PvddError::Send(Arc::new(err)),
        }
    }

    /// Whether the error means the socket is no longer usable.
    pub fn is_transport(&self) -> bool {
        !matches!(
            self,
            PvddError::InvalidUtf8(_) | PvddError::Frame(_) | PvddError::NotConnected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(PvddError::ConnectionClosed.to_string(), "connection broken");
        assert_eq!(PvddError::NotConnected.to_string(), "Not connected to pvdd");

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(
            PvddError::Connect(Arc::new(refused)).to_string(),
            "Connection failed: refused"
        );
    }

    #[test]
    fn test_error_from_io() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(PvddError::from(refused), PvddError::Connect(_)));

        let write_zero = std::io::Error::new(std::io::ErrorKind::WriteZero, "zero");
        assert!(matches!(
            PvddError::from(write_zero),
            PvddError::ConnectionClosed
        ));

        let other = std::io::Error::new(std::io::ErrorKind::Other, "other");
        assert!(matches!(PvddError::from(other), PvddError::Send(_)));
    }

    #[test]
    fn test_invalid_utf8_is_not_transport() {
        let bad = String::from_utf8(vec![0xff, 0xfe]).unwrap_err();
        let err = PvddError::from(bad);
        assert!(matches!(err, PvddError::InvalidUtf8(_)));
        assert!(!err.is_transport());
        assert!(PvddError::ConnectionClosed.is_transport());
    }

    #[test]
    fn test_write_errors_are_send_failures() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(PvddError::from_write(refused), PvddError::Send(_)));

        let pipe = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = PvddError::from_write(pipe);
        assert!(matches!(err, PvddError::Send(_)));
        assert_eq!(err.to_string(), "Send failed: pipe");

        let zero = std::io::Error::new(std::io::ErrorKind::WriteZero, "zero");
        assert!(matches!(
            PvddError::from_write(zero),
            PvddError::ConnectionClosed
        ));
    }

    #[test]
    fn test_frame_error_is_not_transport() {
        let err = PvddError::from(FrameError::LineTooLong { limit: 8 });
        assert_eq!(err.to_string(), "Protocol error: line exceeds 8 bytes");
        assert!(!err.is_transport());
    }
}
