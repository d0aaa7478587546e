//! Stream Errors
//!
//! Failures that abort a single stream. None of these ever cross into other
//! streams or take down the hosting process; they are reported through the
//! stream handle's error event and the pipeline stops.
//!
//! Cancellation by the caller is deliberately absent: a cancelled stream
//! simply goes quiet.

use thiserror::Error;

/// Errors raised while opening or reading a response stream
#[derive(Debug, Error)]
pub enum StreamError {
    /// The server answered with a non-success status; no frames were parsed
    #[error("HTTP {status}: {body}")]
    Transport {
        /// HTTP status code
        status: u16,
        /// Response text (best effort)
        body: String,
    },

    /// The response has no readable body stream
    #[error("response body is not readable as a stream")]
    DecodeUnavailable,

    /// The connection dropped after the stream started
    #[error("connection interrupted: {0}")]
    NetworkInterrupted(String),

    /// The request never reached the server
    #[error("failed to connect: {0}")]
    Connect(String),

    /// The request could not be built (bad URL, unserializable body)
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl StreamError {
    /// HTTP status, for transport errors
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether partial content may exist for the failed stream
    ///
    /// Only interruptions happen after units could have been delivered.
    #[must_use]
    pub fn is_mid_stream(&self) -> bool {
        matches!(self, Self::NetworkInterrupted(_))
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            Self::InvalidRequest(e.to_string())
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else {
            Self::NetworkInterrupted(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = StreamError::Transport {
            status: 502,
            body: "bad gateway".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 502: bad gateway");
        assert_eq!(err.status(), Some(502));
        assert!(!err.is_mid_stream());
    }

    #[test]
    fn test_interruption_is_mid_stream() {
        let err = StreamError::NetworkInterrupted("reset by peer".to_string());
        assert!(err.is_mid_stream());
        assert_eq!(err.status(), None);
    }
}
