use std::time::Duration;

use crate::bluetooth::LinkError;
use crate::device::ConnectionState;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the protocol core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport refused or timed out the GATT connection. Retry with `connect`.
    #[error("GATT connect failed: {0}")]
    GattConnect(#[source] LinkError),

    /// The peripheral does not expose the QXW service. Pick another device entry.
    #[error("QXW service not found: {0}")]
    ServiceNotFound(#[source] LinkError),

    /// No matching notification arrived in time. The session stays usable.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// Write or subscribe failed. The session has moved to `Failed`.
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// Malformed inbound payload.
    #[error("malformed payload: {0}")]
    Format(String),

    #[error("{what} {value} out of range {min}..={max}")]
    Range {
        what: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("invalid argument: {0}")]
    Argument(String),

    /// A pending request was abandoned because the session disconnected.
    #[error("request cancelled by disconnect")]
    Cancelled,

    /// The call is not allowed in the current lifecycle state.
    #[error("not allowed while {0}")]
    InvalidState(ConnectionState),
}

impl Error {
    /// Whether re-issuing the same call can succeed without changing inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::GattConnect(_) | Error::Timeout(_))
    }

    /// Whether the session must reconnect before further commands.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::GattConnect(_) | Error::ServiceNotFound(_) | Error::Link(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_table() {
        assert!(Error::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(!Error::Timeout(Duration::from_secs(5)).is_session_fatal());
        assert!(Error::GattConnect(LinkError::Timeout).is_retryable());

        let not_found = Error::ServiceNotFound(LinkError::NotConnected);
        assert!(!not_found.is_retryable());
        assert!(not_found.is_session_fatal());

        assert!(!Error::Format("short".into()).is_session_fatal());
        assert!(!Error::Argument("x".into()).is_retryable());
    }

    #[test]
    fn test_range_message() {
        let err = Error::Range {
            what: "band",
            value: 8,
            min: 0,
            max: 7,
        };
        assert_eq!(err.to_string(), "band 8 out of range 0..=7");
    }
}
