use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::MessageError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
    #[error("Message error: {0}")]
    Message(#[from] MessageError),
    #[error("Invalid service id '{0}'")]
    InvalidServiceId(String),
    #[error("Invalid state when calling '{operation}' (expected '{expected}' found '{found}')")]
    InvalidState {
        operation: &'static str,
        expected: &'static str,
        found: String,
    },
    #[error("Invalid transfer id (expected '{expected}' found '{found}')")]
    TransferIdMismatch { expected: String, found: String },
    #[error("Session is closed")]
    SessionClosed,
    #[error("Parsing error")]
    Parse,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for Error {
    fn from(_: serde_json::Error) -> Self {
        Self::Parse
    }
}

/// Outcome reported once to the result channel of a failed transfer.
#[derive(
    Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum TransferError {
    /// The transfer was interrupted by either sender or receiver.
    #[error("transfer interrupted")]
    TransferInterrupted,
    /// Sender and receiver speak different protocol versions.
    #[error("protocol version mismatch")]
    VersionMismatch,
    /// The receiving operator declined the transfer.
    #[error("transfer denied")]
    TransferDenied,
    /// The operator cancelled browsing before connecting.
    #[error("cancelled")]
    Cancelled,
    /// Surfaced by the host before the core is reached.
    #[error("permission denied")]
    PermissionDenied,
    /// Out-of-state message, malformed payload or IO failure.
    #[error("internal error")]
    InternalError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_error_serializes_in_camel_case() {
        let json = serde_json::to_string(&TransferError::VersionMismatch)
            .unwrap();
        assert_eq!(json, "\"versionMismatch\"");

        let parsed: TransferError =
            serde_json::from_str("\"transferInterrupted\"").unwrap();
        assert_eq!(parsed, TransferError::TransferInterrupted);
    }

    #[test]
    fn invalid_state_names_both_states() {
        let error = Error::InvalidState {
            operation: "connect",
            expected: "Browsing",
            found: "Idle".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid state when calling 'connect' (expected 'Browsing' found 'Idle')"
        );
    }
}
