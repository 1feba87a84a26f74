//! Control messages exchanged during the handshake.
//!
//! Every message is a short UTF-8 string made of a three letter command, a
//! dot and an argument:
//!
//! | Direction | Message                    |
//! |-----------|----------------------------|
//! | S→R       | `ver.<int>`                |
//! | R→S       | `ver.accept` / `ver.deny`  |
//! | S→R       | `tid.<string>`             |
//! | R→S       | `tid.accept` / `tid.deny`  |
//! | S→R       | `cnt.<int>`                |
//! | R→S       | `cnt.accept`               |
//! | S→R       | `id.<index>.<resourceId>`  |
//! | S→R       | `id.done`                  |
//! | R→S       | `id.accept`                |
//!
//! Messages are decoded per direction: a receiver only ever parses
//! [`SenderMessage`]s and a sender only ever parses [`ReceiverMessage`]s, so
//! a transfer id such as `accept` is never mistaken for an answer.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const VERSION: &str = "ver.";
const TRANSFER_ID: &str = "tid.";
const COUNT: &str = "cnt.";
const RESOURCE_ID: &str = "id.";

const ACCEPT: &str = "accept";
const DENY: &str = "deny";
const DONE: &str = "done";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("message is not valid UTF-8")]
    NotUtf8,
    #[error("unknown message '{0}'")]
    Unknown(String),
    #[error("invalid protocol version in '{0}'")]
    InvalidVersion(String),
    #[error("empty transfer id")]
    EmptyTransferId,
    #[error("invalid resource count in '{0}'")]
    InvalidCount(String),
    #[error("invalid resource index in '{0}'")]
    InvalidIndex(String),
    #[error("empty resource id in '{0}'")]
    EmptyResourceId(String),
}

/// Messages sent from the sender to the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderMessage {
    Version(u32),
    TransferId(String),
    Count(usize),
    ResourceId { index: usize, id: String },
    IdsDone,
}

/// Messages sent from the receiver to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverMessage {
    VersionAccept,
    VersionDeny,
    TransferAccept,
    TransferDeny,
    CountAccept,
    IdAccept,
}

impl SenderMessage {
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        std::str::from_utf8(bytes)
            .map_err(|_| MessageError::NotUtf8)?
            .parse()
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl ReceiverMessage {
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        std::str::from_utf8(bytes)
            .map_err(|_| MessageError::NotUtf8)?
            .parse()
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    pub fn transfer(accept: bool) -> Self {
        if accept {
            Self::TransferAccept
        } else {
            Self::TransferDeny
        }
    }
}

/// Parses a non-empty run of ASCII digits. `usize::from_str` alone would
/// also accept a leading `+`.
fn parse_digits<T: FromStr>(value: &str) -> Option<T> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

impl FromStr for SenderMessage {
    type Err = MessageError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if let Some(version) = input.strip_prefix(VERSION) {
            return parse_digits(version)
                .map(Self::Version)
                .ok_or_else(|| MessageError::InvalidVersion(input.to_string()));
        }

        if let Some(transfer_id) = input.strip_prefix(TRANSFER_ID) {
            if transfer_id.is_empty() {
                return Err(MessageError::EmptyTransferId);
            }
            return Ok(Self::TransferId(transfer_id.to_string()));
        }

        if let Some(count) = input.strip_prefix(COUNT) {
            return parse_digits(count)
                .map(Self::Count)
                .ok_or_else(|| MessageError::InvalidCount(input.to_string()));
        }

        if let Some(rest) = input.strip_prefix(RESOURCE_ID) {
            if rest == DONE {
                return Ok(Self::IdsDone);
            }

            let (index, id) = rest
                .split_once('.')
                .ok_or_else(|| MessageError::InvalidIndex(input.to_string()))?;
            let index = parse_digits(index)
                .ok_or_else(|| MessageError::InvalidIndex(input.to_string()))?;
            if id.is_empty() {
                return Err(MessageError::EmptyResourceId(input.to_string()));
            }
            return Ok(Self::ResourceId {
                index,
                id: id.to_string(),
            });
        }

        Err(MessageError::Unknown(input.to_string()))
    }
}

impl FromStr for ReceiverMessage {
    type Err = MessageError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (command, answer) = input
            .split_once('.')
            .ok_or_else(|| MessageError::Unknown(input.to_string()))?;

        match (command, answer) {
            ("ver", ACCEPT) => Ok(Self::VersionAccept),
            ("ver", DENY) => Ok(Self::VersionDeny),
            ("tid", ACCEPT) => Ok(Self::TransferAccept),
            ("tid", DENY) => Ok(Self::TransferDeny),
            ("cnt", ACCEPT) => Ok(Self::CountAccept),
            ("id", ACCEPT) => Ok(Self::IdAccept),
            _ => Err(MessageError::Unknown(input.to_string())),
        }
    }
}

impl fmt::Display for SenderMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Version(version) => write!(f, "{VERSION}{version}"),
            Self::TransferId(transfer_id) => {
                write!(f, "{TRANSFER_ID}{transfer_id}")
            }
            Self::Count(count) => write!(f, "{COUNT}{count}"),
            Self::ResourceId { index, id } => {
                write!(f, "{RESOURCE_ID}{index}.{id}")
            }
            Self::IdsDone => write!(f, "{RESOURCE_ID}{DONE}"),
        }
    }
}

impl fmt::Display for ReceiverMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::VersionAccept => "ver.accept",
            Self::VersionDeny => "ver.deny",
            Self::TransferAccept => "tid.accept",
            Self::TransferDeny => "tid.deny",
            Self::CountAccept => "cnt.accept",
            Self::IdAccept => "id.accept",
        };
        f.write_str(text)
    }
}
