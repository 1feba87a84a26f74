//! The transport the protocol runs on.
//!
//! Discovery, connection establishment and the actual byte streaming are
//! provided by a platform peer-connection service. The core only consumes it
//! through [`PeerChannel`] and is fed its asynchronous callbacks as events.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{ResourceDescriptor, Result, ServiceId};

/// Opaque transport-level identifier of the other party.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peer found while browsing.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
}

/// Handle the transport assigns to one payload transmission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadId(pub i64);

impl fmt::Display for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    Bytes,
    /// A file payload. `staged` is where the transport writes the incoming
    /// bytes; it is only complete after a successful terminal update.
    File { staged: PathBuf },
}

/// A payload that has started to arrive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingPayload {
    pub id: PayloadId,
    pub kind: PayloadKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadStatus {
    InProgress,
    Success,
    Failure,
    Canceled,
}

/// Progress or terminal event of one payload, keyed by its handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferUpdate {
    pub payload: PayloadId,
    pub status: PayloadStatus,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

impl TransferUpdate {
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        let ratio = self.bytes_transferred.min(self.total_bytes) as f64
            / self.total_bytes as f64;
        (100.0 * ratio) as u8
    }
}

/// Operations the core requires from the peer-connection service.
///
/// All calls are fire-and-forget: outcomes arrive later as events on the
/// session that owns the channel. Implementations must not call back into
/// the session synchronously in a way that blocks on it.
pub trait PeerChannel: Send + Sync {
    /// Starts accepting inbound connection attempts for `service_id`.
    fn start_advertising(&self, service_id: &ServiceId) -> Result<()>;

    fn stop_advertising(&self);

    /// Starts reporting peers advertising `service_id`.
    fn start_discovery(&self, service_id: &ServiceId) -> Result<()>;

    fn stop_discovery(&self);

    fn request_connection(&self, peer: &PeerId) -> Result<()>;

    fn accept_connection(&self, peer: &PeerId) -> Result<()>;

    /// Sends a small control message. Delivery is reliable and ordered.
    fn send_message(&self, peer: &PeerId, bytes: &[u8]) -> Result<()>;

    /// Starts streaming `resource` and returns the handle its progress and
    /// terminal updates will carry.
    fn send_payload(
        &self,
        peer: &PeerId,
        resource: &ResourceDescriptor,
    ) -> Result<PayloadId>;

    fn disconnect(&self, peer: &PeerId);
}
