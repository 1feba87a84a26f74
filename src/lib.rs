//! Transfer of a fixed list of resources from one device to another over a
//! nearby peer-to-peer link.
//!
//! A [`SenderSession`] browses for a receiving peer, connects, runs a short
//! text handshake (protocol version, transfer id, operator acceptance,
//! resource count, resource ids) and then streams one file payload per
//! resource, strictly in order. A [`ReceiverSession`] advertises itself,
//! answers the handshake, asks its operator whether to accept, persists
//! every payload through a [`ResourceStore`] and reports the result.
//!
//! Discovery, connections and byte streaming are provided by the host
//! through [`PeerChannel`]; its callbacks are fed back into the sessions as
//! [`ReceiverEvent`]s and [`SenderEvent`]s.

pub mod channel;
pub mod config;
pub mod errors;
pub mod message;
pub mod progress;
pub mod receiver;
pub mod resource;
pub mod sender;
pub mod service;
pub mod store;

mod subscribers;

pub use channel::{
    IncomingPayload, PayloadId, PayloadKind, PayloadStatus, Peer, PeerChannel,
    PeerId, TransferUpdate,
};
pub use config::{ReceiverConfig, SenderConfig};
pub use errors::{Error, Result, TransferError};
pub use message::{MessageError, ReceiverMessage, SenderMessage};
pub use progress::{LogProgress, Progress, ProgressSink, ProgressValue};
pub use receiver::{
    Receiver, ReceiverEffect, ReceiverEvent, ReceiverSession, ReceiverState,
    ReceiverSubscriber,
};
pub use resource::{AcceptTransferRequest, ResourceDescriptor, TransferResult};
pub use sender::{
    PendingTransfer, Sender, SenderEffect, SenderEvent, SenderSession,
    SenderState, SenderSubscriber, TransferOutcome,
};
pub use service::ServiceId;
pub use store::{DirectoryStore, ResourceStore};

/// Version proposed by senders and required by receivers.
pub const PROTOCOL_VERSION: u32 = 1;
