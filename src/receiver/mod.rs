//! Receiving role of the transfer protocol.
//!
//! [`Receiver`] is a pure state machine: it consumes transport events and
//! operator commands and answers with the [`ReceiverEffect`]s the caller has
//! to perform. [`ReceiverSession`] wraps it into a serialized driver bound to
//! a [`crate::PeerChannel`].
//!
//! States run `Idle → WaitingForConnect → Connecting →
//! WaitingForVersion → WaitingForTransferId → WaitingForTransferAccept →
//! WaitingForCount → WaitingForId → Receiving → Idle`. Control messages
//! that arrive in a state not expecting them are logged and ignored.

mod session;

use std::fmt;
use std::path::PathBuf;

use url::Url;

use crate::channel::{
    IncomingPayload, PayloadId, PayloadKind, PayloadStatus, PeerId,
    TransferUpdate,
};
use crate::message::{ReceiverMessage, SenderMessage};
use crate::progress::Progress;
use crate::{
    AcceptTransferRequest, Error, ReceiverConfig, ResourceDescriptor, Result,
    ServiceId, TransferError, TransferResult,
};

pub use session::{ReceiverSession, ReceiverSubscriber};

const LOG_PREFIX: &str = "[receiver]";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReceiverState {
    Idle,
    WaitingForConnect,
    Connecting,
    WaitingForVersion,
    WaitingForTransferId,
    WaitingForTransferAccept,
    WaitingForCount,
    WaitingForId,
    Receiving,
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Transport callbacks and follow-ups of executed effects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiverEvent {
    ConnectionInitiated(PeerId),
    ConnectionResult { peer: PeerId, connected: bool },
    Disconnected(PeerId),
    MessageReceived { peer: PeerId, bytes: Vec<u8> },
    PayloadReceived { peer: PeerId, payload: IncomingPayload },
    PayloadTransferUpdate(TransferUpdate),
    /// A [`ReceiverEffect::Persist`] succeeded.
    Persisted { index: usize, location: Url },
    /// A [`ReceiverEffect::Persist`] failed.
    PersistFailed { index: usize, reason: String },
    /// The transport refused one of the effects.
    TransportFailed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiverEffect {
    StartAdvertising(ServiceId),
    StopAdvertising,
    AcceptConnection(PeerId),
    Send {
        peer: PeerId,
        message: ReceiverMessage,
    },
    Disconnect(PeerId),
    Progress(Progress),
    NotifyAcceptTransfer(AcceptTransferRequest),
    /// Move a completely received payload to durable storage and report
    /// back with [`ReceiverEvent::Persisted`] or
    /// [`ReceiverEvent::PersistFailed`].
    Persist {
        index: usize,
        resource_id: String,
        staged: PathBuf,
    },
    NotifyTransferComplete(TransferResult),
    NotifyFailure(TransferError),
}

#[derive(Debug)]
struct InFlight {
    index: usize,
    payload: PayloadId,
    staged: PathBuf,
}

/// Everything that belongs to one inbound session.
#[derive(Debug, Default)]
struct Inbound {
    peer: Option<PeerId>,
    transfer_id: Option<String>,
    /// The session was refused; only the peer's disconnect is awaited.
    closing: bool,
    announced: Vec<Option<String>>,
    expected: Vec<String>,
    received: Vec<ResourceDescriptor>,
    in_flight: Option<InFlight>,
    persisting: Option<usize>,
}

#[derive(Debug)]
pub struct Receiver {
    protocol_version: u32,
    max_resources: usize,
    state: ReceiverState,
    service_id: Option<ServiceId>,
    inbound: Inbound,
}

impl Receiver {
    pub fn new(config: &ReceiverConfig) -> Self {
        Self {
            protocol_version: config.protocol_version,
            max_resources: config.max_resources,
            state: ReceiverState::Idle,
            service_id: None,
            inbound: Inbound::default(),
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Transfer id of the current session, once the sender has announced it.
    pub fn transfer_id(&self) -> Option<&str> {
        self.inbound.transfer_id.as_deref()
    }

    pub fn peer(&self) -> Option<&PeerId> {
        self.inbound.peer.as_ref()
    }

    pub fn start_advertising(
        &mut self,
        service_id: ServiceId,
    ) -> Result<Vec<ReceiverEffect>> {
        self.check_state("startAdvertising", ReceiverState::Idle)?;

        log::info!("{LOG_PREFIX} starting advertising for '{service_id}'");
        self.inbound = Inbound::default();
        self.service_id = Some(service_id.clone());
        self.state = ReceiverState::WaitingForConnect;

        Ok(vec![ReceiverEffect::StartAdvertising(service_id)])
    }

    /// Cancels advertising and any session in progress.
    pub fn end_advertising(&mut self) -> Vec<ReceiverEffect> {
        log::info!(
            "{LOG_PREFIX} stop advertising while in state '{}'",
            self.state
        );

        if self.state == ReceiverState::Idle {
            return vec![];
        }

        let mut effects = vec![ReceiverEffect::StopAdvertising];
        if let Some(peer) = self.inbound.peer.take() {
            effects.push(ReceiverEffect::Disconnect(peer));
        }
        effects.push(ReceiverEffect::Progress(Progress::finished()));
        self.reset();
        effects
    }

    /// Answers the pending accept request. Only valid while waiting for the
    /// operator and only for the exact transfer id announced by the sender.
    pub fn accept_transfer(
        &mut self,
        transfer_id: &str,
        accept: bool,
    ) -> Result<Vec<ReceiverEffect>> {
        self.check_state(
            "acceptTransfer",
            ReceiverState::WaitingForTransferAccept,
        )?;

        let current = self.inbound.transfer_id.as_deref().unwrap_or_default();
        if transfer_id != current {
            log::error!(
                "{LOG_PREFIX} invalid transferId to accept (expected: '{current}' found '{transfer_id}')"
            );
            return Err(Error::TransferIdMismatch {
                expected: current.to_string(),
                found: transfer_id.to_string(),
            });
        }

        let peer = self.inbound.peer.clone().ok_or_else(|| {
            Error::Other(anyhow::anyhow!("no peer for transfer '{current}'"))
        })?;

        log::info!(
            "{LOG_PREFIX} ({accept}) accept transfer for transferId '{transfer_id}'"
        );
        self.inbound.closing = !accept;
        self.state = ReceiverState::WaitingForCount;

        Ok(vec![
            ReceiverEffect::Progress(Progress::percent(66)),
            ReceiverEffect::Send {
                peer,
                message: ReceiverMessage::transfer(accept),
            },
        ])
    }

    pub fn handle(&mut self, event: ReceiverEvent) -> Vec<ReceiverEffect> {
        match event {
            ReceiverEvent::ConnectionInitiated(peer) => {
                self.on_connection_initiated(peer)
            }
            ReceiverEvent::ConnectionResult { peer, connected } => {
                self.on_connection_result(peer, connected)
            }
            ReceiverEvent::Disconnected(peer) => self.on_disconnected(peer),
            ReceiverEvent::MessageReceived { peer, bytes } => {
                if !self.is_session_peer(&peer) {
                    return vec![];
                }
                match SenderMessage::decode(&bytes) {
                    Ok(message) => self.on_message(peer, message),
                    Err(err) => {
                        log::warn!(
                            "{LOG_PREFIX} ignoring undecodable message: {err}"
                        );
                        vec![]
                    }
                }
            }
            ReceiverEvent::PayloadReceived { peer, payload } => {
                if !self.is_session_peer(&peer) {
                    return vec![];
                }
                match payload.kind {
                    PayloadKind::Bytes => {
                        log::debug!(
                            "{LOG_PREFIX} bytes payload {} delivered as message",
                            payload.id
                        );
                        vec![]
                    }
                    PayloadKind::File { staged } => {
                        self.on_file_payload(payload.id, staged)
                    }
                }
            }
            ReceiverEvent::PayloadTransferUpdate(update) => {
                self.on_transfer_update(update)
            }
            ReceiverEvent::Persisted { index, location } => {
                self.on_persisted(index, location)
            }
            ReceiverEvent::PersistFailed { index, reason } => {
                if self.inbound.persisting != Some(index) {
                    return vec![];
                }
                log::error!(
                    "{LOG_PREFIX} failed persisting resource {index}: {reason}"
                );
                self.fail(TransferError::InternalError)
            }
            ReceiverEvent::TransportFailed(reason) => {
                if self.state == ReceiverState::Idle {
                    return vec![];
                }
                log::error!("{LOG_PREFIX} transport failure: {reason}");
                if self.inbound.closing {
                    // the refusal was already reported
                    return self.hang_up();
                }
                self.fail(TransferError::InternalError)
            }
        }
    }

    fn on_connection_initiated(&mut self, peer: PeerId) -> Vec<ReceiverEffect> {
        if self.state != ReceiverState::WaitingForConnect {
            log::warn!(
                "{LOG_PREFIX} ignoring connection from '{peer}' in state '{}'",
                self.state
            );
            return vec![];
        }

        log::info!("{LOG_PREFIX} connection initiated from '{peer}'");
        self.inbound.peer = Some(peer.clone());
        self.state = ReceiverState::Connecting;

        vec![
            ReceiverEffect::StopAdvertising,
            ReceiverEffect::AcceptConnection(peer),
        ]
    }

    fn on_connection_result(
        &mut self,
        peer: PeerId,
        connected: bool,
    ) -> Vec<ReceiverEffect> {
        if self.state != ReceiverState::Connecting
            || !self.is_session_peer(&peer)
        {
            return vec![];
        }

        if connected {
            log::info!("{LOG_PREFIX} connected to '{peer}'");
            self.state = ReceiverState::WaitingForVersion;
            return vec![ReceiverEffect::Progress(Progress::handshake(0))];
        }

        log::warn!(
            "{LOG_PREFIX} connection to '{peer}' failed, advertising again"
        );
        self.readvertise()
    }

    fn on_disconnected(&mut self, peer: PeerId) -> Vec<ReceiverEffect> {
        if !self.is_session_peer(&peer) {
            return vec![];
        }

        log::info!(
            "{LOG_PREFIX} disconnected from '{peer}' in state '{}'",
            self.state
        );
        match self.state {
            ReceiverState::Idle | ReceiverState::WaitingForConnect => vec![],
            ReceiverState::Connecting => self.readvertise(),
            _ if self.inbound.closing => self.hang_up(),
            _ => self.fail(TransferError::TransferInterrupted),
        }
    }

    fn on_message(
        &mut self,
        peer: PeerId,
        message: SenderMessage,
    ) -> Vec<ReceiverEffect> {
        log::debug!("{LOG_PREFIX} message = {message}");

        if self.inbound.closing {
            log::warn!(
                "{LOG_PREFIX} ignoring '{message}' from refused session in state '{}'",
                self.state
            );
            return vec![];
        }

        match (self.state, message) {
            (
                ReceiverState::WaitingForVersion,
                SenderMessage::Version(version),
            ) => {
                if version != self.protocol_version {
                    log::warn!(
                        "{LOG_PREFIX} denying protocol version {version} (local {})",
                        self.protocol_version
                    );
                    // the sender hangs up once it has read the denial
                    self.inbound.closing = true;
                    return vec![
                        ReceiverEffect::NotifyFailure(
                            TransferError::VersionMismatch,
                        ),
                        ReceiverEffect::Send {
                            peer,
                            message: ReceiverMessage::VersionDeny,
                        },
                    ];
                }

                self.state = ReceiverState::WaitingForTransferId;
                vec![
                    ReceiverEffect::Progress(Progress::percent(25)),
                    ReceiverEffect::Send {
                        peer,
                        message: ReceiverMessage::VersionAccept,
                    },
                ]
            }

            (
                ReceiverState::WaitingForTransferId,
                SenderMessage::TransferId(transfer_id),
            ) => {
                log::info!(
                    "{LOG_PREFIX} notifying operator about transferId '{transfer_id}'"
                );
                self.inbound.transfer_id = Some(transfer_id.clone());
                self.state = ReceiverState::WaitingForTransferAccept;
                vec![
                    ReceiverEffect::Progress(Progress::percent(50)),
                    ReceiverEffect::NotifyAcceptTransfer(AcceptTransferRequest {
                        transfer_id,
                    }),
                ]
            }

            (ReceiverState::WaitingForCount, SenderMessage::Count(count)) => {
                if count > self.max_resources {
                    log::error!(
                        "{LOG_PREFIX} {count} resource(s) exceed the limit of {}",
                        self.max_resources
                    );
                    return self.fail(TransferError::InternalError);
                }

                log::info!("{LOG_PREFIX} expecting {count} resource(s)");
                self.inbound.announced = vec![None; count];
                self.inbound.received = Vec::with_capacity(count);
                self.state = ReceiverState::WaitingForId;
                vec![
                    ReceiverEffect::Progress(Progress::percent(90)),
                    ReceiverEffect::Send {
                        peer,
                        message: ReceiverMessage::CountAccept,
                    },
                ]
            }

            (
                ReceiverState::WaitingForId,
                SenderMessage::ResourceId { index, id },
            ) => {
                match self.inbound.announced.get_mut(index) {
                    Some(slot) => {
                        log::info!("{LOG_PREFIX} received id {index} '{id}'");
                        if let Some(previous) = slot.replace(id) {
                            log::warn!(
                                "{LOG_PREFIX} id {index} '{previous}' replaced"
                            );
                        }
                    }
                    None => log::warn!(
                        "{LOG_PREFIX} ignoring id for index {index} beyond count {}",
                        self.inbound.announced.len()
                    ),
                }
                vec![]
            }

            (ReceiverState::WaitingForId, SenderMessage::IdsDone) => {
                let announced = std::mem::take(&mut self.inbound.announced);
                let Some(expected) =
                    announced.into_iter().collect::<Option<Vec<String>>>()
                else {
                    log::error!(
                        "{LOG_PREFIX} id enumeration finished with missing ids"
                    );
                    return self.fail(TransferError::InternalError);
                };

                self.inbound.expected = expected;
                self.state = ReceiverState::Receiving;
                let mut effects = vec![
                    ReceiverEffect::Progress(Progress::percent(100)),
                    ReceiverEffect::Send {
                        peer,
                        message: ReceiverMessage::IdAccept,
                    },
                ];
                if self.inbound.expected.is_empty() {
                    effects.extend(self.complete());
                }
                effects
            }

            (state, message) => {
                log::warn!(
                    "{LOG_PREFIX} invalid state '{state}' for message '{message}'"
                );
                vec![]
            }
        }
    }

    fn on_file_payload(
        &mut self,
        payload: PayloadId,
        staged: PathBuf,
    ) -> Vec<ReceiverEffect> {
        log::info!("{LOG_PREFIX} payload received: FILE {payload}");

        match self.state {
            ReceiverState::Idle | ReceiverState::WaitingForConnect => {
                return vec![];
            }
            ReceiverState::Receiving => {}
            state => {
                log::error!(
                    "{LOG_PREFIX} file payload {payload} in state '{state}'"
                );
                return self.fail(TransferError::InternalError);
            }
        }

        if self.inbound.in_flight.is_some() || self.inbound.persisting.is_some()
        {
            log::error!(
                "{LOG_PREFIX} file payload {payload} while another is in flight"
            );
            return self.fail(TransferError::InternalError);
        }

        let index = self.inbound.received.len();
        let total = self.inbound.expected.len();
        if index >= total {
            log::error!(
                "{LOG_PREFIX} invalid number of resources (expected: {total} found: {})",
                index + 1
            );
            return self.fail(TransferError::InternalError);
        }

        self.inbound.in_flight = Some(InFlight {
            index,
            payload,
            staged,
        });
        vec![ReceiverEffect::Progress(Progress::file(index, total))]
    }

    fn on_transfer_update(
        &mut self,
        update: TransferUpdate,
    ) -> Vec<ReceiverEffect> {
        let tracked = matches!(
            &self.inbound.in_flight,
            Some(in_flight) if in_flight.payload == update.payload
        );
        if !tracked {
            return vec![];
        }

        match update.status {
            PayloadStatus::InProgress => {
                let percent = update.percent();
                vec![ReceiverEffect::Progress(Progress::percent(percent))]
            }
            PayloadStatus::Success => {
                let Some(in_flight) = self.inbound.in_flight.take() else {
                    return vec![];
                };
                log::debug!(
                    "{LOG_PREFIX} payload {} complete at {}",
                    in_flight.payload,
                    in_flight.staged.display()
                );
                self.inbound.persisting = Some(in_flight.index);
                vec![
                    ReceiverEffect::Progress(Progress::percent(100)),
                    ReceiverEffect::Persist {
                        index: in_flight.index,
                        resource_id: self.inbound.expected[in_flight.index]
                            .clone(),
                        staged: in_flight.staged,
                    },
                ]
            }
            PayloadStatus::Failure | PayloadStatus::Canceled => {
                log::error!(
                    "{LOG_PREFIX} payload {} ended with {:?}",
                    update.payload,
                    update.status
                );
                self.fail(TransferError::InternalError)
            }
        }
    }

    fn on_persisted(
        &mut self,
        index: usize,
        location: Url,
    ) -> Vec<ReceiverEffect> {
        if self.state != ReceiverState::Receiving
            || self.inbound.persisting != Some(index)
        {
            log::warn!("{LOG_PREFIX} ignoring persisted resource {index}");
            return vec![];
        }

        self.inbound.persisting = None;
        let id = self.inbound.expected[index].clone();
        log::info!("{LOG_PREFIX} resource {index} '{id}' stored at {location}");
        self.inbound
            .received
            .push(ResourceDescriptor::new(id, location));

        if self.inbound.received.len() == self.inbound.expected.len() {
            self.complete()
        } else {
            vec![]
        }
    }

    fn complete(&mut self) -> Vec<ReceiverEffect> {
        log::info!("{LOG_PREFIX} transfer finished");
        let result = TransferResult {
            transfer_id: self.inbound.transfer_id.take().unwrap_or_default(),
            resources: std::mem::take(&mut self.inbound.received),
        };
        self.reset();
        vec![
            ReceiverEffect::Progress(Progress::finished()),
            ReceiverEffect::NotifyTransferComplete(result),
        ]
    }

    fn fail(&mut self, error: TransferError) -> Vec<ReceiverEffect> {
        log::warn!(
            "{LOG_PREFIX} session failed in state '{}': {error}",
            self.state
        );
        let mut effects = Vec::with_capacity(3);
        if let Some(peer) = self.inbound.peer.take() {
            effects.push(ReceiverEffect::Disconnect(peer));
        }
        effects.push(ReceiverEffect::Progress(Progress::finished()));
        effects.push(ReceiverEffect::NotifyFailure(error));
        self.reset();
        effects
    }

    /// Ends a refused session without reporting another failure.
    fn hang_up(&mut self) -> Vec<ReceiverEffect> {
        let mut effects = Vec::with_capacity(2);
        if let Some(peer) = self.inbound.peer.take() {
            effects.push(ReceiverEffect::Disconnect(peer));
        }
        effects.push(ReceiverEffect::Progress(Progress::finished()));
        self.reset();
        effects
    }

    fn readvertise(&mut self) -> Vec<ReceiverEffect> {
        self.inbound = Inbound::default();
        match self.service_id.clone() {
            Some(service_id) => {
                self.state = ReceiverState::WaitingForConnect;
                vec![ReceiverEffect::StartAdvertising(service_id)]
            }
            None => {
                self.state = ReceiverState::Idle;
                vec![]
            }
        }
    }

    fn reset(&mut self) {
        self.inbound = Inbound::default();
        self.state = ReceiverState::Idle;
    }

    fn is_session_peer(&self, peer: &PeerId) -> bool {
        let matches = self.inbound.peer.as_ref() == Some(peer);
        if !matches {
            log::warn!(
                "{LOG_PREFIX} ignoring event from unknown peer '{peer}'"
            );
        }
        matches
    }

    fn check_state(
        &self,
        operation: &'static str,
        expected: ReceiverState,
    ) -> Result<()> {
        if self.state == expected {
            return Ok(());
        }
        log::warn!(
            "{LOG_PREFIX} invalid state when calling '{operation}' (expected '{expected}' found '{}')",
            self.state
        );
        Err(Error::InvalidState {
            operation,
            expected: state_name(expected),
            found: self.state.to_string(),
        })
    }
}

fn state_name(state: ReceiverState) -> &'static str {
    match state {
        ReceiverState::Idle => "Idle",
        ReceiverState::WaitingForConnect => "WaitingForConnect",
        ReceiverState::Connecting => "Connecting",
        ReceiverState::WaitingForVersion => "WaitingForVersion",
        ReceiverState::WaitingForTransferId => "WaitingForTransferId",
        ReceiverState::WaitingForTransferAccept => "WaitingForTransferAccept",
        ReceiverState::WaitingForCount => "WaitingForCount",
        ReceiverState::WaitingForId => "WaitingForId",
        ReceiverState::Receiving => "Receiving",
    }
}
