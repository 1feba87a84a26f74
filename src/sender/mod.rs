//! Sending role of the transfer protocol.
//!
//! [`Sender`] lets the operator pick a discovered peer, drives the handshake
//! and then pushes the resources one payload at a time, strictly in order.
//! [`SenderSession`] runs it against a [`crate::PeerChannel`].

mod session;

use std::fmt;

use crate::channel::{
    IncomingPayload, PayloadId, PayloadKind, PayloadStatus, Peer, PeerId,
    TransferUpdate,
};
use crate::message::{MessageError, ReceiverMessage, SenderMessage};
use crate::progress::Progress;
use crate::{
    Error, ResourceDescriptor, Result, SenderConfig, ServiceId, TransferError,
};

pub use session::{PendingTransfer, SenderSession, SenderSubscriber};

const LOG_PREFIX: &str = "[sender]";

/// Final outcome of a send attempt.
pub type TransferOutcome = std::result::Result<(), TransferError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SenderState {
    Idle,
    StartBrowsing,
    Browsing,
    StartConnecting,
    Connecting,
    WaitingForVersion,
    WaitingForTransferId,
    WaitingForCount,
    WaitingForId,
    TransferringResources,
}

impl SenderState {
    fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::StartBrowsing => "StartBrowsing",
            Self::Browsing => "Browsing",
            Self::StartConnecting => "StartConnecting",
            Self::Connecting => "Connecting",
            Self::WaitingForVersion => "WaitingForVersion",
            Self::WaitingForTransferId => "WaitingForTransferId",
            Self::WaitingForCount => "WaitingForCount",
            Self::WaitingForId => "WaitingForId",
            Self::TransferringResources => "TransferringResources",
        }
    }

    /// Whether a connection to the chosen peer was requested or exists.
    fn is_connected(self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::WaitingForVersion
                | Self::WaitingForTransferId
                | Self::WaitingForCount
                | Self::WaitingForId
                | Self::TransferringResources
        )
    }
}

impl fmt::Display for SenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SenderEvent {
    PeerFound(Peer),
    PeerLost(PeerId),
    ConnectionInitiated(PeerId),
    ConnectionResult { peer: PeerId, connected: bool },
    Disconnected(PeerId),
    MessageReceived { peer: PeerId, bytes: Vec<u8> },
    PayloadReceived { peer: PeerId, payload: IncomingPayload },
    PayloadTransferUpdate(TransferUpdate),
    /// The transport accepted the payload for the resource at `index`.
    PayloadStarted { index: usize, payload: PayloadId },
    /// The transport refused the payload for the resource at `index`.
    PayloadSendFailed { index: usize, reason: String },
    TransportFailed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SenderEffect {
    /// Show the operator a list of nearby peers to pick from.
    PresentPeerBrowser,
    StartDiscovery(ServiceId),
    StopDiscovery,
    NotifyPeerFound(Peer),
    NotifyPeerLost(PeerId),
    /// Replace the peer browser with a progress view.
    PresentTransferProgress,
    RequestConnection(PeerId),
    AcceptConnection(PeerId),
    Send {
        peer: PeerId,
        message: SenderMessage,
    },
    /// Start streaming one resource. Answered by
    /// [`SenderEvent::PayloadStarted`] or [`SenderEvent::PayloadSendFailed`].
    SendPayload {
        peer: PeerId,
        index: usize,
        resource: ResourceDescriptor,
    },
    Disconnect(PeerId),
    Progress(Progress),
    /// Settle the pending transfer returned by `start_browse`.
    Resolve(TransferOutcome),
}

#[derive(Debug)]
struct Outbound {
    service_id: ServiceId,
    transfer_id: String,
    resources: Vec<ResourceDescriptor>,
    peer: Option<PeerId>,
    current: usize,
    in_flight: Option<PayloadId>,
}

#[derive(Debug)]
pub struct Sender {
    protocol_version: u32,
    state: SenderState,
    outbound: Option<Outbound>,
}

impl Sender {
    pub fn new(config: &SenderConfig) -> Self {
        Self {
            protocol_version: config.protocol_version,
            state: SenderState::Idle,
            outbound: None,
        }
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn transfer_id(&self) -> Option<&str> {
        self.outbound
            .as_ref()
            .map(|outbound| outbound.transfer_id.as_str())
    }

    pub fn peer(&self) -> Option<&PeerId> {
        self.outbound.as_ref().and_then(|outbound| outbound.peer.as_ref())
    }

    /// Begins a send attempt for `resources`. The list is fixed for the
    /// lifetime of the session.
    pub fn start_browse(
        &mut self,
        service_id: ServiceId,
        transfer_id: impl Into<String>,
        resources: Vec<ResourceDescriptor>,
    ) -> Result<Vec<SenderEffect>> {
        self.check_state("startBrowse", &[SenderState::Idle])?;

        let transfer_id = transfer_id.into();
        if transfer_id.is_empty() {
            return Err(MessageError::EmptyTransferId.into());
        }
        if let Some(index) = resources.iter().position(|r| r.id().is_empty()) {
            return Err(
                MessageError::EmptyResourceId(format!("{index}")).into()
            );
        }

        log::info!(
            "{LOG_PREFIX} browsing '{service_id}' to send {} resource(s) as '{transfer_id}'",
            resources.len()
        );
        self.outbound = Some(Outbound {
            service_id,
            transfer_id,
            resources,
            peer: None,
            current: 0,
            in_flight: None,
        });
        self.state = SenderState::StartBrowsing;

        Ok(vec![SenderEffect::PresentPeerBrowser])
    }

    /// Called once the peer browser is visible.
    pub fn start_discover(&mut self) -> Result<Vec<SenderEffect>> {
        self.check_state("startDiscover", &[SenderState::StartBrowsing])?;
        let service_id = self.outbound()?.service_id.clone();

        self.state = SenderState::Browsing;
        Ok(vec![SenderEffect::StartDiscovery(service_id)])
    }

    pub fn connect(&mut self, peer: PeerId) -> Result<Vec<SenderEffect>> {
        self.check_state("connect", &[SenderState::Browsing])?;

        log::info!("{LOG_PREFIX} operator picked '{peer}'");
        self.outbound_mut()?.peer = Some(peer);
        self.state = SenderState::StartConnecting;

        Ok(vec![
            SenderEffect::StopDiscovery,
            SenderEffect::PresentTransferProgress,
        ])
    }

    /// Called once the progress view is visible.
    pub fn start_transfer(&mut self) -> Result<Vec<SenderEffect>> {
        self.check_state("startTransfer", &[SenderState::StartConnecting])?;
        let peer = self.session_peer()?;

        self.state = SenderState::Connecting;
        Ok(vec![
            SenderEffect::Progress(Progress::handshake(0)),
            SenderEffect::RequestConnection(peer),
        ])
    }

    pub fn cancel_browse(&mut self) -> Result<Vec<SenderEffect>> {
        self.check_state(
            "cancelBrowse",
            &[SenderState::StartBrowsing, SenderState::Browsing],
        )?;

        log::info!("{LOG_PREFIX} browsing cancelled");
        let mut effects = Vec::with_capacity(2);
        if self.state == SenderState::Browsing {
            effects.push(SenderEffect::StopDiscovery);
        }
        effects.push(SenderEffect::Resolve(Err(TransferError::Cancelled)));
        self.reset();
        Ok(effects)
    }

    pub fn handle(&mut self, event: SenderEvent) -> Vec<SenderEffect> {
        match event {
            SenderEvent::PeerFound(peer) => {
                if self.state != SenderState::Browsing {
                    return vec![];
                }
                log::debug!("{LOG_PREFIX} found '{}' ({})", peer.name, peer.id);
                vec![SenderEffect::NotifyPeerFound(peer)]
            }
            SenderEvent::PeerLost(peer) => {
                if self.state != SenderState::Browsing {
                    return vec![];
                }
                log::debug!("{LOG_PREFIX} lost '{peer}'");
                vec![SenderEffect::NotifyPeerLost(peer)]
            }
            SenderEvent::ConnectionInitiated(peer) => {
                if self.state != SenderState::Connecting
                    || !self.is_session_peer(&peer)
                {
                    return vec![];
                }
                vec![SenderEffect::AcceptConnection(peer)]
            }
            SenderEvent::ConnectionResult { peer, connected } => {
                if self.state != SenderState::Connecting
                    || !self.is_session_peer(&peer)
                {
                    return vec![];
                }
                self.on_connection_result(peer, connected)
            }
            SenderEvent::Disconnected(peer) => {
                if !self.state.is_connected() || !self.is_session_peer(&peer) {
                    return vec![];
                }
                log::warn!(
                    "{LOG_PREFIX} '{peer}' disconnected in state '{}'",
                    self.state
                );
                self.fail(TransferError::TransferInterrupted)
            }
            SenderEvent::MessageReceived { peer, bytes } => {
                if !self.state.is_connected() || !self.is_session_peer(&peer) {
                    return vec![];
                }
                match ReceiverMessage::decode(&bytes) {
                    Ok(message) => self.on_message(peer, message),
                    Err(err) => {
                        log::warn!(
                            "{LOG_PREFIX} ignoring undecodable message: {err}"
                        );
                        vec![]
                    }
                }
            }
            SenderEvent::PayloadReceived { peer, payload } => {
                if !self.state.is_connected() || !self.is_session_peer(&peer) {
                    return vec![];
                }
                match payload.kind {
                    PayloadKind::Bytes => vec![],
                    PayloadKind::File { .. } => {
                        log::error!(
                            "{LOG_PREFIX} unexpected inbound file payload {}",
                            payload.id
                        );
                        self.fail(TransferError::InternalError)
                    }
                }
            }
            SenderEvent::PayloadStarted { index, payload } => {
                self.on_payload_started(index, payload)
            }
            SenderEvent::PayloadSendFailed { index, reason } => {
                if self.state != SenderState::TransferringResources {
                    return vec![];
                }
                log::error!(
                    "{LOG_PREFIX} could not send resource {index}: {reason}"
                );
                self.fail(TransferError::InternalError)
            }
            SenderEvent::PayloadTransferUpdate(update) => {
                self.on_transfer_update(update)
            }
            SenderEvent::TransportFailed(reason) => {
                if self.state == SenderState::Idle {
                    return vec![];
                }
                log::error!("{LOG_PREFIX} transport failure: {reason}");
                self.fail(TransferError::InternalError)
            }
        }
    }

    fn on_connection_result(
        &mut self,
        peer: PeerId,
        connected: bool,
    ) -> Vec<SenderEffect> {
        if !connected {
            log::warn!("{LOG_PREFIX} connection to '{peer}' was rejected");
            return self.fail(TransferError::TransferInterrupted);
        }

        log::info!("{LOG_PREFIX} connected to '{peer}'");
        self.state = SenderState::WaitingForVersion;
        vec![
            SenderEffect::Progress(Progress::handshake(25)),
            SenderEffect::Send {
                peer,
                message: SenderMessage::Version(self.protocol_version),
            },
        ]
    }

    fn on_message(
        &mut self,
        peer: PeerId,
        message: ReceiverMessage,
    ) -> Vec<SenderEffect> {
        log::debug!("{LOG_PREFIX} message = {message}");

        let Some(outbound) = self.outbound.as_ref() else {
            return vec![];
        };

        match (self.state, message) {
            (
                SenderState::WaitingForVersion,
                ReceiverMessage::VersionAccept,
            ) => {
                let transfer_id = outbound.transfer_id.clone();
                self.state = SenderState::WaitingForTransferId;
                vec![
                    SenderEffect::Progress(Progress::percent(50)),
                    SenderEffect::Send {
                        peer,
                        message: SenderMessage::TransferId(transfer_id),
                    },
                ]
            }
            (SenderState::WaitingForVersion, ReceiverMessage::VersionDeny) => {
                self.fail(TransferError::VersionMismatch)
            }
            (
                SenderState::WaitingForTransferId,
                ReceiverMessage::TransferAccept,
            ) => {
                let count = outbound.resources.len();
                self.state = SenderState::WaitingForCount;
                vec![
                    SenderEffect::Progress(Progress::percent(75)),
                    SenderEffect::Send {
                        peer,
                        message: SenderMessage::Count(count),
                    },
                ]
            }
            (
                SenderState::WaitingForTransferId,
                ReceiverMessage::TransferDeny,
            ) => {
                self.fail(TransferError::TransferDenied)
            }
            (SenderState::WaitingForCount, ReceiverMessage::CountAccept) => {
                let mut effects: Vec<SenderEffect> = outbound
                    .resources
                    .iter()
                    .enumerate()
                    .map(|(index, resource)| SenderEffect::Send {
                        peer: peer.clone(),
                        message: SenderMessage::ResourceId {
                            index,
                            id: resource.id().to_string(),
                        },
                    })
                    .collect();
                effects.push(SenderEffect::Send {
                    peer,
                    message: SenderMessage::IdsDone,
                });
                effects.push(SenderEffect::Progress(Progress::percent(90)));

                self.state = SenderState::WaitingForId;
                effects
            }
            (SenderState::WaitingForId, ReceiverMessage::IdAccept) => {
                log::info!("{LOG_PREFIX} handshake done, sending resources");
                self.state = SenderState::TransferringResources;
                let mut effects =
                    vec![SenderEffect::Progress(Progress::percent(100))];
                effects.extend(self.send_current());
                effects
            }
            (state, message) => {
                log::error!(
                    "{LOG_PREFIX} invalid state '{state}' for message '{message}'"
                );
                self.fail(TransferError::InternalError)
            }
        }
    }

    fn on_payload_started(
        &mut self,
        index: usize,
        payload: PayloadId,
    ) -> Vec<SenderEffect> {
        if self.state != SenderState::TransferringResources {
            return vec![];
        }
        let Some(outbound) = self.outbound.as_mut() else {
            return vec![];
        };
        if index != outbound.current || outbound.in_flight.is_some() {
            log::warn!(
                "{LOG_PREFIX} ignoring stale payload {payload} for resource {index}"
            );
            return vec![];
        }

        log::debug!("{LOG_PREFIX} resource {index} is payload {payload}");
        outbound.in_flight = Some(payload);
        vec![]
    }

    fn on_transfer_update(
        &mut self,
        update: TransferUpdate,
    ) -> Vec<SenderEffect> {
        if self.state != SenderState::TransferringResources {
            return vec![];
        }
        let Some(outbound) = self.outbound.as_mut() else {
            return vec![];
        };
        if outbound.in_flight != Some(update.payload) {
            return vec![];
        }

        match update.status {
            PayloadStatus::InProgress => {
                let percent = update.percent();
                vec![SenderEffect::Progress(Progress::percent(percent))]
            }
            PayloadStatus::Success => {
                outbound.in_flight = None;
                outbound.current += 1;
                self.send_current()
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

    /// Sends the resource at the current index, or finishes the session
    /// when every resource went out.
    fn send_current(&mut self) -> Vec<SenderEffect> {
        let Some(outbound) = self.outbound.as_ref() else {
            return vec![];
        };
        let Some(peer) = outbound.peer.clone() else {
            return self.fail(TransferError::InternalError);
        };

        let total = outbound.resources.len();
        let index = outbound.current;
        match outbound.resources.get(index) {
            Some(resource) => vec![
                SenderEffect::Progress(Progress::file(index, total)),
                SenderEffect::SendPayload {
                    peer,
                    index,
                    resource: resource.clone(),
                },
            ],
            None => {
                log::info!("{LOG_PREFIX} all {total} resource(s) sent");
                self.reset();
                vec![
                    SenderEffect::Progress(Progress::finished()),
                    SenderEffect::Disconnect(peer),
                    SenderEffect::Resolve(Ok(())),
                ]
            }
        }
    }

    fn fail(&mut self, error: TransferError) -> Vec<SenderEffect> {
        log::warn!(
            "{LOG_PREFIX} session failed in state '{}': {error}",
            self.state
        );
        let mut effects = Vec::with_capacity(3);
        if self.state.is_connected() {
            if let Some(peer) = self.peer().cloned() {
                effects.push(SenderEffect::Disconnect(peer));
            }
        }
        effects.push(SenderEffect::Progress(Progress::finished()));
        effects.push(SenderEffect::Resolve(Err(error)));
        self.reset();
        effects
    }

    fn reset(&mut self) {
        self.outbound = None;
        self.state = SenderState::Idle;
    }

    fn outbound(&self) -> Result<&Outbound> {
        self.outbound
            .as_ref()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("no outbound session")))
    }

    fn outbound_mut(&mut self) -> Result<&mut Outbound> {
        self.outbound
            .as_mut()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("no outbound session")))
    }

    fn session_peer(&self) -> Result<PeerId> {
        self.peer()
            .cloned()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("no peer selected")))
    }

    fn is_session_peer(&self, peer: &PeerId) -> bool {
        let matches = self.peer() == Some(peer);
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
        expected: &[SenderState],
    ) -> Result<()> {
        if expected.contains(&self.state) {
            return Ok(());
        }
        let expected = expected
            .first()
            .map(|state| state.name())
            .unwrap_or_default();
        log::warn!(
            "{LOG_PREFIX} invalid state when calling '{operation}' (expected '{expected}' found '{}')",
            self.state
        );
        Err(Error::InvalidState {
            operation,
            expected,
            found: self.state.to_string(),
        })
    }
}
