//! In-memory transport wiring a [`SenderSession`] to a [`ReceiverSession`].

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use p2p_connect::{
    AcceptTransferRequest, Error, IncomingPayload, PayloadId, PayloadKind,
    PayloadStatus, Peer, PeerChannel, PeerId, Progress, ProgressSink,
    ReceiverConfig, ReceiverEvent, ReceiverSession, ReceiverSubscriber,
    ResourceDescriptor, Result, SenderConfig, SenderEvent, SenderSession,
    SenderSubscriber, ServiceId, TransferError, TransferResult,
    TransferUpdate,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const SENDER_ENDPOINT: &str = "sender-endpoint";
pub const RECEIVER_ENDPOINT: &str = "receiver-endpoint";
pub const RECEIVER_NAME: &str = "Receiver";

/// Everything the sessions report to their operators.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    AcceptTransfer(AcceptTransferRequest),
    TransferComplete(TransferResult),
    Error(TransferError),
    PeerBrowser,
    PeerFound(Peer),
    PeerLost(PeerId),
    TransferProgress,
}

pub struct Operator {
    notices: mpsc::UnboundedSender<Notice>,
}

impl Operator {
    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }
}

impl ReceiverSubscriber for Operator {
    fn get_id(&self) -> String {
        "receiving-operator".to_string()
    }

    fn notify_accept_transfer(&self, request: AcceptTransferRequest) {
        self.notify(Notice::AcceptTransfer(request));
    }

    fn notify_transfer_complete(&self, result: TransferResult) {
        self.notify(Notice::TransferComplete(result));
    }

    fn notify_error(&self, error: TransferError) {
        self.notify(Notice::Error(error));
    }
}

impl SenderSubscriber for Operator {
    fn get_id(&self) -> String {
        "sending-operator".to_string()
    }

    fn present_peer_browser(&self) {
        self.notify(Notice::PeerBrowser);
    }

    fn notify_peer_found(&self, peer: Peer) {
        self.notify(Notice::PeerFound(peer));
    }

    fn notify_peer_lost(&self, peer: PeerId) {
        self.notify(Notice::PeerLost(peer));
    }

    fn present_transfer_progress(&self) {
        self.notify(Notice::TransferProgress);
    }
}

#[derive(Default)]
pub struct RecordingProgress {
    updates: Mutex<Vec<Progress>>,
}

impl RecordingProgress {
    pub fn updates(&self) -> Vec<Progress> {
        self.updates.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn update_progress(&self, progress: &Progress) {
        self.updates.lock().unwrap().push(progress.clone());
    }
}

/// Shared medium between both ends. Records every control message and
/// payload that crosses it.
pub struct Link {
    staging: TempDir,
    receiver: Mutex<Option<ReceiverSession>>,
    sender: Mutex<Option<SenderSession>>,
    advertised: Mutex<Option<ServiceId>>,
    accepted: Mutex<(bool, bool)>,
    connected: AtomicBool,
    next_payload: AtomicI64,
    wire: Mutex<Vec<String>>,
}

impl Link {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            staging: TempDir::new().unwrap(),
            receiver: Mutex::new(None),
            sender: Mutex::new(None),
            advertised: Mutex::new(None),
            accepted: Mutex::new((false, false)),
            connected: AtomicBool::new(false),
            next_payload: AtomicI64::new(1),
            wire: Mutex::new(Vec::new()),
        })
    }

    /// Control messages and payloads in the order they were put on the
    /// link. Sender lines start with `S`, receiver lines with `R`.
    pub fn wire(&self) -> Vec<String> {
        self.wire.lock().unwrap().clone()
    }

    pub fn is_advertising(&self) -> bool {
        self.advertised.lock().unwrap().is_some()
    }

    fn record(&self, line: String) {
        self.wire.lock().unwrap().push(line);
    }

    fn to_receiver(&self, event: ReceiverEvent) {
        let receiver = self.receiver.lock().unwrap().clone();
        if let Some(receiver) = receiver {
            receiver.on_event(event);
        }
    }

    fn to_sender(&self, event: SenderEvent) {
        let sender = self.sender.lock().unwrap().clone();
        if let Some(sender) = sender {
            sender.on_event(event);
        }
    }

    fn accept(&self, by_sender: bool) {
        let both = {
            let mut accepted = self.accepted.lock().unwrap();
            if by_sender {
                accepted.0 = true;
            } else {
                accepted.1 = true;
            }
            accepted.0 && accepted.1
        };
        if !both {
            return;
        }

        self.connected.store(true, Ordering::SeqCst);
        self.to_receiver(ReceiverEvent::ConnectionResult {
            peer: PeerId::new(SENDER_ENDPOINT),
            connected: true,
        });
        self.to_sender(SenderEvent::ConnectionResult {
            peer: PeerId::new(RECEIVER_ENDPOINT),
            connected: true,
        });
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Other(anyhow::anyhow!("not connected")))
        }
    }

    fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.accepted.lock().unwrap() = (false, false);
    }

    fn stage(
        &self,
        payload: PayloadId,
        source: &Path,
    ) -> Result<(PathBuf, u64)> {
        let staged = self.staging.path().join(format!("payload-{payload}"));
        let len = fs::copy(source, &staged)?;
        Ok((staged, len))
    }
}

fn update(
    payload: PayloadId,
    status: PayloadStatus,
    bytes_transferred: u64,
    total_bytes: u64,
) -> TransferUpdate {
    TransferUpdate {
        payload,
        status,
        bytes_transferred,
        total_bytes,
    }
}

pub struct ReceiverEnd(Arc<Link>);

impl PeerChannel for ReceiverEnd {
    fn start_advertising(&self, service_id: &ServiceId) -> Result<()> {
        *self.0.advertised.lock().unwrap() = Some(service_id.clone());
        Ok(())
    }

    fn stop_advertising(&self) {
        *self.0.advertised.lock().unwrap() = None;
    }

    fn start_discovery(&self, _: &ServiceId) -> Result<()> {
        Err(Error::Other(anyhow::anyhow!("receivers do not browse")))
    }

    fn stop_discovery(&self) {}

    fn request_connection(&self, _: &PeerId) -> Result<()> {
        Err(Error::Other(anyhow::anyhow!("receivers do not connect")))
    }

    fn accept_connection(&self, _: &PeerId) -> Result<()> {
        self.0.accept(false);
        Ok(())
    }

    fn send_message(&self, _: &PeerId, bytes: &[u8]) -> Result<()> {
        self.0.ensure_connected()?;
        self.0
            .record(format!("R {}", String::from_utf8_lossy(bytes)));
        self.0.to_sender(SenderEvent::MessageReceived {
            peer: PeerId::new(RECEIVER_ENDPOINT),
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn send_payload(
        &self,
        _: &PeerId,
        _: &ResourceDescriptor,
    ) -> Result<PayloadId> {
        Err(Error::Other(anyhow::anyhow!("receivers do not send payloads")))
    }

    fn disconnect(&self, _: &PeerId) {
        self.0.drop_connection();
        let receiver = PeerId::new(RECEIVER_ENDPOINT);
        self.0.to_sender(SenderEvent::Disconnected(receiver));
    }
}

pub struct SenderEnd(Arc<Link>);

impl PeerChannel for SenderEnd {
    fn start_advertising(&self, _: &ServiceId) -> Result<()> {
        Err(Error::Other(anyhow::anyhow!("senders do not advertise")))
    }

    fn stop_advertising(&self) {}

    fn start_discovery(&self, service_id: &ServiceId) -> Result<()> {
        let visible =
            self.0.advertised.lock().unwrap().as_ref() == Some(service_id);
        if visible {
            self.0.to_sender(SenderEvent::PeerFound(Peer {
                id: PeerId::new(RECEIVER_ENDPOINT),
                name: RECEIVER_NAME.to_string(),
            }));
        }
        Ok(())
    }

    fn stop_discovery(&self) {}

    fn request_connection(&self, peer: &PeerId) -> Result<()> {
        if peer.as_str() != RECEIVER_ENDPOINT || !self.0.is_advertising() {
            return Err(Error::Other(anyhow::anyhow!(
                "unknown endpoint {peer}"
            )));
        }
        *self.0.accepted.lock().unwrap() = (false, false);
        self.0.to_receiver(ReceiverEvent::ConnectionInitiated(PeerId::new(
            SENDER_ENDPOINT,
        )));
        self.0.to_sender(SenderEvent::ConnectionInitiated(PeerId::new(
            RECEIVER_ENDPOINT,
        )));
        Ok(())
    }

    fn accept_connection(&self, _: &PeerId) -> Result<()> {
        self.0.accept(true);
        Ok(())
    }

    fn send_message(&self, _: &PeerId, bytes: &[u8]) -> Result<()> {
        self.0.ensure_connected()?;
        self.0
            .record(format!("S {}", String::from_utf8_lossy(bytes)));
        self.0.to_receiver(ReceiverEvent::MessageReceived {
            peer: PeerId::new(SENDER_ENDPOINT),
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    /// Delivers the whole file at once: staged copy, one progress update and
    /// the terminal update on both ends.
    fn send_payload(
        &self,
        _: &PeerId,
        resource: &ResourceDescriptor,
    ) -> Result<PayloadId> {
        self.0.ensure_connected()?;
        let source = resource.location().to_file_path().map_err(|_| {
            Error::Other(anyhow::anyhow!("not a file: {}", resource.location()))
        })?;

        let payload =
            PayloadId(self.0.next_payload.fetch_add(1, Ordering::SeqCst));
        let (staged, len) = self.0.stage(payload, &source)?;
        self.0.record(format!("S payload {}", resource.id()));

        self.0.to_receiver(ReceiverEvent::PayloadReceived {
            peer: PeerId::new(SENDER_ENDPOINT),
            payload: IncomingPayload {
                id: payload,
                kind: PayloadKind::File { staged },
            },
        });
        self.0.to_receiver(ReceiverEvent::PayloadTransferUpdate(update(
            payload,
            PayloadStatus::InProgress,
            len / 2,
            len,
        )));
        self.0.to_receiver(ReceiverEvent::PayloadTransferUpdate(update(
            payload,
            PayloadStatus::Success,
            len,
            len,
        )));
        self.0.to_sender(SenderEvent::PayloadTransferUpdate(update(
            payload,
            PayloadStatus::Success,
            len,
            len,
        )));
        Ok(payload)
    }

    fn disconnect(&self, _: &PeerId) {
        self.0.drop_connection();
        let sender = PeerId::new(SENDER_ENDPOINT);
        self.0.to_receiver(ReceiverEvent::Disconnected(sender));
    }
}

/// Both sessions connected through one [`Link`], each with an operator
/// whose notices can be awaited.
pub struct Harness {
    pub link: Arc<Link>,
    pub receiver: ReceiverSession,
    pub sender: SenderSession,
    pub receiver_notices: mpsc::UnboundedReceiver<Notice>,
    pub sender_notices: mpsc::UnboundedReceiver<Notice>,
    pub receiver_progress: Arc<RecordingProgress>,
    pub sender_progress: Arc<RecordingProgress>,
}

impl Harness {
    pub fn new(
        receiver_config: ReceiverConfig,
        sender_config: SenderConfig,
    ) -> Self {
        let link = Link::new();

        let receiver_progress = Arc::new(RecordingProgress::default());
        let receiver = ReceiverSession::new(
            receiver_config,
            Arc::new(ReceiverEnd(link.clone())),
            receiver_progress.clone(),
        );
        let (notices, receiver_notices) = mpsc::unbounded_channel();
        receiver.subscribe(Arc::new(Operator { notices }));

        let sender_progress = Arc::new(RecordingProgress::default());
        let sender = SenderSession::new(
            sender_config,
            Arc::new(SenderEnd(link.clone())),
            sender_progress.clone(),
        );
        let (notices, sender_notices) = mpsc::unbounded_channel();
        sender.subscribe(Arc::new(Operator { notices }));

        *link.receiver.lock().unwrap() = Some(receiver.clone());
        *link.sender.lock().unwrap() = Some(sender.clone());

        Self {
            link,
            receiver,
            sender,
            receiver_notices,
            sender_notices,
            receiver_progress,
            sender_progress,
        }
    }

    /// Runs the sender through browsing and connecting to the receiver.
    pub async fn browse_and_connect(&mut self) {
        assert_eq!(
            next_notice(&mut self.sender_notices).await,
            Notice::PeerBrowser
        );
        self.sender.start_discover().await.unwrap();

        let Notice::PeerFound(peer) =
            next_notice(&mut self.sender_notices).await
        else {
            panic!("expected the receiver to be found");
        };
        assert_eq!(peer.name, RECEIVER_NAME);

        self.sender.connect(peer.id).await.unwrap();
        assert_eq!(
            next_notice(&mut self.sender_notices).await,
            Notice::TransferProgress
        );
        self.sender.start_transfer().await.unwrap();
    }
}

pub async fn next_notice(
    notices: &mut mpsc::UnboundedReceiver<Notice>,
) -> Notice {
    tokio::time::timeout(Duration::from_secs(5), notices.recv())
        .await
        .expect("timed out waiting for a notice")
        .expect("session gone")
}

/// Writes one file per `(id, content)` into `dir` and describes it.
pub fn resources(
    dir: &Path,
    files: &[(&str, &str)],
) -> Vec<ResourceDescriptor> {
    files
        .iter()
        .map(|(id, content)| {
            let path = dir.join(format!("{id}.txt"));
            fs::write(&path, content).unwrap();
            ResourceDescriptor::from_path(*id, &path).unwrap()
        })
        .collect()
}
