use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::{
    Sender, SenderEffect, SenderEvent, SenderState, TransferOutcome, LOG_PREFIX,
};
use crate::channel::{Peer, PeerChannel, PeerId};
use crate::progress::ProgressSink;
use crate::subscribers::Subscribers;
use crate::{
    Error, ResourceDescriptor, Result, SenderConfig, ServiceId, TransferError,
};

/// Observer of a [`SenderSession`], usually the UI presenting the peer
/// browser and the progress view.
pub trait SenderSubscriber: Send + Sync {
    /// A stable unique identifier for this subscriber (used as a map key).
    fn get_id(&self) -> String;

    /// Show the peer browser, then call [`SenderSession::start_discover`].
    fn present_peer_browser(&self);

    fn notify_peer_found(&self, peer: Peer);

    fn notify_peer_lost(&self, peer: PeerId);

    /// Swap the browser for a progress view, then call
    /// [`SenderSession::start_transfer`].
    fn present_transfer_progress(&self);
}

/// Result of a send attempt started with [`SenderSession::start_browse`].
#[derive(Debug)]
pub struct PendingTransfer {
    transfer_id: String,
    outcome: oneshot::Receiver<TransferOutcome>,
}

impl PendingTransfer {
    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    /// Waits until the attempt succeeds or fails. Resolves to
    /// [`TransferError::TransferInterrupted`] if the session goes away first.
    pub async fn wait(self) -> TransferOutcome {
        self.outcome
            .await
            .unwrap_or(Err(TransferError::TransferInterrupted))
    }
}

enum Input {
    Event(SenderEvent),
    StartBrowse {
        service_id: ServiceId,
        transfer_id: String,
        resources: Vec<ResourceDescriptor>,
        reply: oneshot::Sender<Result<oneshot::Receiver<TransferOutcome>>>,
    },
    StartDiscover {
        reply: oneshot::Sender<Result<()>>,
    },
    Connect {
        peer: PeerId,
        reply: oneshot::Sender<Result<()>>,
    },
    StartTransfer {
        reply: oneshot::Sender<Result<()>>,
    },
    CancelBrowse {
        reply: oneshot::Sender<Result<()>>,
    },
    State {
        reply: oneshot::Sender<SenderState>,
    },
}

/// Handle to a sending session running on its own task.
///
/// Must be created inside a tokio runtime. Cloned handles drive the same
/// session.
#[derive(Clone)]
pub struct SenderSession {
    inputs: mpsc::UnboundedSender<Input>,
    subscribers: Subscribers<dyn SenderSubscriber>,
}

impl SenderSession {
    pub fn new(
        config: SenderConfig,
        channel: Arc<dyn PeerChannel>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        let (inputs, queue) = mpsc::unbounded_channel();
        let subscribers = Subscribers::default();

        let driver = Driver {
            machine: Sender::new(&config),
            channel,
            progress,
            subscribers: subscribers.clone(),
            pending: None,
        };
        tokio::spawn(driver.run(queue));

        Self {
            inputs,
            subscribers,
        }
    }

    /// Registers a new subscriber or replaces an existing one with the same
    /// ID.
    pub fn subscribe(&self, subscriber: Arc<dyn SenderSubscriber>) {
        let subscriber_id = subscriber.get_id();
        self.subscribers.insert(subscriber_id.clone(), subscriber);
        log::debug!(
            "{LOG_PREFIX} subscriber {subscriber_id} subscribed, total: {}",
            self.subscribers.len()
        );
    }

    pub fn unsubscribe(&self, subscriber: Arc<dyn SenderSubscriber>) {
        let subscriber_id = subscriber.get_id();
        if !self.subscribers.remove(&subscriber_id) {
            log::debug!(
                "{LOG_PREFIX} subscriber {subscriber_id} was not subscribed"
            );
        }
    }

    /// Feeds a transport callback into the session. Never blocks.
    pub fn on_event(&self, event: SenderEvent) {
        if self.inputs.send(Input::Event(event)).is_err() {
            log::warn!("{LOG_PREFIX} session closed, dropping transport event");
        }
    }

    pub async fn start_browse(
        &self,
        service_id: &str,
        transfer_id: &str,
        resources: Vec<ResourceDescriptor>,
    ) -> Result<PendingTransfer> {
        let service_id: ServiceId = service_id.parse()?;
        let (reply, response) = oneshot::channel();
        self.submit(Input::StartBrowse {
            service_id,
            transfer_id: transfer_id.to_string(),
            resources,
            reply,
        })?;

        let outcome = response.await.map_err(|_| Error::SessionClosed)??;
        Ok(PendingTransfer {
            transfer_id: transfer_id.to_string(),
            outcome,
        })
    }

    pub async fn start_discover(&self) -> Result<()> {
        self.command(|reply| Input::StartDiscover { reply }).await
    }

    pub async fn connect(&self, peer: PeerId) -> Result<()> {
        self.command(|reply| Input::Connect { peer, reply }).await
    }

    pub async fn start_transfer(&self) -> Result<()> {
        self.command(|reply| Input::StartTransfer { reply }).await
    }

    pub async fn cancel_browse(&self) -> Result<()> {
        self.command(|reply| Input::CancelBrowse { reply }).await
    }

    pub async fn state(&self) -> Result<SenderState> {
        let (reply, response) = oneshot::channel();
        self.submit(Input::State { reply })?;
        response.await.map_err(|_| Error::SessionClosed)
    }

    async fn command(
        &self,
        input: impl FnOnce(oneshot::Sender<Result<()>>) -> Input,
    ) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.submit(input(reply))?;
        response.await.map_err(|_| Error::SessionClosed)?
    }

    fn submit(&self, input: Input) -> Result<()> {
        self.inputs.send(input).map_err(|_| Error::SessionClosed)
    }
}

struct Driver {
    machine: Sender,
    channel: Arc<dyn PeerChannel>,
    progress: Arc<dyn ProgressSink>,
    subscribers: Subscribers<dyn SenderSubscriber>,
    pending: Option<oneshot::Sender<TransferOutcome>>,
}

impl Driver {
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = queue.recv().await {
            self.dispatch(input);
        }
        log::debug!("{LOG_PREFIX} all handles dropped, session task done");
    }

    fn dispatch(&mut self, input: Input) {
        match input {
            Input::Event(event) => {
                let effects = self.machine.handle(event);
                let _ = self.execute(effects);
            }
            Input::StartBrowse {
                service_id,
                transfer_id,
                resources,
                reply,
            } => {
                let result = self
                    .machine
                    .start_browse(service_id, transfer_id, resources)
                    .map(|effects| {
                        let (resolve, outcome) = oneshot::channel();
                        self.pending = Some(resolve);
                        let _ = self.execute(effects);
                        outcome
                    });
                let _ = reply.send(result);
            }
            Input::StartDiscover { reply } => {
                let result = self.machine.start_discover();
                let _ = reply.send(self.run_command(result));
            }
            Input::Connect { peer, reply } => {
                let result = self.machine.connect(peer);
                let _ = reply.send(self.run_command(result));
            }
            Input::StartTransfer { reply } => {
                let result = self.machine.start_transfer();
                let _ = reply.send(self.run_command(result));
            }
            Input::CancelBrowse { reply } => {
                let result = self.machine.cancel_browse();
                let _ = reply.send(self.run_command(result));
            }
            Input::State { reply } => {
                let _ = reply.send(self.machine.state());
            }
        }
    }

    fn run_command(
        &mut self,
        effects: Result<Vec<SenderEffect>>,
    ) -> Result<()> {
        self.execute(effects?)
    }

    /// Performs `effects` in order. The effects of a follow-up event are
    /// queued behind the rest of the batch. Returns the first transport
    /// error encountered.
    fn execute(&mut self, effects: Vec<SenderEffect>) -> Result<()> {
        let mut result = Ok(());
        let mut queue = VecDeque::from(effects);

        while let Some(effect) = queue.pop_front() {
            let Some(event) = self.perform(effect) else {
                continue;
            };
            if let SenderEvent::TransportFailed(reason) = &event {
                if result.is_ok() {
                    result =
                        Err(Error::Other(anyhow::anyhow!(reason.clone())));
                }
            }
            queue.extend(self.machine.handle(event));
        }

        result
    }

    fn perform(&mut self, effect: SenderEffect) -> Option<SenderEvent> {
        match effect {
            SenderEffect::PresentPeerBrowser => {
                self.subscribers
                    .for_each(|subscriber| subscriber.present_peer_browser());
                None
            }
            SenderEffect::StartDiscovery(service_id) => self
                .channel
                .start_discovery(&service_id)
                .err()
                .map(transport_failed),
            SenderEffect::StopDiscovery => {
                self.channel.stop_discovery();
                None
            }
            SenderEffect::NotifyPeerFound(peer) => {
                self.subscribers.for_each(|subscriber| {
                    subscriber.notify_peer_found(peer.clone())
                });
                None
            }
            SenderEffect::NotifyPeerLost(peer) => {
                self.subscribers.for_each(|subscriber| {
                    subscriber.notify_peer_lost(peer.clone())
                });
                None
            }
            SenderEffect::PresentTransferProgress => {
                self.subscribers.for_each(|subscriber| {
                    subscriber.present_transfer_progress()
                });
                None
            }
            SenderEffect::RequestConnection(peer) => self
                .channel
                .request_connection(&peer)
                .err()
                .map(transport_failed),
            SenderEffect::AcceptConnection(peer) => self
                .channel
                .accept_connection(&peer)
                .err()
                .map(transport_failed),
            SenderEffect::Send { peer, message } => {
                log::debug!("{LOG_PREFIX} sending '{message}' to '{peer}'");
                self.channel
                    .send_message(&peer, &message.encode())
                    .err()
                    .map(transport_failed)
            }
            SenderEffect::SendPayload {
                peer,
                index,
                resource,
            } => {
                log::info!(
                    "{LOG_PREFIX} sending resource {index} '{}' from {}",
                    resource.id(),
                    resource.location()
                );
                Some(match self.channel.send_payload(&peer, &resource) {
                    Ok(payload) => {
                        SenderEvent::PayloadStarted { index, payload }
                    }
                    Err(err) => SenderEvent::PayloadSendFailed {
                        index,
                        reason: err.to_string(),
                    },
                })
            }
            SenderEffect::Disconnect(peer) => {
                self.channel.disconnect(&peer);
                None
            }
            SenderEffect::Progress(progress) => {
                self.progress.update_progress(&progress);
                None
            }
            SenderEffect::Resolve(outcome) => {
                match self.pending.take() {
                    Some(pending) => {
                        let _ = pending.send(outcome);
                    }
                    None => {
                        log::warn!(
                            "{LOG_PREFIX} no pending transfer for {outcome:?}"
                        )
                    }
                }
                None
            }
        }
    }
}

fn transport_failed(err: Error) -> SenderEvent {
    SenderEvent::TransportFailed(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PayloadId;
    use crate::progress::LogProgress;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingChannel {
        discovering: Mutex<bool>,
        requested: Mutex<Vec<PeerId>>,
        disconnects: Mutex<Vec<PeerId>>,
        fail_discovery: bool,
        fail_sends: bool,
    }

    impl PeerChannel for RecordingChannel {
        fn start_advertising(&self, _: &ServiceId) -> Result<()> {
            Ok(())
        }

        fn stop_advertising(&self) {}

        fn start_discovery(&self, _: &ServiceId) -> Result<()> {
            if self.fail_discovery {
                return Err(Error::Other(anyhow::anyhow!("radio off")));
            }
            *self.discovering.lock().unwrap() = true;
            Ok(())
        }

        fn stop_discovery(&self) {
            *self.discovering.lock().unwrap() = false;
        }

        fn request_connection(&self, peer: &PeerId) -> Result<()> {
            self.requested.lock().unwrap().push(peer.clone());
            Ok(())
        }

        fn accept_connection(&self, _: &PeerId) -> Result<()> {
            Ok(())
        }

        fn send_message(&self, _: &PeerId, _: &[u8]) -> Result<()> {
            if self.fail_sends {
                return Err(Error::Other(anyhow::anyhow!("link dropped")));
            }
            Ok(())
        }

        fn send_payload(
            &self,
            _: &PeerId,
            _: &ResourceDescriptor,
        ) -> Result<PayloadId> {
            Ok(PayloadId(1))
        }

        fn disconnect(&self, peer: &PeerId) {
            self.disconnects.lock().unwrap().push(peer.clone());
        }
    }

    /// Plays the UI: opens the browser and the progress view on request.
    #[derive(Default)]
    struct Ui {
        browser_shown: Mutex<bool>,
        peers: Mutex<Vec<Peer>>,
    }

    impl SenderSubscriber for Ui {
        fn get_id(&self) -> String {
            "ui".to_string()
        }

        fn present_peer_browser(&self) {
            *self.browser_shown.lock().unwrap() = true;
        }

        fn notify_peer_found(&self, peer: Peer) {
            self.peers.lock().unwrap().push(peer);
        }

        fn notify_peer_lost(&self, peer: PeerId) {
            self.peers.lock().unwrap().retain(|found| found.id != peer);
        }

        fn present_transfer_progress(&self) {}
    }

    fn session(channel: Arc<RecordingChannel>) -> SenderSession {
        SenderSession::new(
            SenderConfig::default(),
            channel,
            Arc::new(LogProgress),
        )
    }

    #[test_log::test(tokio::test)]
    async fn browse_then_cancel() {
        let channel = Arc::new(RecordingChannel::default());
        let session = session(channel.clone());
        let ui = Arc::new(Ui::default());
        session.subscribe(ui.clone());

        let pending =
            session.start_browse("files", "T1", vec![]).await.unwrap();
        assert_eq!(pending.transfer_id(), "T1");
        assert!(*ui.browser_shown.lock().unwrap());

        session.start_discover().await.unwrap();
        assert!(*channel.discovering.lock().unwrap());

        let peer = Peer {
            id: PeerId::new("pixel"),
            name: "Pixel".to_string(),
        };
        session.on_event(SenderEvent::PeerFound(peer.clone()));
        session.on_event(SenderEvent::PeerFound(Peer {
            id: PeerId::new("tablet"),
            name: "Tablet".to_string(),
        }));
        session.on_event(SenderEvent::PeerLost(PeerId::new("tablet")));
        assert_eq!(session.state().await.unwrap(), SenderState::Browsing);
        assert_eq!(*ui.peers.lock().unwrap(), vec![peer]);

        session.cancel_browse().await.unwrap();
        assert!(!*channel.discovering.lock().unwrap());
        assert_eq!(pending.wait().await, Err(TransferError::Cancelled));
        assert_eq!(session.state().await.unwrap(), SenderState::Idle);
    }

    #[test_log::test(tokio::test)]
    async fn commands_out_of_order_fail_fast() {
        let channel = Arc::new(RecordingChannel::default());
        let session = session(channel.clone());

        assert!(matches!(
            session.start_transfer().await,
            Err(Error::InvalidState { .. })
        ));
        assert!(matches!(
            session.start_browse("Bad Id", "T1", vec![]).await,
            Err(Error::InvalidServiceId(_))
        ));

        let _pending =
            session.start_browse("files", "T1", vec![]).await.unwrap();
        assert!(session.start_browse("files", "T2", vec![]).await.is_err());
        assert!(session.connect(PeerId::new("pixel")).await.is_err());

        session.start_discover().await.unwrap();
        session.connect(PeerId::new("pixel")).await.unwrap();
        session.start_transfer().await.unwrap();
        assert_eq!(
            *channel.requested.lock().unwrap(),
            vec![PeerId::new("pixel")]
        );
        assert_eq!(session.state().await.unwrap(), SenderState::Connecting);
    }

    #[test_log::test(tokio::test)]
    async fn transport_refusal_resolves_the_transfer() {
        let channel = Arc::new(RecordingChannel {
            fail_discovery: true,
            ..RecordingChannel::default()
        });
        let session = session(channel);

        let pending =
            session.start_browse("files", "T1", vec![]).await.unwrap();
        assert!(session.start_discover().await.is_err());
        assert_eq!(pending.wait().await, Err(TransferError::InternalError));
        assert_eq!(session.state().await.unwrap(), SenderState::Idle);
    }

    #[test_log::test(tokio::test)]
    async fn dropped_session_interrupts_pending_transfer() {
        let channel = Arc::new(RecordingChannel::default());
        let pending = {
            let session = session(channel);
            session.start_browse("files", "T1", vec![]).await.unwrap()
        };

        assert_eq!(
            pending.wait().await,
            Err(TransferError::TransferInterrupted)
        );
    }

    #[test_log::test(tokio::test)]
    async fn unsendable_version_drops_the_connection() {
        let channel = Arc::new(RecordingChannel {
            fail_sends: true,
            ..RecordingChannel::default()
        });
        let session = session(channel.clone());
        let pixel = PeerId::new("pixel");

        let pending =
            session.start_browse("files", "T1", vec![]).await.unwrap();
        session.start_discover().await.unwrap();
        session.connect(pixel.clone()).await.unwrap();
        session.start_transfer().await.unwrap();
        session.on_event(SenderEvent::ConnectionInitiated(pixel.clone()));
        session.on_event(SenderEvent::ConnectionResult {
            peer: pixel.clone(),
            connected: true,
        });

        assert_eq!(pending.wait().await, Err(TransferError::InternalError));
        assert_eq!(*channel.disconnects.lock().unwrap(), vec![pixel]);
        assert_eq!(session.state().await.unwrap(), SenderState::Idle);
    }
}
