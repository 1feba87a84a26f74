use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::{Receiver, ReceiverEffect, ReceiverEvent, ReceiverState, LOG_PREFIX};
use crate::channel::PeerChannel;
use crate::progress::ProgressSink;
use crate::store::{DirectoryStore, ResourceStore};
use crate::subscribers::Subscribers;
use crate::{
    AcceptTransferRequest, Error, ReceiverConfig, Result, ServiceId,
    TransferError, TransferResult,
};

/// Observer of a [`ReceiverSession`].
///
/// Implementors must be thread-safe since notifications are dispatched from
/// the session task.
pub trait ReceiverSubscriber: Send + Sync {
    /// A stable unique identifier for this subscriber (used as a map key).
    fn get_id(&self) -> String;

    /// The sender announced a transfer. Answer it with
    /// [`ReceiverSession::accept_transfer`].
    fn notify_accept_transfer(&self, request: AcceptTransferRequest);

    /// Every resource has been persisted locally.
    fn notify_transfer_complete(&self, result: TransferResult);

    fn notify_error(&self, error: TransferError);
}

enum Input {
    Event(ReceiverEvent),
    StartAdvertising {
        service_id: ServiceId,
        reply: oneshot::Sender<Result<()>>,
    },
    EndAdvertising {
        reply: oneshot::Sender<()>,
    },
    AcceptTransfer {
        transfer_id: String,
        accept: bool,
        reply: oneshot::Sender<bool>,
    },
    State {
        reply: oneshot::Sender<ReceiverState>,
    },
}

/// Handle to a receiving session running on its own task.
///
/// Transport callbacks go through [`ReceiverSession::on_event`], which only
/// enqueues; operator commands wait for the task to process them. Cloned
/// handles drive the same session. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct ReceiverSession {
    inputs: mpsc::UnboundedSender<Input>,
    subscribers: Subscribers<dyn ReceiverSubscriber>,
}

impl ReceiverSession {
    /// Starts a session persisting into `config.storage_dir`.
    pub fn new(
        config: ReceiverConfig,
        channel: Arc<dyn PeerChannel>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        let store = Arc::new(DirectoryStore::new(config.storage_dir.clone()));
        Self::with_store(config, channel, store, progress)
    }

    pub fn with_store(
        config: ReceiverConfig,
        channel: Arc<dyn PeerChannel>,
        store: Arc<dyn ResourceStore>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        let (inputs, queue) = mpsc::unbounded_channel();
        let subscribers = Subscribers::default();

        let driver = Driver {
            machine: Receiver::new(&config),
            channel,
            store,
            progress,
            subscribers: subscribers.clone(),
        };
        tokio::spawn(driver.run(queue));

        Self {
            inputs,
            subscribers,
        }
    }

    /// Registers a new subscriber or replaces an existing one with the same
    /// ID.
    pub fn subscribe(&self, subscriber: Arc<dyn ReceiverSubscriber>) {
        let subscriber_id = subscriber.get_id();
        self.subscribers.insert(subscriber_id.clone(), subscriber);
        log::debug!(
            "{LOG_PREFIX} subscriber {subscriber_id} subscribed, total: {}",
            self.subscribers.len()
        );
    }

    pub fn unsubscribe(&self, subscriber: Arc<dyn ReceiverSubscriber>) {
        let subscriber_id = subscriber.get_id();
        if !self.subscribers.remove(&subscriber_id) {
            log::debug!(
                "{LOG_PREFIX} subscriber {subscriber_id} was not subscribed"
            );
        }
    }

    /// Feeds a transport callback into the session. Never blocks.
    pub fn on_event(&self, event: ReceiverEvent) {
        if self.inputs.send(Input::Event(event)).is_err() {
            log::warn!("{LOG_PREFIX} session closed, dropping transport event");
        }
    }

    pub async fn start_advertising(&self, service_id: &str) -> Result<()> {
        let service_id: ServiceId = service_id.parse()?;
        let (reply, response) = oneshot::channel();
        self.submit(Input::StartAdvertising { service_id, reply })?;
        response.await.map_err(|_| Error::SessionClosed)?
    }

    pub async fn end_advertising(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.submit(Input::EndAdvertising { reply })?;
        response.await.map_err(|_| Error::SessionClosed)
    }

    /// Answers the pending accept request. Returns `false`, leaving the
    /// session untouched, when no request with `transfer_id` is pending.
    pub async fn accept_transfer(
        &self,
        transfer_id: &str,
        accept: bool,
    ) -> bool {
        let (reply, response) = oneshot::channel();
        let input = Input::AcceptTransfer {
            transfer_id: transfer_id.to_string(),
            accept,
            reply,
        };
        if self.submit(input).is_err() {
            return false;
        }
        response.await.unwrap_or(false)
    }

    pub async fn state(&self) -> Result<ReceiverState> {
        let (reply, response) = oneshot::channel();
        self.submit(Input::State { reply })?;
        response.await.map_err(|_| Error::SessionClosed)
    }

    fn submit(&self, input: Input) -> Result<()> {
        self.inputs.send(input).map_err(|_| Error::SessionClosed)
    }
}

struct Driver {
    machine: Receiver,
    channel: Arc<dyn PeerChannel>,
    store: Arc<dyn ResourceStore>,
    progress: Arc<dyn ProgressSink>,
    subscribers: Subscribers<dyn ReceiverSubscriber>,
}

impl Driver {
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = queue.recv().await {
            self.dispatch(input).await;
        }
        log::debug!("{LOG_PREFIX} all handles dropped, session task done");
    }

    async fn dispatch(&mut self, input: Input) {
        match input {
            Input::Event(event) => {
                let effects = self.machine.handle(event);
                // transport failures were already fed back into the machine
                let _ = self.execute(effects).await;
            }
            Input::StartAdvertising { service_id, reply } => {
                let result = match self.machine.start_advertising(service_id) {
                    Ok(effects) => self.execute(effects).await,
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
            }
            Input::EndAdvertising { reply } => {
                let effects = self.machine.end_advertising();
                let _ = self.execute(effects).await;
                let _ = reply.send(());
            }
            Input::AcceptTransfer {
                transfer_id,
                accept,
                reply,
            } => {
                let accepted =
                    match self.machine.accept_transfer(&transfer_id, accept) {
                        Ok(effects) => self.execute(effects).await.is_ok(),
                        Err(_) => false,
                    };
                let _ = reply.send(accepted);
            }
            Input::State { reply } => {
                let _ = reply.send(self.machine.state());
            }
        }
    }

    /// Performs `effects` in order. The effects of a follow-up event are
    /// queued behind the rest of the batch. Returns the first transport
    /// error encountered.
    async fn execute(&mut self, effects: Vec<ReceiverEffect>) -> Result<()> {
        let mut result = Ok(());
        let mut queue = VecDeque::from(effects);

        while let Some(effect) = queue.pop_front() {
            let Some(event) = self.perform(effect).await else {
                continue;
            };
            if let ReceiverEvent::TransportFailed(reason) = &event {
                if result.is_ok() {
                    result =
                        Err(Error::Other(anyhow::anyhow!(reason.clone())));
                }
            }
            queue.extend(self.machine.handle(event));
        }

        result
    }

    async fn perform(&self, effect: ReceiverEffect) -> Option<ReceiverEvent> {
        match effect {
            ReceiverEffect::StartAdvertising(service_id) => self
                .channel
                .start_advertising(&service_id)
                .err()
                .map(transport_failed),
            ReceiverEffect::StopAdvertising => {
                self.channel.stop_advertising();
                None
            }
            ReceiverEffect::AcceptConnection(peer) => self
                .channel
                .accept_connection(&peer)
                .err()
                .map(transport_failed),
            ReceiverEffect::Send { peer, message } => {
                log::debug!("{LOG_PREFIX} sending '{message}' to '{peer}'");
                self.channel
                    .send_message(&peer, &message.encode())
                    .err()
                    .map(transport_failed)
            }
            ReceiverEffect::Disconnect(peer) => {
                self.channel.disconnect(&peer);
                None
            }
            ReceiverEffect::Progress(progress) => {
                self.progress.update_progress(&progress);
                None
            }
            ReceiverEffect::NotifyAcceptTransfer(request) => {
                self.subscribers.for_each(|subscriber| {
                    subscriber.notify_accept_transfer(request.clone())
                });
                None
            }
            ReceiverEffect::Persist {
                index,
                resource_id,
                staged,
            } => {
                let store = Arc::clone(&self.store);
                let persisted = tokio::task::spawn_blocking(move || {
                    store.persist(&staged, &resource_id)
                })
                .await;

                Some(match persisted {
                    Ok(Ok(location)) => {
                        ReceiverEvent::Persisted { index, location }
                    }
                    Ok(Err(err)) => ReceiverEvent::PersistFailed {
                        index,
                        reason: err.to_string(),
                    },
                    Err(err) => ReceiverEvent::PersistFailed {
                        index,
                        reason: err.to_string(),
                    },
                })
            }
            ReceiverEffect::NotifyTransferComplete(result) => {
                self.subscribers.for_each(|subscriber| {
                    subscriber.notify_transfer_complete(result.clone())
                });
                None
            }
            ReceiverEffect::NotifyFailure(error) => {
                self.subscribers
                    .for_each(|subscriber| subscriber.notify_error(error));
                None
            }
        }
    }
}

fn transport_failed(err: Error) -> ReceiverEvent {
    ReceiverEvent::TransportFailed(err.to_string())
}
