//! Telephony event dispatcher
//!
//! Translates engine events into relocation state machine hooks, and
//! reconciles tracked relocations with the engine after every (re)connect.
//!
//! Each relocation gets its own queue, drained by a worker task that exists
//! only while events are pending. Events of one relocation are applied in
//! the order the engine sent them; a relocation whose lock is held (e.g. by
//! a slow originate) never delays the events of another.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::relocate::{Relocate, RelocateRegistry, RelocateRole, RelocateState};
use crate::domain::shared::value_objects::{ChannelId, RelocateId};
use crate::domain::telephony::{ChannelGateway, ChannelState, EventSource, TelephonyEvent};

type EventQueue = mpsc::UnboundedSender<TelephonyEvent>;

pub struct EventDispatcher {
    registry: Arc<RelocateRegistry>,
    channels: Arc<dyn ChannelGateway>,
    /// Queues of the relocations that have a worker running
    queues: Mutex<HashMap<RelocateId, EventQueue>>,
}

impl EventDispatcher {
    pub fn new(registry: Arc<RelocateRegistry>, channels: Arc<dyn ChannelGateway>) -> Self {
        Self {
            registry,
            channels,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to `source` and process its events on a background task
    pub fn spawn(self: Arc<Self>, source: &dyn EventSource) -> JoinHandle<()> {
        let events = source.subscribe();
        tokio::spawn(async move { self.run(events).await })
    }

    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<TelephonyEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.dispatch(event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "telephony events lost, reconciling relocates");
                    self.spawn_reconcile();
                }
                Err(RecvError::Closed) => {
                    info!("telephony event stream closed");
                    break;
                }
            }
        }
    }

    /// Hand `event` to the worker of its relocation; never waits on a relocation lock
    pub fn dispatch(self: &Arc<Self>, event: TelephonyEvent) {
        let channel = match &event {
            TelephonyEvent::ChannelAnswered { channel }
            | TelephonyEvent::ChannelDestroyed { channel } => channel,
            TelephonyEvent::ControlPlaneReady => {
                self.spawn_reconcile();
                return;
            }
        };

        match self.registry.find_by_channel(channel) {
            Some(relocate) => self.enqueue(relocate, event),
            None => debug!(%channel, "ignoring event: no relocate"),
        }
    }

    /// Process one event in place, waiting for its relocation's lock
    pub async fn handle(&self, event: TelephonyEvent) {
        let channel = match &event {
            TelephonyEvent::ChannelAnswered { channel }
            | TelephonyEvent::ChannelDestroyed { channel } => channel,
            TelephonyEvent::ControlPlaneReady => return self.reconcile().await,
        };

        if let Some(relocate) = self.registry.find_by_channel(channel) {
            self.apply(&relocate, event).await;
            self.registry.release(&relocate);
        }
    }

    fn enqueue(self: &Arc<Self>, relocate: Arc<Relocate>, event: TelephonyEvent) {
        let mut queues = self.queues.lock();
        let event = match queues.get(&relocate.uuid()) {
            Some(queue) => match queue.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let (queue, events) = mpsc::unbounded_channel();
        // The receiver is alive until the worker below exits
        let _ = queue.send(event);
        queues.insert(relocate.uuid(), queue);
        drop(queues);

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.drain(relocate, events).await });
    }

    async fn drain(
        self: Arc<Self>,
        relocate: Arc<Relocate>,
        mut events: mpsc::UnboundedReceiver<TelephonyEvent>,
    ) {
        loop {
            // Senders hold the same lock, so nothing is queued after the entry is gone
            let next = {
                let mut queues = self.queues.lock();
                match events.try_recv() {
                    Ok(event) => Some(event),
                    Err(_) => {
                        queues.remove(&relocate.uuid());
                        None
                    }
                }
            };

            match next {
                Some(event) => self.apply(&relocate, event).await,
                None => break,
            }
        }
        self.registry.release(&relocate);
    }

    async fn apply(&self, relocate: &Arc<Relocate>, event: TelephonyEvent) {
        match event {
            TelephonyEvent::ChannelAnswered { channel } => {
                self.channel_answered(relocate, &channel).await
            }
            TelephonyEvent::ChannelDestroyed { channel } => {
                self.channel_destroyed(relocate, &channel).await
            }
            TelephonyEvent::ControlPlaneReady => {}
        }
    }

    async fn channel_answered(&self, relocate: &Arc<Relocate>, channel: &ChannelId) {
        if relocate.role(channel) != Some(RelocateRole::Recipient) {
            debug!(%channel, relocate = %relocate.uuid(), "ignoring answer: not the recipient");
            return;
        }

        relocate.locked().await.on_destination_answered().await;
    }

    async fn channel_destroyed(&self, relocate: &Arc<Relocate>, channel: &ChannelId) {
        debug!(%channel, relocate = %relocate.uuid(), "processing hangup");
        let mut guard = relocate.locked().await;
        match relocate.role(channel) {
            Some(RelocateRole::Initiator) => guard.on_initiator_hangup().await,
            Some(RelocateRole::Relocated) => guard.on_relocated_hangup().await,
            Some(RelocateRole::Recipient) => guard.on_recipient_hangup().await,
            None => {}
        }
    }

    fn spawn_reconcile(self: &Arc<Self>) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.reconcile().await });
    }

    /// Check every tracked relocation against the channels that still exist
    pub async fn reconcile(&self) {
        let relocates = self.registry.list();
        info!(count = relocates.len(), "reconciling relocates with telephony engine");

        join_all(relocates.iter().map(|relocate| self.reconcile_one(relocate))).await;

        for relocate in &relocates {
            self.registry.release(relocate);
        }
        debug!("reconciliation done");
    }

    async fn reconcile_one(&self, relocate: &Arc<Relocate>) {
        let mut guard = relocate.locked().await;
        if guard.state().is_terminal() {
            return;
        }

        let mut legs = vec![
            ("initiator", relocate.initiator_channel().clone()),
            ("relocated", relocate.relocated_channel().clone()),
        ];
        if let Some(recipient) = relocate.recipient_channel() {
            legs.push(("recipient", recipient.clone()));
        }

        let mut recipient_up = false;
        for (role, channel) in legs {
            match self.channels.get_channel(&channel).await {
                Ok(Some(info)) => {
                    if role == "recipient" {
                        recipient_up = info.state == ChannelState::Up;
                    }
                }
                Ok(None) => {
                    guard
                        .force_end(&format!("{} channel {} vanished", role, channel))
                        .await;
                    return;
                }
                Err(err) => {
                    error!(
                        relocate = %relocate.uuid(),
                        %channel,
                        "cannot check channel, leaving relocate as is: {}",
                        err
                    );
                    return;
                }
            }
        }

        if recipient_up && guard.state() == RelocateState::Ringing {
            info!(relocate = %relocate.uuid(), "recipient answered while disconnected");
            guard.on_destination_answered().await;
        }
    }
}
