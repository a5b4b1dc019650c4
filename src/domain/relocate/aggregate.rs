//! Relocate aggregate root
//!
//! A `Relocate` is shared (`Arc`) between the API path and the engine event
//! path. Every read-then-mutate sequence goes through [`RelocateGuard`],
//! obtained with [`Relocate::locked`]; the guard is the only thing that can
//! change the state, so holding it serializes all transitions of one
//! relocation without touching any other.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::domain::relocate::destination::Destination;
use crate::domain::relocate::event::{Notifier, RelocateEvent, RelocateEventKind, RelocateSnapshot};
use crate::domain::relocate::value_object::{Completion, RelocateRole, RelocateState};
use crate::domain::shared::error::RelocateError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{ChannelId, RelocateId, TenantUuid, UserUuid};
use crate::domain::telephony::{ChannelGateway, ChannelVariables, GatewayError};

/// Set on the destination leg so engine-side scripts can correlate it
pub const RELOCATE_UUID_VARIABLE: &str = "ACCENT_RELOCATE_UUID";

/// Parameters of a new relocation
#[derive(Debug, Clone)]
pub struct NewRelocate {
    pub initiator: Option<UserUuid>,
    pub tenant_uuid: Option<TenantUuid>,
    pub initiator_channel: ChannelId,
    pub relocated_channel: ChannelId,
    /// Id the destination leg will be originated with
    pub recipient_channel: ChannelId,
    pub completions: BTreeSet<Completion>,
    pub timeout: Option<Duration>,
    pub recipient_variables: ChannelVariables,
}

#[derive(Debug, Clone, Copy)]
struct Status {
    state: RelocateState,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct RelocateInner {
    timer: Option<AbortHandle>,
}

pub struct Relocate {
    uuid: RelocateId,
    initiator: Option<UserUuid>,
    tenant_uuid: Option<TenantUuid>,
    initiator_channel: ChannelId,
    relocated_channel: ChannelId,
    recipient_channel: ChannelId,
    /// Set before the destination is dialed, cleared if dialing fails
    dialed: AtomicBool,
    completions: BTreeSet<Completion>,
    timeout: Option<Duration>,
    recipient_variables: ChannelVariables,
    created_at: DateTime<Utc>,
    /// Written only while `inner` is locked
    status: RwLock<Status>,
    inner: Arc<Mutex<RelocateInner>>,
    observers: SyncMutex<Vec<Arc<dyn Notifier>>>,
    channels: Arc<dyn ChannelGateway>,
}

impl std::fmt::Debug for Relocate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relocate")
            .field("uuid", &self.uuid)
            .field("state", &self.state())
            .field("initiator_channel", &self.initiator_channel)
            .field("relocated_channel", &self.relocated_channel)
            .field("recipient_channel", &self.recipient_channel())
            .finish()
    }
}

impl Relocate {
    pub fn new(params: NewRelocate, channels: Arc<dyn ChannelGateway>) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            uuid: RelocateId::new(),
            initiator: params.initiator,
            tenant_uuid: params.tenant_uuid,
            initiator_channel: params.initiator_channel,
            relocated_channel: params.relocated_channel,
            recipient_channel: params.recipient_channel,
            dialed: AtomicBool::new(false),
            completions: params.completions,
            timeout: params.timeout,
            recipient_variables: params.recipient_variables,
            created_at: now,
            status: RwLock::new(Status {
                state: RelocateState::Starting,
                updated_at: now,
            }),
            inner: Arc::new(Mutex::new(RelocateInner::default())),
            observers: SyncMutex::new(Vec::new()),
            channels,
        })
    }

    /// Acquire the relocation's lock for a read-then-mutate sequence
    pub async fn locked(self: &Arc<Self>) -> RelocateGuard {
        let inner = Arc::clone(&self.inner).lock_owned().await;
        RelocateGuard {
            relocate: Arc::clone(self),
            inner,
        }
    }

    /// Subscribe a notifier to this relocation's lifecycle events
    pub fn observe(&self, notifier: Arc<dyn Notifier>) {
        self.observers.lock().push(notifier);
    }

    pub fn role(&self, channel: &ChannelId) -> Option<RelocateRole> {
        if *channel == self.initiator_channel {
            Some(RelocateRole::Initiator)
        } else if *channel == self.relocated_channel {
            Some(RelocateRole::Relocated)
        } else if self.recipient_channel() == Some(channel) {
            Some(RelocateRole::Recipient)
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> RelocateSnapshot {
        let status = *self.status.read();
        RelocateSnapshot {
            uuid: self.uuid,
            state: status.state,
            relocated_call: self.relocated_channel.clone(),
            initiator_call: self.initiator_channel.clone(),
            recipient_call: self.recipient_channel().cloned(),
            completions: self.completions.iter().copied().collect(),
            initiator: self.initiator.clone(),
            timeout: self.timeout.map(|timeout| timeout.as_secs()),
            created_at: self.created_at,
            updated_at: status.updated_at,
        }
    }

    // Getters
    pub fn uuid(&self) -> RelocateId {
        self.uuid
    }

    /// Current state; may be stale as soon as it is returned unless the lock is held
    pub fn state(&self) -> RelocateState {
        self.status.read().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn initiator(&self) -> Option<&UserUuid> {
        self.initiator.as_ref()
    }

    pub fn tenant_uuid(&self) -> Option<&TenantUuid> {
        self.tenant_uuid.as_ref()
    }

    pub fn initiator_channel(&self) -> &ChannelId {
        &self.initiator_channel
    }

    pub fn relocated_channel(&self) -> &ChannelId {
        &self.relocated_channel
    }

    /// The destination leg, once it has been dialed
    pub fn recipient_channel(&self) -> Option<&ChannelId> {
        self.dialed
            .load(AtomicOrdering::Acquire)
            .then_some(&self.recipient_channel)
    }

    pub fn completions(&self) -> &BTreeSet<Completion> {
        &self.completions
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn recipient_variables(&self) -> &ChannelVariables {
        &self.recipient_variables
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.status.read().updated_at
    }
}

/// Exclusive access to one relocation
///
/// Every state machine operation lives here. API operations that are not
/// allowed in the current state return `InvalidStateTransition` without side
/// effects; event hooks never fail and ignore events the current state does
/// not handle.
pub struct RelocateGuard {
    relocate: Arc<Relocate>,
    inner: OwnedMutexGuard<RelocateInner>,
}

impl RelocateGuard {
    pub fn relocate(&self) -> &Arc<Relocate> {
        &self.relocate
    }

    pub fn state(&self) -> RelocateState {
        self.relocate.state()
    }

    /// Dial the destination. Starting -> Ringing, or Starting -> Ended on failure
    pub async fn initiate(&mut self, destination: &Destination) -> Result<()> {
        let state = self.state();
        if state != RelocateState::Starting {
            warn!(relocate = %self.relocate.uuid, %state, "initiate ignored");
            return Err(RelocateError::InvalidStateTransition(format!(
                "cannot initiate a relocate in state {}",
                state
            )));
        }

        let endpoint = destination.endpoint();
        let mut variables = self.relocate.recipient_variables.clone();
        variables.insert(
            RELOCATE_UUID_VARIABLE.to_string(),
            self.relocate.uuid.to_string(),
        );

        // Events about the new leg may arrive before originate returns; they
        // must already route to this relocation and wait on its lock
        let recipient = self.relocate.recipient_channel.clone();
        self.relocate.dialed.store(true, AtomicOrdering::Release);

        match self
            .relocate
            .channels
            .originate(&recipient, &endpoint, &variables)
            .await
        {
            Ok(()) => {
                info!(
                    relocate = %self.relocate.uuid,
                    recipient = %recipient,
                    endpoint = %endpoint,
                    "relocate destination ringing"
                );
                self.transition(RelocateState::Ringing);
                self.emit(RelocateEventKind::Initiated);
                Ok(())
            }
            Err(err) => {
                error!(
                    relocate = %self.relocate.uuid,
                    endpoint = %endpoint,
                    "could not originate relocate destination: {}",
                    err
                );
                self.relocate.dialed.store(false, AtomicOrdering::Release);
                self.end(RelocateState::Ended);
                Err(RelocateError::creation(
                    "could not originate destination",
                    json!({ "endpoint": endpoint, "error": err.to_string() }),
                ))
            }
        }
    }

    /// Start the timeout; it fires `on_timeout` at most once, then `on_expired`
    /// with the lock released
    pub fn arm_timeout<F>(&mut self, timeout: Duration, on_expired: F)
    where
        F: FnOnce(Arc<Relocate>) + Send + 'static,
    {
        if !self.state().accepts_timeout() {
            return;
        }

        self.disarm_timeout();
        let relocate = Arc::clone(&self.relocate);
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut guard = relocate.locked().await;
            guard.on_timeout().await;
            drop(guard);
            on_expired(relocate);
        });
        self.inner.timer = Some(task.abort_handle());
    }

    /// Finalize from the API. Allowed from Answered, or from Ringing when `api` is a completion
    pub async fn complete(&mut self) -> Result<()> {
        let state = self.state();
        let allowed = match state {
            RelocateState::Answered => true,
            RelocateState::Ringing => self.relocate.completions.contains(&Completion::Api),
            _ => false,
        };

        if !allowed {
            warn!(relocate = %self.relocate.uuid, %state, "complete ignored");
            return Err(RelocateError::InvalidStateTransition(format!(
                "cannot complete a relocate in state {}",
                state
            )));
        }

        self.finish().await
    }

    /// Abort the relocation, leaving the original call as it was
    pub async fn cancel(&mut self) {
        let state = self.state();
        if state.is_terminal() {
            debug!(relocate = %self.relocate.uuid, %state, "cancel on finished relocate");
            return;
        }

        self.teardown_recipient().await;
        self.end(RelocateState::Cancelled);
    }

    pub async fn on_destination_answered(&mut self) {
        match self.state() {
            RelocateState::Ringing => {
                self.transition(RelocateState::Answered);
                self.emit(RelocateEventKind::Answered);

                if self.relocate.completions.contains(&Completion::Answer) {
                    if let Err(err) = self.finish().await {
                        error!(relocate = %self.relocate.uuid, "auto completion failed: {}", err);
                    }
                }
            }
            state => self.ignore("destination answered", state),
        }
    }

    pub async fn on_initiator_hangup(&mut self) {
        match self.state() {
            RelocateState::Starting => self.end(RelocateState::Ended),
            RelocateState::Ringing => {
                self.teardown_recipient().await;
                self.end(RelocateState::Ended);
            }
            state => self.ignore("initiator hangup", state),
        }
    }

    pub async fn on_relocated_hangup(&mut self) {
        match self.state() {
            RelocateState::Starting | RelocateState::Ringing | RelocateState::Answered => {
                self.teardown_recipient().await;
                self.end(RelocateState::Ended);
            }
            state => self.ignore("relocated hangup", state),
        }
    }

    pub async fn on_recipient_hangup(&mut self) {
        match self.state() {
            RelocateState::Ringing | RelocateState::Answered => self.end(RelocateState::Ended),
            state => self.ignore("recipient hangup", state),
        }
    }

    pub async fn on_timeout(&mut self) {
        // The firing task is the one running this; dropping the handle keeps it alive
        self.inner.timer.take();

        match self.state() {
            RelocateState::Starting | RelocateState::Ringing => {
                info!(relocate = %self.relocate.uuid, "relocate timed out");
                self.teardown_recipient().await;
                self.end(RelocateState::TimedOut);
            }
            state => self.ignore("timeout", state),
        }
    }

    /// End a relocation whose legs vanished while events were not received
    pub async fn force_end(&mut self, reason: &str) {
        let state = self.state();
        if state.is_terminal() {
            return;
        }

        warn!(relocate = %self.relocate.uuid, %state, reason, "forcing relocate to end");
        self.teardown_recipient().await;
        self.end(RelocateState::Ended);
    }

    async fn finish(&mut self) -> Result<()> {
        let relocate = Arc::clone(&self.relocate);
        let Some(recipient) = relocate.recipient_channel() else {
            self.end(RelocateState::Ended);
            return Err(RelocateError::InvalidStateTransition(
                "relocate has no recipient channel".to_string(),
            ));
        };

        if let Err(err) = relocate
            .channels
            .bridge(&relocate.relocated_channel, recipient)
            .await
        {
            error!(
                relocate = %relocate.uuid,
                relocated = %relocate.relocated_channel,
                recipient = %recipient,
                "could not bridge relocated call: {}",
                err
            );
            self.teardown_recipient().await;
            self.end(RelocateState::Ended);
            return Err(err.into());
        }

        self.hangup(&relocate.initiator_channel).await;
        info!(relocate = %relocate.uuid, recipient = %recipient, "relocate completed");
        metrics::counter!("relocates_completed_total").increment(1);

        self.transition(RelocateState::Completed);
        self.emit(RelocateEventKind::Completed);
        self.emit(RelocateEventKind::Ended);
        Ok(())
    }

    async fn teardown_recipient(&mut self) {
        if let Some(recipient) = self.relocate.recipient_channel().cloned() {
            self.hangup(&recipient).await;
        }
    }

    async fn hangup(&self, channel: &ChannelId) {
        match self.relocate.channels.hangup(channel).await {
            Ok(()) | Err(GatewayError::ChannelNotFound(_)) => {}
            Err(err) => {
                error!(relocate = %self.relocate.uuid, %channel, "hangup failed: {}", err);
            }
        }
    }

    fn end(&mut self, state: RelocateState) {
        debug_assert!(state.is_terminal());
        self.transition(state);
        self.emit(RelocateEventKind::Ended);
    }

    fn transition(&mut self, state: RelocateState) {
        {
            let mut status = self.relocate.status.write();
            debug!(relocate = %self.relocate.uuid, from = %status.state, to = %state, "transition");
            status.state = state;
            status.updated_at = Utc::now();
        }

        if !state.accepts_timeout() {
            self.disarm_timeout();
        }

        if state.is_terminal() {
            metrics::counter!("relocates_ended_total", "state" => state.as_str()).increment(1);
        }
    }

    fn disarm_timeout(&mut self) {
        if let Some(timer) = self.inner.timer.take() {
            timer.abort();
        }
    }

    fn emit(&self, kind: RelocateEventKind) {
        let event = RelocateEvent::new(
            kind,
            self.relocate.snapshot(),
            self.relocate.tenant_uuid.clone(),
        );
        for observer in self.relocate.observers.lock().iter() {
            observer.publish(&event);
        }
    }

    fn ignore(&self, event: &str, state: RelocateState) {
        debug!(relocate = %self.relocate.uuid, %state, event, "event ignored in this state");
    }
}
