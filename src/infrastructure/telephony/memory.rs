//! In-process telephony engine
//!
//! Keeps channels and bridges in memory and emits the same events a real
//! engine would. Test and demo code drives the far end of calls through
//! the inherent methods (`answer`, `hangup_channel`, `reconnect`, ...).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::domain::shared::value_objects::{ChannelId, TenantUuid, UserUuid};
use crate::domain::telephony::{
    ChannelGateway, ChannelInfo, ChannelState, ChannelVariables, DialplanGateway, EventSource,
    GatewayError, TelephonyEvent,
};

#[derive(Debug, Clone)]
struct Channel {
    state: ChannelState,
    user_uuid: Option<UserUuid>,
    tenant_uuid: Option<TenantUuid>,
    variables: ChannelVariables,
}

/// Record of an origination request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origination {
    pub channel: ChannelId,
    pub endpoint: String,
    pub variables: ChannelVariables,
}

#[derive(Default)]
struct Engine {
    channels: HashMap<ChannelId, Channel>,
    /// bridge id -> members
    bridges: HashMap<u64, BTreeSet<ChannelId>>,
    /// channel -> bridge id
    memberships: HashMap<ChannelId, u64>,
    extensions: HashSet<(String, String)>,
    contacts: HashMap<String, Vec<String>>,
    originations: Vec<Origination>,
    hangups: Vec<ChannelId>,
    fail_originate: bool,
    next_id: u64,
}

impl Engine {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn leave_bridge(&mut self, channel: &ChannelId) {
        if let Some(bridge) = self.memberships.remove(channel) {
            if let Some(members) = self.bridges.get_mut(&bridge) {
                members.remove(channel);
                if members.is_empty() {
                    self.bridges.remove(&bridge);
                }
            }
        }
    }

    fn join_new_bridge(&mut self, channels: &[&ChannelId]) {
        let bridge = self.next_id();
        for channel in channels {
            self.leave_bridge(channel);
            self.memberships.insert((*channel).clone(), bridge);
        }
        self.bridges
            .insert(bridge, channels.iter().map(|c| (*c).clone()).collect());
    }

    fn peers(&self, channel: &ChannelId) -> Vec<ChannelId> {
        self.memberships
            .get(channel)
            .and_then(|bridge| self.bridges.get(bridge))
            .map(|members| members.iter().filter(|c| *c != channel).cloned().collect())
            .unwrap_or_default()
    }

    fn destroy(&mut self, channel: &ChannelId) -> bool {
        if self.channels.remove(channel).is_none() {
            return false;
        }
        self.leave_bridge(channel);
        true
    }
}

pub struct InMemoryTelephony {
    engine: Mutex<Engine>,
    events: broadcast::Sender<TelephonyEvent>,
}

impl InMemoryTelephony {
    pub fn new(event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer);
        Self {
            engine: Mutex::new(Engine::default()),
            events,
        }
    }

    /// Add an answered channel owned by `user`
    pub fn add_channel(
        &self,
        id: impl Into<String>,
        user_uuid: Option<UserUuid>,
        tenant_uuid: Option<TenantUuid>,
    ) -> ChannelId {
        let id = ChannelId::new(id);
        self.engine.lock().channels.insert(
            id.clone(),
            Channel {
                state: ChannelState::Up,
                user_uuid,
                tenant_uuid,
                variables: ChannelVariables::new(),
            },
        );
        id
    }

    /// Put two existing channels in a fresh bridge
    pub fn connect(&self, a: &ChannelId, b: &ChannelId) {
        self.engine.lock().join_new_bridge(&[a, b]);
    }

    pub fn add_extension(&self, context: impl Into<String>, exten: impl Into<String>) {
        self.engine
            .lock()
            .extensions
            .insert((context.into(), exten.into()));
    }

    pub fn set_contacts(&self, peer_name: impl Into<String>, contacts: Vec<String>) {
        self.engine.lock().contacts.insert(peer_name.into(), contacts);
    }

    /// Make every following origination fail
    pub fn set_fail_originate(&self, fail: bool) {
        self.engine.lock().fail_originate = fail;
    }

    /// The far end picks up
    pub fn answer(&self, id: &ChannelId) -> bool {
        let answered = match self.engine.lock().channels.get_mut(id) {
            Some(channel) => {
                channel.state = ChannelState::Up;
                true
            }
            None => false,
        };
        if answered {
            self.emit(TelephonyEvent::ChannelAnswered {
                channel: id.clone(),
            });
        }
        answered
    }

    /// The far end hangs up
    pub fn hangup_channel(&self, id: &ChannelId) -> bool {
        let destroyed = self.engine.lock().destroy(id);
        if destroyed {
            self.emit(TelephonyEvent::ChannelDestroyed {
                channel: id.clone(),
            });
        }
        destroyed
    }

    /// Remove a channel without telling anyone, as if the event was lost
    pub fn drop_channel(&self, id: &ChannelId) -> bool {
        self.engine.lock().destroy(id)
    }

    /// Change a channel state without emitting any event
    pub fn set_state(&self, id: &ChannelId, state: ChannelState) {
        if let Some(channel) = self.engine.lock().channels.get_mut(id) {
            channel.state = state;
        }
    }

    /// Announce that the control connection is (back) up
    pub fn reconnect(&self) {
        info!("telephony control plane ready");
        self.emit(TelephonyEvent::ControlPlaneReady);
    }

    pub fn exists(&self, id: &ChannelId) -> bool {
        self.engine.lock().channels.contains_key(id)
    }

    pub fn state_of(&self, id: &ChannelId) -> Option<ChannelState> {
        self.engine.lock().channels.get(id).map(|c| c.state)
    }

    pub fn peers_of(&self, id: &ChannelId) -> Vec<ChannelId> {
        self.engine.lock().peers(id)
    }

    pub fn originations(&self) -> Vec<Origination> {
        self.engine.lock().originations.clone()
    }

    /// Channels hung up through the gateway, in order
    pub fn hangups(&self) -> Vec<ChannelId> {
        self.engine.lock().hangups.clone()
    }

    fn emit(&self, event: TelephonyEvent) {
        debug!(?event, "telephony event");
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

impl Default for InMemoryTelephony {
    fn default() -> Self {
        Self::new(1024)
    }
}

fn not_found(id: &ChannelId) -> GatewayError {
    GatewayError::ChannelNotFound(id.clone())
}

#[async_trait]
impl ChannelGateway for InMemoryTelephony {
    async fn get_channel(&self, id: &ChannelId) -> Result<Option<ChannelInfo>, GatewayError> {
        Ok(self.engine.lock().channels.get(id).map(|channel| ChannelInfo {
            id: id.clone(),
            state: channel.state,
            user_uuid: channel.user_uuid.clone(),
            tenant_uuid: channel.tenant_uuid.clone(),
        }))
    }

    async fn originate(
        &self,
        channel: &ChannelId,
        endpoint: &str,
        variables: &ChannelVariables,
    ) -> Result<(), GatewayError> {
        let mut engine = self.engine.lock();
        if engine.fail_originate {
            return Err(GatewayError::Unavailable(format!(
                "cannot originate {}",
                endpoint
            )));
        }
        if engine.channels.contains_key(channel) {
            return Err(GatewayError::Unavailable(format!(
                "channel {} already exists",
                channel
            )));
        }

        engine.channels.insert(
            channel.clone(),
            Channel {
                state: ChannelState::Ringing,
                user_uuid: None,
                tenant_uuid: None,
                variables: variables.clone(),
            },
        );
        engine.originations.push(Origination {
            channel: channel.clone(),
            endpoint: endpoint.to_string(),
            variables: variables.clone(),
        });
        debug!(%channel, endpoint, "originated channel");
        Ok(())
    }

    async fn hangup(&self, id: &ChannelId) -> Result<(), GatewayError> {
        {
            let mut engine = self.engine.lock();
            if !engine.destroy(id) {
                return Err(not_found(id));
            }
            engine.hangups.push(id.clone());
        }
        self.emit(TelephonyEvent::ChannelDestroyed { channel: id.clone() });
        Ok(())
    }

    async fn get_variable(&self, id: &ChannelId, name: &str) -> Result<String, GatewayError> {
        let engine = self.engine.lock();
        let channel = engine.channels.get(id).ok_or_else(|| not_found(id))?;
        channel
            .variables
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("variable {} on {}", name, id)))
    }

    async fn set_variable(
        &self,
        id: &ChannelId,
        name: &str,
        value: &str,
    ) -> Result<(), GatewayError> {
        let mut engine = self.engine.lock();
        let channel = engine.channels.get_mut(id).ok_or_else(|| not_found(id))?;
        channel.variables.insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn bridge(&self, a: &ChannelId, b: &ChannelId) -> Result<(), GatewayError> {
        let mut engine = self.engine.lock();
        for id in [a, b] {
            if !engine.channels.contains_key(id) {
                return Err(not_found(id));
            }
        }
        engine.join_new_bridge(&[a, b]);
        debug!(%a, %b, "channels bridged");
        Ok(())
    }

    async fn only_connected_channel(&self, id: &ChannelId) -> Result<ChannelId, GatewayError> {
        let engine = self.engine.lock();
        if !engine.channels.contains_key(id) {
            return Err(not_found(id));
        }

        let mut peers = engine.peers(id);
        match peers.len() {
            0 => Err(GatewayError::NotEnoughChannels(id.clone())),
            1 => Ok(peers.remove(0)),
            _ => Err(GatewayError::TooManyChannels(peers)),
        }
    }
}

#[async_trait]
impl DialplanGateway for InMemoryTelephony {
    async fn extension_exists(&self, context: &str, exten: &str) -> Result<bool, GatewayError> {
        Ok(self
            .engine
            .lock()
            .extensions
            .contains(&(context.to_string(), exten.to_string())))
    }

    async fn dial_contacts(&self, peer_name: &str) -> Result<Vec<String>, GatewayError> {
        Ok(self
            .engine
            .lock()
            .contacts
            .get(peer_name)
            .cloned()
            .unwrap_or_default())
    }
}

impl EventSource for InMemoryTelephony {
    fn subscribe(&self) -> broadcast::Receiver<TelephonyEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(engine: &InMemoryTelephony) -> (ChannelId, ChannelId) {
        let a = engine.add_channel("a", Some(UserUuid::new("alice")), None);
        let b = engine.add_channel("b", None, None);
        engine.connect(&a, &b);
        (a, b)
    }

    #[tokio::test]
    async fn test_only_connected_channel() {
        let engine = InMemoryTelephony::default();
        let (a, b) = call(&engine);
        assert_eq!(engine.only_connected_channel(&a).await.unwrap(), b);

        let c = engine.add_channel("c", None, None);
        assert_eq!(
            engine.only_connected_channel(&c).await,
            Err(GatewayError::NotEnoughChannels(c.clone()))
        );

        engine.bridge(&c, &a).await.unwrap();
        assert_eq!(
            engine.only_connected_channel(&b).await,
            Err(GatewayError::NotEnoughChannels(b.clone()))
        );
        assert!(matches!(
            engine.only_connected_channel(&ChannelId::new("nope")).await,
            Err(GatewayError::ChannelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_too_many_channels() {
        let engine = InMemoryTelephony::default();
        let a = engine.add_channel("a", None, None);
        let b = engine.add_channel("b", None, None);
        let c = engine.add_channel("c", None, None);
        {
            let mut inner = engine.engine.lock();
            inner.join_new_bridge(&[&a, &b]);
            let bridge = inner.memberships[&a];
            inner.memberships.insert(c.clone(), bridge);
            inner.bridges.get_mut(&bridge).unwrap().insert(c.clone());
        }

        assert_eq!(
            engine.only_connected_channel(&a).await,
            Err(GatewayError::TooManyChannels(vec![b, c]))
        );
    }

    #[tokio::test]
    async fn test_hangup_emits_destroyed() {
        let engine = InMemoryTelephony::default();
        let mut events = engine.subscribe();
        let (a, b) = call(&engine);

        engine.hangup(&a).await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            TelephonyEvent::ChannelDestroyed { channel: a.clone() }
        );
        assert!(!engine.exists(&a));
        assert!(engine.peers_of(&b).is_empty());
        assert_eq!(engine.hangups(), vec![a.clone()]);
        assert_eq!(
            engine.hangup(&a).await,
            Err(GatewayError::ChannelNotFound(a.clone()))
        );
    }

    #[tokio::test]
    async fn test_originate_records_variables() {
        let engine = InMemoryTelephony::default();
        let mut variables = ChannelVariables::new();
        variables.insert("X".to_string(), "1".to_string());

        let channel = ChannelId::new("leg-1");

        engine.originate(&channel, "pjsip/bob", &variables).await.unwrap();

        assert_eq!(engine.state_of(&channel), Some(ChannelState::Ringing));
        assert_eq!(engine.get_variable(&channel, "X").await.unwrap(), "1");
        assert_eq!(engine.originations()[0].endpoint, "pjsip/bob");
        assert_eq!(engine.originations()[0].channel, channel);
        assert!(matches!(
            engine.get_variable(&channel, "Y").await,
            Err(GatewayError::NotFound(_))
        ));

        // Ids are never reused
        assert!(matches!(
            engine.originate(&channel, "pjsip/bob", &variables).await,
            Err(GatewayError::Unavailable(_))
        ));

        engine.set_fail_originate(true);
        assert!(matches!(
            engine
                .originate(&ChannelId::new("leg-2"), "pjsip/bob", &variables)
                .await,
            Err(GatewayError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_dialplan() {
        let engine = InMemoryTelephony::default();
        engine.add_extension("default", "1001");
        engine.set_contacts("bob", vec!["PJSIP/bob/sip:bob@10.0.0.2".to_string()]);

        assert!(engine.extension_exists("default", "1001").await.unwrap());
        assert!(!engine.extension_exists("default", "1002").await.unwrap());
        assert_eq!(engine.dial_contacts("bob").await.unwrap().len(), 1);
        assert!(engine.dial_contacts("carol").await.unwrap().is_empty());
    }
}
