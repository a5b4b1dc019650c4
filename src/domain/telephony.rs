//! Telephony engine ports
//!
//! These traits are the only way the relocation context talks to the live
//! signaling engine. They are defined here (ports) and implemented in the
//! infrastructure layer (adapters).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::domain::shared::value_objects::{ChannelId, TenantUuid, UserUuid};

/// Variables set on a channel at origination
pub type ChannelVariables = BTreeMap<String, String>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("no such channel: {0}")]
    ChannelNotFound(ChannelId),

    /// Anything else the engine does not know: endpoints, variables
    #[error("not found: {0}")]
    NotFound(String),

    #[error("too many channels: {0:?}")]
    TooManyChannels(Vec<ChannelId>),

    #[error("no channel connected to {0}")]
    NotEnoughChannels(ChannelId),

    #[error("telephony engine unavailable: {0}")]
    Unavailable(String),
}

/// Channel state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Down,
    Ring,
    Ringing,
    Up,
}

/// Snapshot of a live channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub state: ChannelState,
    /// Owner of the device this channel belongs to
    pub user_uuid: Option<UserUuid>,
    pub tenant_uuid: Option<TenantUuid>,
}

/// Imperative control over live call legs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelGateway: Send + Sync {
    /// Fetch a channel, `None` if it does not exist
    async fn get_channel(&self, id: &ChannelId) -> Result<Option<ChannelInfo>, GatewayError>;

    /// Dial `endpoint` as a new leg named `channel`
    ///
    /// The caller picks the id so that events about the leg can be routed
    /// before this call returns.
    async fn originate(
        &self,
        channel: &ChannelId,
        endpoint: &str,
        variables: &ChannelVariables,
    ) -> Result<(), GatewayError>;

    async fn hangup(&self, id: &ChannelId) -> Result<(), GatewayError>;

    async fn get_variable(&self, id: &ChannelId, name: &str) -> Result<String, GatewayError>;

    async fn set_variable(&self, id: &ChannelId, name: &str, value: &str)
        -> Result<(), GatewayError>;

    /// Put `a` and `b` in the same bridge, moving `a` out of its current one
    async fn bridge(&self, a: &ChannelId, b: &ChannelId) -> Result<(), GatewayError>;

    /// The single channel sharing a bridge with `id`
    async fn only_connected_channel(&self, id: &ChannelId) -> Result<ChannelId, GatewayError>;
}

/// Dialplan and registration queries
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DialplanGateway: Send + Sync {
    async fn extension_exists(&self, context: &str, exten: &str) -> Result<bool, GatewayError>;

    /// Registered contact URIs of a PJSIP endpoint, e.g. `PJSIP/abc/sip:abc@10.0.0.1:5060`
    async fn dial_contacts(&self, peer_name: &str) -> Result<Vec<String>, GatewayError>;
}

/// Low level events emitted by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelephonyEvent {
    /// A channel went `Up`
    ChannelAnswered { channel: ChannelId },
    ChannelDestroyed { channel: ChannelId },
    /// The control connection was (re)established
    ControlPlaneReady,
}

#[cfg_attr(test, mockall::automock)]
pub trait EventSource: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<TelephonyEvent>;
}
