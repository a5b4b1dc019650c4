//! Relocate lifecycle events and the outward notification port

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::relocate::value_object::{Completion, RelocateState};
use crate::domain::shared::value_objects::{ChannelId, RelocateId, TenantUuid, UserUuid};

/// Serializable view of a relocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocateSnapshot {
    pub uuid: RelocateId,
    pub state: RelocateState,
    pub relocated_call: ChannelId,
    pub initiator_call: ChannelId,
    pub recipient_call: Option<ChannelId>,
    pub completions: Vec<Completion>,
    pub initiator: Option<UserUuid>,
    pub timeout: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelocateEventKind {
    Initiated,
    Answered,
    Completed,
    Ended,
}

impl RelocateEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            RelocateEventKind::Initiated => "relocate_initiated",
            RelocateEventKind::Answered => "relocate_answered",
            RelocateEventKind::Completed => "relocate_completed",
            RelocateEventKind::Ended => "relocate_ended",
        }
    }

    pub fn routing_key(&self) -> &'static str {
        match self {
            RelocateEventKind::Initiated => "calls.relocate.created",
            RelocateEventKind::Answered | RelocateEventKind::Completed => "calls.relocate.edited",
            RelocateEventKind::Ended => "calls.relocate.deleted",
        }
    }
}

/// Lifecycle event published for every observed relocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelocateEvent {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub kind: RelocateEventKind,
    pub relocate: RelocateSnapshot,
    pub tenant_uuid: Option<TenantUuid>,
}

impl RelocateEvent {
    pub fn new(
        kind: RelocateEventKind,
        relocate: RelocateSnapshot,
        tenant_uuid: Option<TenantUuid>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            kind,
            relocate,
            tenant_uuid,
        }
    }

    pub fn user_uuid(&self) -> Option<&UserUuid> {
        self.relocate.initiator.as_ref()
    }

    /// ACL a bus consumer needs to receive this event
    pub fn required_acl(&self) -> Option<String> {
        self.user_uuid()
            .map(|user| format!("events.relocates.{}", user))
    }
}

/// Outward sink for relocation lifecycle events
///
/// `publish` is called while the relocation's own lock is held and must not
/// block.
#[cfg_attr(test, mockall::automock)]
pub trait Notifier: Send + Sync {
    fn publish(&self, event: &RelocateEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(initiator: Option<UserUuid>) -> RelocateSnapshot {
        RelocateSnapshot {
            uuid: RelocateId::new(),
            state: RelocateState::Ringing,
            relocated_call: ChannelId::new("relocated"),
            initiator_call: ChannelId::new("initiator"),
            recipient_call: Some(ChannelId::new("recipient")),
            completions: vec![Completion::Answer],
            initiator,
            timeout: Some(30),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_event_routing() {
        let event = RelocateEvent::new(
            RelocateEventKind::Ended,
            snapshot(Some(UserUuid::new("alice"))),
            None,
        );

        assert_eq!(event.kind.name(), "relocate_ended");
        assert_eq!(event.kind.routing_key(), "calls.relocate.deleted");
        assert_eq!(event.required_acl().as_deref(), Some("events.relocates.alice"));
    }

    #[test]
    fn test_event_without_user_has_no_acl() {
        let event = RelocateEvent::new(RelocateEventKind::Initiated, snapshot(None), None);
        assert!(event.required_acl().is_none());
    }

    #[test]
    fn test_events_are_distinct() {
        let first = RelocateEvent::new(RelocateEventKind::Answered, snapshot(None), None);
        let second = RelocateEvent::new(RelocateEventKind::Answered, snapshot(None), None);

        assert_ne!(first.event_id, second.event_id);
        assert!(second.occurred_at >= first.occurred_at);
        assert_eq!(
            serde_json::to_value(&first).unwrap()["event_id"],
            first.event_id.to_string()
        );
    }
}
