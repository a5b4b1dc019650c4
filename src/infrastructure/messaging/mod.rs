//! Outward event delivery

use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::relocate::{Notifier, RelocateEvent};

/// Fans relocation events out to any number of subscribers
pub struct BroadcastNotifier {
    tx: broadcast::Sender<RelocateEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelocateEvent> {
        self.tx.subscribe()
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, event: &RelocateEvent) {
        debug!(
            event = event.kind.name(),
            routing_key = event.kind.routing_key(),
            relocate = %event.relocate.uuid,
            "publishing relocate event"
        );
        // Ignore send errors (no receivers)
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::relocate::{RelocateEventKind, RelocateSnapshot, RelocateState};
    use crate::domain::shared::value_objects::{ChannelId, RelocateId, UserUuid};
    use chrono::Utc;

    fn event(kind: RelocateEventKind) -> RelocateEvent {
        RelocateEvent::new(
            kind,
            RelocateSnapshot {
                uuid: RelocateId::new(),
                state: RelocateState::Ringing,
                relocated_call: ChannelId::new("relocated"),
                initiator_call: ChannelId::new("initiator"),
                recipient_call: Some(ChannelId::new("recipient")),
                completions: vec![],
                initiator: Some(UserUuid::new("alice")),
                timeout: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            None,
        )
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let notifier = BroadcastNotifier::new(8);
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 2);

        notifier.publish(&event(RelocateEventKind::Initiated));

        assert_eq!(first.recv().await.unwrap().kind, RelocateEventKind::Initiated);
        assert_eq!(second.recv().await.unwrap().kind, RelocateEventKind::Initiated);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let notifier = BroadcastNotifier::default();
        notifier.publish(&event(RelocateEventKind::Ended));
        assert_eq!(notifier.subscriber_count(), 0);
    }
}
