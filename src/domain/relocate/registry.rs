//! Active relocation registry
//!
//! Created once at startup and shared by reference. Its lock is held only
//! for map operations: it is never held across an await and never while a
//! relocation's own lock is being acquired.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::domain::relocate::aggregate::Relocate;
use crate::domain::shared::error::RelocateError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{ChannelId, RelocateId, UserUuid};

#[derive(Default)]
struct Entries {
    by_uuid: HashMap<RelocateId, Arc<Relocate>>,
    by_initiator: HashMap<ChannelId, RelocateId>,
}

impl Entries {
    fn find_by_channel(&self, channel: &ChannelId) -> Option<&Arc<Relocate>> {
        if let Some(relocate) = self
            .by_initiator
            .get(channel)
            .and_then(|uuid| self.by_uuid.get(uuid))
        {
            return Some(relocate);
        }

        self.by_uuid
            .values()
            .find(|relocate| relocate.role(channel).is_some())
    }

    fn remove(&mut self, uuid: &RelocateId) -> Option<Arc<Relocate>> {
        let relocate = self.by_uuid.remove(uuid)?;
        if self.by_initiator.get(relocate.initiator_channel()) == Some(uuid) {
            self.by_initiator.remove(relocate.initiator_channel());
        }
        Some(relocate)
    }
}

#[derive(Default)]
pub struct RelocateRegistry {
    entries: Mutex<Entries>,
}

impl RelocateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `relocate` unless a live relocation already uses its initiator channel
    pub fn add(&self, relocate: Arc<Relocate>) -> Result<()> {
        let mut entries = self.entries.lock();
        let channel = relocate.initiator_channel().clone();

        while let Some(existing) = entries.find_by_channel(&channel).cloned() {
            if !existing.is_terminal() {
                return Err(RelocateError::AlreadyStarted(channel));
            }
            debug!(relocate = %existing.uuid(), "purging finished relocate");
            entries.remove(&existing.uuid());
        }

        entries.by_initiator.insert(channel, relocate.uuid());
        entries.by_uuid.insert(relocate.uuid(), relocate);
        Ok(())
    }

    /// Relocation `uuid` if it was initiated by `owner`
    pub fn get(&self, uuid: &RelocateId, owner: &UserUuid) -> Result<Arc<Relocate>> {
        self.lookup(uuid)
            .filter(|relocate| relocate.initiator() == Some(owner))
            .ok_or(RelocateError::NoSuchRelocate(*uuid))
    }

    /// Relocation `uuid` regardless of owner
    pub fn lookup(&self, uuid: &RelocateId) -> Option<Arc<Relocate>> {
        self.entries.lock().by_uuid.get(uuid).cloned()
    }

    /// Relocation using `channel` in any role
    pub fn find_by_channel(&self, channel: &ChannelId) -> Option<Arc<Relocate>> {
        self.entries.lock().find_by_channel(channel).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Relocate>> {
        self.entries.lock().by_uuid.values().cloned().collect()
    }

    pub fn list_for_user(&self, owner: &UserUuid) -> Vec<Arc<Relocate>> {
        self.entries
            .lock()
            .by_uuid
            .values()
            .filter(|relocate| relocate.initiator() == Some(owner))
            .cloned()
            .collect()
    }

    pub fn remove(&self, uuid: &RelocateId) -> Option<Arc<Relocate>> {
        let removed = self.entries.lock().remove(uuid);
        if removed.is_some() {
            debug!(relocate = %uuid, "relocate removed from registry");
        }
        removed
    }

    /// Drop `relocate` from active tracking once it is finished
    pub fn release(&self, relocate: &Relocate) {
        if relocate.is_terminal() {
            self.remove(&relocate.uuid());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::relocate::aggregate::NewRelocate;
    use crate::domain::telephony::{ChannelVariables, MockChannelGateway};
    use std::collections::BTreeSet;

    fn relocate(initiator_channel: &str, user: &str) -> Arc<Relocate> {
        Relocate::new(
            NewRelocate {
                initiator: Some(UserUuid::new(user)),
                tenant_uuid: None,
                initiator_channel: ChannelId::new(initiator_channel),
                relocated_channel: ChannelId::new(format!("{}-peer", initiator_channel)),
                recipient_channel: ChannelId::new(format!("{}-recipient", initiator_channel)),
                completions: BTreeSet::new(),
                timeout: None,
                recipient_variables: ChannelVariables::new(),
            },
            Arc::new(MockChannelGateway::new()),
        )
    }

    #[test]
    fn test_duplicate_initiator_is_rejected() {
        let registry = RelocateRegistry::new();
        registry.add(relocate("c1", "alice")).unwrap();

        let result = registry.add(relocate("c1", "alice"));

        assert!(matches!(result, Err(RelocateError::AlreadyStarted(ref c)) if c.as_str() == "c1"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_relocated_channel_cannot_start_a_second_relocate() {
        let registry = RelocateRegistry::new();
        registry.add(relocate("c1", "alice")).unwrap();

        let result = registry.add(relocate("c1-peer", "bob"));

        assert!(matches!(result, Err(RelocateError::AlreadyStarted(_))));
    }

    #[test]
    fn test_get_checks_owner() {
        let registry = RelocateRegistry::new();
        let relocate = relocate("c1", "alice");
        registry.add(relocate.clone()).unwrap();

        assert!(registry.get(&relocate.uuid(), &UserUuid::new("alice")).is_ok());
        assert!(matches!(
            registry.get(&relocate.uuid(), &UserUuid::new("bob")),
            Err(RelocateError::NoSuchRelocate(_))
        ));
    }

    #[test]
    fn test_find_and_list() {
        let registry = RelocateRegistry::new();
        registry.add(relocate("c1", "alice")).unwrap();
        registry.add(relocate("c2", "alice")).unwrap();
        registry.add(relocate("c3", "bob")).unwrap();

        assert_eq!(registry.list().len(), 3);
        assert_eq!(registry.list_for_user(&UserUuid::new("alice")).len(), 2);
        assert!(registry.find_by_channel(&ChannelId::new("c2-peer")).is_some());
        assert!(registry.find_by_channel(&ChannelId::new("c9")).is_none());
    }

    #[test]
    fn test_remove_frees_channel() {
        let registry = RelocateRegistry::new();
        let first = relocate("c1", "alice");
        registry.add(first.clone()).unwrap();

        assert!(registry.remove(&first.uuid()).is_some());
        assert!(registry.is_empty());
        assert!(registry.add(relocate("c1", "alice")).is_ok());
    }

    #[test]
    fn test_release_keeps_live_relocates() {
        let registry = RelocateRegistry::new();
        let live = relocate("c1", "alice");
        registry.add(live.clone()).unwrap();

        registry.release(&live);

        assert_eq!(registry.len(), 1);
    }
}
