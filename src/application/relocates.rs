//! Relocates application service
//!
//! The only entry point API callers use. Preconditions (channel existence,
//! ownership, a single bridged peer, destination validity) are all checked
//! before a relocation is registered, so a failed `create` leaves nothing
//! behind.

use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RelocatesConfig;
use crate::domain::relocate::{
    Completion, DestinationRequest, DestinationResolver, NewRelocate, Notifier, Relocate,
    RelocateGuard, RelocateRegistry,
};
use crate::domain::shared::error::RelocateError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{ChannelId, RelocateId, TenantUuid, UserUuid};
use crate::domain::telephony::{ChannelGateway, ChannelInfo, ChannelVariables, DialplanGateway};
use crate::domain::user::UserDirectory;

pub const TENANT_VARIABLE: &str = "ACCENT_TENANT_UUID";

/// Variables asking the destination device to pick up by itself
pub const AUTO_ANSWER_VARIABLES: [(&str, &str); 4] = [
    (
        "PJSIP_HEADER(add,Alert-Info)",
        "<http://localhost>;info=alert-autoanswer;delay=0",
    ),
    ("PJSIP_HEADER(add,Answer-After)", "0"),
    ("PJSIP_HEADER(add,Call-Info)", ";answer-after=0"),
    ("ACCENT_AUTO_ANSWER", "1"),
];

/// A relocation request as received from the API
#[derive(Debug, Clone)]
pub struct CreateRelocate {
    pub initiator_call: ChannelId,
    pub destination: DestinationRequest,
    pub completions: Vec<Completion>,
    pub timeout: Option<Duration>,
}

/// Caller-supplied part of a relocation (user-scoped requests)
#[derive(Debug, Default)]
struct Draft {
    initiator: Option<UserUuid>,
    tenant_uuid: Option<TenantUuid>,
    variables: ChannelVariables,
}

pub struct RelocatesService {
    channels: Arc<dyn ChannelGateway>,
    resolver: DestinationResolver,
    registry: Arc<RelocateRegistry>,
    notifier: Arc<dyn Notifier>,
    config: RelocatesConfig,
}

impl RelocatesService {
    pub fn new(
        channels: Arc<dyn ChannelGateway>,
        dialplan: Arc<dyn DialplanGateway>,
        users: Arc<dyn UserDirectory>,
        registry: Arc<RelocateRegistry>,
        notifier: Arc<dyn Notifier>,
        config: RelocatesConfig,
    ) -> Self {
        Self {
            channels,
            resolver: DestinationResolver::new(dialplan, users),
            registry,
            notifier,
            config,
        }
    }

    pub fn list_from_user(&self, user: &UserUuid) -> Vec<Arc<Relocate>> {
        self.registry.list_for_user(user)
    }

    pub fn get_from_user(&self, uuid: &RelocateId, user: &UserUuid) -> Result<Arc<Relocate>> {
        self.registry.get(uuid, user)
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    pub async fn create(&self, request: CreateRelocate) -> Result<Arc<Relocate>> {
        self.create_relocate(request, Draft::default()).await
    }

    pub async fn create_from_user(
        &self,
        request: CreateRelocate,
        auto_answer: bool,
        user: &UserUuid,
    ) -> Result<Arc<Relocate>> {
        let initiator = self.existing_channel(&request.initiator_call).await?;
        if initiator.user_uuid.as_ref() != Some(user) {
            warn!(user = %user, call = %request.initiator_call, "relocate denied: call not owned by user");
            return Err(RelocateError::PermissionDenied {
                user: user.clone(),
                call: request.initiator_call,
            });
        }

        let mut variables = ChannelVariables::new();
        if let Some(tenant) = &initiator.tenant_uuid {
            variables.insert(TENANT_VARIABLE.to_string(), tenant.to_string());
        }
        if auto_answer {
            variables.extend(
                AUTO_ANSWER_VARIABLES
                    .iter()
                    .map(|(name, value)| (name.to_string(), value.to_string())),
            );
        }

        let draft = Draft {
            initiator: Some(user.clone()),
            tenant_uuid: initiator.tenant_uuid,
            variables,
        };
        self.create_relocate(request, draft).await
    }

    pub async fn complete_from_user(&self, uuid: &RelocateId, user: &UserUuid) -> Result<()> {
        let relocate = self.owned(uuid, user)?;
        let mut guard = relocate.locked().await;
        let result = guard.complete().await;
        self.settle(guard);
        result
    }

    pub async fn cancel_from_user(&self, uuid: &RelocateId, user: &UserUuid) -> Result<()> {
        let relocate = self.owned(uuid, user)?;
        let mut guard = relocate.locked().await;
        guard.cancel().await;
        self.settle(guard);
        Ok(())
    }

    async fn create_relocate(&self, request: CreateRelocate, draft: Draft) -> Result<Arc<Relocate>> {
        let timeout = self.timeout(request.timeout)?;
        let completions = self.completions(&request.completions);

        let initiator = self.existing_channel(&request.initiator_call).await?;
        let relocated = self
            .channels
            .only_connected_channel(&initiator.id)
            .await
            .map_err(RelocateError::from)?;

        let resolved = self
            .resolver
            .resolve(&request.destination, draft.initiator.as_ref())
            .await?;

        let mut recipient_variables = draft.variables;
        recipient_variables.extend(resolved.variables);

        let relocate = Relocate::new(
            NewRelocate {
                initiator: draft.initiator,
                tenant_uuid: draft.tenant_uuid.or(initiator.tenant_uuid),
                initiator_channel: initiator.id,
                relocated_channel: relocated,
                recipient_channel: ChannelId::new(Uuid::new_v4().to_string()),
                completions,
                timeout,
                recipient_variables,
            },
            Arc::clone(&self.channels),
        );
        relocate.observe(Arc::clone(&self.notifier));
        self.registry.add(Arc::clone(&relocate))?;

        // The timeout counts from creation, dialing included
        let mut guard = relocate.locked().await;
        if let Some(timeout) = timeout {
            let registry = Arc::clone(&self.registry);
            guard.arm_timeout(timeout, move |relocate| registry.release(&relocate));
        }

        if let Err(err) = guard.initiate(&resolved.destination).await {
            drop(guard);
            self.registry.remove(&relocate.uuid());
            self.record_active();
            return Err(err);
        }
        drop(guard);

        info!(
            relocate = %relocate.uuid(),
            initiator_call = %relocate.initiator_channel(),
            relocated_call = %relocate.relocated_channel(),
            destination = request.destination.kind(),
            "relocate created"
        );
        metrics::counter!("relocates_created_total").increment(1);
        self.record_active();
        Ok(relocate)
    }

    async fn existing_channel(&self, channel: &ChannelId) -> Result<ChannelInfo> {
        self.channels
            .get_channel(channel)
            .await?
            .ok_or_else(|| RelocateError::ChannelNotFound(channel.clone()))
    }

    fn owned(&self, uuid: &RelocateId, user: &UserUuid) -> Result<Arc<Relocate>> {
        let relocate = self
            .registry
            .lookup(uuid)
            .ok_or(RelocateError::NoSuchRelocate(*uuid))?;

        if relocate.initiator() != Some(user) {
            warn!(relocate = %uuid, user = %user, "relocate denied: not the initiator");
            return Err(RelocateError::PermissionDenied {
                user: user.clone(),
                call: relocate.initiator_channel().clone(),
            });
        }
        Ok(relocate)
    }

    fn timeout(&self, requested: Option<Duration>) -> Result<Option<Duration>> {
        let timeout = requested.or(self
            .config
            .default_timeout_secs
            .map(Duration::from_secs));

        match timeout {
            Some(timeout)
                if timeout.is_zero() || timeout.as_secs() > self.config.max_timeout_secs =>
            {
                Err(RelocateError::creation(
                    "invalid timeout",
                    json!({
                        "timeout": timeout.as_secs(),
                        "max_timeout": self.config.max_timeout_secs,
                    }),
                ))
            }
            timeout => Ok(timeout),
        }
    }

    fn completions(&self, requested: &[Completion]) -> BTreeSet<Completion> {
        if requested.is_empty() {
            self.config.default_completions.iter().copied().collect()
        } else {
            requested.iter().copied().collect()
        }
    }

    /// Release the relocation's lock, then stop tracking it if it is finished
    fn settle(&self, guard: RelocateGuard) {
        let relocate = Arc::clone(guard.relocate());
        drop(guard);
        self.registry.release(&relocate);
        self.record_active();
    }

    fn record_active(&self) {
        metrics::gauge!("relocates_active").set(self.registry.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::relocate::event::MockNotifier;
    use crate::domain::relocate::RelocateState;
    use crate::domain::shared::error::ErrorKind;
    use crate::domain::telephony::{
        ChannelInfo, ChannelState, GatewayError, MockChannelGateway, MockDialplanGateway,
    };
    use crate::domain::user::MockUserDirectory;

    fn channel(id: &str, user: Option<&str>) -> ChannelInfo {
        ChannelInfo {
            id: ChannelId::new(id),
            state: ChannelState::Up,
            user_uuid: user.map(UserUuid::new),
            tenant_uuid: Some(TenantUuid::new("tenant-1")),
        }
    }

    fn quiet_notifier() -> Arc<MockNotifier> {
        let mut notifier = MockNotifier::new();
        notifier.expect_publish().returning(|_| ());
        Arc::new(notifier)
    }

    fn service(channels: MockChannelGateway, dialplan: MockDialplanGateway) -> RelocatesService {
        RelocatesService::new(
            Arc::new(channels),
            Arc::new(dialplan),
            Arc::new(MockUserDirectory::new()),
            Arc::new(RelocateRegistry::new()),
            quiet_notifier(),
            RelocatesConfig::default(),
        )
    }

    fn request(destination: DestinationRequest) -> CreateRelocate {
        CreateRelocate {
            initiator_call: ChannelId::new("initiator"),
            destination,
            completions: vec![Completion::Answer],
            timeout: None,
        }
    }

    fn interface(name: &str) -> DestinationRequest {
        DestinationRequest::Interface {
            interface: name.to_string(),
            contact: None,
        }
    }

    #[tokio::test]
    async fn test_unknown_initiator_call() {
        let mut channels = MockChannelGateway::new();
        channels.expect_get_channel().returning(|_| Ok(None));

        let service = service(channels, MockDialplanGateway::new());
        let err = service.create(request(interface("pjsip/bob"))).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(service.active_count(), 0);
    }

    #[tokio::test]
    async fn test_initiator_not_bridged() {
        let mut channels = MockChannelGateway::new();
        channels
            .expect_get_channel()
            .returning(|_| Ok(Some(channel("initiator", None))));
        channels
            .expect_only_connected_channel()
            .returning(|id| Err(GatewayError::NotEnoughChannels(id.clone())));

        let service = service(channels, MockDialplanGateway::new());
        let err = service.create(request(interface("pjsip/bob"))).await.unwrap_err();

        assert!(matches!(err, RelocateError::NotEnoughChannels(_)));
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_too_many_candidates() {
        let mut channels = MockChannelGateway::new();
        channels
            .expect_get_channel()
            .returning(|_| Ok(Some(channel("initiator", None))));
        channels.expect_only_connected_channel().returning(|_| {
            Err(GatewayError::TooManyChannels(vec![
                ChannelId::new("a"),
                ChannelId::new("b"),
            ]))
        });

        let service = service(channels, MockDialplanGateway::new());
        let err = service.create(request(interface("pjsip/bob"))).await.unwrap_err();

        assert!(matches!(err, RelocateError::TooManyChannelCandidates(ref c) if c.len() == 2));
    }

    #[tokio::test]
    async fn test_invalid_extension_has_no_side_effect() {
        let mut channels = MockChannelGateway::new();
        channels
            .expect_get_channel()
            .returning(|_| Ok(Some(channel("initiator", None))));
        channels
            .expect_only_connected_channel()
            .returning(|_| Ok(ChannelId::new("relocated")));
        channels.expect_originate().never();
        let mut dialplan = MockDialplanGateway::new();
        dialplan.expect_extension_exists().returning(|_, _| Ok(false));

        let service = service(channels, dialplan);
        let err = service
            .create(request(DestinationRequest::Extension {
                exten: "9999".to_string(),
                context: "default".to_string(),
            }))
            .await
            .unwrap_err();

        assert!(matches!(err, RelocateError::InvalidDestination { .. }));
        assert_eq!(service.active_count(), 0);
    }

    #[tokio::test]
    async fn test_originate_failure_is_unregistered() {
        let mut channels = MockChannelGateway::new();
        channels
            .expect_get_channel()
            .returning(|_| Ok(Some(channel("initiator", None))));
        channels
            .expect_only_connected_channel()
            .returning(|_| Ok(ChannelId::new("relocated")));
        channels
            .expect_originate()
            .returning(|_, _, _| Err(GatewayError::Unavailable("no route".to_string())));

        let service = service(channels, MockDialplanGateway::new());
        let err = service.create(request(interface("pjsip/bob"))).await.unwrap_err();

        assert_eq!(err.error_id(), "relocate-creation-error");
        assert_eq!(service.active_count(), 0);
    }

    #[tokio::test]
    async fn test_create_from_user_checks_ownership() {
        let mut channels = MockChannelGateway::new();
        channels
            .expect_get_channel()
            .returning(|_| Ok(Some(channel("initiator", Some("bob")))));
        channels.expect_only_connected_channel().never();

        let service = service(channels, MockDialplanGateway::new());
        let err = service
            .create_from_user(request(interface("pjsip/bob")), false, &UserUuid::new("alice"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Permission);
    }

    #[tokio::test]
    async fn test_create_from_user_sets_recipient_variables() {
        let mut channels = MockChannelGateway::new();
        channels
            .expect_get_channel()
            .returning(|_| Ok(Some(channel("initiator", Some("alice")))));
        channels
            .expect_only_connected_channel()
            .returning(|_| Ok(ChannelId::new("relocated")));
        channels
            .expect_originate()
            .withf(|_, _, variables| {
                variables.get(TENANT_VARIABLE).map(String::as_str) == Some("tenant-1")
                    && variables.get("ACCENT_AUTO_ANSWER").map(String::as_str) == Some("1")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let service = service(channels, MockDialplanGateway::new());
        let relocate = service
            .create_from_user(request(interface("pjsip/alice-mobile")), true, &UserUuid::new("alice"))
            .await
            .unwrap();

        assert_eq!(relocate.state(), RelocateState::Ringing);
        assert_eq!(relocate.initiator(), Some(&UserUuid::new("alice")));
        assert_eq!(relocate.tenant_uuid(), Some(&TenantUuid::new("tenant-1")));
        assert!(relocate.recipient_channel().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_originate_failure_disarms_timeout() {
        let mut channels = MockChannelGateway::new();
        channels
            .expect_get_channel()
            .returning(|_| Ok(Some(channel("initiator", None))));
        channels
            .expect_only_connected_channel()
            .returning(|_| Ok(ChannelId::new("relocated")));
        channels
            .expect_originate()
            .returning(|_, _, _| Err(GatewayError::Unavailable("no route".to_string())));
        channels.expect_hangup().never();

        let service = service(channels, MockDialplanGateway::new());
        let mut request = request(interface("pjsip/bob"));
        request.timeout = Some(Duration::from_secs(5));
        tokio_test::assert_err!(service.create(request).await);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(service.active_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_above_maximum_is_rejected() {
        let service = service(MockChannelGateway::new(), MockDialplanGateway::new());
        let mut request = request(interface("pjsip/bob"));
        request.timeout = Some(Duration::from_secs(86_400));

        let err = service.create(request).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_unknown_relocate() {
        let service = service(MockChannelGateway::new(), MockDialplanGateway::new());
        let uuid = RelocateId::new();

        let err = service
            .cancel_from_user(&uuid, &UserUuid::new("alice"))
            .await
            .unwrap_err();

        assert!(matches!(err, RelocateError::NoSuchRelocate(u) if u == uuid));
    }
}
