//! Relocation errors
//!
//! Every failure that crosses the `RelocatesService` boundary is one of these
//! variants, each with a stable machine-readable kind and identifier.

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use super::value_objects::{ChannelId, RelocateId, UserUuid};
use crate::domain::telephony::GatewayError;
use crate::domain::user::DirectoryError;

/// Coarse error class, stable across releases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Permission,
    Conflict,
    NotFound,
    InvalidState,
    ControlPlane,
}

#[derive(Error, Debug, Clone)]
pub enum RelocateError {
    #[error("Relocate creation error: {message}")]
    CreationError { message: String, details: Value },

    #[error("Invalid destination: {details}")]
    InvalidDestination { details: Value },

    #[error("Relocate already started on channel {0}")]
    AlreadyStarted(ChannelId),

    #[error("No such relocate: {0}")]
    NoSuchRelocate(RelocateId),

    #[error("Channel not found: {0}")]
    ChannelNotFound(ChannelId),

    #[error("Not enough channels connected to {0}")]
    NotEnoughChannels(ChannelId),

    #[error("Too many channel candidates: {0:?}")]
    TooManyChannelCandidates(Vec<ChannelId>),

    #[error("User {user} is not allowed to use call {call}")]
    PermissionDenied { user: UserUuid, call: ChannelId },

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Telephony engine error: {0}")]
    ControlPlane(String),
}

impl RelocateError {
    pub fn creation(message: impl Into<String>, details: Value) -> Self {
        RelocateError::CreationError {
            message: message.into(),
            details,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RelocateError::CreationError { .. }
            | RelocateError::InvalidDestination { .. }
            | RelocateError::NotEnoughChannels(_)
            | RelocateError::TooManyChannelCandidates(_) => ErrorKind::Validation,
            RelocateError::PermissionDenied { .. } => ErrorKind::Permission,
            RelocateError::AlreadyStarted(_) => ErrorKind::Conflict,
            RelocateError::NoSuchRelocate(_) | RelocateError::ChannelNotFound(_) => {
                ErrorKind::NotFound
            }
            RelocateError::InvalidStateTransition(_) => ErrorKind::InvalidState,
            RelocateError::ControlPlane(_) => ErrorKind::ControlPlane,
        }
    }

    /// Identifier exposed to API clients
    pub fn error_id(&self) -> &'static str {
        match self {
            RelocateError::CreationError { .. } => "relocate-creation-error",
            RelocateError::InvalidDestination { .. } => "invalid-destination",
            RelocateError::AlreadyStarted(_) => "relocate-already-started",
            RelocateError::NoSuchRelocate(_) => "no-such-relocate",
            RelocateError::ChannelNotFound(_) => "no-such-call",
            RelocateError::NotEnoughChannels(_) => "not-enough-channels",
            RelocateError::TooManyChannelCandidates(_) => "too-many-channel-candidates",
            RelocateError::PermissionDenied { .. } => "user-permission-denied",
            RelocateError::InvalidStateTransition(_) => "invalid-state-transition",
            RelocateError::ControlPlane(_) => "control-plane-error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::Permission => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict | ErrorKind::InvalidState => 409,
            ErrorKind::ControlPlane => 503,
        }
    }

    pub fn details(&self) -> Value {
        match self {
            RelocateError::CreationError { details, .. }
            | RelocateError::InvalidDestination { details } => details.clone(),
            RelocateError::AlreadyStarted(channel) => json!({ "initiator_call": channel }),
            RelocateError::NoSuchRelocate(uuid) => json!({ "relocate_uuid": uuid }),
            RelocateError::ChannelNotFound(channel)
            | RelocateError::NotEnoughChannels(channel) => json!({ "call": channel }),
            RelocateError::TooManyChannelCandidates(channels) => {
                json!({ "candidates": channels })
            }
            RelocateError::PermissionDenied { user, call } => {
                json!({ "user_uuid": user, "call": call })
            }
            RelocateError::InvalidStateTransition(_) | RelocateError::ControlPlane(_) => {
                json!({})
            }
        }
    }

    /// Structured body handed to the API layer
    pub fn to_body(&self) -> Value {
        json!({
            "error_id": self.error_id(),
            "kind": self.kind(),
            "message": self.to_string(),
            "details": self.details(),
        })
    }
}

impl From<GatewayError> for RelocateError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::ChannelNotFound(channel) => RelocateError::ChannelNotFound(channel),
            GatewayError::NotFound(what) => {
                RelocateError::ControlPlane(format!("not found: {}", what))
            }
            GatewayError::TooManyChannels(channels) => {
                RelocateError::TooManyChannelCandidates(channels)
            }
            GatewayError::NotEnoughChannels(channel) => RelocateError::NotEnoughChannels(channel),
            GatewayError::Unavailable(msg) => RelocateError::ControlPlane(msg),
        }
    }
}

impl From<DirectoryError> for RelocateError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::InvalidUserUuid(user) => RelocateError::creation(
                "invalid user: could not find main line",
                json!({ "user_uuid": user }),
            ),
            DirectoryError::InvalidUserLine { user, line_id } => RelocateError::creation(
                "invalid line for user",
                json!({ "user_uuid": user, "line_id": line_id }),
            ),
            DirectoryError::Unavailable(msg) => RelocateError::ControlPlane(msg),
        }
    }
}
