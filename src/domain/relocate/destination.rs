//! Relocation destinations
//!
//! A [`DestinationRequest`] is what a caller asks for; a [`Destination`] is a
//! dial target that has been checked against the live engine. Destinations
//! can only be built by [`DestinationResolver`], so holding one means it was
//! valid at resolution time.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::domain::shared::error::RelocateError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::UserUuid;
use crate::domain::telephony::{ChannelVariables, DialplanGateway, GatewayError};
use crate::domain::user::UserDirectory;

/// Marks the destination leg as belonging to the user even when dialed as a plain extension
pub const DEREFERENCED_USER_VARIABLE: &str = "ACCENT_DEREFERENCED_USERUUID";

/// Requested destination, as received from the API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "destination", content = "location", rename_all = "lowercase")]
pub enum DestinationRequest {
    Interface {
        interface: String,
        #[serde(default)]
        contact: Option<String>,
    },
    Extension {
        exten: String,
        context: String,
    },
    /// One of the user's own lines, optionally a single registered contact of it
    Line {
        line_id: u32,
        #[serde(default)]
        contact: Option<String>,
    },
    /// The user's mobile phone number
    Mobile {},
}

impl DestinationRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            DestinationRequest::Interface { .. } => "interface",
            DestinationRequest::Extension { .. } => "extension",
            DestinationRequest::Line { .. } => "line",
            DestinationRequest::Mobile {} => "mobile",
        }
    }

    fn details(&self) -> Value {
        let location = match self {
            DestinationRequest::Interface { interface, contact } => {
                json!({ "interface": interface, "contact": contact })
            }
            DestinationRequest::Extension { exten, context } => {
                json!({ "exten": exten, "context": context })
            }
            DestinationRequest::Line { line_id, contact } => {
                json!({ "line_id": line_id, "contact": contact })
            }
            DestinationRequest::Mobile {} => json!({}),
        };
        json!({ "destination": self.kind(), "location": location })
    }
}

/// Validated dial target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Destination {
    Interface { endpoint: String },
    Extension { exten: String, context: String },
}

impl Destination {
    /// Endpoint string handed to the engine's originate
    pub fn endpoint(&self) -> String {
        match self {
            Destination::Interface { endpoint } => endpoint.clone(),
            Destination::Extension { exten, context } => format!("Local/{}@{}", exten, context),
        }
    }
}

/// Outcome of a resolution: the dial target and the variables it requires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDestination {
    pub destination: Destination,
    pub variables: ChannelVariables,
}

impl ResolvedDestination {
    fn plain(destination: Destination) -> Self {
        Self {
            destination,
            variables: ChannelVariables::new(),
        }
    }
}

fn pjsip_contact_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^pjsip/[a-z0-9]+/sip:[a-z0-9]+@.*").expect("static contact pattern")
    })
}

/// Turns destination requests into validated dial targets
pub struct DestinationResolver {
    dialplan: Arc<dyn DialplanGateway>,
    users: Arc<dyn UserDirectory>,
}

impl DestinationResolver {
    pub fn new(dialplan: Arc<dyn DialplanGateway>, users: Arc<dyn UserDirectory>) -> Self {
        Self { dialplan, users }
    }

    /// Resolve `request`; derived destinations need the requesting `user`
    pub async fn resolve(
        &self,
        request: &DestinationRequest,
        user: Option<&UserUuid>,
    ) -> Result<ResolvedDestination> {
        match request {
            DestinationRequest::Interface { interface, contact } => {
                let endpoint = self
                    .interface_endpoint(interface, contact.as_deref(), request)
                    .await?;
                Ok(ResolvedDestination::plain(Destination::Interface { endpoint }))
            }
            DestinationRequest::Extension { exten, context } => {
                let destination = self.extension(exten, context, request).await?;
                Ok(ResolvedDestination::plain(destination))
            }
            DestinationRequest::Line { line_id, contact } => {
                let user = user.ok_or_else(|| invalid(request))?;
                let interface = self.users.line_interface(user, *line_id).await?;
                debug!(user = %user, line_id, interface = %interface, "resolved user line");
                let endpoint = self
                    .interface_endpoint(&interface, contact.as_deref(), request)
                    .await?;
                Ok(ResolvedDestination::plain(Destination::Interface { endpoint }))
            }
            DestinationRequest::Mobile {} => {
                let user = user.ok_or_else(|| invalid(request))?;
                let mobile = self
                    .users
                    .mobile_number(user)
                    .await?
                    .filter(|number| !number.is_empty())
                    .ok_or_else(|| {
                        RelocateError::creation(
                            "invalid user: no mobile phone number",
                            json!({ "user_uuid": user }),
                        )
                    })?;
                let context = self.users.main_line_context(user).await?;
                let destination = self.extension(&mobile, &context, request).await?;

                let mut variables = ChannelVariables::new();
                variables.insert(DEREFERENCED_USER_VARIABLE.to_string(), user.to_string());
                Ok(ResolvedDestination {
                    destination,
                    variables,
                })
            }
        }
    }

    async fn extension(
        &self,
        exten: &str,
        context: &str,
        request: &DestinationRequest,
    ) -> Result<Destination> {
        if exten.is_empty() || context.is_empty() {
            return Err(invalid(request));
        }

        if !self.dialplan.extension_exists(context, exten).await? {
            warn!(exten, context, "relocate destination does not exist");
            return Err(invalid(request));
        }

        Ok(Destination::Extension {
            exten: exten.to_string(),
            context: context.to_string(),
        })
    }

    async fn interface_endpoint(
        &self,
        interface: &str,
        contact: Option<&str>,
        request: &DestinationRequest,
    ) -> Result<String> {
        if interface.is_empty() {
            return Err(invalid(request));
        }

        let peer_name = match interface.split_once('/') {
            Some((tech, peer)) if tech.eq_ignore_ascii_case("pjsip") && !peer.is_empty() => peer,
            _ => return Ok(interface.to_string()),
        };

        let contact = match contact {
            Some(contact) if !contact.is_empty() => contact,
            // No hint: let the engine ring every registered contact
            _ => return Ok(interface.to_string()),
        };

        if pjsip_contact_re().is_match(contact) {
            return Ok(contact.to_string());
        }

        let contacts = match self.dialplan.dial_contacts(peer_name).await {
            Ok(contacts) => contacts,
            Err(GatewayError::NotFound(msg)) => {
                warn!(peer = peer_name, "cannot find dial contacts: {}", msg);
                return Err(invalid(request));
            }
            Err(err) => return Err(err.into()),
        };

        let uri_start = format!("PJSIP/{}/sip:{}", peer_name, contact);
        contacts
            .into_iter()
            .find(|uri| uri.starts_with(&uri_start))
            .ok_or_else(|| {
                warn!(peer = peer_name, contact, "failed to find a matching contact");
                invalid(request)
            })
    }
}

fn invalid(request: &DestinationRequest) -> RelocateError {
    RelocateError::InvalidDestination {
        details: request.details(),
    }
}
