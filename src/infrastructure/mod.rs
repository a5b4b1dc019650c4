//! Infrastructure layer - Adapters for the domain ports
//!
//! This layer contains:
//! - Telephony: in-process engine and user directory
//! - Messaging: outward relocation event delivery

pub mod messaging;
pub mod telephony;

pub use messaging::BroadcastNotifier;
pub use telephony::{InMemoryTelephony, InMemoryUserDirectory, UserProfile};
