//! Domain layer - Core business logic and rules
//!
//! This layer contains:
//! - Aggregates: the `Relocate` state machine
//! - Value Objects: states, completions, destinations
//! - Domain Services: destination resolution, the active relocation registry
//! - Ports: telephony engine, user directory and notifier interfaces
//! - Domain Events: relocation lifecycle events

pub mod relocate;
pub mod shared;
pub mod telephony;
pub mod user;

// Re-export commonly used types
pub use shared::{ErrorKind, RelocateError, Result};
