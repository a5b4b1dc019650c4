//! Relocated - live call relocation for a multi-tenant PBX
//!
//! Moves the remote party of an established call from one of the user's
//! devices to another without dropping the call. Built as a Domain-Driven
//! Design crate: the `domain` layer owns the relocation state machine and
//! its ports, `application` drives it from API requests and engine events,
//! `infrastructure` provides the adapters.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::shared::error::RelocateError;
pub use domain::shared::result::Result;
