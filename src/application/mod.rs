//! Application layer - Use cases and application services
//!
//! This layer orchestrates domain objects to fulfill use cases.
//! It's responsible for:
//! - Validating requests and resolving destinations
//! - Keeping the registry of active relocations in sync
//! - Feeding telephony engine events to the relocation state machine

pub mod dispatcher;
pub mod relocates;

pub use dispatcher::EventDispatcher;
pub use relocates::{CreateRelocate, RelocatesService, AUTO_ANSWER_VARIABLES, TENANT_VARIABLE};
