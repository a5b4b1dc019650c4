//! Relocate bounded context - moving a live call to another device without dropping it

pub mod aggregate;
pub mod destination;
pub mod event;
pub mod registry;
pub mod value_object;

pub use aggregate::{NewRelocate, Relocate, RelocateGuard, RELOCATE_UUID_VARIABLE};
pub use destination::{
    Destination, DestinationRequest, DestinationResolver, ResolvedDestination,
    DEREFERENCED_USER_VARIABLE,
};
pub use event::{Notifier, RelocateEvent, RelocateEventKind, RelocateSnapshot};
pub use registry::RelocateRegistry;
pub use value_object::{Completion, RelocateRole, RelocateState};
