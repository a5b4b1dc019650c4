//! Telephony engine adapters

pub mod directory;
pub mod memory;

pub use directory::{InMemoryUserDirectory, UserProfile};
pub use memory::{InMemoryTelephony, Origination};
