//! Shared kernel - Common types used across the relocation context

pub mod error;
pub mod result;
pub mod value_objects;

pub use error::{ErrorKind, RelocateError};
pub use result::Result;
pub use value_objects::*;
