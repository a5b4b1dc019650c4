//! Domain result type

use super::error::RelocateError;

/// Standard result type for relocation operations
pub type Result<T> = std::result::Result<T, RelocateError>;
