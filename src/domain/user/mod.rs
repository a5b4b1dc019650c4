//! User bounded context - directory lookups used to resolve derived destinations

pub mod directory;

pub use directory::{DirectoryError, UserDirectory};

#[cfg(test)]
pub use directory::MockUserDirectory;
