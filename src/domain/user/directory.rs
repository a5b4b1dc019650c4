//! User directory port

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::shared::value_objects::UserUuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("invalid user: {0}")]
    InvalidUserUuid(UserUuid),

    #[error("user {user} has no line {line_id}")]
    InvalidUserLine { user: UserUuid, line_id: u32 },

    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view of user configuration
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Dial interface of one of the user's lines, e.g. `pjsip/abcdef`
    async fn line_interface(&self, user: &UserUuid, line_id: u32)
        -> Result<String, DirectoryError>;

    async fn mobile_number(&self, user: &UserUuid) -> Result<Option<String>, DirectoryError>;

    /// Dialplan context of the user's main line
    async fn main_line_context(&self, user: &UserUuid) -> Result<String, DirectoryError>;
}
