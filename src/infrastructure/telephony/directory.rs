//! In-memory user directory

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use crate::domain::shared::value_objects::UserUuid;
use crate::domain::user::{DirectoryError, UserDirectory};

#[derive(Debug, Clone, Default)]
pub struct UserProfile {
    /// line id -> dial interface
    pub lines: BTreeMap<u32, String>,
    pub mobile_number: Option<String>,
    /// Context of the main line
    pub context: String,
}

#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<UserUuid, UserProfile>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: UserUuid, profile: UserProfile) {
        self.users.write().insert(user, profile);
    }

    fn profile(&self, user: &UserUuid) -> Result<UserProfile, DirectoryError> {
        self.users
            .read()
            .get(user)
            .cloned()
            .ok_or_else(|| DirectoryError::InvalidUserUuid(user.clone()))
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn line_interface(
        &self,
        user: &UserUuid,
        line_id: u32,
    ) -> Result<String, DirectoryError> {
        self.profile(user)?
            .lines
            .remove(&line_id)
            .ok_or_else(|| DirectoryError::InvalidUserLine {
                user: user.clone(),
                line_id,
            })
    }

    async fn mobile_number(&self, user: &UserUuid) -> Result<Option<String>, DirectoryError> {
        Ok(self.profile(user)?.mobile_number)
    }

    async fn main_line_context(&self, user: &UserUuid) -> Result<String, DirectoryError> {
        let profile = self.profile(user)?;
        match profile.lines.keys().next() {
            Some(_) => Ok(profile.context),
            None => Err(DirectoryError::InvalidUserLine {
                user: user.clone(),
                line_id: 0,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> InMemoryUserDirectory {
        let directory = InMemoryUserDirectory::new();
        directory.insert(
            UserUuid::new("alice"),
            UserProfile {
                lines: BTreeMap::from([(1, "pjsip/alice-desk".to_string())]),
                mobile_number: Some("5551234".to_string()),
                context: "default".to_string(),
            },
        );
        directory.insert(UserUuid::new("ghost"), UserProfile::default());
        directory
    }

    #[tokio::test]
    async fn test_line_interface() {
        let directory = directory();
        let alice = UserUuid::new("alice");

        assert_eq!(
            directory.line_interface(&alice, 1).await.unwrap(),
            "pjsip/alice-desk"
        );
        assert_eq!(
            directory.line_interface(&alice, 2).await,
            Err(DirectoryError::InvalidUserLine {
                user: alice.clone(),
                line_id: 2
            })
        );
        assert_eq!(
            directory.line_interface(&UserUuid::new("bob"), 1).await,
            Err(DirectoryError::InvalidUserUuid(UserUuid::new("bob")))
        );
    }

    #[tokio::test]
    async fn test_main_line_context_requires_a_line() {
        let directory = directory();
        assert_eq!(
            directory
                .main_line_context(&UserUuid::new("alice"))
                .await
                .unwrap(),
            "default"
        );
        assert!(directory
            .main_line_context(&UserUuid::new("ghost"))
            .await
            .is_err());
        assert_eq!(
            directory.mobile_number(&UserUuid::new("ghost")).await,
            Ok(None)
        );
    }
}
