//! Read-only lookup of known users by email address.

use std::collections::HashMap;
use std::path::Path;

use crate::error::StoreError;
use crate::models::User;

/// Lookup of known users. Implementations are shared read-only across
/// request tasks.
pub trait UserStore: Send + Sync {
    /// Find a user by email address (case-insensitive).
    fn find_user(&self, email: &str) -> Option<User>;

    /// Number of known users.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory user store, loaded once at startup.
#[derive(Debug, Default)]
pub struct StaticUserStore {
    by_email: HashMap<String, User>,
}

impl StaticUserStore {
    pub fn new(users: Vec<User>) -> Self {
        let by_email = users
            .into_iter()
            .map(|user| (user.email.trim().to_lowercase(), user))
            .collect();
        Self { by_email }
    }

    /// Load users from a JSON array file.
    pub fn from_json_file(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path).map_err(|source| StoreError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let users: Vec<User> = serde_json::from_str(&raw).map_err(|source| StoreError::Malformed {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::new(users))
    }
}

impl UserStore for StaticUserStore {
    fn find_user(&self, email: &str) -> Option<User> {
        self.by_email.get(&email.trim().to_lowercase()).cloned()
    }

    fn len(&self) -> usize {
        self.by_email.len()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let store = StaticUserStore::new(vec![User::new("u1", "Alice", "Alice@Example.com")]);

        let user = store.find_user("alice@example.COM").unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(user.name, "Alice");
        assert!(store.find_user("bob@example.com").is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn loads_users_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"id": "u1", "name": "Alice", "email": "alice@example.com"}},
                {{"id": "u2", "name": "Bob", "email": "bob@example.com"}}
            ]"#
        )
        .unwrap();

        let store = StaticUserStore::from_json_file(file.path()).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.find_user("bob@example.com").unwrap().id, "u2");
    }

    #[test]
    fn malformed_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = StaticUserStore::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = StaticUserStore::from_json_file(Path::new("/nonexistent/users.json")).unwrap_err();
        assert!(matches!(err, StoreError::Read { .. }));
    }
}
