use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A signed-in account on a remote server.
///
/// Two accounts are the same when they point at the same server with the same
/// login; the optional display name does not take part in identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub server: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Account {
    pub fn new(server: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            server: server.into().trim_end_matches('/').to_string(),
            email: email.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.server == other.server && self.email == other.email
    }
}

impl Eq for Account {}

impl Hash for Account {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.server.hash(state);
        self.email.hash(state);
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.email, self.server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn identity_ignores_display_name_and_trailing_slash() {
        let a = Account::new("https://cloud.example.com/", "alice@example.com").with_name("Alice");
        let b = Account::new("https://cloud.example.com", "alice@example.com");
        assert_eq!(a, b);

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn different_login_is_a_different_account() {
        let a = Account::new("https://cloud.example.com", "alice@example.com");
        let b = Account::new("https://cloud.example.com", "bob@example.com");
        assert_ne!(a, b);
    }
}
