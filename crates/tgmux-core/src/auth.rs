//! User allow-list.

use std::collections::HashSet;

/// Checks incoming Telegram user ids against the configured allow-list.
#[derive(Debug, Clone)]
pub struct AuthChecker {
    allowed: HashSet<i64>,
}

impl AuthChecker {
    #[must_use]
    pub fn new(user_ids: &[i64]) -> Self {
        Self {
            allowed: user_ids.iter().copied().collect(),
        }
    }

    /// True iff `user_id` may interact with the bot.
    #[must_use]
    pub fn is_allowed(&self, user_id: i64) -> bool {
        self.allowed.contains(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_only_listed_users() {
        let auth = AuthChecker::new(&[1, 2]);
        assert!(auth.is_allowed(1));
        assert!(auth.is_allowed(2));
        assert!(!auth.is_allowed(3));
        assert!(!auth.is_allowed(0));
    }
}
