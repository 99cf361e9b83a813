//! Follower lookup seam.
//!
//! Presence fan-out needs "who follows this user" and nothing else, so
//! the directory stays an opaque async lookup backed elsewhere: the
//! social graph service in production, fixture data in tests.

use std::collections::HashMap;

use async_trait::async_trait;

/// Source of follower relationships.
#[async_trait]
pub trait FollowerDirectory: Send + Sync {
    /// Users following `user_id`, capped at `limit`.
    async fn followers_of(&self, user_id: &str, limit: usize) -> anyhow::Result<Vec<String>>;
}

/// Fixed in-memory directory for tests and standalone deployments.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    followers: HashMap<String, Vec<String>>,
}

impl StaticDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `follower` follows `user`.
    #[must_use]
    pub fn with_follower(mut self, user: impl Into<String>, follower: impl Into<String>) -> Self {
        self.followers
            .entry(user.into())
            .or_default()
            .push(follower.into());
        self
    }
}

#[async_trait]
impl FollowerDirectory for StaticDirectory {
    async fn followers_of(&self, user_id: &str, limit: usize) -> anyhow::Result<Vec<String>> {
        Ok(self
            .followers
            .get(user_id)
            .map(|f| f.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

/// Directory that knows no one. Presence transitions then reach only
/// the read surfaces, which suits single-tenant deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFollowers;

#[async_trait]
impl FollowerDirectory for NoFollowers {
    async fn followers_of(&self, _user_id: &str, _limit: usize) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}
