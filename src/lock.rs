//! HA lock handle contract and the leader-loss notification.
//!
//! A handle moves `idle -> attempting -> held -> idle`. `lock` blocks until
//! the lock is acquired or `stop` fires; on success it hands back a
//! [`LeaderLost`] signal that completes once leadership is gone.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Notification returned by a successful [`Lock::lock`].
///
/// Completion means leadership was lost, either through `unlock`, expiry of
/// the lock record, or another holder taking the key.
#[derive(Debug, Clone)]
pub struct LeaderLost {
    token: CancellationToken,
}

impl LeaderLost {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Wait until leadership is lost.
    pub async fn lost(&self) {
        self.token.cancelled().await
    }

    pub fn is_lost(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A distributed leader lock.
#[async_trait]
pub trait Lock: Send + Sync {
    /// Block trying to acquire the lock.
    ///
    /// Returns `Ok(None)` if `stop` fires first.
    async fn lock(&self, stop: CancellationToken) -> Result<Option<LeaderLost>>;

    /// Release the lock if held. Idempotent.
    async fn unlock(&self) -> Result<()>;

    /// Observe current ownership without acquiring: `(held, holder)`.
    async fn value(&self) -> Result<(bool, String)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_leader_lost_completes_on_cancel() {
        let token = CancellationToken::new();
        let lost = LeaderLost::new(token.clone());
        assert!(!lost.is_lost());

        token.cancel();
        lost.lost().await;
        assert!(lost.is_lost());
    }
}
