//! Room-creation quotas
//!
//! Anonymous devices may create a limited number of rooms per UTC day.
//! Accounts are not limited.

use async_trait::async_trait;
use roomdrop_core::{RelayError, Tier};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::now_millis;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Prune stale days once the table grows past this
const MAX_TRACKED_FINGERPRINTS: usize = 10_000;

/// Decides whether a client may create another room
#[async_trait]
pub trait RoomQuota: Send + Sync {
    /// Count one room against the quota. Returns the rooms left today.
    async fn try_acquire(&self, fingerprint: &str, tier: Tier) -> Result<u32, RelayError>;
}

/// No limits at all
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedQuota;

#[async_trait]
impl RoomQuota for UnlimitedQuota {
    async fn try_acquire(&self, _fingerprint: &str, _tier: Tier) -> Result<u32, RelayError> {
        Ok(u32::MAX)
    }
}

struct DailyUsage {
    day: u64,
    count: u32,
}

/// In-memory per-fingerprint daily counter for anonymous clients
pub struct DailyRoomQuota {
    limit: u32,
    usage: Mutex<HashMap<String, DailyUsage>>,
}

impl DailyRoomQuota {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            usage: Mutex::new(HashMap::new()),
        }
    }

    /// Quota check against an explicit clock
    pub async fn try_acquire_at(
        &self,
        fingerprint: &str,
        tier: Tier,
        now_ms: u64,
    ) -> Result<u32, RelayError> {
        if tier != Tier::Anonymous {
            return Ok(u32::MAX);
        }

        let day = now_ms / DAY_MS;
        let mut usage = self.usage.lock().await;
        if usage.len() > MAX_TRACKED_FINGERPRINTS {
            usage.retain(|_, u| u.day == day);
        }

        let entry = usage
            .entry(fingerprint.to_string())
            .or_insert(DailyUsage { day, count: 0 });
        if entry.day != day {
            entry.day = day;
            entry.count = 0;
        }

        if entry.count >= self.limit {
            debug!("Room quota exhausted for {}", fingerprint);
            return Err(RelayError::LimitReached {
                remaining: 0,
                reset_time: (day + 1) * DAY_MS,
            });
        }
        entry.count += 1;
        Ok(self.limit - entry.count)
    }
}

#[async_trait]
impl RoomQuota for DailyRoomQuota {
    async fn try_acquire(&self, fingerprint: &str, tier: Tier) -> Result<u32, RelayError> {
        self.try_acquire_at(fingerprint, tier, now_millis()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOON: u64 = 19_000 * DAY_MS + DAY_MS / 2;

    #[tokio::test]
    async fn test_anonymous_limit_and_reset_time() {
        let quota = DailyRoomQuota::new(2);
        assert_eq!(quota.try_acquire_at("dev-a", Tier::Anonymous, NOON).await, Ok(1));
        assert_eq!(quota.try_acquire_at("dev-a", Tier::Anonymous, NOON).await, Ok(0));
        assert_eq!(
            quota.try_acquire_at("dev-a", Tier::Anonymous, NOON).await,
            Err(RelayError::LimitReached {
                remaining: 0,
                reset_time: 19_001 * DAY_MS,
            })
        );

        // Other devices have their own budget
        assert_eq!(quota.try_acquire_at("dev-b", Tier::Anonymous, NOON).await, Ok(1));
    }

    #[tokio::test]
    async fn test_resets_next_day() {
        let quota = DailyRoomQuota::new(1);
        assert!(quota.try_acquire_at("dev", Tier::Anonymous, NOON).await.is_ok());
        assert!(quota.try_acquire_at("dev", Tier::Anonymous, NOON).await.is_err());
        assert!(quota
            .try_acquire_at("dev", Tier::Anonymous, NOON + DAY_MS)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_accounts_unlimited() {
        let quota = DailyRoomQuota::new(0);
        assert!(quota.try_acquire_at("dev", Tier::Authenticated, NOON).await.is_ok());
        assert!(quota.try_acquire_at("dev", Tier::Premium, NOON).await.is_ok());
        assert!(quota.try_acquire_at("dev", Tier::Anonymous, NOON).await.is_err());
        assert_eq!(UnlimitedQuota.try_acquire("dev", Tier::Anonymous).await, Ok(u32::MAX));
    }
}
