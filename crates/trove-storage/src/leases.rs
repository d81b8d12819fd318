use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use trove_core::{Provider, UserId};
use uuid::Uuid;

use crate::{Database, LeaseStore, StoreError};

// An existing lease is only taken over once it has expired.
const ACQUIRE_LEASE: &str = r#"
    INSERT INTO backfill_leases (user_id, provider, holder, acquired_at, expires_at)
    VALUES (?, ?, ?, ?, ?)
    ON CONFLICT (user_id, provider) DO UPDATE SET
        holder = excluded.holder,
        acquired_at = excluded.acquired_at,
        expires_at = excluded.expires_at
    WHERE backfill_leases.expires_at <= excluded.acquired_at
    RETURNING holder
"#;

#[async_trait]
impl LeaseStore for Database {
    async fn try_acquire(
        &self,
        user_id: UserId,
        provider: Provider,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().timestamp();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let holder = holder.to_string();
        let granted: Option<String> = sqlx::query_scalar(ACQUIRE_LEASE)
            .bind(user_id)
            .bind(provider.as_str())
            .bind(&holder)
            .bind(now)
            .bind(now.saturating_add(ttl_secs))
            .fetch_optional(self.pool())
            .await?;
        Ok(granted.as_deref() == Some(holder.as_str()))
    }

    async fn release(&self, user_id: UserId, provider: Provider, holder: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM backfill_leases WHERE user_id = ? AND provider = ? AND holder = ?")
            .bind(user_id)
            .bind(provider.as_str())
            .bind(holder.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::db_with_user;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn second_holder_is_rejected_until_release() {
        let (db, user) = db_with_user().await;
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(db.try_acquire(user, Provider::Spotify, first, HOUR).await.unwrap());
        assert!(!db.try_acquire(user, Provider::Spotify, second, HOUR).await.unwrap());
        assert!(db.try_acquire(user, Provider::Reddit, second, HOUR).await.unwrap());

        db.release(user, Provider::Spotify, second).await.unwrap();
        assert!(!db.try_acquire(user, Provider::Spotify, second, HOUR).await.unwrap());

        db.release(user, Provider::Spotify, first).await.unwrap();
        assert!(db.try_acquire(user, Provider::Spotify, second, HOUR).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let (db, user) = db_with_user().await;
        assert!(db.try_acquire(user, Provider::Metacritic, Uuid::new_v4(), Duration::ZERO).await.unwrap());
        assert!(db.try_acquire(user, Provider::Metacritic, Uuid::new_v4(), HOUR).await.unwrap());
    }
}
