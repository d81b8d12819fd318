//! Idempotent relational store + HTTP transport utilities for trove.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use trove_core::{
    AccessToken, ArtistListens, ListenEvent, PlayHistory, Provider, ReviewAction, ReviewCard,
    ReviewQuery, SavedPost, StoredPost, StoredReview, TrackListens, UserId,
};
use uuid::Uuid;

pub mod http;
mod leases;
mod listens;
mod posts;
mod reviews;
mod tokens;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpTransport, ProviderPolicy, RateLimit, RetryDisposition, TokenBucket, TransportConfig,
};

pub const CRATE_NAME: &str = "trove-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("encoding column value: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("no artist provided for track {track_id}")]
    NoArtist { track_id: String },
    #[error("invalid review query {0:?}")]
    InvalidQuery(ReviewQuery),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait PostStore: Send + Sync {
    /// Upserts by (user, permalink). Returns the id of every row written,
    /// including rows whose volatile fields were refreshed in place.
    async fn persist_posts(&self, user_id: UserId, posts: &[SavedPost]) -> Result<Vec<i64>, StoreError>;
    async fn all_posts(&self, user_id: UserId) -> Result<Vec<StoredPost>, StoreError>;
    async fn subreddits(&self, user_id: UserId) -> Result<Vec<String>, StoreError>;
    async fn posts_for(&self, user_id: UserId, subreddit: &str) -> Result<Vec<StoredPost>, StoreError>;
}

#[async_trait]
pub trait ListenStore: Send + Sync {
    /// Records plays, returning the track id of each newly recorded play.
    async fn persist_plays(&self, user_id: UserId, plays: &[PlayHistory]) -> Result<Vec<String>, StoreError>;
    async fn recently_played(
        &self,
        user_id: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ListenEvent>, StoreError>;
    async fn listens_by_artist(
        &self,
        user_id: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ArtistListens>, StoreError>;
    async fn tracks_for_artist(
        &self,
        user_id: UserId,
        artist: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TrackListens>, StoreError>;
}

#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// Inserts new cards; cards already stored for the user are skipped.
    async fn persist_reviews(
        &self,
        user_id: UserId,
        cards: &[ReviewCard],
        requested_at: DateTime<Utc>,
    ) -> Result<Vec<i64>, StoreError>;
    async fn reviews(&self, user_id: UserId, query: &ReviewQuery) -> Result<Vec<StoredReview>, StoreError>;
    async fn mark_reviews(&self, user_id: UserId, ids: &[i64], action: ReviewAction) -> Result<u64, StoreError>;
    async fn marked_reviews(&self, user_id: UserId, action: ReviewAction) -> Result<Vec<StoredReview>, StoreError>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load_token(&self, user_id: UserId, provider: Provider) -> Result<Option<AccessToken>, StoreError>;
    async fn save_token(&self, user_id: UserId, provider: Provider, token: &AccessToken) -> Result<(), StoreError>;
}

/// Per (user, provider) lease guarding long-running backfills.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn try_acquire(
        &self,
        user_id: UserId,
        provider: Provider,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
    async fn release(&self, user_id: UserId, provider: Provider, holder: Uuid) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database with migrations applied.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Returns the id for `username`, creating the user on first sight.
    pub async fn register_user(&self, username: &str) -> Result<UserId, StoreError> {
        let id: UserId = sqlx::query_scalar(
            r#"
            INSERT INTO users (username, created_at)
            VALUES (?, ?)
            ON CONFLICT (username) DO UPDATE SET username = excluded.username
            RETURNING id
            "#,
        )
        .bind(username)
        .bind(Utc::now().timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn user_ids(&self) -> Result<Vec<UserId>, StoreError> {
        Ok(sqlx::query_scalar("SELECT id FROM users ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {ms}ms out of range")))
}

pub(crate) fn from_secs(secs: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {secs}s out of range")))
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn register_user_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let first = db.register_user("mira").await.unwrap();
        let again = db.register_user("mira").await.unwrap();
        let other = db.register_user("ana").await.unwrap();
        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(db.user_ids().await.unwrap(), vec![first, other]);
    }

    #[tokio::test]
    async fn file_backed_database_survives_reconnect() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("trove.db").display());

        let db = Database::connect(&url).await.unwrap();
        db.migrate().await.unwrap();
        let id = db.register_user("mira").await.unwrap();
        db.pool().close().await;

        let reopened = Database::connect(&url).await.unwrap();
        reopened.migrate().await.unwrap();
        assert_eq!(reopened.user_ids().await.unwrap(), vec![id]);
    }
}
