use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::error;
use trove_core::{Medium, ReviewAction, ReviewCard, ReviewQuery, StoredReview, UserId};

use crate::{from_secs, Database, ReviewStore, StoreError};

const INSERT_REVIEW: &str = r#"
    INSERT INTO reviews (user_id, title, href, score, description, release_date, medium, requested_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (user_id, title, medium, release_date) DO NOTHING
    RETURNING id
"#;

// The WHERE clause also disambiguates SELECT from the upsert clause in SQLite.
const MARK_REVIEW: &str = r#"
    INSERT INTO review_actions (user_id, review_id, action, created_at)
    SELECT user_id, id, ?, ? FROM reviews WHERE id = ? AND user_id = ?
    ON CONFLICT (user_id, review_id, action) DO NOTHING
"#;

#[derive(Debug, sqlx::FromRow)]
struct ReviewRow {
    id: i64,
    title: String,
    href: String,
    score: i64,
    description: String,
    release_date: i64,
    medium: String,
}

impl TryFrom<ReviewRow> for StoredReview {
    type Error = StoreError;

    fn try_from(row: ReviewRow) -> Result<Self, Self::Error> {
        let medium = Medium::from_str(&row.medium).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(StoredReview {
            id: row.id,
            card: ReviewCard {
                title: row.title,
                href: row.href,
                score: row.score,
                description: row.description,
                release_date: from_secs(row.release_date)?,
                medium,
            },
        })
    }
}

fn into_stored(rows: Vec<ReviewRow>) -> Result<Vec<StoredReview>, StoreError> {
    rows.into_iter().map(StoredReview::try_from).collect()
}

#[async_trait]
impl ReviewStore for Database {
    async fn persist_reviews(
        &self,
        user_id: UserId,
        cards: &[ReviewCard],
        requested_at: DateTime<Utc>,
    ) -> Result<Vec<i64>, StoreError> {
        let mut tx = self.pool().begin().await?;
        let mut ids = Vec::with_capacity(cards.len());
        for card in cards {
            let inserted: Option<i64> = sqlx::query_scalar(INSERT_REVIEW)
                .bind(user_id)
                .bind(&card.title)
                .bind(&card.href)
                .bind(card.score)
                .bind(&card.description)
                .bind(card.release_date.timestamp())
                .bind(card.medium.as_str())
                .bind(requested_at.timestamp())
                .fetch_optional(&mut *tx)
                .await
                .inspect_err(|err| error!(user_id, title = %card.title, error = %err, "persisting review failed"))?;
            ids.extend(inserted);
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn reviews(&self, user_id: UserId, query: &ReviewQuery) -> Result<Vec<StoredReview>, StoreError> {
        let (lower, upper) = query
            .is_valid()
            .then(|| query.range())
            .flatten()
            .ok_or(StoreError::InvalidQuery(*query))?;
        let rows: Vec<ReviewRow> = sqlx::query_as(
            r#"
            SELECT id, title, href, score, description, release_date, medium
              FROM reviews
             WHERE user_id = ? AND medium = ? AND release_date BETWEEN ? AND ?
             ORDER BY score DESC, title ASC
            "#,
        )
        .bind(user_id)
        .bind(query.medium.as_str())
        .bind(lower.timestamp())
        .bind(upper.timestamp())
        .fetch_all(self.pool())
        .await?;
        into_stored(rows)
    }

    async fn mark_reviews(&self, user_id: UserId, ids: &[i64], action: ReviewAction) -> Result<u64, StoreError> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool().begin().await?;
        let mut marked = 0;
        for id in ids {
            marked += sqlx::query(MARK_REVIEW)
                .bind(action.as_str())
                .bind(now)
                .bind(id)
                .bind(user_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(marked)
    }

    async fn marked_reviews(&self, user_id: UserId, action: ReviewAction) -> Result<Vec<StoredReview>, StoreError> {
        let rows: Vec<ReviewRow> = sqlx::query_as(
            r#"
            SELECT r.id, r.title, r.href, r.score, r.description, r.release_date, r.medium
              FROM review_actions ra
              JOIN reviews r ON r.id = ra.review_id
             WHERE ra.user_id = ? AND ra.action = ?
             ORDER BY ra.created_at DESC, r.id DESC
            "#,
        )
        .bind(user_id)
        .bind(action.as_str())
        .fetch_all(self.pool())
        .await?;
        into_stored(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{count, db_with_user};
    use chrono::TimeZone;

    fn card(title: &str, score: i64, year: i32) -> ReviewCard {
        ReviewCard {
            title: title.into(),
            href: format!("/movie/{}/", title.to_lowercase().replace(' ', "-")),
            score,
            description: String::new(),
            release_date: Utc.with_ymd_and_hms(year, 6, 1, 0, 0, 0).unwrap(),
            medium: Medium::Movie,
        }
    }

    #[tokio::test]
    async fn duplicate_cards_are_skipped_not_reinserted() {
        let (db, user) = db_with_user().await;
        let cards = vec![card("Heat", 76, 1995), card("Alien", 89, 1979)];

        let first = db.persist_reviews(user, &cards, Utc::now()).await.unwrap();
        let second = db.persist_reviews(user, &cards, Utc::now()).await.unwrap();

        assert_eq!(first.len(), 2);
        assert!(second.is_empty());
        assert_eq!(count(&db, "reviews").await, 2);
    }

    #[tokio::test]
    async fn invalid_third_card_leaves_batch_uncommitted() {
        let (db, user) = db_with_user().await;
        let cards = vec![
            card("A", 50, 2020),
            card("B", 60, 2020),
            card("C", 150, 2020),
            card("D", 70, 2020),
            card("E", 80, 2020),
        ];

        assert!(db.persist_reviews(user, &cards, Utc::now()).await.is_err());
        assert_eq!(count(&db, "reviews").await, 0);
    }

    #[tokio::test]
    async fn query_filters_by_medium_and_year_range_best_first() {
        let (db, user) = db_with_user().await;
        let mut tv = card("Lost", 90, 2021);
        tv.medium = Medium::Tv;
        db.persist_reviews(
            user,
            &[card("Old", 99, 1999), card("Mid", 60, 2021), card("Top", 95, 2022), tv],
            Utc::now(),
        )
        .await
        .unwrap();

        let query = ReviewQuery { medium: Medium::Movie, min_year: 2021, max_year: 2022, page: None };
        let titles: Vec<_> = db
            .reviews(user, &query)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.card.title)
            .collect();
        assert_eq!(titles, vec!["Top", "Mid"]);

        let inverted = ReviewQuery { min_year: 2023, ..query };
        assert!(matches!(db.reviews(user, &inverted).await, Err(StoreError::InvalidQuery(_))));
    }

    #[tokio::test]
    async fn marking_is_idempotent_and_scoped_to_owner() {
        let (db, user) = db_with_user().await;
        let other = db.register_user("someone-else").await.unwrap();
        let ids = db.persist_reviews(user, &[card("Heat", 76, 1995)], Utc::now()).await.unwrap();

        assert_eq!(db.mark_reviews(user, &ids, ReviewAction::Saved).await.unwrap(), 1);
        assert_eq!(db.mark_reviews(user, &ids, ReviewAction::Saved).await.unwrap(), 0);
        assert_eq!(db.mark_reviews(other, &ids, ReviewAction::Saved).await.unwrap(), 0);

        let saved = db.marked_reviews(user, ReviewAction::Saved).await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].card.title, "Heat");
    }
}
