use async_trait::async_trait;
use tracing::error;
use trove_core::{SavedPost, StoredPost, UserId};

use crate::{Database, PostStore, StoreError};

const UPSERT_POST: &str = r#"
    INSERT INTO saved_posts
        (user_id, name, permalink, subreddit, title, link_title, body, num_comments,
         upvote_ratio, ups, score, total_awards_received, suggested_sort, created_utc)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (user_id, permalink) DO UPDATE SET
        ups = excluded.ups,
        score = excluded.score,
        upvote_ratio = excluded.upvote_ratio,
        num_comments = excluded.num_comments,
        total_awards_received = excluded.total_awards_received,
        link_title = excluded.link_title,
        body = excluded.body
    RETURNING id
"#;

const SELECT_POSTS: &str = r#"
    SELECT id, name, permalink, subreddit, title, link_title, body, num_comments,
           upvote_ratio, ups, score, total_awards_received, suggested_sort, created_utc
      FROM saved_posts
"#;

#[derive(Debug, sqlx::FromRow)]
struct PostRow {
    id: i64,
    name: String,
    permalink: String,
    subreddit: String,
    title: String,
    link_title: String,
    body: String,
    num_comments: i64,
    upvote_ratio: f64,
    ups: i64,
    score: i64,
    total_awards_received: i64,
    suggested_sort: Option<String>,
    created_utc: f64,
}

impl From<PostRow> for StoredPost {
    fn from(row: PostRow) -> Self {
        StoredPost {
            id: row.id,
            post: SavedPost {
                name: row.name,
                permalink: row.permalink,
                subreddit: row.subreddit,
                title: row.title,
                link_title: row.link_title,
                body: row.body,
                num_comments: row.num_comments,
                upvote_ratio: row.upvote_ratio,
                ups: row.ups,
                score: row.score,
                total_awards_received: row.total_awards_received,
                suggested_sort: row.suggested_sort,
                created_utc: row.created_utc,
            },
        }
    }
}

#[async_trait]
impl PostStore for Database {
    async fn persist_posts(&self, user_id: UserId, posts: &[SavedPost]) -> Result<Vec<i64>, StoreError> {
        let mut tx = self.pool().begin().await?;
        let mut ids = Vec::with_capacity(posts.len());
        for post in posts {
            let id: i64 = sqlx::query_scalar(UPSERT_POST)
                .bind(user_id)
                .bind(&post.name)
                .bind(&post.permalink)
                .bind(&post.subreddit)
                .bind(&post.title)
                .bind(&post.link_title)
                .bind(&post.body)
                .bind(post.num_comments)
                .bind(post.upvote_ratio)
                .bind(post.ups)
                .bind(post.score)
                .bind(post.total_awards_received)
                .bind(&post.suggested_sort)
                .bind(post.created_utc)
                .fetch_one(&mut *tx)
                .await
                .inspect_err(|err| {
                    error!(user_id, permalink = %post.permalink, error = %err, "persisting saved post failed")
                })?;
            ids.push(id);
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn all_posts(&self, user_id: UserId) -> Result<Vec<StoredPost>, StoreError> {
        let rows: Vec<PostRow> = sqlx::query_as(&format!(
            "{SELECT_POSTS} WHERE user_id = ? ORDER BY created_utc DESC LIMIT 100"
        ))
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(StoredPost::from).collect())
    }

    async fn subreddits(&self, user_id: UserId) -> Result<Vec<String>, StoreError> {
        Ok(sqlx::query_scalar(
            "SELECT DISTINCT subreddit FROM saved_posts WHERE user_id = ? ORDER BY subreddit ASC",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?)
    }

    async fn posts_for(&self, user_id: UserId, subreddit: &str) -> Result<Vec<StoredPost>, StoreError> {
        let rows: Vec<PostRow> = sqlx::query_as(&format!(
            "{SELECT_POSTS} WHERE user_id = ? AND subreddit = ? ORDER BY created_utc DESC"
        ))
        .bind(user_id)
        .bind(subreddit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(StoredPost::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{count, db_with_user};

    fn post(name: &str, subreddit: &str, created_utc: f64) -> SavedPost {
        SavedPost {
            name: name.to_string(),
            permalink: format!("/r/{subreddit}/comments/{name}/"),
            subreddit: subreddit.to_string(),
            title: format!("title {name}"),
            link_title: String::new(),
            body: String::new(),
            num_comments: 3,
            upvote_ratio: 0.9,
            ups: 10,
            score: 10,
            total_awards_received: 0,
            suggested_sort: None,
            created_utc,
        }
    }

    #[tokio::test]
    async fn re_ingesting_a_post_reaffirms_its_id_and_refreshes_votes() {
        let (db, user) = db_with_user().await;
        let first = db.persist_posts(user, &[post("t3_a", "rust", 1.0)]).await.unwrap();

        let mut again = post("t3_a", "rust", 1.0);
        again.ups = 99;
        again.score = 98;
        let second = db.persist_posts(user, &[again]).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(count(&db, "saved_posts").await, 1);
        let stored = db.all_posts(user).await.unwrap();
        assert_eq!(stored[0].post.ups, 99);
        assert_eq!(stored[0].post.score, 98);
    }

    #[tokio::test]
    async fn batch_with_unknown_user_commits_nothing() {
        let (db, _) = db_with_user().await;
        let err = db
            .persist_posts(9999, &[post("t3_a", "rust", 1.0), post("t3_b", "rust", 2.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Sqlx(_)));
        assert_eq!(count(&db, "saved_posts").await, 0);
    }

    #[tokio::test]
    async fn failure_mid_batch_rolls_back_the_items_before_it() {
        let (db, user) = db_with_user().await;
        db.persist_posts(user, &[post("t3_old", "rust", 0.5)]).await.unwrap();
        sqlx::query(
            r#"
            CREATE TRIGGER reject_post BEFORE INSERT ON saved_posts
            WHEN NEW.name = 't3_bad'
            BEGIN SELECT RAISE(ABORT, 'rejected post'); END
            "#,
        )
        .execute(db.pool())
        .await
        .unwrap();

        let batch = [
            post("t3_a", "rust", 1.0),
            post("t3_b", "rust", 2.0),
            post("t3_bad", "rust", 3.0),
            post("t3_c", "rust", 4.0),
            post("t3_d", "rust", 5.0),
        ];
        let err = db.persist_posts(user, &batch).await.unwrap_err();

        assert!(matches!(err, StoreError::Sqlx(_)));
        let names: Vec<_> = db
            .all_posts(user)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.post.name)
            .collect();
        assert_eq!(names, vec!["t3_old"]);
    }

    #[tokio::test]
    async fn reads_are_scoped_and_ordered() {
        let (db, user) = db_with_user().await;
        let other = db.register_user("someone-else").await.unwrap();
        db.persist_posts(
            user,
            &[post("t3_a", "rust", 1.0), post("t3_b", "golang", 3.0), post("t3_c", "rust", 2.0)],
        )
        .await
        .unwrap();
        db.persist_posts(other, &[post("t3_z", "zig", 5.0)]).await.unwrap();

        let names: Vec<_> = db
            .all_posts(user)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.post.name)
            .collect();
        assert_eq!(names, vec!["t3_b", "t3_c", "t3_a"]);
        assert_eq!(db.subreddits(user).await.unwrap(), vec!["golang", "rust"]);
        assert_eq!(db.posts_for(user, "rust").await.unwrap().len(), 2);
        assert!(db.posts_for(user, "zig").await.unwrap().is_empty());
    }
}
