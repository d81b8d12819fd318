use serde::{Deserialize, Serialize};

/// A saved post or comment. `permalink` is the natural key per user; the vote
/// counters and text fields are volatile and refreshed on re-ingestion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedPost {
    pub name: String,
    pub permalink: String,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub link_title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub num_comments: i64,
    #[serde(default)]
    pub upvote_ratio: f64,
    #[serde(default)]
    pub ups: i64,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub total_awards_received: i64,
    #[serde(default)]
    pub suggested_sort: Option<String>,
    #[serde(default)]
    pub created_utc: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPost {
    pub id: i64,
    #[serde(flatten)]
    pub post: SavedPost,
}
