//! Core domain model for trove: providers, tokens, activity items and jobs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod listens;
pub mod posts;
pub mod reviews;
pub mod token;

pub use listens::{
    Album, Artist, ArtistListens, ExternalUrls, ListenEvent, PlayContext, PlayHistory, Track,
    TrackListens,
};
pub use posts::{SavedPost, StoredPost};
pub use reviews::{Medium, ReviewAction, ReviewCard, ReviewQuery, StoredReview};
pub use token::{AccessToken, TokenGrant, DEFAULT_SAFETY_MARGIN_SECS};

pub const CRATE_NAME: &str = "trove-core";

/// Opaque user identifier supplied by the authenticating layer.
pub type UserId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Reddit,
    Spotify,
    Metacritic,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Reddit, Provider::Spotify, Provider::Metacritic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Reddit => "reddit",
            Provider::Spotify => "spotify",
            Provider::Metacritic => "metacritic",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown provider `{0}`")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownProvider(s.to_string()))
    }
}

/// One page of provider results. An empty `next_cursor` means no more pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: String,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next_cursor: impl Into<String>) -> Self {
        Self {
            items,
            next_cursor: next_cursor.into(),
        }
    }

    pub fn last(items: Vec<T>) -> Self {
        Self::new(items, String::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum JobMode {
    Refresh,
    Backfill {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl JobMode {
    pub fn label(&self) -> &'static str {
        match self {
            JobMode::Refresh => "refresh",
            JobMode::Backfill { .. } => "backfill",
        }
    }
}

/// In-memory description of a single synchronization run. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub run_id: Uuid,
    pub provider: Provider,
    pub user_id: UserId,
    pub mode: JobMode,
}

impl Job {
    pub fn refresh(provider: Provider, user_id: UserId) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            provider,
            user_id,
            mode: JobMode::Refresh,
        }
    }

    pub fn backfill(
        provider: Provider,
        user_id: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            provider,
            user_id,
            mode: JobMode::Backfill { start, end },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed,
    TimedOut,
}

/// Message reported to the publisher when a job finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub run_id: Uuid,
    pub provider: Provider,
    pub user_id: UserId,
    pub mode: String,
    pub status: JobStatus,
    pub num_persisted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn succeeded(job: &Job, num_persisted: usize) -> Self {
        Self {
            run_id: job.run_id,
            provider: job.provider,
            user_id: job.user_id,
            mode: job.mode.label().to_string(),
            status: JobStatus::Succeeded,
            num_persisted,
            error: None,
        }
    }

    pub fn failed(job: &Job, num_persisted: usize, status: JobStatus, error: impl fmt::Display) -> Self {
        Self {
            status,
            error: Some(error.to_string()),
            ..Self::succeeded(job, num_persisted)
        }
    }
}
