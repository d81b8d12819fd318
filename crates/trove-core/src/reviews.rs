//! Review listing cards and the query window used to browse them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_QUERY_YEAR: i32 = 1900;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Medium {
    Tv,
    Movie,
    Pc,
    Switch,
}

impl Medium {
    pub const ALL: [Medium; 4] = [Medium::Tv, Medium::Pc, Medium::Switch, Medium::Movie];

    pub fn as_str(&self) -> &'static str {
        match self {
            Medium::Tv => "tv",
            Medium::Movie => "movie",
            Medium::Pc => "pc",
            Medium::Switch => "switch",
        }
    }

    /// Browse path segment. Game platforms live under `game/`.
    pub fn path(&self) -> &'static str {
        match self {
            Medium::Tv => "tv",
            Medium::Movie => "movie",
            Medium::Pc => "game/pc",
            Medium::Switch => "game/nintendo-switch",
        }
    }
}

impl fmt::Display for Medium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown medium `{0}`")]
pub struct UnknownMedium(pub String);

impl FromStr for Medium {
    type Err = UnknownMedium;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Medium::ALL
            .into_iter()
            .find(|m| m.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| UnknownMedium(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewCard {
    pub title: String,
    pub href: String,
    pub score: i64,
    pub description: String,
    pub release_date: DateTime<Utc>,
    pub medium: Medium,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredReview {
    pub id: i64,
    #[serde(flatten)]
    pub card: ReviewCard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewAction {
    Saved,
}

impl ReviewAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewAction::Saved => "saved",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewQuery {
    pub medium: Medium,
    pub min_year: i32,
    pub max_year: i32,
    #[serde(default)]
    pub page: Option<u32>,
}

impl ReviewQuery {
    pub fn single_year(medium: Medium, year: i32, page: u32) -> Self {
        Self {
            medium,
            min_year: year,
            max_year: year,
            page: Some(page),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.min_year >= MIN_QUERY_YEAR
            && self.max_year >= MIN_QUERY_YEAR
            && self.min_year <= self.max_year
    }

    /// January 1st of `min_year` through the last second of `max_year`, UTC.
    pub fn range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let lower = Utc.with_ymd_and_hms(self.min_year, 1, 1, 0, 0, 0).single()?;
        let upper = Utc
            .with_ymd_and_hms(self.max_year.checked_add(1)?, 1, 1, 0, 0, 0)
            .single()?
            - Duration::seconds(1);
        Some((lower, upper))
    }
}
