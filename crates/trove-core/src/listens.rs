//! Listen-history payloads and the read models built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayHistory {
    pub played_at: DateTime<Utc>,
    #[serde(default)]
    pub context: Option<PlayContext>,
    pub track: Track,
}

impl PlayHistory {
    /// First credited artist; plays without one cannot be normalised.
    pub fn primary_artist(&self) -> Option<&Artist> {
        self.track.artists.first()
    }

    pub fn context_json(&self) -> serde_json::Result<Option<String>> {
        self.context.as_ref().map(serde_json::to_string).transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayContext {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub external_urls: ExternalUrls,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalUrls {
    #[serde(default)]
    pub spotify: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub explicit: bool,
    #[serde(default)]
    pub popularity: i64,
    pub album: Album,
    #[serde(default)]
    pub artists: Vec<Artist>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub album_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenEvent {
    pub track: String,
    pub played_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistListens {
    pub artist: String,
    pub listens: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackListens {
    pub track: String,
    pub listens: i64,
}
