//! Normalised listen history: albums, tracks, artists and the credit junction
//! are upserted conflict-tolerantly before each play is recorded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};
use tracing::error;
use trove_core::{ArtistListens, ListenEvent, PlayHistory, TrackListens, UserId};

use crate::{from_millis, Database, ListenStore, StoreError};

const UPSERT_ALBUM: &str = r#"
    INSERT INTO albums (id, name, href, uri, album_type)
    VALUES (?, ?, ?, ?, ?)
    ON CONFLICT (id) DO NOTHING
"#;

const UPSERT_TRACK: &str = r#"
    INSERT INTO tracks (id, name, href, uri, duration_ms, explicit, popularity, album_id)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (id) DO NOTHING
"#;

const UPSERT_ARTIST: &str = r#"
    INSERT INTO artists (id, name, href, uri)
    VALUES (?, ?, ?, ?)
    ON CONFLICT (id) DO NOTHING
"#;

const UPSERT_CREDIT: &str = r#"
    INSERT INTO track_artists (track_id, artist_id, position)
    VALUES (?, ?, ?)
    ON CONFLICT (track_id, artist_id) DO NOTHING
"#;

const INSERT_PLAY: &str = r#"
    INSERT INTO plays (user_id, track_id, played_at, context)
    VALUES (?, ?, ?, ?)
    ON CONFLICT (user_id, track_id, played_at) DO NOTHING
    RETURNING track_id
"#;

#[derive(Debug, sqlx::FromRow)]
struct PlayRow {
    track: String,
    played_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CountRow {
    name: String,
    listens: i64,
}

async fn record_play(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: UserId,
    play: &PlayHistory,
) -> Result<Option<String>, StoreError> {
    if play.primary_artist().is_none() {
        return Err(StoreError::NoArtist {
            track_id: play.track.id.clone(),
        });
    }
    let track = &play.track;
    let album = &track.album;

    sqlx::query(UPSERT_ALBUM)
        .bind(&album.id)
        .bind(&album.name)
        .bind(&album.href)
        .bind(&album.uri)
        .bind(&album.album_type)
        .execute(&mut **tx)
        .await?;

    sqlx::query(UPSERT_TRACK)
        .bind(&track.id)
        .bind(&track.name)
        .bind(&track.href)
        .bind(&track.uri)
        .bind(track.duration_ms)
        .bind(track.explicit)
        .bind(track.popularity)
        .bind(&album.id)
        .execute(&mut **tx)
        .await?;

    for (position, artist) in track.artists.iter().enumerate() {
        sqlx::query(UPSERT_ARTIST)
            .bind(&artist.id)
            .bind(&artist.name)
            .bind(&artist.href)
            .bind(&artist.uri)
            .execute(&mut **tx)
            .await?;
        sqlx::query(UPSERT_CREDIT)
            .bind(&track.id)
            .bind(&artist.id)
            .bind(position as i64)
            .execute(&mut **tx)
            .await?;
    }

    let recorded = sqlx::query_scalar(INSERT_PLAY)
        .bind(user_id)
        .bind(&track.id)
        .bind(play.played_at.timestamp_millis())
        .bind(play.context_json()?)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(recorded)
}

fn counts<T>(rows: Vec<CountRow>, build: impl Fn(String, i64) -> T) -> Vec<T> {
    rows.into_iter().map(|r| build(r.name, r.listens)).collect()
}

#[async_trait]
impl ListenStore for Database {
    async fn persist_plays(&self, user_id: UserId, plays: &[PlayHistory]) -> Result<Vec<String>, StoreError> {
        let mut tx = self.pool().begin().await?;
        let mut recorded = Vec::with_capacity(plays.len());
        for play in plays {
            match record_play(&mut tx, user_id, play).await {
                Ok(Some(track_id)) => recorded.push(track_id),
                Ok(None) => {}
                Err(err) => {
                    error!(user_id, track_id = %play.track.id, error = %err, "persisting play failed");
                    return Err(err);
                }
            }
        }
        tx.commit().await?;
        Ok(recorded)
    }

    async fn recently_played(
        &self,
        user_id: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ListenEvent>, StoreError> {
        let rows: Vec<PlayRow> = sqlx::query_as(
            r#"
            SELECT t.name AS track, p.played_at
              FROM plays p
              JOIN tracks t ON t.id = p.track_id
             WHERE p.user_id = ? AND p.played_at BETWEEN ? AND ?
             ORDER BY p.played_at DESC
            "#,
        )
        .bind(user_id)
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ListenEvent {
                    track: row.track,
                    played_at: from_millis(row.played_at)?,
                })
            })
            .collect()
    }

    async fn listens_by_artist(
        &self,
        user_id: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ArtistListens>, StoreError> {
        let rows: Vec<CountRow> = sqlx::query_as(
            r#"
            SELECT a.name AS name, COUNT(*) AS listens
              FROM plays p
              JOIN track_artists ta ON ta.track_id = p.track_id
              JOIN artists a ON a.id = ta.artist_id
             WHERE p.user_id = ? AND p.played_at BETWEEN ? AND ?
             GROUP BY a.id, a.name
             ORDER BY listens DESC, a.name ASC
            "#,
        )
        .bind(user_id)
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .fetch_all(self.pool())
        .await?;
        Ok(counts(rows, |artist, listens| ArtistListens { artist, listens }))
    }

    async fn tracks_for_artist(
        &self,
        user_id: UserId,
        artist: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TrackListens>, StoreError> {
        let rows: Vec<CountRow> = sqlx::query_as(
            r#"
            SELECT t.name AS name, COUNT(*) AS listens
              FROM plays p
              JOIN tracks t ON t.id = p.track_id
              JOIN track_artists ta ON ta.track_id = t.id
              JOIN artists a ON a.id = ta.artist_id
             WHERE p.user_id = ? AND a.name = ? AND p.played_at BETWEEN ? AND ?
             GROUP BY t.id, t.name
             ORDER BY listens DESC, t.name ASC
            "#,
        )
        .bind(user_id)
        .bind(artist)
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .fetch_all(self.pool())
        .await?;
        Ok(counts(rows, |track, listens| TrackListens { track, listens }))
    }
}
