//! Axum HTTP surface: job triggers and read endpoints per provider.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{FromRequestParts, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use trove_core::{Medium, Provider, ReviewAction, ReviewQuery, UserId};
use trove_storage::StoreError;
use trove_sync::{JobRunner, SyncError};

pub const CRATE_NAME: &str = "trove-web";

/// Set by the authenticating proxy in front of this service.
pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub runner: JobRunner,
    pub listen_window: Duration,
}

impl AppState {
    pub fn new(runner: JobRunner) -> Self {
        Self {
            runner,
            listen_window: Duration::hours(1),
        }
    }

    pub fn with_listen_window(mut self, window: Duration) -> Self {
        self.listen_window = window;
        self
    }
}

type SharedState = Arc<AppState>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/reddit/posts", get(saved_posts_handler))
        .route("/reddit/subreddits", get(subreddits_handler))
        .route("/spotify/songs", get(songs_handler))
        .route("/spotify/artists", get(artists_handler))
        .route("/spotify/artist", get(artist_tracks_handler))
        .route("/spotify/token", post(add_token_handler))
        .route("/metacritic/posts", get(reviews_handler).patch(mark_reviews_handler))
        .merge(job_routes(Provider::Reddit))
        .merge(job_routes(Provider::Spotify))
        .merge(job_routes(Provider::Metacritic))
        .with_state(Arc::new(state))
}

fn job_routes(provider: Provider) -> Router<SharedState> {
    Router::new()
        .route(
            &format!("/{provider}/refresh"),
            post(move |state: State<SharedState>, user: CurrentUser| refresh_handler(state, user, provider)),
        )
        .route(
            &format!("/{provider}/backfill"),
            post(
                move |state: State<SharedState>, user: CurrentUser, body: Option<Json<BackfillRequest>>| {
                    backfill_handler(state, user, body, provider)
                },
            ),
        )
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("TROVE_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let (config, registry, db, runner) = trove_sync::runner_from_env().await?;
    let scheduler = trove_sync::maybe_build_scheduler(&config, &registry, runner.clone(), db).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await.context("starting scheduler")?;
        info!(cron = %config.refresh_cron, "refresh scheduler started");
    }

    let state = AppState::new(runner).with_listen_window(config.listen_window());
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

/// The caller's user id, read from [`USER_HEADER`].
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts.headers.get(USER_HEADER).ok_or(ApiError::MissingUser)?;
        value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .map(CurrentUser)
            .ok_or_else(|| ApiError::BadRequest(format!("{USER_HEADER} must be an integer")))
    }
}

#[derive(Debug)]
pub enum ApiError {
    MissingUser,
    BadRequest(String),
    Sync(SyncError),
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError::Sync(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Sync(SyncError::from(err))
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingUser => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Sync(err) => match err {
                SyncError::Auth { .. } | SyncError::TokenExpired => StatusCode::UNAUTHORIZED,
                SyncError::Provider(_) | SyncError::InvalidItem(_) => StatusCode::BAD_GATEWAY,
                SyncError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                SyncError::Persistence(_) | SyncError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::MissingUser => format!("missing {USER_HEADER} header"),
            ApiError::BadRequest(message) => message.clone(),
            ApiError::Sync(err) => err.to_string(),
        };
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %message, "request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct RefreshResponse {
    num_persisted: usize,
}

/// Inclusive UTC days, `YYYY-MM-DD`.
#[derive(Debug, Default, Deserialize)]
pub struct BackfillRequest {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WindowParams {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    artist: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SavedPostsParams {
    subreddit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReviewsParams {
    medium: Option<Medium>,
    min_year: Option<i32>,
    max_year: Option<i32>,
    action: Option<ReviewAction>,
}

#[derive(Debug, Deserialize)]
struct MarkRequest {
    ids: Vec<i64>,
    action: ReviewAction,
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    code: String,
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn refresh_handler(
    State(state): State<SharedState>,
    CurrentUser(user_id): CurrentUser,
    provider: Provider,
) -> ApiResult<Json<RefreshResponse>> {
    let num_persisted = state.runner.refresh(provider, user_id).await?;
    Ok(Json(RefreshResponse { num_persisted }))
}

async fn backfill_handler(
    State(state): State<SharedState>,
    CurrentUser(user_id): CurrentUser,
    body: Option<Json<BackfillRequest>>,
    provider: Provider,
) -> ApiResult<Response> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let (start, end) = backfill_window(provider, &request)?;
    let ticket = state.runner.backfill(provider, user_id, start, end).await?;
    let status = if ticket.accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(ticket)).into_response())
}

fn backfill_window(provider: Provider, request: &BackfillRequest) -> ApiResult<(DateTime<Utc>, DateTime<Utc>)> {
    let now = Utc::now();
    let start = match (&request.start, provider) {
        (Some(day), _) => parse_day(day, start_of_day())?,
        (None, Provider::Spotify) => return Err(ApiError::BadRequest("start is required".to_string())),
        (None, _) => Utc
            .with_ymd_and_hms(now.year(), 1, 1, 0, 0, 0)
            .single()
            .unwrap_or(now),
    };
    let end = match &request.end {
        Some(day) => parse_day(day, end_of_day())?,
        None if provider == Provider::Spotify => {
            return Err(ApiError::BadRequest("end is required".to_string()))
        }
        None => now,
    };
    Ok((start, end))
}

fn start_of_day() -> NaiveTime {
    NaiveTime::default()
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default()
}

fn parse_day(day: &str, time: NaiveTime) -> ApiResult<DateTime<Utc>> {
    NaiveDate::parse_from_str(day.trim(), "%Y-%m-%d")
        .map(|date| date.and_time(time).and_utc())
        .map_err(|_| ApiError::BadRequest(format!("invalid date `{day}`, expected YYYY-MM-DD")))
}

async fn saved_posts_handler(
    State(state): State<SharedState>,
    CurrentUser(user_id): CurrentUser,
    Query(params): Query<SavedPostsParams>,
) -> ApiResult<Response> {
    let posts = state.runner.stores().posts.as_ref();
    let rows = match params.subreddit.as_deref().filter(|s| !s.is_empty()) {
        Some(subreddit) => posts.posts_for(user_id, subreddit).await?,
        None => posts.all_posts(user_id).await?,
    };
    Ok(Json(rows).into_response())
}

async fn subreddits_handler(
    State(state): State<SharedState>,
    CurrentUser(user_id): CurrentUser,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.runner.stores().posts.subreddits(user_id).await?))
}

impl WindowParams {
    fn resolve(&self, default_window: Duration) -> ApiResult<(DateTime<Utc>, DateTime<Utc>)> {
        let end = self.end.unwrap_or_else(Utc::now);
        let start = self.start.unwrap_or(end - default_window);
        if start > end {
            return Err(ApiError::BadRequest("start must not be after end".to_string()));
        }
        Ok((start, end))
    }
}

async fn songs_handler(
    State(state): State<SharedState>,
    CurrentUser(user_id): CurrentUser,
    Query(params): Query<WindowParams>,
) -> ApiResult<Response> {
    let (start, end) = params.resolve(state.listen_window)?;
    let rows = state.runner.stores().listens.recently_played(user_id, start, end).await?;
    Ok(Json(rows).into_response())
}

async fn artists_handler(
    State(state): State<SharedState>,
    CurrentUser(user_id): CurrentUser,
    Query(params): Query<WindowParams>,
) -> ApiResult<Response> {
    let (start, end) = params.resolve(state.listen_window)?;
    let rows = state.runner.stores().listens.listens_by_artist(user_id, start, end).await?;
    Ok(Json(rows).into_response())
}

async fn artist_tracks_handler(
    State(state): State<SharedState>,
    CurrentUser(user_id): CurrentUser,
    Query(params): Query<WindowParams>,
) -> ApiResult<Response> {
    let artist = params
        .artist
        .as_deref()
        .filter(|a| !a.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("artist is required".to_string()))?;
    let (start, end) = params.resolve(state.listen_window)?;
    let rows = state
        .runner
        .stores()
        .listens
        .tracks_for_artist(user_id, artist, start, end)
        .await?;
    Ok(Json(rows).into_response())
}

async fn add_token_handler(
    State(state): State<SharedState>,
    CurrentUser(user_id): CurrentUser,
    Json(request): Json<TokenRequest>,
) -> ApiResult<Response> {
    let token = state.runner.add_token(user_id, &request.code).await?;
    let body = json!({ "provider": Provider::Spotify, "expires_at": token.expires_at });
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

async fn reviews_handler(
    State(state): State<SharedState>,
    CurrentUser(user_id): CurrentUser,
    Query(params): Query<ReviewsParams>,
) -> ApiResult<Response> {
    let reviews = state.runner.stores().reviews.as_ref();
    if let Some(action) = params.action {
        return Ok(Json(reviews.marked_reviews(user_id, action).await?).into_response());
    }
    let medium = params
        .medium
        .ok_or_else(|| ApiError::BadRequest("medium is required".to_string()))?;
    let year = Utc::now().year();
    let query = ReviewQuery {
        medium,
        min_year: params.min_year.unwrap_or(year),
        max_year: params.max_year.unwrap_or(year),
        page: None,
    };
    Ok(Json(reviews.reviews(user_id, &query).await?).into_response())
}

async fn mark_reviews_handler(
    State(state): State<SharedState>,
    CurrentUser(user_id): CurrentUser,
    Json(request): Json<MarkRequest>,
) -> ApiResult<Response> {
    let num_marked = state
        .runner
        .stores()
        .reviews
        .mark_reviews(user_id, &request.ids, request.action)
        .await?;
    Ok(Json(json!({ "num_marked": num_marked })).into_response())
}
