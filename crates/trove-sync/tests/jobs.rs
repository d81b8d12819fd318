use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use trove_adapters::{
    ClientCredentials, ListensClient, PasswordCredentials, RedditEndpoints, ReviewsClient, SavedPostsClient,
    SpotifyEndpoints,
};
use trove_core::{AccessToken, JobOutcome, JobStatus, Medium, Provider, ReviewQuery, UserId};
use trove_storage::{Database, HttpTransport, TransportConfig};
use trove_sync::{JobRunner, Publisher, RunnerSettings, Stores, SyncError};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct RecordingPublisher {
    outcomes: Mutex<Vec<JobOutcome>>,
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, outcome: &JobOutcome) -> Result<()> {
        self.outcomes.lock().unwrap().push(outcome.clone());
        Ok(())
    }
}

struct Harness {
    server: MockServer,
    db: Database,
    user: UserId,
    runner: JobRunner,
    published: Arc<RecordingPublisher>,
}

async fn harness(settings: RunnerSettings) -> Harness {
    let server = MockServer::start().await;
    let db = Database::in_memory().await.unwrap();
    let user = db.register_user("mira").await.unwrap();
    let transport = HttpTransport::new(TransportConfig::default()).unwrap();
    let published = Arc::new(RecordingPublisher::default());

    let runner = JobRunner::new(
        Stores::from_database(&db),
        ReviewsClient::new(transport.clone(), &server.uri()),
        published.clone(),
        settings,
    )
    .with_saved_posts(SavedPostsClient::new(
        transport.clone(),
        PasswordCredentials {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            username: "mira".into(),
            password: "pw".into(),
        },
        RedditEndpoints {
            auth_base: server.uri(),
            api_base: server.uri(),
        },
    ))
    .with_listens(ListensClient::new(
        transport,
        ClientCredentials {
            client_id: "spot-id".into(),
            client_secret: "spot-secret".into(),
            redirect_uri: "http://localhost/cb".into(),
        },
        SpotifyEndpoints {
            accounts_base: server.uri(),
            api_base: server.uri(),
        },
    ));

    Harness {
        server,
        db,
        user,
        runner,
        published,
    }
}

fn settings() -> RunnerSettings {
    RunnerSettings {
        review_pages: 2,
        backfill_timeout: StdDuration::from_secs(30),
        ..RunnerSettings::default()
    }
}

impl Harness {
    fn outcomes(&self) -> Vec<JobOutcome> {
        self.published.outcomes.lock().unwrap().clone()
    }

    async fn store_token(&self, expires_in: i64) {
        use trove_storage::TokenStore;
        let token = AccessToken {
            access_token: "live".into(),
            token_type: "Bearer".into(),
            scope: String::new(),
            refresh_token: "R1".into(),
            expires_at: Utc::now() + Duration::seconds(expires_in),
        };
        self.db.save_token(self.user, Provider::Spotify, &token).await.unwrap();
    }

    async fn mount_reddit_token(&self) {
        Mock::given(method("POST"))
            .and(path("/api/v1/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok", "token_type": "bearer", "expires_in": 86400
            })))
            .mount(&self.server)
            .await;
    }
}

fn play(track: &str, played_at: DateTime<Utc>) -> Value {
    json!({
        "played_at": played_at.to_rfc3339(),
        "track": {
            "id": track, "name": format!("Song {track}"), "uri": format!("spotify:track:{track}"),
            "duration_ms": 1000, "explicit": false, "popularity": 1,
            "album": {"id": "al1", "name": "Album", "album_type": "album"},
            "artists": [{"id": "a1", "name": "Ada"}]
        }
    })
}

fn saved(name: &str) -> Value {
    json!({"data": {"name": name, "permalink": format!("/r/rust/{name}/"), "subreddit": "rust",
                    "title": name, "created_utc": 1700000000.0}})
}

fn card(title: &str, score: u32) -> String {
    format!(
        r#"<a class="c-finderProductCard_container" href="/x/{title}/">
             <div class="c-finderProductCard_title" data-title="{title}"></div>
             <div class="c-finderProductCard_meta"><span>Mar 3, 2024</span></div>
             <span class="c-finderProductCard_metascoreValue">{score}</span>
           </a>"#
    )
}

fn listing(cards: &[String]) -> String {
    format!("<html><body>{}</body></html>", cards.concat())
}

fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
}

#[tokio::test]
async fn empty_listen_refresh_writes_nothing_and_still_publishes() {
    use trove_storage::ListenStore;
    let h = harness(settings()).await;
    h.store_token(3600).await;
    Mock::given(method("GET"))
        .and(path("/v1/me/player/recently-played"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/token"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&h.server)
        .await;

    let num_persisted = h.runner.refresh(Provider::Spotify, h.user).await.unwrap();

    assert_eq!(num_persisted, 0);
    let outcomes = h.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].num_persisted, 0);
    assert_eq!(outcomes[0].status, JobStatus::Succeeded);
    let everything = h
        .db
        .recently_played(h.user, Utc.timestamp_opt(0, 0).unwrap(), Utc::now())
        .await
        .unwrap();
    assert!(everything.is_empty());
}

#[tokio::test]
async fn listen_refresh_renews_an_expiring_token_first() {
    let h = harness(settings()).await;
    h.store_token(10).await;
    Mock::given(method("POST"))
        .and(path("/api/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "renewed", "expires_in": 3600
        })))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/me/player/recently-played"))
        .and(wiremock::matchers::header("authorization", "Bearer renewed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [play("t1", Utc::now() - Duration::minutes(5))]
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    assert_eq!(h.runner.refresh(Provider::Spotify, h.user).await.unwrap(), 1);
}

#[tokio::test]
async fn listen_refresh_without_token_is_an_auth_failure() {
    let h = harness(settings()).await;
    let err = h.runner.refresh(Provider::Spotify, h.user).await.unwrap_err();
    assert!(matches!(err, SyncError::Auth { .. }));
    let outcomes = h.outcomes();
    assert_eq!(outcomes[0].status, JobStatus::Failed);
    assert!(outcomes[0].error.is_some());
}

#[tokio::test]
async fn saved_refresh_reads_only_the_first_page() {
    let h = harness(settings()).await;
    h.mount_reddit_token().await;
    Mock::given(method("GET"))
        .and(path("/user/mira/saved"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"after": "t3_b", "children": [saved("t3_a"), saved("t3_b")]}
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    assert_eq!(h.runner.refresh(Provider::Reddit, h.user).await.unwrap(), 2);
}

#[tokio::test]
async fn review_refresh_fans_out_over_every_medium_and_page() {
    use trove_storage::ReviewStore;
    let h = harness(settings()).await;
    let year = Utc::now().year().to_string();
    for medium in Medium::ALL {
        Mock::given(method("GET"))
            .and(path(format!("/browse/{}/", medium.path())))
            .and(query_param("releaseYearMin", year.as_str()))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[card(medium.as_str(), 80)])))
            .expect(1)
            .mount(&h.server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/browse/{}/", medium.path())))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[])))
            .expect(1)
            .mount(&h.server)
            .await;
    }

    assert_eq!(h.runner.refresh(Provider::Metacritic, h.user).await.unwrap(), 4);
    let query = ReviewQuery {
        medium: Medium::Pc,
        min_year: 2024,
        max_year: 2024,
        page: None,
    };
    assert_eq!(h.db.reviews(h.user, &query).await.unwrap().len(), 1);
}

#[tokio::test]
async fn one_failing_review_page_fails_the_refresh_and_persists_nothing() {
    use trove_storage::ReviewStore;
    let h = harness(settings()).await;
    Mock::given(method("GET"))
        .and(path("/browse/tv/"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not here"))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[card("ok", 70)])))
        .mount(&h.server)
        .await;

    let err = h.runner.refresh(Provider::Metacritic, h.user).await.unwrap_err();
    assert!(matches!(err, SyncError::Provider(_)));
    assert_eq!(h.outcomes()[0].status, JobStatus::Failed);
    for medium in Medium::ALL {
        let query = ReviewQuery { medium, min_year: 1900, max_year: 2100, page: None };
        assert!(h.db.reviews(h.user, &query).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn inverted_backfill_window_fetches_nothing() {
    let h = harness(settings()).await;
    h.store_token(3600).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .expect(0)
        .mount(&h.server)
        .await;

    for provider in Provider::ALL {
        let outcome = h
            .runner
            .backfill_now(provider, h.user, at("2024-03-02T00:00:00Z"), at("2024-03-01T00:00:00Z"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(outcome.num_persisted, 0);
    }
}

#[tokio::test]
async fn listen_backfill_advances_after_bound_until_an_empty_page() {
    let h = harness(settings()).await;
    h.store_token(3600).await;
    let start = at("2024-03-01T00:00:00Z");
    let first = at("2024-03-01T10:00:00Z");
    let second = at("2024-03-01T11:00:00Z");
    let beyond = at("2024-03-03T09:00:00Z");

    Mock::given(method("GET"))
        .and(path("/v1/me/player/recently-played"))
        .and(query_param("after", start.timestamp_millis().to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [play("t1", first), play("t2", second)]
        })))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/me/player/recently-played"))
        .and(query_param("after", second.timestamp_millis().to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [play("t3", beyond)]})))
        .expect(1)
        .mount(&h.server)
        .await;

    let outcome = h
        .runner
        .backfill_now(Provider::Spotify, h.user, start, at("2024-03-02T00:00:00Z"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(outcome.num_persisted, 2);
}

#[tokio::test]
async fn listen_backfill_over_a_single_instant_still_fetches() {
    let h = harness(settings()).await;
    h.store_token(3600).await;
    let instant = at("2024-03-01T10:00:00Z");
    Mock::given(method("GET"))
        .and(path("/v1/me/player/recently-played"))
        .and(query_param("after", instant.timestamp_millis().to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [play("t1", instant)]})))
        .expect(1)
        .mount(&h.server)
        .await;

    let outcome = h
        .runner
        .backfill_now(Provider::Spotify, h.user, instant, instant)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(outcome.num_persisted, 1);
}

#[tokio::test]
async fn listen_backfill_stops_when_a_page_does_not_move_past_its_bound() {
    let h = harness(settings()).await;
    h.store_token(3600).await;
    let start = at("2024-03-01T00:00:00Z");
    let only = at("2024-03-01T10:00:00Z");
    Mock::given(method("GET"))
        .and(path("/v1/me/player/recently-played"))
        .and(query_param("after", start.timestamp_millis().to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [play("t1", only)]})))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/me/player/recently-played"))
        .and(query_param("after", only.timestamp_millis().to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [play("t1", only)]})))
        .expect(1)
        .mount(&h.server)
        .await;

    let outcome = h
        .runner
        .backfill_now(Provider::Spotify, h.user, start, at("2024-03-02T00:00:00Z"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(outcome.num_persisted, 1);
    assert_eq!(h.server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn review_backfill_stops_when_the_listing_repeats_its_page() {
    let h = harness(settings()).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[card("Same", 70)])))
        .mount(&h.server)
        .await;

    let outcome = h
        .runner
        .backfill_now(Provider::Metacritic, h.user, at("2024-01-01T00:00:00Z"), at("2024-06-01T00:00:00Z"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Succeeded);
    // One card per medium, and a second page per medium to notice the repeat.
    assert_eq!(outcome.num_persisted, Medium::ALL.len());
    assert_eq!(h.server.received_requests().await.unwrap().len(), 2 * Medium::ALL.len());
}

#[tokio::test]
async fn review_backfill_stops_when_the_listing_cycles_back() {
    let h = harness(settings()).await;
    Mock::given(method("GET"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[card("Alpha", 80), card("Beta", 75)])))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[card("Beta", 75), card("Gamma", 60)])))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[card("Alpha", 80)])))
        .with_priority(10)
        .mount(&h.server)
        .await;

    let outcome = h
        .runner
        .backfill_now(Provider::Metacritic, h.user, at("2024-01-01T00:00:00Z"), at("2024-06-01T00:00:00Z"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(outcome.num_persisted, 3 * Medium::ALL.len());
    assert_eq!(h.server.received_requests().await.unwrap().len(), 3 * Medium::ALL.len());
}

#[tokio::test]
async fn saved_backfill_persists_each_page_and_stops_on_a_repeated_cursor() {
    let h = harness(settings()).await;
    h.mount_reddit_token().await;
    Mock::given(method("GET"))
        .and(path("/user/mira/saved"))
        .and(query_param("after", "t3_b"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"after": "t3_b", "children": [saved("t3_c")]}
        })))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/user/mira/saved"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"after": "t3_b", "children": [saved("t3_a"), saved("t3_b")]}
        })))
        .mount(&h.server)
        .await;

    let outcome = h
        .runner
        .backfill_now(Provider::Reddit, h.user, at("2000-01-01T00:00:00Z"), Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.num_persisted, 3);
}

#[tokio::test]
async fn failed_backfill_keeps_pages_already_persisted() {
    use trove_storage::ReviewStore;
    let h = harness(settings()).await;
    Mock::given(method("GET"))
        .and(path("/browse/tv/"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[card("Kept", 90)])))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403).set_body_string("blocked"))
        .mount(&h.server)
        .await;

    let outcome = h
        .runner
        .backfill_now(Provider::Metacritic, h.user, at("2024-01-01T00:00:00Z"), at("2024-12-31T00:00:00Z"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.num_persisted, 1);
    let query = ReviewQuery { medium: Medium::Tv, min_year: 2024, max_year: 2024, page: None };
    assert_eq!(h.db.reviews(h.user, &query).await.unwrap()[0].card.title, "Kept");
}

#[tokio::test]
async fn backfill_is_rejected_while_another_holds_the_lease() {
    use trove_storage::LeaseStore;
    let h = harness(settings()).await;
    let holder = uuid::Uuid::new_v4();
    assert!(h
        .db
        .try_acquire(h.user, Provider::Metacritic, holder, StdDuration::from_secs(600))
        .await
        .unwrap());

    let ticket = h
        .runner
        .backfill(Provider::Metacritic, h.user, at("2024-01-01T00:00:00Z"), Utc::now())
        .await
        .unwrap();
    assert!(!ticket.accepted);
    assert!(h.outcomes().is_empty());

    h.db.release(h.user, Provider::Metacritic, holder).await.unwrap();
    let ticket = h
        .runner
        .backfill(Provider::Metacritic, h.user, at("2024-03-02T00:00:00Z"), at("2024-03-01T00:00:00Z"))
        .await
        .unwrap();
    assert!(ticket.accepted);
}

#[tokio::test]
async fn backfill_that_outlives_its_timeout_is_reported_as_timed_out() {
    let h = harness(RunnerSettings {
        backfill_timeout: StdDuration::from_millis(200),
        ..settings()
    })
    .await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(listing(&[card("Slow", 50)]))
                .set_delay(StdDuration::from_secs(2)),
        )
        .mount(&h.server)
        .await;

    let outcome = h
        .runner
        .backfill_now(Provider::Metacritic, h.user, at("2024-01-01T00:00:00Z"), at("2024-06-01T00:00:00Z"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, JobStatus::TimedOut);

    // The lease is released with the run.
    let again = h
        .runner
        .backfill_now(Provider::Metacritic, h.user, at("2024-03-02T00:00:00Z"), at("2024-03-01T00:00:00Z"))
        .await
        .unwrap();
    assert!(again.is_some());
}
