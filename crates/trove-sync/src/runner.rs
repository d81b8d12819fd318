use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use trove_adapters::{ListensClient, ReviewsClient, SavedPostsClient};
use trove_core::reviews::MIN_QUERY_YEAR;
use trove_core::{AccessToken, Job, JobOutcome, JobStatus, Medium, Provider, ReviewQuery, UserId};
use trove_storage::{Database, LeaseStore, ListenStore, PostStore, ReviewStore, TokenStore};
use uuid::Uuid;

use crate::paginator::{self, CursorWalk};
use crate::{Publisher, SyncConfig, SyncError, TokenManager};

/// The persistence capabilities a runner needs, each behind its trait.
#[derive(Clone)]
pub struct Stores {
    pub posts: Arc<dyn PostStore>,
    pub listens: Arc<dyn ListenStore>,
    pub reviews: Arc<dyn ReviewStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub leases: Arc<dyn LeaseStore>,
}

impl Stores {
    pub fn from_database(db: &Database) -> Self {
        let db = Arc::new(db.clone());
        Self {
            posts: db.clone(),
            listens: db.clone(),
            reviews: db.clone(),
            tokens: db.clone(),
            leases: db,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub refresh_workers: usize,
    pub review_pages: u32,
    pub backfill_timeout: Duration,
    pub token_margin: chrono::Duration,
    pub listen_window: chrono::Duration,
}

impl From<&SyncConfig> for RunnerSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            refresh_workers: config.refresh_workers,
            review_pages: config.review_pages,
            backfill_timeout: config.backfill_timeout(),
            token_margin: config.token_margin(),
            listen_window: config.listen_window(),
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackfillTicket {
    pub accepted: bool,
    pub run_id: Uuid,
}

#[derive(Clone)]
struct Listens {
    client: ListensClient,
    tokens: TokenManager,
}

/// Runs refresh and backfill jobs for one user and provider at a time.
#[derive(Clone)]
pub struct JobRunner {
    stores: Stores,
    saved: Option<SavedPostsClient>,
    listens: Option<Listens>,
    reviews: ReviewsClient,
    publisher: Arc<dyn Publisher>,
    settings: RunnerSettings,
}

impl JobRunner {
    pub fn new(
        stores: Stores,
        reviews: ReviewsClient,
        publisher: Arc<dyn Publisher>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            stores,
            saved: None,
            listens: None,
            reviews,
            publisher,
            settings,
        }
    }

    pub fn with_saved_posts(mut self, client: SavedPostsClient) -> Self {
        self.saved = Some(client);
        self
    }

    pub fn with_listens(mut self, client: ListensClient) -> Self {
        let tokens = TokenManager::new(
            self.stores.tokens.clone(),
            Arc::new(client.clone()),
            self.settings.token_margin,
        );
        self.listens = Some(Listens { client, tokens });
        self
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn is_configured(&self, provider: Provider) -> bool {
        match provider {
            Provider::Reddit => self.saved.is_some(),
            Provider::Spotify => self.listens.is_some(),
            Provider::Metacritic => true,
        }
    }

    /// Stores the token obtained from an authorization code.
    pub async fn add_token(&self, user_id: UserId, code: &str) -> Result<AccessToken, SyncError> {
        self.listens()?.tokens.bootstrap(user_id, code).await
    }

    /// Synchronizes the recent window and returns how many rows were written.
    pub async fn refresh(&self, provider: Provider, user_id: UserId) -> Result<usize, SyncError> {
        let job = Job::refresh(provider, user_id);
        let span = info_span!("job", run_id = %job.run_id, %provider, user_id, mode = "refresh");
        async {
            let result = match provider {
                Provider::Reddit => self.refresh_saved(user_id).await,
                Provider::Spotify => self.refresh_listens(user_id).await,
                Provider::Metacritic => self.refresh_reviews(user_id).await,
            };
            let outcome = match &result {
                Ok(num_persisted) => {
                    info!(num_persisted, "refresh finished");
                    JobOutcome::succeeded(&job, *num_persisted)
                }
                Err(err) => {
                    error!(error = %err, "refresh failed");
                    JobOutcome::failed(&job, 0, JobStatus::Failed, err)
                }
            };
            self.publish(&outcome).await;
            result
        }
        .instrument(span)
        .await
    }

    /// Starts a detached backfill unless one already holds the lease for
    /// this user and provider.
    pub async fn backfill(
        &self,
        provider: Provider,
        user_id: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BackfillTicket, SyncError> {
        let job = Job::backfill(provider, user_id, start, end);
        let accepted = self.acquire_lease(&job).await?;
        if accepted {
            let runner = self.clone();
            tokio::spawn(async move {
                runner.execute_backfill(job, start, end).await;
            });
        }
        Ok(BackfillTicket {
            accepted,
            run_id: job.run_id,
        })
    }

    /// Runs a backfill to completion. `None` when another run holds the lease.
    pub async fn backfill_now(
        &self,
        provider: Provider,
        user_id: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<JobOutcome>, SyncError> {
        let job = Job::backfill(provider, user_id, start, end);
        if !self.acquire_lease(&job).await? {
            return Ok(None);
        }
        Ok(Some(self.execute_backfill(job, start, end).await))
    }

    async fn acquire_lease(&self, job: &Job) -> Result<bool, SyncError> {
        let ttl = self.settings.backfill_timeout + Duration::from_secs(60);
        let acquired = self
            .stores
            .leases
            .try_acquire(job.user_id, job.provider, job.run_id, ttl)
            .await?;
        if !acquired {
            warn!(provider = %job.provider, user_id = job.user_id, "backfill already in flight");
        }
        Ok(acquired)
    }

    async fn execute_backfill(&self, job: Job, start: DateTime<Utc>, end: DateTime<Utc>) -> JobOutcome {
        let span = info_span!(
            "job",
            run_id = %job.run_id,
            provider = %job.provider,
            user_id = job.user_id,
            mode = "backfill"
        );
        async {
            let limit = self.settings.backfill_timeout;
            let mut persisted = 0usize;
            let result = tokio::time::timeout(
                limit,
                self.backfill_pages(job.provider, job.user_id, start, end, &mut persisted),
            )
            .await;

            let outcome = match result {
                Ok(Ok(())) => {
                    info!(num_persisted = persisted, "backfill finished");
                    JobOutcome::succeeded(&job, persisted)
                }
                Ok(Err(err)) => {
                    error!(error = %err, num_persisted = persisted, "backfill stopped; persisted pages are kept");
                    JobOutcome::failed(&job, persisted, JobStatus::Failed, err)
                }
                Err(_) => {
                    warn!(num_persisted = persisted, timeout_secs = limit.as_secs(), "backfill timed out");
                    JobOutcome::failed(
                        &job,
                        persisted,
                        JobStatus::TimedOut,
                        format!("timed out after {}s", limit.as_secs()),
                    )
                }
            };

            if let Err(err) = self.stores.leases.release(job.user_id, job.provider, job.run_id).await {
                warn!(error = %err, "releasing backfill lease failed");
            }
            self.publish(&outcome).await;
            outcome
        }
        .instrument(span)
        .await
    }

    async fn backfill_pages(
        &self,
        provider: Provider,
        user_id: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        persisted: &mut usize,
    ) -> Result<(), SyncError> {
        if start > end {
            info!(%start, %end, "empty backfill window");
            return Ok(());
        }
        match provider {
            Provider::Reddit => self.backfill_saved(user_id, persisted).await,
            Provider::Spotify => self.backfill_listens(user_id, start, end, persisted).await,
            Provider::Metacritic => self.backfill_reviews(user_id, start, end, persisted).await,
        }
    }

    async fn publish(&self, outcome: &JobOutcome) {
        if let Err(err) = self.publisher.publish(outcome).await {
            warn!(error = %format!("{err:#}"), "publishing job outcome failed");
        }
    }

    fn saved(&self) -> Result<&SavedPostsClient, SyncError> {
        self.saved
            .as_ref()
            .ok_or_else(|| SyncError::not_configured(Provider::Reddit))
    }

    fn listens(&self) -> Result<&Listens, SyncError> {
        self.listens
            .as_ref()
            .ok_or_else(|| SyncError::not_configured(Provider::Spotify))
    }

    async fn refresh_saved(&self, user_id: UserId) -> Result<usize, SyncError> {
        let client = self.saved()?;
        let session = client.authenticate().await?;
        let session = &session;
        let posts = paginator::walk("", false, move |cursor| async move {
            client.fetch_page(session, &cursor).await
        })
        .await
        .map_err(|partial| SyncError::from(partial.error))?;

        if posts.is_empty() {
            return Ok(0);
        }
        Ok(self.stores.posts.persist_posts(user_id, &posts).await?.len())
    }

    async fn backfill_saved(&self, user_id: UserId, persisted: &mut usize) -> Result<(), SyncError> {
        let client = self.saved()?;
        let session = client.authenticate().await?;
        let mut walk = CursorWalk::new("", true);
        while let Some(cursor) = walk.cursor().map(str::to_string) {
            let page = client.fetch_page(&session, &cursor).await?;
            if !page.items.is_empty() {
                *persisted += self.stores.posts.persist_posts(user_id, &page.items).await?.len();
            }
            debug!(cursor, num_items = page.items.len(), "saved page persisted");
            walk.advance(&page.next_cursor);
        }
        Ok(())
    }

    async fn refresh_listens(&self, user_id: UserId) -> Result<usize, SyncError> {
        let listens = self.listens()?;
        let token = listens.tokens.ensure_valid(user_id).await?;
        let after = Utc::now() - self.settings.listen_window;
        let plays = listens.client.fetch_since(&token, after).await?;
        if plays.is_empty() {
            return Ok(0);
        }
        Ok(self.stores.listens.persist_plays(user_id, &plays).await?.len())
    }

    /// Walks forward from `start`, using the newest play of each page as the
    /// next `after` bound.
    async fn backfill_listens(
        &self,
        user_id: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        persisted: &mut usize,
    ) -> Result<(), SyncError> {
        let listens = self.listens()?;
        let mut after = start;
        while after <= end {
            let token = listens.tokens.ensure_valid(user_id).await?;
            let plays = listens.client.fetch_since(&token, after).await?;
            let Some(newest) = plays.iter().map(|p| p.played_at).max() else {
                break;
            };
            let in_window: Vec<_> = plays.into_iter().filter(|p| p.played_at <= end).collect();
            if !in_window.is_empty() {
                *persisted += self.stores.listens.persist_plays(user_id, &in_window).await?.len();
            }
            debug!(%after, %newest, num_items = in_window.len(), "listen page persisted");
            if newest <= after {
                break;
            }
            after = newest;
        }
        Ok(())
    }

    /// Every medium for the current year, `review_pages` pages each, fetched
    /// through a bounded worker pool. The first failure cancels the rest.
    async fn refresh_reviews(&self, user_id: UserId) -> Result<usize, SyncError> {
        let year = Utc::now().year();
        let workers = Arc::new(Semaphore::new(self.settings.refresh_workers.max(1)));
        let mut tasks = JoinSet::new();
        for medium in Medium::ALL {
            for page in 1..=self.settings.review_pages {
                let client = self.reviews.clone();
                let workers = workers.clone();
                tasks.spawn(async move {
                    let _permit = workers
                        .acquire_owned()
                        .await
                        .map_err(|e| SyncError::Worker(e.to_string()))?;
                    client
                        .fetch_cards(&ReviewQuery::single_year(medium, year, page))
                        .await
                        .map_err(SyncError::from)
                });
            }
        }

        let mut cards = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let page = match joined {
                Ok(page) => page,
                Err(join_err) => Err(SyncError::Worker(join_err.to_string())),
            };
            match page {
                Ok(page) => cards.extend(page),
                Err(err) => {
                    tasks.abort_all();
                    return Err(err);
                }
            }
        }

        if cards.is_empty() {
            return Ok(0);
        }
        Ok(self
            .stores
            .reviews
            .persist_reviews(user_id, &cards, Utc::now())
            .await?
            .len())
    }

    /// Year by year, medium by medium, page by page until a page comes back
    /// empty or holds nothing already seen in that listing. Pacing comes from
    /// the provider's rate limiter.
    async fn backfill_reviews(
        &self,
        user_id: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        persisted: &mut usize,
    ) -> Result<(), SyncError> {
        for year in start.year().max(MIN_QUERY_YEAR)..=end.year() {
            for medium in Medium::ALL {
                let mut seen = HashSet::new();
                for page in 1u32.. {
                    let cards = self
                        .reviews
                        .fetch_cards(&ReviewQuery::single_year(medium, year, page))
                        .await?;
                    let fresh = cards
                        .iter()
                        .filter(|card| seen.insert((card.title.clone(), card.release_date)))
                        .count();
                    if fresh == 0 {
                        debug!(%medium, year, page, num_items = cards.len(), "review listing exhausted");
                        break;
                    }
                    *persisted += self
                        .stores
                        .reviews
                        .persist_reviews(user_id, &cards, Utc::now())
                        .await?
                        .len();
                }
            }
        }
        Ok(())
    }
}
