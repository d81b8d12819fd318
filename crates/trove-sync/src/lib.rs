//! Token management, pagination and the refresh/backfill job runner.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use trove_adapters::{
    load_credentials, ClientCredentials, ListensClient, PasswordCredentials, ReviewsClient, SavedPostsClient,
};
use trove_core::Provider;
use trove_storage::{Database, HttpTransport};

pub mod config;
mod error;
pub mod paginator;
mod publisher;
mod runner;
mod token;

pub use config::{ProviderEntry, ProviderRegistry, SyncConfig};
pub use error::SyncError;
pub use paginator::{walk, CursorWalk, PartialWalk};
pub use publisher::{LogPublisher, Publisher, WebhookPublisher};
pub use runner::{BackfillTicket, JobRunner, RunnerSettings, Stores};
pub use token::TokenManager;

pub const CRATE_NAME: &str = "trove-sync";

pub fn build_publisher(config: &SyncConfig) -> Result<Arc<dyn Publisher>> {
    Ok(match &config.publish_url {
        Some(url) => Arc::new(WebhookPublisher::new(url.clone(), Duration::from_secs(config.http_timeout_secs))?),
        None => Arc::new(LogPublisher),
    })
}

/// Wires clients for every enabled provider whose credentials are present.
/// Missing credentials leave that provider unconfigured rather than failing.
pub fn build_runner(config: &SyncConfig, registry: &ProviderRegistry, db: &Database) -> Result<JobRunner> {
    let transport = HttpTransport::new(config.transport_config(registry)).context("building http transport")?;
    let reviews = ReviewsClient::new(transport.clone(), &registry.reviews_base());
    let mut runner = JobRunner::new(
        Stores::from_database(db),
        reviews,
        build_publisher(config)?,
        RunnerSettings::from(config),
    );

    if registry.is_enabled(Provider::Reddit) {
        match load_credentials::<PasswordCredentials>(config.credentials_path(Provider::Reddit)) {
            Ok(creds) => {
                runner = runner.with_saved_posts(SavedPostsClient::new(
                    transport.clone(),
                    creds,
                    registry.reddit_endpoints(),
                ))
            }
            Err(err) => warn!(provider = "reddit", error = %format!("{err:#}"), "provider left unconfigured"),
        }
    }
    if registry.is_enabled(Provider::Spotify) {
        match load_credentials::<ClientCredentials>(config.credentials_path(Provider::Spotify)) {
            Ok(creds) => {
                runner = runner.with_listens(ListensClient::new(
                    transport.clone(),
                    creds,
                    registry.spotify_endpoints(),
                ))
            }
            Err(err) => warn!(provider = "spotify", error = %format!("{err:#}"), "provider left unconfigured"),
        }
    }
    Ok(runner)
}

/// Connects, migrates and loads the registry named by the environment.
pub async fn runner_from_env() -> Result<(SyncConfig, ProviderRegistry, Database, JobRunner)> {
    let config = SyncConfig::from_env();
    let registry = ProviderRegistry::load(&config.providers_file).await?;
    let db = Database::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    db.migrate().await.context("running migrations")?;
    let runner = build_runner(&config, &registry, &db)?;
    Ok((config, registry, db, runner))
}

/// Refreshes every registered user for each configured provider. Failures
/// are logged and do not stop the sweep.
pub async fn refresh_all(runner: &JobRunner, db: &Database, providers: &[Provider]) -> Result<usize> {
    let users = db.user_ids().await.context("listing users")?;
    let mut total = 0;
    for user_id in users {
        for provider in providers.iter().copied().filter(|p| runner.is_configured(*p)) {
            match runner.refresh(provider, user_id).await {
                Ok(n) => total += n,
                Err(err) => warn!(%provider, user_id, error = %err, "scheduled refresh failed"),
            }
        }
    }
    Ok(total)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    registry: &ProviderRegistry,
    runner: JobRunner,
    db: Database,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let providers = registry.enabled();
    let cron = config.refresh_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let runner = runner.clone();
        let db = db.clone();
        let providers = providers.clone();
        Box::pin(async move {
            match refresh_all(&runner, &db, &providers).await {
                Ok(total) => info!(num_persisted = total, "scheduled refresh finished"),
                Err(err) => warn!(error = %format!("{err:#}"), "scheduled refresh failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
