use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use trove_core::{JobOutcome, JobStatus, Provider, UserId};
use trove_storage::Database;
use trove_sync::SyncConfig;

#[derive(Debug, Parser)]
#[command(name = "trove")]
#[command(about = "Mirror saved posts, listening history and review listings into one database")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (and the refresh scheduler when enabled).
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Register a user and print its id.
    AddUser { username: String },
    /// Exchange an OAuth authorization code for the listen-history provider.
    AddToken { user: UserId, code: String },
    /// Synchronize the recent window once.
    Refresh { provider: Provider, user: UserId },
    /// Walk a date range (inclusive UTC days) in the foreground.
    Backfill {
        provider: Provider,
        user: UserId,
        start: NaiveDate,
        end: NaiveDate,
    },
    /// Backfill review listings for a range of release years.
    Scrape {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        min_year: i32,
        #[arg(long)]
        max_year: i32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => trove_web::serve_from_env().await?,
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let db = Database::connect(&config.database_url)
                .await
                .with_context(|| format!("connecting to {}", config.database_url))?;
            db.migrate().await.context("running migrations")?;
            info!(database_url = %config.database_url, "migrations applied");
        }
        Commands::AddUser { username } => {
            let (_, _, db, _) = trove_sync::runner_from_env().await?;
            let id = db.register_user(&username).await?;
            println!("{id}");
        }
        Commands::AddToken { user, code } => {
            let (_, _, _, runner) = trove_sync::runner_from_env().await?;
            let token = runner.add_token(user, &code).await?;
            println!("token stored; expires at {}", token.expires_at.to_rfc3339());
        }
        Commands::Refresh { provider, user } => {
            let (_, _, _, runner) = trove_sync::runner_from_env().await?;
            let num_persisted = runner.refresh(provider, user).await?;
            println!("refresh complete: provider={provider} user={user} num_persisted={num_persisted}");
        }
        Commands::Backfill {
            provider,
            user,
            start,
            end,
        } => {
            let start = at(start, NaiveTime::default());
            let end = at(end, NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default());
            backfill(provider, user, start, end).await?;
        }
        Commands::Scrape {
            user,
            min_year,
            max_year,
        } => {
            let start = Utc
                .with_ymd_and_hms(min_year, 1, 1, 0, 0, 0)
                .single()
                .with_context(|| format!("invalid year {min_year}"))?;
            let end = Utc
                .with_ymd_and_hms(max_year, 12, 31, 23, 59, 59)
                .single()
                .with_context(|| format!("invalid year {max_year}"))?;
            backfill(Provider::Metacritic, user, start, end).await?;
        }
    }

    Ok(())
}

async fn backfill(provider: Provider, user: UserId, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    let (_, _, _, runner) = trove_sync::runner_from_env().await?;
    let Some(outcome) = runner.backfill_now(provider, user, start, end).await? else {
        bail!("a {provider} backfill for user {user} is already running");
    };
    report(&outcome)
}

fn report(outcome: &JobOutcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    match outcome.status {
        JobStatus::Succeeded => Ok(()),
        JobStatus::Failed | JobStatus::TimedOut => bail!(
            "backfill {:?}: {}",
            outcome.status,
            outcome.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn at(day: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    day.and_time(time).and_utc()
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var("TROVE_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
