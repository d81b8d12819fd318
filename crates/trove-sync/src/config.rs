use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::fs;
use tracing::info;
use trove_adapters::reviews::DEFAULT_BASE_URL;
use trove_adapters::{RedditEndpoints, SpotifyEndpoints};
use trove_core::Provider;
use trove_storage::{ProviderPolicy, TransportConfig};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub providers_file: PathBuf,
    pub secrets_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub refresh_workers: usize,
    pub review_pages: u32,
    pub backfill_timeout_secs: u64,
    pub token_margin_secs: i64,
    pub listen_window_secs: i64,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
    pub publish_url: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://trove.db".to_string(),
            providers_file: PathBuf::from("providers.yaml"),
            secrets_dir: PathBuf::from("secrets"),
            user_agent: trove_adapters::saved::IDENTIFYING_AGENT.to_string(),
            http_timeout_secs: 20,
            refresh_workers: 20,
            review_pages: 5,
            backfill_timeout_secs: 3600,
            token_margin_secs: trove_core::DEFAULT_SAFETY_MARGIN_SECS,
            listen_window_secs: 3600,
            scheduler_enabled: false,
            refresh_cron: "0 0 * * * *".to_string(),
            publish_url: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            providers_file: std::env::var("TROVE_PROVIDERS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.providers_file),
            secrets_dir: std::env::var("TROVE_SECRETS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.secrets_dir),
            user_agent: std::env::var("TROVE_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("TROVE_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            refresh_workers: env_parse("TROVE_REFRESH_WORKERS").unwrap_or(defaults.refresh_workers),
            review_pages: env_parse("TROVE_REVIEW_PAGES").unwrap_or(defaults.review_pages),
            backfill_timeout_secs: env_parse("TROVE_BACKFILL_TIMEOUT_SECS")
                .unwrap_or(defaults.backfill_timeout_secs),
            token_margin_secs: env_parse("TROVE_TOKEN_MARGIN_SECS").unwrap_or(defaults.token_margin_secs),
            listen_window_secs: env_parse("TROVE_LISTEN_WINDOW_SECS").unwrap_or(defaults.listen_window_secs),
            scheduler_enabled: std::env::var("TROVE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            refresh_cron: std::env::var("TROVE_REFRESH_CRON").unwrap_or(defaults.refresh_cron),
            publish_url: std::env::var("TROVE_PUBLISH_URL").ok().filter(|v| !v.is_empty()),
        }
    }

    pub fn backfill_timeout(&self) -> Duration {
        Duration::from_secs(self.backfill_timeout_secs)
    }

    pub fn token_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_margin_secs)
    }

    pub fn listen_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.listen_window_secs)
    }

    pub fn credentials_path(&self, provider: Provider) -> PathBuf {
        self.secrets_dir.join(format!("{provider}.json"))
    }

    pub fn transport_config(&self, registry: &ProviderRegistry) -> TransportConfig {
        TransportConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: registry.global_concurrency,
            policies: registry.policies(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// `providers.yaml`: per-provider switches, hosts and transport policy.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderRegistry {
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: usize,
    #[serde(default)]
    pub providers: HashMap<Provider, ProviderEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderEntry {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub auth_base: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub policy: Option<ProviderPolicy>,
}

fn default_global_concurrency() -> usize {
    16
}

fn default_enabled() -> bool {
    true
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self {
            global_concurrency: default_global_concurrency(),
            providers: HashMap::new(),
        }
    }
}

impl ProviderRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            info!(path = %path.display(), "no provider registry; using built-in defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn is_enabled(&self, provider: Provider) -> bool {
        self.providers.get(&provider).map_or(true, |e| e.enabled)
    }

    pub fn enabled(&self) -> Vec<Provider> {
        Provider::ALL.into_iter().filter(|p| self.is_enabled(*p)).collect()
    }

    pub fn policies(&self) -> HashMap<Provider, ProviderPolicy> {
        self.providers
            .iter()
            .filter_map(|(provider, entry)| entry.policy.map(|policy| (*provider, policy)))
            .collect()
    }

    fn entry(&self, provider: Provider) -> ProviderEntry {
        self.providers.get(&provider).cloned().unwrap_or_default()
    }

    pub fn reddit_endpoints(&self) -> RedditEndpoints {
        let entry = self.entry(Provider::Reddit);
        let defaults = RedditEndpoints::default();
        RedditEndpoints {
            auth_base: entry.auth_base.unwrap_or(defaults.auth_base),
            api_base: entry.api_base.unwrap_or(defaults.api_base),
        }
    }

    pub fn spotify_endpoints(&self) -> SpotifyEndpoints {
        let entry = self.entry(Provider::Spotify);
        let defaults = SpotifyEndpoints::default();
        SpotifyEndpoints {
            accounts_base: entry.auth_base.unwrap_or(defaults.accounts_base),
            api_base: entry.api_base.unwrap_or(defaults.api_base),
        }
    }

    pub fn reviews_base(&self) -> String {
        self.entry(Provider::Metacritic)
            .api_base
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }
}
