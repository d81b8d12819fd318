use chrono::Utc;
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use tracing::{debug, info};
use trove_core::{AccessToken, Page, Provider, SavedPost, TokenGrant};
use trove_storage::HttpTransport;

use crate::{trim_base, AdapterError, PasswordCredentials};

/// Sent on every call; the API throttles anonymous agents aggressively.
pub const IDENTIFYING_AGENT: &str = "trove/0.1 (saved-posts mirror)";

const PROVIDER: Provider = Provider::Reddit;

#[derive(Debug, Clone)]
pub struct RedditEndpoints {
    pub auth_base: String,
    pub api_base: String,
}

impl Default for RedditEndpoints {
    fn default() -> Self {
        Self {
            auth_base: "https://www.reddit.com".to_string(),
            api_base: "https://oauth.reddit.com".to_string(),
        }
    }
}

/// Access obtained from a single password-grant exchange.
#[derive(Debug, Clone)]
pub struct Session {
    token: AccessToken,
}

impl Session {
    pub fn authorization_value(&self) -> String {
        self.token.authorization_value()
    }
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Child>,
    #[serde(default)]
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Child {
    data: SavedPost,
}

#[derive(Debug, Deserialize)]
struct GrantError {
    error: String,
}

#[derive(Debug, Clone)]
pub struct SavedPostsClient {
    transport: HttpTransport,
    credentials: PasswordCredentials,
    endpoints: RedditEndpoints,
}

impl SavedPostsClient {
    pub fn new(transport: HttpTransport, credentials: PasswordCredentials, endpoints: RedditEndpoints) -> Self {
        Self {
            transport,
            credentials,
            endpoints: RedditEndpoints {
                auth_base: trim_base(&endpoints.auth_base),
                api_base: trim_base(&endpoints.api_base),
            },
        }
    }

    pub async fn authenticate(&self) -> Result<Session, AdapterError> {
        let request = self
            .transport
            .client()
            .post(format!("{}/api/v1/access_token", self.endpoints.auth_base))
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .header(USER_AGENT, IDENTIFYING_AGENT)
            .form(&[
                ("grant_type", "password"),
                ("username", self.credentials.username.as_str()),
                ("password", self.credentials.password.as_str()),
            ])
            .build()
            .map_err(|e| AdapterError::build(PROVIDER, e))?;

        let response = match self.transport.execute(PROVIDER, request).await {
            Ok(response) => response,
            Err(trove_storage::FetchError::HttpStatus { status: 401 | 403, body, .. }) => {
                return Err(AdapterError::Auth { provider: PROVIDER, message: body })
            }
            Err(err) => return Err(AdapterError::from_fetch(PROVIDER, err)),
        };

        // Bad passwords come back as 200 with an `error` field.
        if let Ok(rejected) = response.json::<GrantError>() {
            return Err(AdapterError::Auth {
                provider: PROVIDER,
                message: rejected.error,
            });
        }
        let grant: TokenGrant = response.json().map_err(|e| AdapterError::from_fetch(PROVIDER, e))?;
        if grant.access_token.as_deref().unwrap_or_default().is_empty() {
            return Err(AdapterError::Auth {
                provider: PROVIDER,
                message: "token response carried no access token".to_string(),
            });
        }
        info!(username = %self.credentials.username, "authenticated");
        Ok(Session {
            token: grant.into_token(Utc::now()),
        })
    }

    /// Fetches one page of saved items. An empty cursor requests the newest page.
    pub async fn fetch_page(&self, session: &Session, cursor: &str) -> Result<Page<SavedPost>, AdapterError> {
        let mut builder = self
            .transport
            .client()
            .get(format!(
                "{}/user/{}/saved",
                self.endpoints.api_base, self.credentials.username
            ))
            .header(USER_AGENT, IDENTIFYING_AGENT)
            .header(AUTHORIZATION, session.authorization_value());
        if !cursor.is_empty() {
            builder = builder.query(&[("after", cursor)]);
        }
        let request = builder.build().map_err(|e| AdapterError::build(PROVIDER, e))?;

        let listing: Listing = self
            .transport
            .execute(PROVIDER, request)
            .await
            .and_then(|response| response.json())
            .map_err(|e| AdapterError::from_fetch(PROVIDER, e))?;

        let items: Vec<SavedPost> = listing.data.children.into_iter().map(|c| c.data).collect();
        debug!(cursor, num_items = items.len(), "fetched saved page");
        Ok(Page::new(items, listing.data.after.unwrap_or_default()))
    }
}
