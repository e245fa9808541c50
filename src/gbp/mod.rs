use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::Gbp;
use crate::gbp::model::{
    ListAccountsResponse, ListLocationsResponse, Location, OAuthErrorResponse, TokenResponse,
};
use crate::model::ExternalListing;

pub mod model;

const LOCATION_READ_MASK: &str = "name,title";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("failed to reach Business Profile: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Short-lived bearer token returned by the OAuth exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

/// Where external listings come from.
#[async_trait]
pub trait ListingSource: Send + Sync {
    /// Exchange an organization's stored refresh token for an access token.
    async fn authenticate(&self, refresh_token: &str) -> Result<AccessToken, SourceError>;

    /// Every location visible to the token, across all of its accounts.
    async fn fetch_listings(&self, token: &AccessToken)
        -> Result<Vec<ExternalListing>, SourceError>;
}

#[derive(Clone)]
pub struct GbpClient {
    http: Client,
    token_url: Url,
    account_api_base: Url,
    business_info_api_base: Url,
    client_id: String,
    client_secret: String,
    page_size: u32,
}

impl fmt::Debug for GbpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GbpClient")
            .field("token_url", &self.token_url)
            .field("account_api_base", &self.account_api_base)
            .field("business_info_api_base", &self.business_info_api_base)
            .finish_non_exhaustive()
    }
}

impl GbpClient {
    pub fn from_config(cfg: &Gbp) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent("gbp-sync/0.1")
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            token_url: Url::parse(&cfg.token_url)?,
            account_api_base: Url::parse(&cfg.account_api_base)?,
            business_info_api_base: Url::parse(&cfg.business_info_api_base)?,
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            page_size: cfg.page_size,
        })
    }

    pub fn build_token_request(
        &self,
        refresh_token: &str,
    ) -> Result<reqwest::Request, SourceError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ];
        Ok(self.http.post(self.token_url.clone()).form(&form).build()?)
    }

    pub fn accounts_url(&self, page_token: Option<&str>) -> Result<Url, SourceError> {
        let mut url = self
            .account_api_base
            .join("v1/accounts")
            .map_err(|e| SourceError::Fetch(format!("invalid account API base: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("pageSize", &self.page_size.to_string());
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }
        Ok(url)
    }

    /// `account` is a resource name such as `accounts/123`.
    pub fn locations_url(
        &self,
        account: &str,
        page_token: Option<&str>,
    ) -> Result<Url, SourceError> {
        let mut url = self
            .business_info_api_base
            .join(&format!("v1/{}/locations", account))
            .map_err(|e| {
                SourceError::Fetch(format!("invalid business information API base: {e}"))
            })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("readMask", LOCATION_READ_MASK);
            query.append_pair("pageSize", &self.page_size.to_string());
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        token: &AccessToken,
        url: Url,
    ) -> Result<T, SourceError> {
        debug!(url = %url, "sending business profile request");
        let res = self.http.get(url).bearer_auth(token.secret()).send().await?;

        let status = res.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "business profile rejected access token");
            return Err(SourceError::Auth(format!("access denied ({status}): {body}")));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(SourceError::Fetch(format!("rate limited by Business Profile: {body}")));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(SourceError::Fetch(format!("business profile error {status}: {body}")));
        }

        res.json::<T>()
            .await
            .map_err(|e| SourceError::Fetch(format!("invalid Business Profile response: {e}")))
    }

    #[instrument(skip_all)]
    pub async fn list_accounts(&self, token: &AccessToken) -> Result<Vec<String>, SourceError> {
        let mut accounts = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let url = self.accounts_url(page_token.as_deref())?;
            let page: ListAccountsResponse = self.get_json(token, url).await?;
            accounts.extend(page.accounts.into_iter().map(|a| a.name));
            page_token = page.next_page_token.filter(|t| !t.is_empty());
            if page_token.is_none() {
                break;
            }
        }
        Ok(accounts)
    }

    #[instrument(skip_all, fields(account = %account))]
    pub async fn list_locations(
        &self,
        token: &AccessToken,
        account: &str,
    ) -> Result<Vec<ExternalListing>, SourceError> {
        let mut listings = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let url = self.locations_url(account, page_token.as_deref())?;
            let page: ListLocationsResponse = self.get_json(token, url).await?;
            listings.extend(page.locations.into_iter().filter_map(location_to_listing));
            page_token = page.next_page_token.filter(|t| !t.is_empty());
            if page_token.is_none() {
                break;
            }
        }
        Ok(listings)
    }
}

#[async_trait]
impl ListingSource for GbpClient {
    #[instrument(skip_all)]
    async fn authenticate(&self, refresh_token: &str) -> Result<AccessToken, SourceError> {
        let request = self.build_token_request(refresh_token)?;
        let res = self.http.execute(request).await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(SourceError::Auth(describe_oauth_error(status, &body)));
        }
        let payload: TokenResponse = res
            .json()
            .await
            .map_err(|e| SourceError::Auth(format!("invalid token response: {e}")))?;
        debug!(expires_in = ?payload.expires_in, "obtained business profile access token");
        Ok(AccessToken::new(payload.access_token))
    }

    #[instrument(skip_all)]
    async fn fetch_listings(
        &self,
        token: &AccessToken,
    ) -> Result<Vec<ExternalListing>, SourceError> {
        let accounts = self.list_accounts(token).await?;
        let mut listings = Vec::new();
        for account in &accounts {
            listings.extend(self.list_locations(token, account).await?);
        }
        info!(
            accounts = accounts.len(),
            locations = listings.len(),
            "fetched business profile locations"
        );
        Ok(listings)
    }
}

/// Locations without a title fall back to their resource name.
pub fn location_to_listing(location: Location) -> Option<ExternalListing> {
    let external_id = location.name.trim().to_string();
    if external_id.is_empty() {
        return None;
    }
    let display_name = location
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| external_id.clone());
    Some(ExternalListing {
        external_id,
        display_name,
    })
}

fn describe_oauth_error(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<OAuthErrorResponse>(body) {
        Ok(err) => match err.error_description {
            Some(desc) => format!("{} ({}): {}", err.error, status, desc),
            None => format!("{} ({})", err.error, status),
        },
        Err(_) => format!("token endpoint returned {status}"),
    }
}
