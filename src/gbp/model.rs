//! Wire types for the Business Profile and OAuth endpoints.

use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// OAuth error body, e.g. `{"error": "invalid_grant", "error_description": "..."}`.
#[derive(Deserialize, Debug)]
pub struct OAuthErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Resource name, `accounts/{id}`.
    pub name: String,
    #[serde(default)]
    pub account_name: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListAccountsResponse {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct Location {
    /// Resource name, `locations/{id}`.
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListLocationsResponse {
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}
