//! Row models for tables outside the listing domain.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Tenant. `gbp_refresh_token` is the stored Business Profile connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub gbp_refresh_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Session issued by the identity provider. Read-only here.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub organization_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}
