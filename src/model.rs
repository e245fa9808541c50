use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Attribute key set by the analytics selection toggle.
pub const SELECTED_FOR_ANALYTICS: &str = "selectedForAnalytics";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListingStatus {
    Active,
    Suspended,
    Verified,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Active => "ACTIVE",
            ListingStatus::Suspended => "SUSPENDED",
            ListingStatus::Verified => "VERIFIED",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(ListingStatus::Active),
            "SUSPENDED" => Some(ListingStatus::Suspended),
            "VERIFIED" => Some(ListingStatus::Verified),
            _ => None,
        }
    }
}

/// A location as reported by Business Profile. Lives for one sync pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalListing {
    pub external_id: String,
    pub display_name: String,
}

impl ExternalListing {
    pub fn new(external_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Tenant-owned listing row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalListing {
    pub id: String,
    pub organization_id: String,
    pub external_id: Option<String>,
    pub display_name: String,
    pub status: ListingStatus,
    pub is_verified: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub attributes: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocalListing {
    pub fn is_selected_for_analytics(&self) -> bool {
        self.attributes
            .get(SELECTED_FOR_ANALYTICS)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Fields for a listing about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewListing {
    pub external_id: Option<String>,
    pub display_name: String,
    pub status: ListingStatus,
    pub is_verified: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub attributes: Map<String, Value>,
}

/// Partial update of a listing. `None` leaves the column as it is.
/// Attributes are not part of this type; they change only through
/// `db::set_listing_attribute`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingChanges {
    pub external_id: Option<String>,
    pub status: Option<ListingStatus>,
    pub is_verified: Option<bool>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncOutcome {
    Succeeded,
    Failed,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Succeeded => "SUCCEEDED",
            SyncOutcome::Failed => "FAILED",
        }
    }

    pub fn parse_outcome(s: &str) -> Option<Self> {
        match s {
            "SUCCEEDED" => Some(SyncOutcome::Succeeded),
            "FAILED" => Some(SyncOutcome::Failed),
            _ => None,
        }
    }
}

/// One entry in the sync activity log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRun {
    pub organization_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: SyncOutcome,
    pub total_locations: i64,
    pub synced_count: i64,
    pub new_count: i64,
    pub existing_count: i64,
    pub failed_count: i64,
    pub error: Option<String>,
}
