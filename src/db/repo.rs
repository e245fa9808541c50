use super::model::{Organization, Session};
use crate::model::{
    ListingChanges, ListingStatus, LocalListing, NewListing, SyncOutcome, SyncRun,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

const LISTING_COLUMNS: &str = "id, organization_id, external_id, display_name, status, \
     is_verified, last_synced_at, attributes, created_at, updated_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {normalized}"))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("failed to open database")?;
    Ok(pool)
}

/// Expand a leading `~/` in a file-backed SQLite URL and make sure the parent
/// directory exists. In-memory and non-sqlite URLs pass through unchanged.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// organizations
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn create_organization(pool: &Pool, id: &str, name: &str) -> Result<Organization> {
    let now = Utc::now();
    sqlx::query("INSERT INTO organizations (id, name, created_at) VALUES (?, ?, ?)")
        .bind(id)
        .bind(name)
        .bind(now)
        .execute(pool)
        .await
        .with_context(|| format!("failed to create organization {id}"))?;
    Ok(Organization {
        id: id.to_string(),
        name: name.to_string(),
        gbp_refresh_token: None,
        created_at: now,
    })
}

#[instrument(skip_all)]
pub async fn find_organization(pool: &Pool, id: &str) -> Result<Option<Organization>> {
    let row = sqlx::query(
        "SELECT id, name, gbp_refresh_token, created_at FROM organizations WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.map(|row| -> Result<Organization> {
        Ok(Organization {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            gbp_refresh_token: row
                .try_get::<Option<String>, _>("gbp_refresh_token")?
                .filter(|t| !t.trim().is_empty()),
            created_at: row.try_get("created_at")?,
        })
    })
    .transpose()
}

/// Store (or clear) the Business Profile refresh token for an organization.
#[instrument(skip_all)]
pub async fn set_gbp_refresh_token(
    pool: &Pool,
    organization_id: &str,
    refresh_token: Option<&str>,
) -> Result<()> {
    let res = sqlx::query("UPDATE organizations SET gbp_refresh_token = ? WHERE id = ?")
        .bind(refresh_token)
        .bind(organization_id)
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("organization {} not found", organization_id));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// sessions
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_session(pool: &Pool, session: &Session) -> Result<()> {
    sqlx::query(
        "INSERT INTO sessions (token, user_id, organization_id, expires_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&session.token)
    .bind(&session.user_id)
    .bind(&session.organization_id)
    .bind(session.expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Session for `token` if it exists and has not expired at `now`.
#[instrument(skip_all)]
pub async fn find_active_session(
    pool: &Pool,
    token: &str,
    now: DateTime<Utc>,
) -> Result<Option<Session>> {
    let row = sqlx::query(
        "SELECT token, user_id, organization_id, expires_at FROM sessions WHERE token = ?",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let session = Session {
        token: row.try_get("token")?,
        user_id: row.try_get("user_id")?,
        organization_id: row.try_get("organization_id")?,
        expires_at: row.try_get("expires_at")?,
    };
    Ok(Some(session).filter(|s| s.is_active_at(now)))
}

// ---------------------------------------------------------------------------
// listings
// ---------------------------------------------------------------------------

fn listing_from_row(row: &SqliteRow) -> Result<LocalListing> {
    let id: String = row.try_get("id")?;
    let status_str: String = row.try_get("status")?;
    let status = ListingStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("listing {} has unknown status {}", id, status_str))?;
    let attributes_str: String = row.try_get("attributes")?;
    let attributes = parse_attributes(&attributes_str)
        .with_context(|| format!("listing {} has malformed attributes", id))?;

    Ok(LocalListing {
        organization_id: row.try_get("organization_id")?,
        external_id: row
            .try_get::<Option<String>, _>("external_id")?
            .filter(|s| !s.trim().is_empty()),
        display_name: row.try_get("display_name")?,
        status,
        is_verified: row.try_get("is_verified")?,
        last_synced_at: row.try_get("last_synced_at")?,
        attributes,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        id,
    })
}

fn parse_attributes(raw: &str) -> Result<Map<String, Value>> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(anyhow!("expected a JSON object, got {}", other)),
    }
}

#[instrument(skip_all)]
pub async fn list_listings(pool: &Pool, organization_id: &str) -> Result<Vec<LocalListing>> {
    let rows = sqlx::query(&format!(
        "SELECT {LISTING_COLUMNS} FROM listings WHERE organization_id = ? ORDER BY created_at, id"
    ))
    .bind(organization_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(listing_from_row).collect()
}

#[instrument(skip_all)]
pub async fn find_listing(
    pool: &Pool,
    organization_id: &str,
    id: &str,
) -> Result<Option<LocalListing>> {
    let row = sqlx::query(&format!(
        "SELECT {LISTING_COLUMNS} FROM listings WHERE id = ? AND organization_id = ?"
    ))
    .bind(id)
    .bind(organization_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(listing_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn insert_listing(
    pool: &Pool,
    organization_id: &str,
    listing: &NewListing,
) -> Result<LocalListing> {
    let now = Utc::now();
    let id = Uuid::new_v4().to_string();
    let attributes = serde_json::to_string(&listing.attributes)?;
    let row = sqlx::query(&format!(
        "INSERT INTO listings (id, organization_id, external_id, display_name, status, \
         is_verified, last_synced_at, attributes, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {LISTING_COLUMNS}"
    ))
    .bind(&id)
    .bind(organization_id)
    .bind(listing.external_id.as_deref())
    .bind(&listing.display_name)
    .bind(listing.status.as_str())
    .bind(listing.is_verified)
    .bind(listing.last_synced_at)
    .bind(attributes)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .with_context(|| {
        format!(
            "failed to insert listing {:?} for organization {}",
            listing.external_id, organization_id
        )
    })?;
    listing_from_row(&row)
}

/// Apply `changes` to one listing of the organization. Returns `None` when the
/// listing does not exist in that organization.
#[instrument(skip_all)]
pub async fn update_listing(
    pool: &Pool,
    organization_id: &str,
    id: &str,
    changes: &ListingChanges,
) -> Result<Option<LocalListing>> {
    let row = sqlx::query(&format!(
        "UPDATE listings SET \
            external_id = COALESCE(?, external_id), \
            status = COALESCE(?, status), \
            is_verified = COALESCE(?, is_verified), \
            last_synced_at = COALESCE(?, last_synced_at), \
            updated_at = ? \
         WHERE id = ? AND organization_id = ? \
         RETURNING {LISTING_COLUMNS}"
    ))
    .bind(changes.external_id.as_deref())
    .bind(changes.status.map(|s| s.as_str()))
    .bind(changes.is_verified)
    .bind(changes.last_synced_at)
    .bind(Utc::now())
    .bind(id)
    .bind(organization_id)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to update listing {id}"))?;
    row.as_ref().map(listing_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn set_listing_status(
    pool: &Pool,
    organization_id: &str,
    id: &str,
    status: ListingStatus,
) -> Result<Option<LocalListing>> {
    let changes = ListingChanges {
        status: Some(status),
        ..Default::default()
    };
    update_listing(pool, organization_id, id, &changes).await
}

/// Set one key in a listing's attributes, keeping every other key.
#[instrument(skip_all)]
pub async fn set_listing_attribute(
    pool: &Pool,
    organization_id: &str,
    id: &str,
    key: &str,
    value: Value,
) -> Result<Option<LocalListing>> {
    let mut tx = pool.begin().await?;
    let raw: Option<String> =
        sqlx::query_scalar("SELECT attributes FROM listings WHERE id = ? AND organization_id = ?")
            .bind(id)
            .bind(organization_id)
            .fetch_optional(&mut *tx)
            .await?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    let mut attributes = parse_attributes(&raw)
        .with_context(|| format!("listing {} has malformed attributes", id))?;
    attributes.insert(key.to_string(), value);

    let row = sqlx::query(&format!(
        "UPDATE listings SET attributes = ?, updated_at = ? \
         WHERE id = ? AND organization_id = ? RETURNING {LISTING_COLUMNS}"
    ))
    .bind(serde_json::to_string(&attributes)?)
    .bind(Utc::now())
    .bind(id)
    .bind(organization_id)
    .fetch_one(&mut *tx)
    .await?;
    let listing = listing_from_row(&row)?;
    tx.commit().await?;
    Ok(Some(listing))
}

// ---------------------------------------------------------------------------
// sync runs
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_sync_run(pool: &Pool, run: &SyncRun) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO sync_runs (organization_id, started_at, finished_at, outcome, \
         total_locations, synced_count, new_count, existing_count, failed_count, error) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&run.organization_id)
    .bind(run.started_at)
    .bind(run.finished_at)
    .bind(run.outcome.as_str())
    .bind(run.total_locations)
    .bind(run.synced_count)
    .bind(run.new_count)
    .bind(run.existing_count)
    .bind(run.failed_count)
    .bind(run.error.as_deref())
    .fetch_one(pool)
    .await
    .context("failed to record sync run")?;
    Ok(rec.get("id"))
}

/// Most recent runs first.
#[instrument(skip_all)]
pub async fn recent_sync_runs(
    pool: &Pool,
    organization_id: &str,
    limit: i64,
) -> Result<Vec<SyncRun>> {
    let rows = sqlx::query(
        "SELECT organization_id, started_at, finished_at, outcome, total_locations, synced_count, \
         new_count, existing_count, failed_count, error \
         FROM sync_runs WHERE organization_id = ? ORDER BY id DESC LIMIT ?",
    )
    .bind(organization_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let outcome_str: String = row.try_get("outcome")?;
            let outcome = SyncOutcome::parse_outcome(&outcome_str)
                .ok_or_else(|| anyhow!("sync run has unknown outcome {}", outcome_str))?;
            Ok(SyncRun {
                organization_id: row.try_get("organization_id")?,
                started_at: row.try_get("started_at")?,
                finished_at: row.try_get("finished_at")?,
                outcome,
                total_locations: row.try_get("total_locations")?,
                synced_count: row.try_get("synced_count")?,
                new_count: row.try_get("new_count")?,
                existing_count: row.try_get("existing_count")?,
                failed_count: row.try_get("failed_count")?,
                error: row.try_get("error")?,
            })
        })
        .collect()
}
