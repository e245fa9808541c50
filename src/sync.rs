//! Sync driver: one pass of `auth → fetch → reconcile → apply → report` for a
//! single organization.
//!
//! Auth and fetch failures end the pass before anything is written. Once the
//! plan exists, every operation is applied independently; a failed write is
//! recorded in the report and the pass carries on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{error, info, instrument, warn};

use crate::gbp::{ListingSource, SourceError};
use crate::model::{ListingChanges, LocalListing, NewListing, SyncOutcome, SyncRun};
use crate::reconcile::{reconcile, Operation, Plan, ReconcileOptions};

/// Tenant-scoped persistence the driver writes through.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn find_by_organization(&self, organization_id: &str) -> Result<Vec<LocalListing>>;

    async fn create(&self, organization_id: &str, listing: &NewListing) -> Result<LocalListing>;

    async fn update(
        &self,
        organization_id: &str,
        id: &str,
        changes: &ListingChanges,
    ) -> Result<LocalListing>;

    /// Append an entry to the organization's sync activity log.
    async fn record_sync_run(&self, run: &SyncRun) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("business profile unavailable: {reason}")]
    UpstreamUnavailable { reason: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SyncError {
    pub fn upstream(reason: impl Into<String>) -> Self {
        SyncError::UpstreamUnavailable {
            reason: reason.into(),
        }
    }
}

impl From<SourceError> for SyncError {
    fn from(err: SourceError) -> Self {
        SyncError::upstream(err.to_string())
    }
}

/// One write that did not go through.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecordFailure {
    pub external_id: String,
    pub operation: &'static str,
    pub message: String,
}

/// What the HTTP layer and the CLI hand back to the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub success: bool,
    pub total_locations: usize,
    pub synced_count: usize,
    pub new_count: usize,
    pub existing_count: usize,
    pub failed_count: usize,
    pub failures: Vec<RecordFailure>,
    pub business_profiles: Vec<LocalListing>,
}

/// Per-organization advisory locks. Passes for the same organization run one
/// at a time; different organizations do not wait on each other.
#[derive(Debug, Clone, Default)]
pub struct SyncLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl SyncLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, organization_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(organization_id.to_string())
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Collaborators for a pass.
pub struct SyncContext<'a> {
    pub store: &'a dyn ListingStore,
    pub source: &'a dyn ListingSource,
    pub locks: &'a SyncLocks,
    pub options: ReconcileOptions,
}

/// Run one sync pass for `organization_id`, using its stored refresh token.
#[instrument(skip_all, fields(organization_id = %organization_id))]
pub async fn run_sync(
    ctx: &SyncContext<'_>,
    organization_id: &str,
    refresh_token: Option<&str>,
) -> Result<SyncReport, SyncError> {
    let _guard = ctx.locks.acquire(organization_id).await;
    let started_at = Utc::now();

    let result = run_pass(ctx, organization_id, refresh_token, started_at).await;

    let run = sync_run_entry(organization_id, started_at, Utc::now(), &result);
    if let Err(err) = ctx.store.record_sync_run(&run).await {
        warn!(?err, "failed to record sync run");
    }

    match &result {
        Ok(report) => info!(
            total = report.total_locations,
            synced = report.synced_count,
            new = report.new_count,
            existing = report.existing_count,
            failed = report.failed_count,
            "sync pass finished"
        ),
        Err(SyncError::Internal(err)) => error!(?err, "sync pass failed"),
        Err(err) => warn!(%err, "sync pass aborted"),
    }
    result
}

async fn run_pass(
    ctx: &SyncContext<'_>,
    organization_id: &str,
    refresh_token: Option<&str>,
    now: DateTime<Utc>,
) -> Result<SyncReport, SyncError> {
    // AUTH_CHECK
    let Some(refresh_token) = refresh_token.filter(|t| !t.trim().is_empty()) else {
        return Err(SyncError::upstream(
            "no Business Profile connection for this organization",
        ));
    };
    let token = ctx.source.authenticate(refresh_token).await?;

    // FETCH_EXTERNAL
    let incoming = ctx.source.fetch_listings(&token).await?;

    // RECONCILE
    let existing = ctx.store.find_by_organization(organization_id).await?;
    let plan = reconcile(organization_id, &existing, &incoming, now, ctx.options);
    info!(
        incoming = incoming.len(),
        existing = existing.len(),
        creates = plan.created,
        updates = plan.updated(),
        skipped = plan.skipped,
        "planned sync"
    );

    // APPLY
    let failures = apply_plan(ctx.store, organization_id, &plan).await;

    // REPORT
    // Writes are committed by now, so a failed reload must not turn the pass
    // into an error.
    let business_profiles = match ctx.store.find_by_organization(organization_id).await {
        Ok(listings) => listings,
        Err(err) => {
            warn!(?err, "failed to reload listings after apply");
            Vec::new()
        }
    };
    Ok(build_report(&plan, failures, business_profiles))
}

/// Apply every operation, collecting the ones that failed.
#[instrument(skip_all)]
pub async fn apply_plan(
    store: &dyn ListingStore,
    organization_id: &str,
    plan: &Plan,
) -> Vec<RecordFailure> {
    let mut failures = Vec::new();
    for op in &plan.operations {
        let (operation, res) = match op {
            Operation::Create(listing) => ("create", store.create(organization_id, listing).await),
            Operation::Update {
                target_id, changes, ..
            } => (
                "update",
                store.update(organization_id, target_id, changes).await,
            ),
        };
        if let Err(err) = res {
            warn!(
                ?err,
                external_id = op.external_id(),
                operation,
                "failed to apply listing operation"
            );
            failures.push(RecordFailure {
                external_id: op.external_id().to_string(),
                operation,
                message: format!("failed to {operation} listing"),
            });
        }
    }
    failures
}

fn build_report(
    plan: &Plan,
    failures: Vec<RecordFailure>,
    business_profiles: Vec<LocalListing>,
) -> SyncReport {
    let total_locations = plan.total_incoming;
    let new_count = plan.created;
    SyncReport {
        success: true,
        total_locations,
        synced_count: plan.operations.len() - failures.len(),
        new_count,
        existing_count: total_locations - new_count,
        failed_count: failures.len(),
        failures,
        business_profiles,
    }
}

fn sync_run_entry(
    organization_id: &str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    result: &Result<SyncReport, SyncError>,
) -> SyncRun {
    let mut run = SyncRun {
        organization_id: organization_id.to_string(),
        started_at,
        finished_at,
        outcome: SyncOutcome::Succeeded,
        total_locations: 0,
        synced_count: 0,
        new_count: 0,
        existing_count: 0,
        failed_count: 0,
        error: None,
    };
    match result {
        Ok(report) => {
            run.total_locations = report.total_locations as i64;
            run.synced_count = report.synced_count as i64;
            run.new_count = report.new_count as i64;
            run.existing_count = report.existing_count as i64;
            run.failed_count = report.failed_count as i64;
        }
        Err(err) => {
            run.outcome = SyncOutcome::Failed;
            run.error = Some(match err {
                SyncError::Internal(_) => "internal error".to_string(),
                other => other.to_string(),
            });
        }
    }
    run
}
