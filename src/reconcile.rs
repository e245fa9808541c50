//! Listing reconciliation: diff Business Profile locations against the
//! listings an organization already has and plan the writes that bring the
//! two in line.
//!
//! Planning is pure. Applying the plan is the sync driver's job.
//!
//! Policy:
//! - a location nobody has seen before becomes a new ACTIVE, verified listing;
//! - a location that matches an existing listing only touches its sync
//!   status (`VERIFIED`, verified flag, `last_synced_at`);
//! - `attributes` and `display_name` of existing listings are never written;
//! - listings missing from the fetch are left alone (absence is not deletion).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Map;
use tracing::warn;

use crate::config::SyncSettings;
use crate::model::{ExternalListing, ListingChanges, ListingStatus, LocalListing, NewListing};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Allow rule (b): match unlinked listings by exact display name.
    pub match_display_name: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            match_display_name: true,
        }
    }
}

impl From<&SyncSettings> for ReconcileOptions {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            match_display_name: settings.match_display_name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    ExternalId,
    DisplayName,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Create(NewListing),
    Update {
        target_id: String,
        /// Location the update was planned for.
        external_id: String,
        matched_by: MatchKind,
        changes: ListingChanges,
    },
}

impl Operation {
    /// Business Profile location this operation came from.
    pub fn external_id(&self) -> &str {
        match self {
            Operation::Create(listing) => listing.external_id.as_deref().unwrap_or_default(),
            Operation::Update { external_id, .. } => external_id,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self, Operation::Create(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub operations: Vec<Operation>,
    /// Distinct incoming locations considered.
    pub total_incoming: usize,
    pub created: usize,
    /// Incoming records dropped as blank or repeated.
    pub skipped: usize,
}

impl Plan {
    pub fn updated(&self) -> usize {
        self.total_incoming - self.created
    }
}

/// Plan the writes for one organization.
///
/// Listings in `existing` that belong to another organization are ignored, so
/// no operation can ever target them.
pub fn reconcile(
    organization_id: &str,
    existing: &[LocalListing],
    incoming: &[ExternalListing],
    now: DateTime<Utc>,
    options: ReconcileOptions,
) -> Plan {
    let scoped: Vec<&LocalListing> = existing
        .iter()
        .filter(|l| l.organization_id == organization_id)
        .collect();
    let foreign = existing.len() - scoped.len();
    if foreign > 0 {
        warn!(
            organization_id,
            foreign, "ignoring listings from other organizations"
        );
    }

    let mut by_external: HashMap<&str, &LocalListing> = HashMap::new();
    let mut unlinked_by_name: HashMap<&str, Vec<&LocalListing>> = HashMap::new();
    for listing in scoped.iter().copied() {
        match listing.external_id.as_deref() {
            Some(ext) => {
                by_external.entry(ext).or_insert(listing);
            }
            None => unlinked_by_name
                .entry(listing.display_name.as_str())
                .or_default()
                .push(listing),
        }
    }

    let mut plan = Plan::default();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut claimed: HashSet<&str> = HashSet::new();

    for record in incoming {
        let external_id = record.external_id.trim();
        if external_id.is_empty() {
            warn!(
                organization_id,
                display_name = %record.display_name,
                "skipping location without id"
            );
            plan.skipped += 1;
            continue;
        }
        if !seen.insert(external_id) {
            warn!(organization_id, external_id, "skipping repeated location");
            plan.skipped += 1;
            continue;
        }
        plan.total_incoming += 1;

        let found = by_external
            .get(external_id)
            .map(|l| (*l, MatchKind::ExternalId))
            .or_else(|| {
                if !options.match_display_name {
                    return None;
                }
                match_by_name(&unlinked_by_name, &record.display_name, &claimed, organization_id)
                    .map(|l| (l, MatchKind::DisplayName))
            });

        match found {
            Some((listing, matched_by)) => {
                claimed.insert(listing.id.as_str());
                let link = match matched_by {
                    MatchKind::ExternalId => None,
                    MatchKind::DisplayName => Some(external_id.to_string()),
                };
                plan.operations.push(Operation::Update {
                    target_id: listing.id.clone(),
                    external_id: external_id.to_string(),
                    matched_by,
                    changes: ListingChanges {
                        external_id: link,
                        status: Some(ListingStatus::Verified),
                        is_verified: Some(true),
                        last_synced_at: Some(now),
                    },
                });
            }
            None => {
                plan.created += 1;
                plan.operations.push(Operation::Create(NewListing {
                    external_id: Some(external_id.to_string()),
                    display_name: record.display_name.clone(),
                    status: ListingStatus::Active,
                    is_verified: true,
                    last_synced_at: Some(now),
                    attributes: Map::new(),
                }));
            }
        }
    }

    plan
}

/// Rule (b). Only an unambiguous, still unclaimed, unlinked listing matches.
fn match_by_name<'a>(
    unlinked_by_name: &HashMap<&str, Vec<&'a LocalListing>>,
    display_name: &str,
    claimed: &HashSet<&str>,
    organization_id: &str,
) -> Option<&'a LocalListing> {
    let candidates = unlinked_by_name.get(display_name)?;
    if candidates.len() > 1 {
        warn!(
            organization_id,
            display_name,
            candidates = candidates.len(),
            "display name is ambiguous; creating a new listing instead of guessing"
        );
        return None;
    }
    let listing = candidates[0];
    if claimed.contains(listing.id.as_str()) {
        return None;
    }
    Some(listing)
}
