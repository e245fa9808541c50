use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::repo::{self, Pool};
use crate::model::{ListingChanges, LocalListing, NewListing, SyncRun};
use crate::sync::ListingStore;

/// `ListingStore` backed by the SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteListingStore {
    pool: Pool,
}

impl SqliteListingStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ListingStore for SqliteListingStore {
    async fn find_by_organization(&self, organization_id: &str) -> Result<Vec<LocalListing>> {
        repo::list_listings(&self.pool, organization_id).await
    }

    async fn create(&self, organization_id: &str, listing: &NewListing) -> Result<LocalListing> {
        repo::insert_listing(&self.pool, organization_id, listing).await
    }

    async fn update(
        &self,
        organization_id: &str,
        id: &str,
        changes: &ListingChanges,
    ) -> Result<LocalListing> {
        repo::update_listing(&self.pool, organization_id, id, changes)
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "listing {} not found in organization {}",
                    id,
                    organization_id
                )
            })
    }

    async fn record_sync_run(&self, run: &SyncRun) -> Result<()> {
        repo::insert_sync_run(&self.pool, run).await.map(|_| ())
    }
}
