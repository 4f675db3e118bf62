use std::collections::HashSet;

use futures::{stream, StreamExt};
use serde::Serialize;

use crate::{storage::ObjectStorageClient, store::RestStore};

/// A stored prefix whose owning row no longer exists. Recomputed on every
/// run, never persisted.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrphanedPrefix {
    pub path: String,
    pub owner_kind: OwnerKind,
    pub owner_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    User,
    Listing,
    Job,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub scanned: u64,
    pub orphaned: Vec<OrphanedPrefix>,
    pub deleted: u64,
    pub failed: u64,
    pub dry_run: bool,
}

/// Diffs the object store against live database IDs and deletes prefixes
/// nothing owns anymore: uploads stranded by abandoned flows or deleted rows.
#[derive(Clone)]
pub struct StorageReconciler {
    store: RestStore,
    storage: ObjectStorageClient,
    delete_concurrency: usize,
}

impl StorageReconciler {
    pub fn new(store: RestStore, storage: ObjectStorageClient, delete_concurrency: usize) -> Self {
        Self {
            store,
            storage,
            delete_concurrency: delete_concurrency.max(1),
        }
    }

    /// Full reconciliation pass. `dry_run` (the default at the HTTP surface)
    /// reports orphans without touching them.
    pub async fn scan(&self, dry_run: bool) -> anyhow::Result<ScanReport> {
        let live_users = self.store.account_ids().await?;
        let user_prefixes = self.storage.list_prefixes("").await?;

        let mut scanned = 0u64;
        let mut orphaned = Vec::new();

        for prefix in &user_prefixes {
            scanned += 1;
            let user_id = prefix_id(prefix);
            if user_id.is_empty() {
                continue;
            }

            if !live_users.contains(user_id) {
                // The whole user tree is orphaned; no need to descend.
                orphaned.push(OrphanedPrefix {
                    path: prefix.clone(),
                    owner_kind: OwnerKind::User,
                    owner_id: user_id.to_string(),
                });
                continue;
            }

            let live_listings = self.store.listing_ids_for_user(user_id).await?;
            scanned += self
                .collect_orphans(
                    &format!("{user_id}/listings/"),
                    OwnerKind::Listing,
                    &live_listings,
                    &mut orphaned,
                )
                .await?;

            let live_jobs = self.store.job_ids_for_user(user_id).await?;
            scanned += self
                .collect_orphans(
                    &format!("{user_id}/jobs/"),
                    OwnerKind::Job,
                    &live_jobs,
                    &mut orphaned,
                )
                .await?;
        }

        let (deleted, failed) = if dry_run {
            (0, 0)
        } else {
            self.delete_orphans(&orphaned).await
        };

        Ok(ScanReport {
            scanned,
            orphaned,
            deleted,
            failed,
            dry_run,
        })
    }

    async fn collect_orphans(
        &self,
        parent: &str,
        owner_kind: OwnerKind,
        live_ids: &HashSet<String>,
        orphaned: &mut Vec<OrphanedPrefix>,
    ) -> anyhow::Result<u64> {
        let prefixes = self.storage.list_prefixes(parent).await?;
        let scanned = prefixes.len() as u64;
        for prefix in prefixes {
            let id = prefix_id(&prefix);
            if !id.is_empty() && !live_ids.contains(id) {
                orphaned.push(OrphanedPrefix {
                    path: prefix.clone(),
                    owner_kind,
                    owner_id: id.to_string(),
                });
            }
        }
        Ok(scanned)
    }

    /// Deletes every key under each orphaned prefix, `delete_concurrency`
    /// keys in flight at a time. Returns (deleted, failed) key counts.
    async fn delete_orphans(&self, orphaned: &[OrphanedPrefix]) -> (u64, u64) {
        let mut deleted = 0u64;
        let mut failed = 0u64;

        for orphan in orphaned {
            let keys = match self.storage.list_keys(&orphan.path).await {
                Ok(keys) => keys,
                Err(error) => {
                    tracing::error!(path = %orphan.path, error = %error, "failed to list orphaned prefix");
                    failed += 1;
                    continue;
                }
            };

            let results = stream::iter(keys)
                .map(|key| {
                    let storage = self.storage.clone();
                    async move {
                        let result = storage.delete_object(&key).await;
                        (key, result)
                    }
                })
                .buffer_unordered(self.delete_concurrency)
                .collect::<Vec<_>>()
                .await;

            for (key, result) in results {
                match result {
                    Ok(()) => deleted += 1,
                    Err(error) => {
                        tracing::error!(key = %key, error = %error, "failed to delete orphaned object");
                        failed += 1;
                    }
                }
            }
        }

        (deleted, failed)
    }
}

/// Last path segment of a listing prefix: "u1/listings/l2/" -> "l2".
fn prefix_id(prefix: &str) -> &str {
    prefix
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
}
