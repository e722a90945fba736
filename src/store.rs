//! Work store collaborator.
//!
//! The orchestrator sees the store only through [`WorkStore`]: pending
//! counts, batch claims and single-item compare-and-set transitions. Stage
//! handlers additionally insert discovered candidates and keep per-article
//! business data ([`ArticleRecord`]) in it.
//!
//! [`MemoryWorkStore`] is the in-process implementation, seeded from the
//! dataset catalog.

use crate::errors::WorkStoreError;
use crate::models::{
    ArticleRecord, Catalog, Dataset, DatasetId, ItemId, NewWorkItem, Stage, WorkItem, WorkStatus,
};
use crate::utils::host_of;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Which datasets a count or claim may draw from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimFilter {
    /// Restrict to one explicitly targeted dataset.
    pub dataset: Option<DatasetId>,
    /// Only datasets with `cron_enabled`.
    pub cron_only: bool,
}

impl ClaimFilter {
    /// Unscoped scheduling: every cron-enabled dataset.
    pub fn scheduled() -> Self {
        Self {
            dataset: None,
            cron_only: true,
        }
    }

    /// Explicit targeting of one dataset, regardless of `cron_enabled`.
    pub fn targeted(dataset: impl Into<DatasetId>) -> Self {
        Self {
            dataset: Some(dataset.into()),
            cron_only: false,
        }
    }

    pub fn admits(&self, dataset: &Dataset) -> bool {
        if let Some(id) = &self.dataset {
            if *id != dataset.id {
                return false;
            }
        }
        !self.cron_only || dataset.cron_enabled
    }
}

#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Items waiting for `stage` in datasets admitted by `filter`.
    async fn count_pending(&self, stage: Stage, filter: &ClaimFilter) -> Result<usize, WorkStoreError>;

    /// Atomically move up to `limit` pending items of `stage` into its
    /// claimed status, oldest first, and return them.
    async fn claim(
        &self,
        stage: Stage,
        filter: &ClaimFilter,
        limit: usize,
    ) -> Result<Vec<WorkItem>, WorkStoreError>;

    /// Move one item from `from` to `to`; fails if it is not in `from`.
    async fn transition(&self, id: ItemId, from: WorkStatus, to: WorkStatus) -> Result<(), WorkStoreError>;

    /// Insert discovered candidates, skipping URLs already known. Returns
    /// the number inserted.
    async fn insert_candidates(&self, items: Vec<NewWorkItem>) -> Result<usize, WorkStoreError>;

    async fn dataset(&self, id: &str) -> Result<Dataset, WorkStoreError>;

    async fn put_record(&self, id: ItemId, record: ArticleRecord) -> Result<(), WorkStoreError>;

    async fn record(&self, id: ItemId) -> Result<Option<ArticleRecord>, WorkStoreError>;

    async fn items_in(&self, status: WorkStatus) -> Result<Vec<WorkItem>, WorkStoreError>;

    /// Return scanned seeds to `Seed` so discovery polls them again.
    async fn rearm_seeds(&self) -> Result<usize, WorkStoreError>;

    /// Return every item still held in a claimed status to its stage's
    /// pending status. Used to recover after a cycle aborted mid-batch.
    async fn release_claimed(&self) -> Result<usize, WorkStoreError>;
}

#[derive(Debug, Default)]
struct Inner {
    next_id: ItemId,
    items: BTreeMap<ItemId, WorkItem>,
    by_url: HashMap<String, ItemId>,
    datasets: BTreeMap<DatasetId, Dataset>,
    records: HashMap<ItemId, ArticleRecord>,
}

impl Inner {
    fn insert(&mut self, url: &str, dataset_id: &str, status: WorkStatus) -> Option<ItemId> {
        if self.by_url.contains_key(url) {
            return None;
        }
        let Some(domain) = host_of(url) else {
            warn!(url, "Skipping URL without a host");
            return None;
        };
        self.next_id += 1;
        let id = self.next_id;
        let now = Utc::now();
        self.items.insert(
            id,
            WorkItem {
                id,
                url: url.to_string(),
                domain,
                dataset_id: dataset_id.to_string(),
                status,
                created_at: now,
                updated_at: now,
            },
        );
        self.by_url.insert(url.to_string(), id);
        Some(id)
    }

    fn pending<'a>(
        &'a self,
        stage: Stage,
        filter: &'a ClaimFilter,
    ) -> impl Iterator<Item = &'a WorkItem> + 'a {
        let status = stage.pending_status();
        self.items.values().filter(move |item| {
            item.status == status
                && self
                    .datasets
                    .get(&item.dataset_id)
                    .is_some_and(|d| filter.admits(d))
        })
    }
}

/// In-memory [`WorkStore`].
#[derive(Debug, Default)]
pub struct MemoryWorkStore {
    inner: Mutex<Inner>,
}

impl MemoryWorkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every dataset and insert one `Seed` item per seed URL.
    pub fn from_catalog(catalog: &Catalog) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.lock();
            for dataset in &catalog.datasets {
                inner.datasets.insert(dataset.id.clone(), dataset.clone());
                for seed in &dataset.seeds {
                    inner.insert(seed, &dataset.id, WorkStatus::Seed);
                }
            }
            info!(
                datasets = inner.datasets.len(),
                seeds = inner.items.len(),
                "Seeded work store from catalog"
            );
        }
        store
    }

    /// Insert an item directly in `status`. Used when importing existing work.
    pub fn insert_with_status(&self, url: &str, dataset_id: &str, status: WorkStatus) -> Option<ItemId> {
        self.inner.lock().insert(url, dataset_id, status)
    }

    pub fn item(&self, id: ItemId) -> Option<WorkItem> {
        self.inner.lock().items.get(&id).cloned()
    }

    /// Item counts per status, for cycle summaries.
    pub fn status_counts(&self) -> BTreeMap<String, usize> {
        let inner = self.inner.lock();
        let mut counts = BTreeMap::new();
        for item in inner.items.values() {
            *counts.entry(format!("{:?}", item.status)).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl WorkStore for MemoryWorkStore {
    async fn count_pending(&self, stage: Stage, filter: &ClaimFilter) -> Result<usize, WorkStoreError> {
        if let Some(id) = &filter.dataset {
            if !self.inner.lock().datasets.contains_key(id) {
                return Err(WorkStoreError::UnknownDataset(id.clone()));
            }
        }
        Ok(self.inner.lock().pending(stage, filter).count())
    }

    async fn claim(
        &self,
        stage: Stage,
        filter: &ClaimFilter,
        limit: usize,
    ) -> Result<Vec<WorkItem>, WorkStoreError> {
        let mut inner = self.inner.lock();
        let ids: Vec<ItemId> = inner.pending(stage, filter).take(limit).map(|i| i.id).collect();
        let now = Utc::now();
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = inner.items.get_mut(&id) {
                item.status = stage.claimed_status();
                item.updated_at = now;
                claimed.push(item.clone());
            }
        }
        debug!(%stage, claimed = claimed.len(), "Claimed batch");
        Ok(claimed)
    }

    async fn transition(&self, id: ItemId, from: WorkStatus, to: WorkStatus) -> Result<(), WorkStoreError> {
        let mut inner = self.inner.lock();
        let item = inner
            .items
            .get_mut(&id)
            .ok_or(WorkStoreError::UnknownItem(id))?;
        if item.status != from {
            return Err(WorkStoreError::StatusConflict {
                id,
                expected: from,
                found: item.status,
            });
        }
        item.status = to;
        item.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_candidates(&self, items: Vec<NewWorkItem>) -> Result<usize, WorkStoreError> {
        let mut inner = self.inner.lock();
        if let Some(unknown) = items.iter().find(|i| !inner.datasets.contains_key(&i.dataset_id)) {
            return Err(WorkStoreError::UnknownDataset(unknown.dataset_id.clone()));
        }
        let mut inserted = 0;
        for item in items {
            if inner
                .insert(&item.url, &item.dataset_id, WorkStatus::Candidate)
                .is_some()
            {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn dataset(&self, id: &str) -> Result<Dataset, WorkStoreError> {
        self.inner
            .lock()
            .datasets
            .get(id)
            .cloned()
            .ok_or_else(|| WorkStoreError::UnknownDataset(id.to_string()))
    }

    async fn put_record(&self, id: ItemId, record: ArticleRecord) -> Result<(), WorkStoreError> {
        let mut inner = self.inner.lock();
        if !inner.items.contains_key(&id) {
            return Err(WorkStoreError::UnknownItem(id));
        }
        inner.records.insert(id, record);
        Ok(())
    }

    async fn record(&self, id: ItemId) -> Result<Option<ArticleRecord>, WorkStoreError> {
        Ok(self.inner.lock().records.get(&id).cloned())
    }

    async fn items_in(&self, status: WorkStatus) -> Result<Vec<WorkItem>, WorkStoreError> {
        Ok(self
            .inner
            .lock()
            .items
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect())
    }

    async fn rearm_seeds(&self) -> Result<usize, WorkStoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let mut rearmed = 0;
        for item in inner.items.values_mut() {
            if item.status == WorkStatus::Scanned {
                item.status = WorkStatus::Seed;
                item.updated_at = now;
                rearmed += 1;
            }
        }
        Ok(rearmed)
    }

    async fn release_claimed(&self) -> Result<usize, WorkStoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let mut released = 0;
        for item in inner.items.values_mut() {
            if let Some(stage) = Stage::ALL.into_iter().find(|s| s.claimed_status() == item.status) {
                item.status = stage.pending_status();
                item.updated_at = now;
                released += 1;
            }
        }
        if released > 0 {
            info!(released, "Released items stranded in a claimed status");
        }
        Ok(released)
    }
}
