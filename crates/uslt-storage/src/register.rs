//! The [`SponsorStore`] contract shared by every backend.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use uslt_core::{DailyUpdate, Sponsor, SponsorKey, SponsorRecord, SponsorStats};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Per-row results of [`SponsorStore::upsert_new`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub inserted: u64,
    /// Key already present; mutable fields were refreshed instead.
    pub conflicts: u64,
    /// Row could be neither inserted nor refreshed; skipped.
    pub failed: u64,
}

/// Everything one pipeline run writes, committed as a unit.
#[derive(Debug, Clone)]
pub struct RunBatch {
    pub observed: NaiveDate,
    pub new_entities: Vec<Sponsor>,
    pub snapshot: Vec<Sponsor>,
    pub added_count: i64,
    pub removed_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub upsert: UpsertReport,
    pub touched: u64,
    pub ledger: DailyUpdate,
}

/// Durable keyed sponsor storage plus the daily change ledger.
///
/// Writers are assumed to be serialized externally (one pipeline run at a
/// time). Reads never mutate.
#[async_trait]
pub trait SponsorStore: Send + Sync {
    /// Every persisted sponsor, present or lapsed.
    async fn load_all(&self) -> Result<Vec<SponsorRecord>, StoreError>;

    async fn contains(&self, key: &SponsorKey) -> Result<bool, StoreError>;

    /// Insert each entity with `first = last = observed`. A key that already
    /// exists keeps its `first_appeared_date` and has its mutable fields and
    /// `last_updated_date` refreshed. Row failures are counted, not returned.
    async fn upsert_new(
        &self,
        entities: &[Sponsor],
        observed: NaiveDate,
    ) -> Result<UpsertReport, StoreError>;

    /// Set `last_updated_date = observed` for every snapshot entity already
    /// stored. Returns the number of stored rows modified.
    async fn touch_existing(
        &self,
        snapshot: &[Sponsor],
        observed: NaiveDate,
    ) -> Result<u64, StoreError>;

    /// Replace the ledger row for `date`.
    async fn record_daily_counts(
        &self,
        date: NaiveDate,
        added_count: i64,
        removed_count: i64,
    ) -> Result<(), StoreError>;

    /// `upsert_new` + `touch_existing` + `record_daily_counts`, all or nothing.
    async fn commit_run(&self, batch: &RunBatch) -> Result<CommitReport, StoreError>;

    /// Sponsors first seen on or after `cutoff`, newest first.
    async fn query_since(&self, cutoff: NaiveDate) -> Result<Vec<SponsorRecord>, StoreError>;

    async fn aggregate_counts(
        &self,
        as_of: NaiveDate,
        top_n: usize,
    ) -> Result<SponsorStats, StoreError>;

    /// Ledger rows, oldest first.
    async fn daily_series(&self) -> Result<Vec<DailyUpdate>, StoreError>;
}
