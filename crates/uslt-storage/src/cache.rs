//! Time-bounded cache over the dashboard read paths.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::sync::Mutex;
use uslt_core::{Clock, DailyUpdate, Sponsor, SponsorKey, SponsorRecord, SponsorStats};

use crate::register::{CommitReport, RunBatch, SponsorStore, StoreError, UpsertReport};

#[derive(Debug, Clone)]
struct Cached<T> {
    value: T,
    stored_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CacheState {
    /// Bumped on every invalidation. A read that started under an older
    /// generation must not publish its result.
    generation: u64,
    since: HashMap<NaiveDate, Cached<Vec<SponsorRecord>>>,
    stats: HashMap<(NaiveDate, usize), Cached<SponsorStats>>,
    series: Option<Cached<Vec<DailyUpdate>>>,
}

impl CacheState {
    fn evict_expired(&mut self, now: DateTime<Utc>, ttl: Duration) {
        let live = |stored_at: DateTime<Utc>| now - stored_at < ttl;
        self.since.retain(|_, entry| live(entry.stored_at));
        self.stats.retain(|_, entry| live(entry.stored_at));
        if self.series.as_ref().is_some_and(|entry| !live(entry.stored_at)) {
            self.series = None;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.since.len() + self.stats.len() + usize::from(self.series.is_some())
    }
}

/// Wraps a store and memoizes `query_since`, `aggregate_counts` and
/// `daily_series` for `ttl` as measured by the injected clock.
///
/// Any write made through the wrapper clears every entry, and a read racing
/// such a write never repopulates the cache with what it saw. Expired entries
/// are dropped whenever a new one is stored. `load_all` and `contains` always
/// go to the inner store.
pub struct CachedSponsorStore {
    inner: Arc<dyn SponsorStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl CachedSponsorStore {
    pub fn new(inner: Arc<dyn SponsorStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            inner,
            clock,
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        *state = CacheState {
            generation: state.generation.wrapping_add(1),
            ..CacheState::default()
        };
    }

    /// Runs `store` on the state only if no invalidation happened since
    /// `generation` was read.
    async fn publish(
        &self,
        generation: u64,
        store: impl FnOnce(&mut CacheState, DateTime<Utc>),
    ) {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return;
        }
        let now = self.clock.now();
        state.evict_expired(now, self.ttl);
        store(&mut state, now);
    }

    fn fresh<T: Clone>(&self, entry: Option<&Cached<T>>) -> Option<T> {
        let entry = entry?;
        (self.clock.now() - entry.stored_at < self.ttl).then(|| entry.value.clone())
    }
}

fn stamp<T>(value: T, stored_at: DateTime<Utc>) -> Cached<T> {
    Cached { value, stored_at }
}

#[async_trait]
impl SponsorStore for CachedSponsorStore {
    async fn load_all(&self) -> Result<Vec<SponsorRecord>, StoreError> {
        self.inner.load_all().await
    }

    async fn contains(&self, key: &SponsorKey) -> Result<bool, StoreError> {
        self.inner.contains(key).await
    }

    async fn upsert_new(
        &self,
        entities: &[Sponsor],
        observed: NaiveDate,
    ) -> Result<UpsertReport, StoreError> {
        let result = self.inner.upsert_new(entities, observed).await;
        self.invalidate().await;
        result
    }

    async fn touch_existing(
        &self,
        snapshot: &[Sponsor],
        observed: NaiveDate,
    ) -> Result<u64, StoreError> {
        let result = self.inner.touch_existing(snapshot, observed).await;
        self.invalidate().await;
        result
    }

    async fn record_daily_counts(
        &self,
        date: NaiveDate,
        added_count: i64,
        removed_count: i64,
    ) -> Result<(), StoreError> {
        let result = self
            .inner
            .record_daily_counts(date, added_count, removed_count)
            .await;
        self.invalidate().await;
        result
    }

    async fn commit_run(&self, batch: &RunBatch) -> Result<CommitReport, StoreError> {
        let result = self.inner.commit_run(batch).await;
        self.invalidate().await;
        result
    }

    async fn query_since(&self, cutoff: NaiveDate) -> Result<Vec<SponsorRecord>, StoreError> {
        let generation = {
            let state = self.state.lock().await;
            if let Some(hit) = self.fresh(state.since.get(&cutoff)) {
                return Ok(hit);
            }
            state.generation
        };
        let rows = self.inner.query_since(cutoff).await?;
        let value = rows.clone();
        self.publish(generation, |state, now| {
            state.since.insert(cutoff, stamp(value, now));
        })
        .await;
        Ok(rows)
    }

    async fn aggregate_counts(
        &self,
        as_of: NaiveDate,
        top_n: usize,
    ) -> Result<SponsorStats, StoreError> {
        let generation = {
            let state = self.state.lock().await;
            if let Some(hit) = self.fresh(state.stats.get(&(as_of, top_n))) {
                return Ok(hit);
            }
            state.generation
        };
        let stats = self.inner.aggregate_counts(as_of, top_n).await?;
        let value = stats.clone();
        self.publish(generation, |state, now| {
            state.stats.insert((as_of, top_n), stamp(value, now));
        })
        .await;
        Ok(stats)
    }

    async fn daily_series(&self) -> Result<Vec<DailyUpdate>, StoreError> {
        let generation = {
            let state = self.state.lock().await;
            if let Some(hit) = self.fresh(state.series.as_ref()) {
                return Ok(hit);
            }
            state.generation
        };
        let series = self.inner.daily_series().await?;
        let value = series.clone();
        self.publish(generation, |state, now| {
            state.series = Some(stamp(value, now));
        })
        .await;
        Ok(series)
    }
}
