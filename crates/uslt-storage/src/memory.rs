use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use tokio::sync::Mutex;
use tracing::debug;
use uslt_core::{rank_counts, DailyUpdate, Sponsor, SponsorKey, SponsorRecord, SponsorStats};

use crate::register::{CommitReport, RunBatch, SponsorStore, StoreError, UpsertReport};

#[derive(Debug, Default, Clone)]
struct MemoryState {
    sponsors: BTreeMap<SponsorKey, SponsorRecord>,
    ledger: BTreeMap<NaiveDate, DailyUpdate>,
}

impl MemoryState {
    fn upsert_new(&mut self, entities: &[Sponsor], observed: NaiveDate) -> UpsertReport {
        let mut report = UpsertReport::default();
        for sponsor in entities {
            match self.sponsors.get_mut(&sponsor.key()) {
                Some(existing) => {
                    debug!(key = %sponsor.key(), "sponsor already stored; refreshing");
                    existing.sponsor.town_city = sponsor.town_city.clone();
                    existing.sponsor.county = sponsor.county.clone();
                    existing.sponsor.type_rating = sponsor.type_rating.clone();
                    existing.last_updated_date = observed;
                    report.conflicts += 1;
                }
                None => {
                    self.sponsors
                        .insert(sponsor.key(), sponsor.clone().into_record(observed));
                    report.inserted += 1;
                }
            }
        }
        report
    }

    fn touch_existing(&mut self, snapshot: &[Sponsor], observed: NaiveDate) -> u64 {
        let keys = snapshot.iter().map(Sponsor::key).collect::<HashSet<_>>();
        let mut touched = 0;
        for key in keys {
            if let Some(record) = self.sponsors.get_mut(&key) {
                record.last_updated_date = observed;
                touched += 1;
            }
        }
        touched
    }

    fn record_daily_counts(&mut self, date: NaiveDate, added: i64, removed: i64) -> DailyUpdate {
        let row = DailyUpdate {
            date,
            added_count: added,
            removed_count: removed,
        };
        self.ledger.insert(date, row);
        row
    }
}

/// Process-local store. Used by tests, dry runs and the web smoke tests.
#[derive(Debug, Default)]
pub struct MemorySponsorStore {
    state: Mutex<MemoryState>,
}

impl MemorySponsorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store with existing records and ledger rows.
    pub fn with_records(
        records: impl IntoIterator<Item = SponsorRecord>,
        ledger: impl IntoIterator<Item = DailyUpdate>,
    ) -> Self {
        let state = MemoryState {
            sponsors: records.into_iter().map(|r| (r.key(), r)).collect(),
            ledger: ledger.into_iter().map(|row| (row.date, row)).collect(),
        };
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn get(&self, key: &SponsorKey) -> Option<SponsorRecord> {
        self.state.lock().await.sponsors.get(key).cloned()
    }
}

#[async_trait]
impl SponsorStore for MemorySponsorStore {
    async fn load_all(&self) -> Result<Vec<SponsorRecord>, StoreError> {
        Ok(self.state.lock().await.sponsors.values().cloned().collect())
    }

    async fn contains(&self, key: &SponsorKey) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.sponsors.contains_key(key))
    }

    async fn upsert_new(
        &self,
        entities: &[Sponsor],
        observed: NaiveDate,
    ) -> Result<UpsertReport, StoreError> {
        Ok(self.state.lock().await.upsert_new(entities, observed))
    }

    async fn touch_existing(
        &self,
        snapshot: &[Sponsor],
        observed: NaiveDate,
    ) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.touch_existing(snapshot, observed))
    }

    async fn record_daily_counts(
        &self,
        date: NaiveDate,
        added_count: i64,
        removed_count: i64,
    ) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .record_daily_counts(date, added_count, removed_count);
        Ok(())
    }

    async fn commit_run(&self, batch: &RunBatch) -> Result<CommitReport, StoreError> {
        // One lock for the whole batch: readers see all of it or none of it.
        let mut state = self.state.lock().await;
        let upsert = state.upsert_new(&batch.new_entities, batch.observed);
        let touched = state.touch_existing(&batch.snapshot, batch.observed);
        let ledger =
            state.record_daily_counts(batch.observed, batch.added_count, batch.removed_count);
        Ok(CommitReport {
            upsert,
            touched,
            ledger,
        })
    }

    async fn query_since(&self, cutoff: NaiveDate) -> Result<Vec<SponsorRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state
            .sponsors
            .values()
            .filter(|r| r.first_appeared_date >= cutoff)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.first_appeared_date.cmp(&a.first_appeared_date));
        Ok(rows)
    }

    async fn aggregate_counts(
        &self,
        as_of: NaiveDate,
        top_n: usize,
    ) -> Result<SponsorStats, StoreError> {
        let state = self.state.lock().await;
        let since_7 = as_of - Duration::days(7);
        let since_30 = as_of - Duration::days(30);

        let mut cities = BTreeMap::<String, i64>::new();
        let mut routes = BTreeMap::<String, i64>::new();
        let (mut new_7, mut new_30) = (0i64, 0i64);
        for record in state.sponsors.values() {
            if record.first_appeared_date >= since_7 {
                new_7 += 1;
            }
            if record.first_appeared_date >= since_30 {
                new_30 += 1;
            }
            if !record.sponsor.town_city.is_empty() {
                *cities.entry(record.sponsor.town_city.clone()).or_default() += 1;
            }
            *routes.entry(record.sponsor.route.clone()).or_default() += 1;
        }

        Ok(SponsorStats {
            as_of,
            total_sponsors: state.sponsors.len() as i64,
            new_last_7_days: new_7,
            new_last_30_days: new_30,
            top_cities: rank_counts(cities, Some(top_n)),
            routes: rank_counts(routes, None),
        })
    }

    async fn daily_series(&self) -> Result<Vec<DailyUpdate>, StoreError> {
        Ok(self.state.lock().await.ledger.values().copied().collect())
    }
}
