//! PostgreSQL backend. Schema lives in `migrations/` at the workspace root.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Connection, PgConnection, PgPool, Row};
use tracing::{debug, info, warn};
use uslt_core::{DailyUpdate, NameCount, Sponsor, SponsorKey, SponsorRecord, SponsorStats};

use crate::register::{CommitReport, RunBatch, SponsorStore, StoreError, UpsertReport};

const SELECT_SPONSORS: &str = r#"
    SELECT organisation_name, town_city, county, type_rating, route,
           first_appeared_date, last_updated_date
      FROM sponsor_register
"#;

#[derive(Debug, Clone)]
pub struct PgSponsorStore {
    pool: PgPool,
}

enum RowOutcome {
    Inserted,
    Refreshed,
}

impl PgSponsorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("sponsor register schema is up to date");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn record_from_row(row: &PgRow) -> Result<SponsorRecord, StoreError> {
    Ok(SponsorRecord {
        sponsor: Sponsor {
            organisation_name: row.try_get("organisation_name")?,
            town_city: row.try_get("town_city")?,
            county: row.try_get("county")?,
            type_rating: row.try_get("type_rating")?,
            route: row.try_get("route")?,
        },
        first_appeared_date: row.try_get("first_appeared_date")?,
        last_updated_date: row.try_get("last_updated_date")?,
    })
}

fn name_counts(rows: Vec<PgRow>, column: &str) -> Result<Vec<NameCount>, StoreError> {
    rows.iter()
        .map(|row| {
            Ok(NameCount {
                name: row.try_get(column)?,
                count: row.try_get("count")?,
            })
        })
        .collect()
}

async fn insert_or_refresh(
    conn: &mut PgConnection,
    sponsor: &Sponsor,
    observed: NaiveDate,
) -> Result<RowOutcome, sqlx::Error> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO sponsor_register
            (organisation_name, town_city, county, type_rating, route,
             first_appeared_date, last_updated_date)
        VALUES ($1, $2, $3, $4, $5, $6, $6)
        ON CONFLICT (organisation_name, route) DO NOTHING
        "#,
    )
    .bind(&sponsor.organisation_name)
    .bind(&sponsor.town_city)
    .bind(&sponsor.county)
    .bind(&sponsor.type_rating)
    .bind(&sponsor.route)
    .bind(observed)
    .execute(&mut *conn)
    .await?;
    if inserted.rows_affected() > 0 {
        return Ok(RowOutcome::Inserted);
    }

    sqlx::query(
        r#"
        UPDATE sponsor_register
           SET town_city = $1,
               county = $2,
               type_rating = $3,
               last_updated_date = $4
         WHERE organisation_name = $5
           AND route = $6
        "#,
    )
    .bind(&sponsor.town_city)
    .bind(&sponsor.county)
    .bind(&sponsor.type_rating)
    .bind(observed)
    .bind(&sponsor.organisation_name)
    .bind(&sponsor.route)
    .execute(&mut *conn)
    .await?;
    Ok(RowOutcome::Refreshed)
}

/// Each row runs inside its own savepoint so one bad row cannot poison the
/// enclosing transaction.
async fn upsert_rows(
    conn: &mut PgConnection,
    entities: &[Sponsor],
    observed: NaiveDate,
) -> Result<UpsertReport, StoreError> {
    let mut report = UpsertReport::default();
    for sponsor in entities {
        let mut savepoint = conn.begin().await?;
        match insert_or_refresh(&mut savepoint, sponsor, observed).await {
            Ok(RowOutcome::Inserted) => {
                savepoint.commit().await?;
                report.inserted += 1;
            }
            Ok(RowOutcome::Refreshed) => {
                savepoint.commit().await?;
                report.conflicts += 1;
                debug!(key = %sponsor.key(), "sponsor already stored; refreshed instead");
            }
            Err(err) => {
                savepoint.rollback().await?;
                report.failed += 1;
                warn!(key = %sponsor.key(), error = %err, "skipping sponsor row");
            }
        }
    }
    Ok(report)
}

async fn touch_rows(
    conn: &mut PgConnection,
    snapshot: &[Sponsor],
    observed: NaiveDate,
) -> Result<u64, StoreError> {
    let keys = snapshot.iter().map(Sponsor::key).collect::<HashSet<_>>();
    let (names, routes): (Vec<String>, Vec<String>) = keys
        .into_iter()
        .map(|k| (k.organisation_name, k.route))
        .unzip();
    let result = sqlx::query(
        r#"
        UPDATE sponsor_register AS s
           SET last_updated_date = $1
          FROM UNNEST($2::text[], $3::text[]) AS snap(organisation_name, route)
         WHERE s.organisation_name = snap.organisation_name
           AND s.route = snap.route
        "#,
    )
    .bind(observed)
    .bind(&names)
    .bind(&routes)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

async fn upsert_ledger(
    conn: &mut PgConnection,
    date: NaiveDate,
    added_count: i64,
    removed_count: i64,
) -> Result<DailyUpdate, StoreError> {
    sqlx::query(
        r#"
        INSERT INTO daily_updates (date, added_count, removed_count)
        VALUES ($1, $2, $3)
        ON CONFLICT (date) DO UPDATE
           SET added_count = EXCLUDED.added_count,
               removed_count = EXCLUDED.removed_count
        "#,
    )
    .bind(date)
    .bind(added_count)
    .bind(removed_count)
    .execute(&mut *conn)
    .await?;
    Ok(DailyUpdate {
        date,
        added_count,
        removed_count,
    })
}

#[async_trait]
impl SponsorStore for PgSponsorStore {
    async fn load_all(&self) -> Result<Vec<SponsorRecord>, StoreError> {
        let rows = sqlx::query(SELECT_SPONSORS).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn contains(&self, key: &SponsorKey) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM sponsor_register
                 WHERE organisation_name = $1 AND route = $2
            )
            "#,
        )
        .bind(&key.organisation_name)
        .bind(&key.route)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn upsert_new(
        &self,
        entities: &[Sponsor],
        observed: NaiveDate,
    ) -> Result<UpsertReport, StoreError> {
        let mut tx = self.pool.begin().await?;
        let report = upsert_rows(&mut tx, entities, observed).await?;
        tx.commit().await?;
        Ok(report)
    }

    async fn touch_existing(
        &self,
        snapshot: &[Sponsor],
        observed: NaiveDate,
    ) -> Result<u64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        touch_rows(&mut conn, snapshot, observed).await
    }

    async fn record_daily_counts(
        &self,
        date: NaiveDate,
        added_count: i64,
        removed_count: i64,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_ledger(&mut conn, date, added_count, removed_count).await?;
        Ok(())
    }

    async fn commit_run(&self, batch: &RunBatch) -> Result<CommitReport, StoreError> {
        let mut tx = self.pool.begin().await?;
        let upsert = upsert_rows(&mut tx, &batch.new_entities, batch.observed).await?;
        let touched = touch_rows(&mut tx, &batch.snapshot, batch.observed).await?;
        let ledger = upsert_ledger(
            &mut tx,
            batch.observed,
            batch.added_count,
            batch.removed_count,
        )
        .await?;
        tx.commit().await?;
        Ok(CommitReport {
            upsert,
            touched,
            ledger,
        })
    }

    async fn query_since(&self, cutoff: NaiveDate) -> Result<Vec<SponsorRecord>, StoreError> {
        let sql = format!(
            "{SELECT_SPONSORS} WHERE first_appeared_date >= $1 ORDER BY first_appeared_date DESC"
        );
        let rows = sqlx::query(&sql).bind(cutoff).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn aggregate_counts(
        &self,
        as_of: NaiveDate,
        top_n: usize,
    ) -> Result<SponsorStats, StoreError> {
        let totals = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE first_appeared_date >= $1) AS new_7,
                   COUNT(*) FILTER (WHERE first_appeared_date >= $2) AS new_30
              FROM sponsor_register
            "#,
        )
        .bind(as_of - Duration::days(7))
        .bind(as_of - Duration::days(30))
        .fetch_one(&self.pool)
        .await?;

        let cities = sqlx::query(
            r#"
            SELECT town_city, COUNT(*) AS count
              FROM sponsor_register
             WHERE town_city <> ''
             GROUP BY town_city
             ORDER BY count DESC, town_city ASC
             LIMIT $1
            "#,
        )
        .bind(i64::try_from(top_n).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let routes = sqlx::query(
            r#"
            SELECT route, COUNT(*) AS count
              FROM sponsor_register
             GROUP BY route
             ORDER BY count DESC, route ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(SponsorStats {
            as_of,
            total_sponsors: totals.try_get("total")?,
            new_last_7_days: totals.try_get("new_7")?,
            new_last_30_days: totals.try_get("new_30")?,
            top_cities: name_counts(cities, "town_city")?,
            routes: name_counts(routes, "route")?,
        })
    }

    async fn daily_series(&self) -> Result<Vec<DailyUpdate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT date, added_count, removed_count
              FROM daily_updates
             ORDER BY date ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(DailyUpdate {
                    date: row.try_get("date")?,
                    added_count: row.try_get("added_count")?,
                    removed_count: row.try_get("removed_count")?,
                })
            })
            .collect()
    }
}
