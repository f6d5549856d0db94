//! Daily sync pipeline: fetch the register, reconcile it against the store,
//! commit the result and write the run reports.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uslt_adapters::{
    CsvFileProvider, GovUkRegisterProvider, ProviderError, SnapshotProvider,
    DEFAULT_REGISTER_PAGE_URL,
};
use uslt_core::{
    normalize_snapshot, CityPolicy, Clock, RawSponsorRow, Sponsor, SponsorKey, SponsorRecord,
    SystemClock,
};
use uslt_storage::{
    HttpClientConfig, HttpFetcher, MemorySponsorStore, PgSponsorStore, RunBatch, SnapshotArchive,
    SponsorStore, StoreError,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "uslt-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub register_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub city_policy: CityPolicy,
    pub scheduler_cron: String,
    /// Reconcile and report counts without committing anything.
    pub dry_run: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            artifacts_dir: PathBuf::from("./data/raw"),
            reports_dir: PathBuf::from("./reports"),
            register_url: DEFAULT_REGISTER_PAGE_URL.to_string(),
            user_agent: "uslt-bot/0.1".to_string(),
            http_timeout_secs: 30,
            city_policy: CityPolicy::default(),
            scheduler_cron: "0 0 8 * * Mon-Fri".to_string(),
            dry_run: false,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            artifacts_dir: std::env::var("USLT_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            reports_dir: std::env::var("USLT_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            register_url: std::env::var("USLT_REGISTER_URL").unwrap_or(defaults.register_url),
            user_agent: std::env::var("USLT_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("USLT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            city_policy: match std::env::var("USLT_CITY_POLICY") {
                Ok(raw) => raw.parse().unwrap_or_else(|err| {
                    warn!(%err, "falling back to the default city policy");
                    CityPolicy::default()
                }),
                Err(_) => defaults.city_policy,
            },
            scheduler_cron: std::env::var("USLT_SCHEDULER_CRON").unwrap_or(defaults.scheduler_cron),
            dry_run: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// How one snapshot relates to the stored register.
///
/// Every key in `store ∪ snapshot` lands in exactly one of the four lists.
/// `removed` and `lapsed` together are the stored sponsors missing from the
/// snapshot: `removed` were listed in the latest observed snapshot and so
/// disappeared just now, `lapsed` were already gone before.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub new_entities: Vec<Sponsor>,
    pub retained_entities: Vec<Sponsor>,
    pub removed_entities: Vec<SponsorRecord>,
    pub lapsed_entities: Vec<SponsorRecord>,
    /// Snapshot rows folded into an earlier row with the same key.
    pub duplicate_rows: usize,
}

pub fn reconcile(snapshot: &[Sponsor], stored: &[SponsorRecord]) -> Reconciliation {
    let mut positions = HashMap::<SponsorKey, usize>::with_capacity(snapshot.len());
    let mut unique = Vec::<Sponsor>::with_capacity(snapshot.len());
    let mut duplicate_rows = 0;
    for sponsor in snapshot {
        match positions.entry(sponsor.key()) {
            Entry::Occupied(slot) => {
                unique[*slot.get()] = sponsor.clone();
                duplicate_rows += 1;
            }
            Entry::Vacant(slot) => {
                slot.insert(unique.len());
                unique.push(sponsor.clone());
            }
        }
    }

    let stored_keys = stored.iter().map(SponsorRecord::key).collect::<HashSet<_>>();
    let (retained_entities, new_entities): (Vec<_>, Vec<_>) = unique
        .into_iter()
        .partition(|sponsor| stored_keys.contains(&sponsor.key()));

    let latest_observed = stored.iter().map(|r| r.last_updated_date).max();
    let (removed_entities, lapsed_entities): (Vec<_>, Vec<_>) = stored
        .iter()
        .filter(|record| !positions.contains_key(&record.key()))
        .cloned()
        .partition(|record| Some(record.last_updated_date) == latest_observed);

    Reconciliation {
        new_entities,
        retained_entities,
        removed_entities,
        lapsed_entities,
        duplicate_rows,
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetch stage failed: {0}")]
    Fetch(ProviderError),
    #[error("normalize stage failed: {0}")]
    Normalize(String),
    #[error("loading stored sponsors failed: {0}")]
    Load(StoreError),
    #[error("persist stage failed: {0}")]
    Persist(StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub date: NaiveDate,
    pub source_url: String,
    pub dry_run: bool,
    pub snapshot_rows: usize,
    pub skipped_rows: usize,
    pub new_entries: usize,
    pub removed_entries: usize,
    pub retained_entries: usize,
    pub lapsed_entries: usize,
    pub duplicate_rows: usize,
    pub touched: u64,
    pub conflicts: u64,
    pub failed_rows: u64,
    pub reports_dir: Option<PathBuf>,
}

pub struct SyncPipeline {
    provider: Arc<dyn SnapshotProvider>,
    store: Arc<dyn SponsorStore>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl SyncPipeline {
    pub fn new(
        provider: Arc<dyn SnapshotProvider>,
        store: Arc<dyn SponsorStore>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            provider,
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn SponsorStore> {
        Arc::clone(&self.store)
    }

    /// FETCH → NORMALIZE → RECONCILE → PERSIST → LOG. A failing stage stops
    /// the run; nothing is committed unless PERSIST succeeds.
    pub async fn run_once(&self) -> Result<RunOutcome, SyncError> {
        let run_id = Uuid::new_v4();
        let date = self.clock.today();
        let span = info_span!(
            "sync_run",
            %run_id,
            %date,
            source = self.provider.source_id(),
            dry_run = self.config.dry_run
        );
        self.run_stages(run_id, date).instrument(span).await
    }

    async fn run_stages(&self, run_id: Uuid, date: NaiveDate) -> Result<RunOutcome, SyncError> {
        let snapshot = self
            .provider
            .fetch()
            .instrument(info_span!("fetch"))
            .await
            .map_err(SyncError::Fetch)?;
        if snapshot.rows.is_empty() {
            return Err(SyncError::Fetch(ProviderError::Empty(snapshot.source_url)));
        }

        let (sponsors, skipped_rows) =
            info_span!("normalize").in_scope(|| self.normalize(&snapshot.rows))?;

        let stored = self
            .store
            .load_all()
            .instrument(info_span!("load"))
            .await
            .map_err(SyncError::Load)?;
        let reconciliation = info_span!("reconcile").in_scope(|| reconcile(&sponsors, &stored));
        info!(
            new = reconciliation.new_entities.len(),
            retained = reconciliation.retained_entities.len(),
            removed = reconciliation.removed_entities.len(),
            lapsed = reconciliation.lapsed_entities.len(),
            duplicates = reconciliation.duplicate_rows,
            "reconciled snapshot against store"
        );

        let commit = if self.config.dry_run {
            info!("dry run; nothing will be committed");
            None
        } else {
            let batch = RunBatch {
                observed: date,
                new_entities: reconciliation.new_entities.clone(),
                snapshot: reconciliation
                    .new_entities
                    .iter()
                    .chain(&reconciliation.retained_entities)
                    .cloned()
                    .collect(),
                added_count: reconciliation.new_entities.len() as i64,
                removed_count: reconciliation.removed_entities.len() as i64,
            };
            let report = self
                .store
                .commit_run(&batch)
                .instrument(info_span!("persist"))
                .await
                .map_err(SyncError::Persist)?;
            Some(report)
        };

        let mut outcome = RunOutcome {
            run_id,
            date,
            source_url: snapshot.source_url,
            dry_run: self.config.dry_run,
            snapshot_rows: snapshot.rows.len(),
            skipped_rows,
            new_entries: reconciliation.new_entities.len(),
            removed_entries: reconciliation.removed_entities.len(),
            retained_entries: reconciliation.retained_entities.len(),
            lapsed_entries: reconciliation.lapsed_entities.len(),
            duplicate_rows: reconciliation.duplicate_rows,
            touched: commit.map(|c| c.touched).unwrap_or_default(),
            conflicts: commit.map(|c| c.upsert.conflicts).unwrap_or_default(),
            failed_rows: commit.map(|c| c.upsert.failed).unwrap_or_default(),
            reports_dir: None,
        };

        if commit.is_some() {
            self.log_run(&mut outcome, &reconciliation)
                .instrument(info_span!("log"))
                .await;
        }
        info!(
            new = outcome.new_entries,
            removed = outcome.removed_entries,
            touched = outcome.touched,
            conflicts = outcome.conflicts,
            failed_rows = outcome.failed_rows,
            "sync run complete"
        );
        Ok(outcome)
    }

    fn normalize(&self, rows: &[RawSponsorRow]) -> Result<(Vec<Sponsor>, usize), SyncError> {
        let normalized = normalize_snapshot(rows, self.config.city_policy);
        let total = normalized.len();
        let sponsors = normalized
            .into_iter()
            .filter(|s| !s.organisation_name.is_empty() && !s.route.is_empty())
            .collect::<Vec<_>>();
        let skipped = total - sponsors.len();
        if skipped > 0 {
            warn!(skipped, "dropping register rows without an organisation name or route");
        }
        if sponsors.is_empty() {
            return Err(SyncError::Normalize(format!(
                "none of {total} rows has both an organisation name and a route"
            )));
        }
        Ok((sponsors, skipped))
    }

    /// The store has already committed, so report failures only warn.
    async fn log_run(&self, outcome: &mut RunOutcome, reconciliation: &Reconciliation) {
        let day_dir = self.config.reports_dir.join(outcome.date.to_string());
        outcome.reports_dir = Some(day_dir.clone());
        if let Err(err) = write_reports(&day_dir, outcome, reconciliation).await {
            warn!(
                error = ?err,
                dir = %day_dir.display(),
                "run committed but reports were not written"
            );
            outcome.reports_dir = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Run reports
// ---------------------------------------------------------------------------

const REPORT_HEADERS: [&str; 7] = [
    "Organisation Name",
    "Town/City",
    "County",
    "Type & Rating",
    "Route",
    "first_appeared_date",
    "last_updated_date",
];

#[derive(Debug, Serialize)]
struct ReportRow<'a> {
    organisation_name: &'a str,
    town_city: &'a str,
    county: &'a str,
    type_rating: &'a str,
    route: &'a str,
    first_appeared_date: NaiveDate,
    last_updated_date: NaiveDate,
}

impl<'a> ReportRow<'a> {
    fn new(sponsor: &'a Sponsor, first: NaiveDate, last: NaiveDate) -> Self {
        Self {
            organisation_name: &sponsor.organisation_name,
            town_city: &sponsor.town_city,
            county: &sponsor.county,
            type_rating: &sponsor.type_rating,
            route: &sponsor.route,
            first_appeared_date: first,
            last_updated_date: last,
        }
    }
}

fn sponsors_csv<'a>(rows: impl IntoIterator<Item = ReportRow<'a>>) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(REPORT_HEADERS)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow!("flushing report csv: {}", err.error()))
}

/// Writes `new_sponsors.csv`, `removed_sponsors.csv` and `summary.json`
/// into `day_dir`, replacing any earlier report for the same day.
pub async fn write_reports(
    day_dir: &Path,
    outcome: &RunOutcome,
    reconciliation: &Reconciliation,
) -> Result<()> {
    fs::create_dir_all(day_dir)
        .await
        .with_context(|| format!("creating {}", day_dir.display()))?;

    let new_csv = sponsors_csv(
        reconciliation
            .new_entities
            .iter()
            .map(|s| ReportRow::new(s, outcome.date, outcome.date)),
    )?;
    fs::write(day_dir.join("new_sponsors.csv"), new_csv)
        .await
        .context("writing new_sponsors.csv")?;

    let removed_csv = sponsors_csv(
        reconciliation
            .removed_entities
            .iter()
            .map(|r| ReportRow::new(&r.sponsor, r.first_appeared_date, r.last_updated_date)),
    )?;
    fs::write(day_dir.join("removed_sponsors.csv"), removed_csv)
        .await
        .context("writing removed_sponsors.csv")?;

    let summary = serde_json::to_vec_pretty(outcome).context("serializing run summary")?;
    fs::write(day_dir.join("summary.json"), summary)
        .await
        .context("writing summary.json")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Postgres when `DATABASE_URL` is set (migrations applied on connect).
/// Dry runs without a database reconcile against an empty memory store.
pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn SponsorStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgSponsorStore::connect(url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            Ok(Arc::new(store))
        }
        None if config.dry_run => {
            warn!("DATABASE_URL is unset; dry run reconciles against an empty in-memory store");
            Ok(Arc::new(MemorySponsorStore::new()))
        }
        None => bail!("DATABASE_URL must be set"),
    }
}

pub fn register_provider(
    config: &SyncConfig,
    clock: Arc<dyn Clock>,
) -> Result<GovUkRegisterProvider> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    Ok(GovUkRegisterProvider::new(http, clock)
        .with_page_url(config.register_url.clone())
        .with_archive(SnapshotArchive::new(config.artifacts_dir.clone())))
}

/// Production wiring. `csv_path` swaps the GOV.UK download for a local file.
pub async fn pipeline_from_config(
    config: SyncConfig,
    csv_path: Option<PathBuf>,
) -> Result<SyncPipeline> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let provider: Arc<dyn SnapshotProvider> = match csv_path {
        Some(path) => Arc::new(CsvFileProvider::new(path, Arc::clone(&clock))),
        None => Arc::new(register_provider(&config, Arc::clone(&clock))?),
    };
    let store = open_store(&config).await?;
    Ok(SyncPipeline::new(provider, store, clock, config))
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// One cron job running the pipeline. Triggers queue on a mutex so two runs
/// never overlap.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let gate = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let gate = Arc::clone(&gate);
        Box::pin(async move {
            let _running = gate.lock().await;
            match pipeline.run_once().await {
                Ok(outcome) => info!(
                    run_id = %outcome.run_id,
                    new = outcome.new_entries,
                    removed = outcome.removed_entries,
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn run_scheduler_until_shutdown(pipeline: Arc<SyncPipeline>) -> Result<()> {
    let cron = pipeline.config().scheduler_cron.clone();
    let mut sched = build_scheduler(pipeline, &cron).await?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler started; waiting for ctrl-c");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use uslt_adapters::Snapshot;
    use uslt_core::{DailyUpdate, ManualClock};

    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn sponsor(org: &str, route: &str) -> Sponsor {
        Sponsor {
            organisation_name: org.into(),
            town_city: "London".into(),
            county: String::new(),
            type_rating: "Worker (A rating)".into(),
            route: route.into(),
        }
    }

    fn record(org: &str, first: NaiveDate, last: NaiveDate) -> SponsorRecord {
        SponsorRecord {
            sponsor: sponsor(org, "Skilled Worker"),
            first_appeared_date: first,
            last_updated_date: last,
        }
    }

    fn raw(org: &str, city: &str, route: &str) -> RawSponsorRow {
        RawSponsorRow {
            organisation_name: Some(org.into()),
            town_city: Some(city.into()),
            county: None,
            type_rating: Some("Worker (A rating)".into()),
            route: Some(route.into()),
        }
    }

    fn names(sponsors: &[Sponsor]) -> Vec<&str> {
        sponsors.iter().map(|s| s.organisation_name.as_str()).collect()
    }

    /// Serves whatever rows the test last handed it.
    struct StaticProvider {
        rows: StdMutex<Vec<RawSponsorRow>>,
        clock: ManualClock,
    }

    impl StaticProvider {
        fn new(clock: ManualClock) -> Self {
            Self {
                rows: StdMutex::new(Vec::new()),
                clock,
            }
        }

        fn publish(&self, rows: Vec<RawSponsorRow>) {
            *self.rows.lock().unwrap() = rows;
        }
    }

    #[async_trait]
    impl SnapshotProvider for StaticProvider {
        fn source_id(&self) -> &str {
            "static"
        }

        async fn fetch(&self) -> Result<Snapshot, ProviderError> {
            let retrieved_at: DateTime<Utc> = self.clock.now();
            Ok(Snapshot {
                rows: self.rows.lock().unwrap().clone(),
                retrieved_at,
                source_url: "memory://register.csv".into(),
                archived_path: None,
            })
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl SnapshotProvider for FailingProvider {
        fn source_id(&self) -> &str {
            "failing"
        }

        async fn fetch(&self) -> Result<Snapshot, ProviderError> {
            Err(ProviderError::LinkNotFound {
                needle: "Worker_and_Temporary_Worker.csv".into(),
                page_url: "https://www.gov.uk/register".into(),
            })
        }
    }

    struct Harness {
        _reports: tempfile::TempDir,
        reports_dir: PathBuf,
        clock: ManualClock,
        provider: Arc<StaticProvider>,
        store: Arc<MemorySponsorStore>,
        pipeline: SyncPipeline,
    }

    fn harness(start: NaiveDate, dry_run: bool) -> Harness {
        let reports = tempfile::tempdir().unwrap();
        let reports_dir = reports.path().to_path_buf();
        let clock = ManualClock::at_date(start);
        let provider = Arc::new(StaticProvider::new(clock.clone()));
        let store = Arc::new(MemorySponsorStore::new());
        let config = SyncConfig {
            reports_dir: reports_dir.clone(),
            dry_run,
            ..SyncConfig::default()
        };
        let pipeline = SyncPipeline::new(
            provider.clone(),
            store.clone(),
            Arc::new(clock.clone()),
            config,
        );
        Harness {
            _reports: reports,
            reports_dir,
            clock,
            provider,
            store,
            pipeline,
        }
    }

    #[test]
    fn reconcile_partitions_every_key_exactly_once() {
        let stored = vec![
            record("Acme Ltd", d(2024, 1, 1), d(2024, 1, 5)),
            record("Beta Inc", d(2024, 1, 1), d(2024, 1, 5)),
            record("Gone Ltd", d(2023, 6, 1), d(2023, 12, 1)),
        ];
        let snapshot = vec![
            sponsor("Acme Ltd", "Skilled Worker"),
            sponsor("Delta LLP", "Skilled Worker"),
        ];

        let result = reconcile(&snapshot, &stored);

        assert_eq!(names(&result.new_entities), vec!["Delta LLP"]);
        assert_eq!(names(&result.retained_entities), vec!["Acme Ltd"]);
        assert_eq!(result.removed_entities.len(), 1);
        assert_eq!(result.removed_entities[0].sponsor.organisation_name, "Beta Inc");
        assert_eq!(result.lapsed_entities.len(), 1);
        assert_eq!(result.lapsed_entities[0].sponsor.organisation_name, "Gone Ltd");

        let mut seen = result
            .new_entities
            .iter()
            .chain(&result.retained_entities)
            .map(Sponsor::key)
            .chain(result.removed_entities.iter().map(SponsorRecord::key))
            .chain(result.lapsed_entities.iter().map(SponsorRecord::key))
            .collect::<Vec<_>>();
        let total = seen.len();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), total);
        assert_eq!(total, 4);
    }

    #[test]
    fn reconcile_treats_route_as_part_of_identity() {
        let stored = vec![record("Acme Ltd", d(2024, 1, 1), d(2024, 1, 1))];
        let snapshot = vec![
            sponsor("Acme Ltd", "Skilled Worker"),
            sponsor("Acme Ltd", "Global Business Mobility"),
        ];
        let result = reconcile(&snapshot, &stored);
        assert_eq!(result.new_entities.len(), 1);
        assert_eq!(result.new_entities[0].route, "Global Business Mobility");
        assert_eq!(result.retained_entities.len(), 1);
    }

    #[test]
    fn reconcile_against_empty_store_marks_everything_new() {
        let snapshot = vec![
            sponsor("Acme Ltd", "Skilled Worker"),
            sponsor("Beta Inc", "Skilled Worker"),
        ];
        let result = reconcile(&snapshot, &[]);
        assert_eq!(names(&result.new_entities), vec!["Acme Ltd", "Beta Inc"]);
        assert!(result.retained_entities.is_empty());
        assert!(result.removed_entities.is_empty());
        assert!(result.lapsed_entities.is_empty());
    }

    #[test]
    fn reconcile_collapses_duplicate_keys_keeping_the_last_row() {
        let mut moved = sponsor("Acme Ltd", "Skilled Worker");
        moved.town_city = "Leeds".into();
        let snapshot = vec![
            sponsor("Acme Ltd", "Skilled Worker"),
            sponsor("Beta Inc", "Skilled Worker"),
            moved,
        ];
        let result = reconcile(&snapshot, &[]);
        assert_eq!(result.duplicate_rows, 1);
        assert_eq!(names(&result.new_entities), vec!["Acme Ltd", "Beta Inc"]);
        assert_eq!(result.new_entities[0].town_city, "Leeds");
    }

    #[tokio::test]
    async fn acme_then_beta_records_one_addition() {
        let h = harness(d(2024, 1, 1), false);
        h.provider.publish(vec![raw("Acme Ltd", "LONDON", "Skilled Worker")]);
        let first = h.pipeline.run_once().await.unwrap();
        assert_eq!(first.new_entries, 1);
        assert_eq!(first.touched, 1);

        h.clock.set(d(2024, 1, 5).and_hms_opt(8, 0, 0).unwrap().and_utc());
        h.provider.publish(vec![
            raw("Acme Ltd", "LONDON", "Skilled Worker"),
            raw("Beta Inc", "Manchester", "Skilled Worker"),
        ]);
        let second = h.pipeline.run_once().await.unwrap();

        assert_eq!(second.date, d(2024, 1, 5));
        assert_eq!(second.new_entries, 1);
        assert_eq!(second.removed_entries, 0);
        assert_eq!(second.retained_entries, 1);
        assert_eq!(second.touched, 2);

        let acme = h.store.get(&SponsorKey::new("Acme Ltd", "Skilled Worker")).await.unwrap();
        assert_eq!(acme.first_appeared_date, d(2024, 1, 1));
        assert_eq!(acme.last_updated_date, d(2024, 1, 5));
        assert_eq!(acme.sponsor.town_city, "London");
        let beta = h.store.get(&SponsorKey::new("Beta Inc", "Skilled Worker")).await.unwrap();
        assert_eq!(beta.first_appeared_date, d(2024, 1, 5));
        assert_eq!(beta.last_updated_date, d(2024, 1, 5));

        let series = h.store.daily_series().await.unwrap();
        assert_eq!(
            series.last(),
            Some(&DailyUpdate {
                date: d(2024, 1, 5),
                added_count: 1,
                removed_count: 0
            })
        );
    }

    #[tokio::test]
    async fn rerun_on_the_same_day_is_idempotent() {
        let h = harness(d(2024, 3, 4), false);
        h.provider.publish(vec![
            raw("Acme Ltd", "London", "Skilled Worker"),
            raw("Beta Inc", "Leeds", "Skilled Worker"),
        ]);
        let first = h.pipeline.run_once().await.unwrap();
        assert_eq!(first.new_entries, 2);

        let second = h.pipeline.run_once().await.unwrap();
        assert_eq!(second.new_entries, 0);
        assert_eq!(second.removed_entries, 0);
        assert_eq!(second.retained_entries, 2);

        let series = h.store.daily_series().await.unwrap();
        assert_eq!(
            series,
            vec![DailyUpdate {
                date: d(2024, 3, 4),
                added_count: 0,
                removed_count: 0
            }]
        );
        let acme = h.store.get(&SponsorKey::new("Acme Ltd", "Skilled Worker")).await.unwrap();
        assert_eq!(acme.first_appeared_date, d(2024, 3, 4));
    }

    #[tokio::test]
    async fn removed_sponsor_is_counted_once_and_stays_queryable() {
        let h = harness(d(2024, 2, 1), false);
        h.provider.publish(vec![
            raw("Acme Ltd", "London", "Skilled Worker"),
            raw("Beta Inc", "Leeds", "Skilled Worker"),
        ]);
        h.pipeline.run_once().await.unwrap();

        h.clock.set(d(2024, 2, 2).and_hms_opt(8, 0, 0).unwrap().and_utc());
        h.provider.publish(vec![raw("Acme Ltd", "London", "Skilled Worker")]);
        let removal = h.pipeline.run_once().await.unwrap();
        assert_eq!(removal.removed_entries, 1);
        assert_eq!(removal.lapsed_entries, 0);

        h.clock.set(d(2024, 2, 3).and_hms_opt(8, 0, 0).unwrap().and_utc());
        let later = h.pipeline.run_once().await.unwrap();
        assert_eq!(later.removed_entries, 0);
        assert_eq!(later.lapsed_entries, 1);

        let beta = h.store.get(&SponsorKey::new("Beta Inc", "Skilled Worker")).await.unwrap();
        assert_eq!(beta.last_updated_date, d(2024, 2, 1));
        let listed = h.store.query_since(d(2024, 2, 1)).await.unwrap();
        assert_eq!(listed.len(), 2);

        let series = h.store.daily_series().await.unwrap();
        assert_eq!(series[1].removed_count, 1);
        assert_eq!(series[2].removed_count, 0);
    }

    #[tokio::test]
    async fn fetch_failure_writes_nothing() {
        let reports = tempfile::tempdir().unwrap();
        let store = Arc::new(MemorySponsorStore::new());
        let pipeline = SyncPipeline::new(
            Arc::new(FailingProvider),
            store.clone(),
            Arc::new(ManualClock::at_date(d(2024, 1, 5))),
            SyncConfig {
                reports_dir: reports.path().to_path_buf(),
                ..SyncConfig::default()
            },
        );

        let err = pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, SyncError::Fetch(ProviderError::LinkNotFound { .. })));
        assert!(store.load_all().await.unwrap().is_empty());
        assert!(store.daily_series().await.unwrap().is_empty());
        assert!(!reports.path().join("2024-01-05").exists());
    }

    #[tokio::test]
    async fn empty_snapshot_is_rejected_before_reconciling() {
        let h = harness(d(2024, 1, 5), false);
        h.store
            .upsert_new(&[sponsor("Acme Ltd", "Skilled Worker")], d(2024, 1, 1))
            .await
            .unwrap();

        let err = h.pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, SyncError::Fetch(ProviderError::Empty(_))));
        assert!(h.store.daily_series().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rows_without_identity_fail_normalization() {
        let h = harness(d(2024, 1, 5), false);
        h.provider.publish(vec![RawSponsorRow {
            town_city: Some("London".into()),
            ..RawSponsorRow::default()
        }]);
        let err = h.pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, SyncError::Normalize(_)));
    }

    #[tokio::test]
    async fn dry_run_reports_counts_without_committing() {
        let h = harness(d(2024, 1, 5), true);
        h.provider.publish(vec![raw("Acme Ltd", "London", "Skilled Worker")]);

        let outcome = h.pipeline.run_once().await.unwrap();
        assert!(outcome.dry_run);
        assert_eq!(outcome.new_entries, 1);
        assert_eq!(outcome.touched, 0);
        assert!(outcome.reports_dir.is_none());
        assert!(h.store.load_all().await.unwrap().is_empty());
        assert!(h.store.daily_series().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn committed_run_writes_csv_and_summary_reports() {
        let h = harness(d(2024, 1, 5), false);
        h.provider.publish(vec![
            raw("Acme Ltd", "London", "Skilled Worker"),
            raw("Acme Ltd", "London", "Skilled Worker"),
        ]);

        let outcome = h.pipeline.run_once().await.unwrap();
        let day_dir = h.reports_dir.join("2024-01-05");
        assert_eq!(outcome.reports_dir.as_deref(), Some(day_dir.as_path()));
        assert_eq!(outcome.duplicate_rows, 1);

        let new_csv = std::fs::read_to_string(day_dir.join("new_sponsors.csv")).unwrap();
        let mut lines = new_csv.lines();
        assert_eq!(
            lines.next(),
            Some("Organisation Name,Town/City,County,Type & Rating,Route,first_appeared_date,last_updated_date")
        );
        assert_eq!(
            lines.next(),
            Some("Acme Ltd,London,,Worker (A rating),Skilled Worker,2024-01-05,2024-01-05")
        );
        assert_eq!(lines.next(), None);

        let removed_csv = std::fs::read_to_string(day_dir.join("removed_sponsors.csv")).unwrap();
        assert_eq!(removed_csv.lines().count(), 1);

        let summary: serde_json::Value =
            serde_json::from_slice(&std::fs::read(day_dir.join("summary.json")).unwrap()).unwrap();
        assert_eq!(summary["new_entries"], 1);
        assert_eq!(summary["date"], "2024-01-05");
        assert_eq!(summary["run_id"], outcome.run_id.to_string());
    }

    #[tokio::test]
    async fn dry_run_without_database_uses_memory_store() {
        let config = SyncConfig {
            dry_run: true,
            ..SyncConfig::default()
        };
        let store = open_store(&config).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());

        let err = open_store(&SyncConfig::default()).await.err().unwrap();
        assert!(err.to_string().contains("DATABASE_URL"));
    }
}
