//! Core domain model for USLT: sponsor entities, the snapshot normalizer,
//! the daily ledger and the clock abstraction shared by every other crate.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "uslt-core";

/// Composite identity of a sponsor: the same organisation licensed for two
/// routes is two entities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SponsorKey {
    pub organisation_name: String,
    pub route: String,
}

impl SponsorKey {
    pub fn new(organisation_name: impl Into<String>, route: impl Into<String>) -> Self {
        Self {
            organisation_name: organisation_name.into(),
            route: route.into(),
        }
    }
}

impl fmt::Display for SponsorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.organisation_name, self.route)
    }
}

/// One row of the provider CSV, as published. Every cell may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSponsorRow {
    #[serde(rename = "Organisation Name", default)]
    pub organisation_name: Option<String>,
    #[serde(rename = "Town/City", default)]
    pub town_city: Option<String>,
    #[serde(rename = "County", default)]
    pub county: Option<String>,
    #[serde(rename = "Type & Rating", default)]
    pub type_rating: Option<String>,
    #[serde(rename = "Route", default)]
    pub route: Option<String>,
}

/// Canonical sponsor as seen in one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sponsor {
    pub organisation_name: String,
    pub town_city: String,
    pub county: String,
    pub type_rating: String,
    pub route: String,
}

impl Sponsor {
    pub fn key(&self) -> SponsorKey {
        SponsorKey::new(self.organisation_name.clone(), self.route.clone())
    }

    pub fn into_record(self, observed: NaiveDate) -> SponsorRecord {
        SponsorRecord {
            sponsor: self,
            first_appeared_date: observed,
            last_updated_date: observed,
        }
    }
}

/// Persisted sponsor with its tracking dates.
///
/// `first_appeared_date` is written once, on insert. `last_updated_date`
/// moves forward with every snapshot that still lists the sponsor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SponsorRecord {
    #[serde(flatten)]
    pub sponsor: Sponsor,
    pub first_appeared_date: NaiveDate,
    pub last_updated_date: NaiveDate,
}

impl SponsorRecord {
    pub fn key(&self) -> SponsorKey {
        self.sponsor.key()
    }
}

/// One ledger row per day the pipeline ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUpdate {
    pub date: NaiveDate,
    pub added_count: i64,
    pub removed_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameCount {
    pub name: String,
    pub count: i64,
}

/// Aggregates served to the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SponsorStats {
    pub as_of: NaiveDate,
    pub total_sponsors: i64,
    pub new_last_7_days: i64,
    pub new_last_30_days: i64,
    pub top_cities: Vec<NameCount>,
    pub routes: Vec<NameCount>,
}

/// Sort descending by count, then by name so results are stable.
pub fn rank_counts(counts: BTreeMap<String, i64>, limit: Option<usize>) -> Vec<NameCount> {
    let mut ranked = counts
        .into_iter()
        .map(|(name, count)| NameCount { name, count })
        .collect::<Vec<_>>();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    if let Some(limit) = limit {
        ranked.truncate(limit);
    }
    ranked
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

/// How `Town/City` values are cleaned before they are stored or compared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CityPolicy {
    /// Drop everything that is not a letter or whitespace.
    #[default]
    LettersOnly,
    /// Drop commas and periods only.
    Punctuation,
}

#[derive(Debug, Error)]
#[error("unknown city policy `{0}` (expected `letters` or `punctuation`)")]
pub struct ParseCityPolicyError(String);

impl FromStr for CityPolicy {
    type Err = ParseCityPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "letters" | "letters_only" => Ok(Self::LettersOnly),
            "punctuation" => Ok(Self::Punctuation),
            other => Err(ParseCityPolicyError(other.to_string())),
        }
    }
}

impl CityPolicy {
    pub fn normalize(&self, raw: &str) -> String {
        let kept = raw
            .chars()
            .filter(|c| match self {
                CityPolicy::LettersOnly => c.is_alphabetic() || c.is_whitespace(),
                CityPolicy::Punctuation => *c != ',' && *c != '.',
            })
            .collect::<String>();
        title_case(&kept.split_whitespace().collect::<Vec<_>>().join(" "))
    }
}

/// Upper-case the first letter of every word, lower-case the rest.
pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev: Option<char> = None;
    for c in input.chars() {
        let word_start = match prev {
            None => true,
            Some(p) => !p.is_alphanumeric() && p != '\'',
        };
        if word_start {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        prev = Some(c);
    }
    out
}

fn cell(value: &Option<String>) -> String {
    value.as_deref().map(str::trim).unwrap_or_default().to_string()
}

pub fn normalize_row(row: &RawSponsorRow, policy: CityPolicy) -> Sponsor {
    Sponsor {
        organisation_name: cell(&row.organisation_name),
        town_city: policy.normalize(row.town_city.as_deref().unwrap_or_default()),
        county: cell(&row.county),
        type_rating: cell(&row.type_rating),
        route: cell(&row.route),
    }
}

/// Turn provider rows into canonical sponsors. Missing cells become `""`.
pub fn normalize_snapshot(rows: &[RawSponsorRow], policy: CityPolicy) -> Vec<Sponsor> {
    rows.iter().map(|row| normalize_row(row, policy)).collect()
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of "now" for observation dates and cache expiry.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Midnight UTC on `date`.
    pub fn at_date(date: NaiveDate) -> Self {
        Self::new(date.and_time(chrono::NaiveTime::MIN).and_utc())
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Ledger series
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesPeriod {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl SeriesPeriod {
    /// Label of the bucket containing `date`: the date itself, the Sunday
    /// ending its week, or the last day of its month.
    pub fn bucket_end(&self, date: NaiveDate) -> NaiveDate {
        match self {
            SeriesPeriod::Daily => date,
            SeriesPeriod::Weekly => {
                let to_sunday = (7 - date.weekday().num_days_from_sunday()) % 7;
                date + Duration::days(i64::from(to_sunday))
            }
            SeriesPeriod::Monthly => last_day_of_month(date),
        }
    }

    fn next_bucket_end(&self, bucket_end: NaiveDate) -> NaiveDate {
        match self {
            SeriesPeriod::Daily => bucket_end + Duration::days(1),
            SeriesPeriod::Weekly => bucket_end + Duration::days(7),
            SeriesPeriod::Monthly => last_day_of_month(bucket_end + Duration::days(1)),
        }
    }
}

fn last_day_of_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first_of_next| first_of_next.pred_opt())
        .unwrap_or(date)
}

/// Re-bucket an ascending ledger. Daily input passes through untouched;
/// weekly and monthly output covers every bucket between the first and last
/// entry, with zero counts for buckets that had no runs.
pub fn bucket_daily_series(series: &[DailyUpdate], period: SeriesPeriod) -> Vec<DailyUpdate> {
    if period == SeriesPeriod::Daily {
        return series.to_vec();
    }
    let mut sums: BTreeMap<NaiveDate, (i64, i64)> = BTreeMap::new();
    for point in series {
        let entry = sums.entry(period.bucket_end(point.date)).or_default();
        entry.0 += point.added_count;
        entry.1 += point.removed_count;
    }
    let (Some(first), Some(last)) = (
        sums.keys().next().copied(),
        sums.keys().next_back().copied(),
    ) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    let mut bucket = first;
    while bucket <= last {
        let (added_count, removed_count) = sums.get(&bucket).copied().unwrap_or_default();
        out.push(DailyUpdate {
            date: bucket,
            added_count,
            removed_count,
        });
        bucket = period.next_bucket_end(bucket);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn raw(org: Option<&str>, city: Option<&str>, route: Option<&str>) -> RawSponsorRow {
        RawSponsorRow {
            organisation_name: org.map(str::to_string),
            town_city: city.map(str::to_string),
            county: None,
            type_rating: Some("Worker (A rating)".into()),
            route: route.map(str::to_string),
        }
    }

    #[test]
    fn missing_cells_become_empty_strings() {
        let sponsor = normalize_row(&raw(None, None, None), CityPolicy::LettersOnly);
        assert_eq!(sponsor.organisation_name, "");
        assert_eq!(sponsor.town_city, "");
        assert_eq!(sponsor.county, "");
        assert_eq!(sponsor.route, "");
        assert_eq!(sponsor.type_rating, "Worker (A rating)");
    }

    #[test]
    fn letters_only_policy_merges_noisy_city_spellings() {
        let policy = CityPolicy::LettersOnly;
        assert_eq!(policy.normalize("LONDON"), "London");
        assert_eq!(policy.normalize("london "), "London");
        assert_eq!(policy.normalize("  St. Albans,"), "St Albans");
        assert_eq!(policy.normalize("Lond0n!"), "Londn");
        assert_eq!(policy.normalize("NEWCASTLE   UPON TYNE"), "Newcastle Upon Tyne");
    }

    #[test]
    fn punctuation_policy_keeps_hyphens_and_digits() {
        let policy = CityPolicy::Punctuation;
        assert_eq!(policy.normalize("stoke-on-trent."), "Stoke-On-Trent");
        assert_eq!(policy.normalize("St. Albans,"), "St Albans");
        assert_eq!(policy.normalize("King's Lynn"), "King's Lynn");
        assert_eq!(policy.normalize("Lond0n"), "Lond0n");
    }

    #[test]
    fn city_policy_parses_from_config_strings() {
        assert_eq!("letters".parse::<CityPolicy>().unwrap(), CityPolicy::LettersOnly);
        assert_eq!(" Punctuation ".parse::<CityPolicy>().unwrap(), CityPolicy::Punctuation);
        assert!("aggressive".parse::<CityPolicy>().is_err());
    }

    #[test]
    fn key_and_name_fields_are_trimmed_not_rewritten() {
        let sponsor = normalize_row(
            &raw(Some("  Acme Ltd "), Some("leeds"), Some(" Skilled Worker")),
            CityPolicy::default(),
        );
        assert_eq!(sponsor.key(), SponsorKey::new("Acme Ltd", "Skilled Worker"));
        assert_eq!(sponsor.town_city, "Leeds");
    }

    #[test]
    fn record_serializes_flat() {
        let record = Sponsor {
            organisation_name: "Acme Ltd".into(),
            route: "Skilled Worker".into(),
            ..Default::default()
        }
        .into_record(d(2024, 1, 5));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["organisation_name"], "Acme Ltd");
        assert_eq!(json["first_appeared_date"], "2024-01-05");
    }

    fn update(date: NaiveDate, added_count: i64, removed_count: i64) -> DailyUpdate {
        DailyUpdate {
            date,
            added_count,
            removed_count,
        }
    }

    #[test]
    fn weekly_buckets_end_on_sunday_and_fill_gaps() {
        let series = vec![
            update(d(2024, 1, 1), 3, 1),
            update(d(2024, 1, 7), 2, 0),
            update(d(2024, 1, 16), 5, 2),
        ];
        let weekly = bucket_daily_series(&series, SeriesPeriod::Weekly);
        assert_eq!(
            weekly,
            vec![
                update(d(2024, 1, 7), 5, 1),
                update(d(2024, 1, 14), 0, 0),
                update(d(2024, 1, 21), 5, 2),
            ]
        );
    }

    #[test]
    fn monthly_buckets_use_month_end_across_year_boundary() {
        let series = vec![
            update(d(2023, 12, 30), 1, 0),
            update(d(2024, 2, 10), 4, 1),
        ];
        let monthly = bucket_daily_series(&series, SeriesPeriod::Monthly);
        let dates = monthly.iter().map(|p| p.date).collect::<Vec<_>>();
        assert_eq!(dates, vec![d(2023, 12, 31), d(2024, 1, 31), d(2024, 2, 29)]);
        assert_eq!(monthly[2].added_count, 4);
    }

    #[test]
    fn rank_counts_orders_by_count_then_name() {
        let counts = BTreeMap::from([
            ("Leeds".to_string(), 2),
            ("London".to_string(), 5),
            ("Bath".to_string(), 2),
        ]);
        let ranked = rank_counts(counts, Some(2));
        assert_eq!(ranked[0].name, "London");
        assert_eq!(ranked[1].name, "Bath");
        assert_eq!(ranked.len(), 2);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::at_date(d(2024, 1, 5));
        let other = clock.clone();
        clock.advance(Duration::days(1));
        assert_eq!(other.today(), d(2024, 1, 6));
    }
}
