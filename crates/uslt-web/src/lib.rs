//! Axum JSON API over the sponsor register.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use uslt_core::{
    bucket_daily_series, rank_counts, CityPolicy, Clock, DailyUpdate, NameCount, SeriesPeriod,
    SponsorRecord, SystemClock,
};
use uslt_storage::{CachedSponsorStore, SponsorStore, StoreError};
use uslt_sync::{open_store, SyncConfig};

pub const CRATE_NAME: &str = "uslt-web";

const DEFAULT_DAYS: i64 = 30;
const MAX_DAYS: i64 = 365;
const STATS_TOP_CITIES: usize = 10;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub cache_ttl_secs: i64,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("USLT_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            cache_ttl_secs: std::env::var("USLT_CACHE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300)
                .clamp(0, 86_400),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SponsorStore>,
    pub clock: Arc<dyn Clock>,
    /// Applied to the `city` filter so it matches stored values.
    pub city_policy: CityPolicy,
}

impl AppState {
    pub fn new(
        store: Arc<dyn SponsorStore>,
        clock: Arc<dyn Clock>,
        city_policy: CityPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            city_policy,
        }
    }

    fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    fn cutoff(&self, days: i64) -> NaiveDate {
        self.today() - Duration::days(days)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SponsorsQuery {
    pub days: Option<i64>,
    /// Comma separated.
    pub city: Option<String>,
    /// Comma separated.
    pub route: Option<String>,
    pub q: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

impl SponsorsQuery {
    fn days(&self) -> i64 {
        self.days.unwrap_or(DEFAULT_DAYS).clamp(1, MAX_DAYS)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SponsorPage {
    pub days: i64,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
    pub sponsors: Vec<SponsorRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SponsorFacets {
    pub days: i64,
    pub cities: Vec<NameCount>,
    pub routes: Vec<NameCount>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DailyQuery {
    pub period: Option<SeriesPeriod>,
    pub days: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailySeries {
    pub period: SeriesPeriod,
    pub points: Vec<DailyUpdate>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/sponsors", get(sponsors_handler))
        .route("/api/sponsors/facets", get(sponsor_facets_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/daily", get(daily_handler))
        .route("/api/daily/chart", get(daily_chart_handler))
        .with_state(Arc::new(state))
}

/// Postgres from `DATABASE_URL`, behind the read cache.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let web = WebConfig::from_env();
    let sync = SyncConfig::from_env();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = open_store(&sync).await?;
    let cached = CachedSponsorStore::new(
        store,
        Arc::clone(&clock),
        Duration::seconds(web.cache_ttl_secs),
    );
    let state = AppState::new(Arc::new(cached), clock, sync.city_policy);
    let listener = TcpListener::bind(("0.0.0.0", web.port)).await?;
    info!(port = web.port, cache_ttl_secs = web.cache_ttl_secs, "serving sponsor api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn sponsors_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SponsorsQuery>,
) -> Response {
    match state.store.query_since(state.cutoff(query.days())).await {
        Ok(rows) => {
            Json(filtered_paginated_sponsors(rows, &query, state.city_policy)).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn sponsor_facets_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SponsorsQuery>,
) -> Response {
    match state.store.query_since(state.cutoff(query.days())).await {
        Ok(rows) => {
            let mut cities = BTreeMap::<String, i64>::new();
            let mut routes = BTreeMap::<String, i64>::new();
            for record in &rows {
                if !record.sponsor.town_city.is_empty() {
                    *cities.entry(record.sponsor.town_city.clone()).or_default() += 1;
                }
                *routes.entry(record.sponsor.route.clone()).or_default() += 1;
            }
            Json(SponsorFacets {
                days: query.days(),
                cities: rank_counts(cities, None),
                routes: rank_counts(routes, None),
            })
            .into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.aggregate_counts(state.today(), STATS_TOP_CITIES).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => server_error(err),
    }
}

async fn daily_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DailyQuery>,
) -> Response {
    match load_series(&state, &query).await {
        Ok(series) => Json(series).into_response(),
        Err(err) => server_error(err),
    }
}

async fn daily_chart_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DailyQuery>,
) -> Response {
    match load_series(&state, &query).await {
        Ok(series) => {
            let x = series.points.iter().map(|p| p.date.to_string()).collect::<Vec<_>>();
            let added = series.points.iter().map(|p| p.added_count).collect::<Vec<_>>();
            let removed = series.points.iter().map(|p| p.removed_count).collect::<Vec<_>>();
            Json(serde_json::json!({
                "data": [
                    {
                        "type": "bar",
                        "name": "Added",
                        "x": x,
                        "y": added,
                        "marker": {"color": "#16a34a"}
                    },
                    {
                        "type": "bar",
                        "name": "Removed",
                        "x": x,
                        "y": removed,
                        "marker": {"color": "#dc2626"}
                    }
                ],
                "layout": {
                    "title": format!("Sponsor Register Changes ({})", period_label(series.period)),
                    "barmode": "group",
                    "paper_bgcolor": "#ffffff",
                    "plot_bgcolor": "#f8fafc"
                }
            }))
            .into_response()
        }
        Err(err) => server_error(err),
    }
}

fn period_label(period: SeriesPeriod) -> &'static str {
    match period {
        SeriesPeriod::Daily => "Daily",
        SeriesPeriod::Weekly => "Weekly",
        SeriesPeriod::Monthly => "Monthly",
    }
}

fn server_error(err: StoreError) -> Response {
    error!(error = %err, "store read failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

/// The ledger, optionally cut to the trailing `days`, then bucketed.
async fn load_series(state: &AppState, query: &DailyQuery) -> Result<DailySeries, StoreError> {
    let period = query.period.unwrap_or_default();
    let mut points = state.store.daily_series().await?;
    if let Some(days) = query.days {
        let cutoff = state.cutoff(days.clamp(1, MAX_DAYS));
        points.retain(|p| p.date >= cutoff);
    }
    Ok(DailySeries {
        period,
        points: bucket_daily_series(&points, period),
    })
}

fn csv_values(raw: Option<&str>) -> impl Iterator<Item = &str> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn filtered_paginated_sponsors(
    rows: Vec<SponsorRecord>,
    query: &SponsorsQuery,
    city_policy: CityPolicy,
) -> SponsorPage {
    let cities = csv_values(query.city.as_deref())
        .map(|c| city_policy.normalize(c))
        .collect::<HashSet<_>>();
    let routes = csv_values(query.route.as_deref()).collect::<HashSet<_>>();
    let needle = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_lowercase);

    let filtered = rows
        .into_iter()
        .filter(|r| cities.is_empty() || cities.contains(&r.sponsor.town_city))
        .filter(|r| routes.is_empty() || routes.contains(r.sponsor.route.as_str()))
        .filter(|r| match &needle {
            Some(needle) => r.sponsor.organisation_name.to_lowercase().contains(needle),
            None => true,
        })
        .collect::<Vec<_>>();

    let total = filtered.len();
    let per_page = query.per_page.unwrap_or(50).clamp(1, 500);
    let total_pages = total.max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    let sponsors = filtered.into_iter().skip(start).take(per_page).collect();

    SponsorPage {
        days: query.days(),
        total,
        page,
        per_page,
        total_pages,
        sponsors,
    }
}
