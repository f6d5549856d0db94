//! Snapshot providers: where the sponsor register comes from.
//!
//! A provider returns the full current register as raw rows. Nothing here
//! knows about stored state; normalization happens downstream.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use url::Url;
use uslt_core::{Clock, RawSponsorRow};
use uslt_storage::{FetchError, HttpFetcher, SnapshotArchive};

pub const CRATE_NAME: &str = "uslt-adapters";

pub const GOV_UK_BASE_URL: &str = "https://www.gov.uk";
pub const DEFAULT_REGISTER_PAGE_URL: &str =
    "https://www.gov.uk/government/publications/register-of-licensed-sponsors-workers";
pub const DEFAULT_CSV_LINK_NEEDLE: &str = "Worker_and_Temporary_Worker.csv";

const REQUIRED_COLUMNS: [&str; 2] = ["Organisation Name", "Route"];

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("no link containing `{needle}` on {page_url}")]
    LinkNotFound { needle: String, page_url: String },
    #[error("invalid url `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid selector: {0}")]
    Selector(String),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed register csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("register csv is missing column `{0}`")]
    MissingColumn(&'static str),
    #[error("register from {0} contains no sponsor rows")]
    Empty(String),
    #[error("archiving raw snapshot: {0}")]
    Archive(String),
}

/// Full point-in-time listing of the register.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub rows: Vec<RawSponsorRow>,
    pub retrieved_at: DateTime<Utc>,
    pub source_url: String,
    pub archived_path: Option<PathBuf>,
}

#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    fn source_id(&self) -> &str;

    /// The current full register, never a delta.
    async fn fetch(&self) -> Result<Snapshot, ProviderError>;
}

/// Parse the published CSV by header name. Columns other than organisation
/// name and route may be absent; a leading UTF-8 BOM is ignored.
pub fn parse_register_csv(bytes: &[u8]) -> Result<Vec<RawSponsorRow>, ProviderError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(bytes);

    let headers = reader.headers()?.clone();
    for column in REQUIRED_COLUMNS {
        if !headers.iter().any(|h| h == column) {
            return Err(ProviderError::MissingColumn(column));
        }
    }

    reader
        .deserialize::<RawSponsorRow>()
        .map(|row| row.map_err(ProviderError::from))
        .collect()
}

/// First `<a href>` whose target contains `needle`.
pub fn find_csv_link(html: &str, needle: &str) -> Result<Option<String>, ProviderError> {
    let document = Html::parse_document(html);
    let selector =
        Selector::parse("a[href]").map_err(|e| ProviderError::Selector(e.to_string()))?;
    Ok(document
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .find(|href| href.contains(needle))
        .map(str::to_string))
}

/// Absolute links pass through; relative ones are resolved against `base`.
pub fn resolve_link(base: &str, href: &str) -> Result<String, ProviderError> {
    let base_url = Url::parse(base).map_err(|source| ProviderError::InvalidUrl {
        url: base.to_string(),
        source,
    })?;
    base_url
        .join(href)
        .map(String::from)
        .map_err(|source| ProviderError::InvalidUrl {
            url: href.to_string(),
            source,
        })
}

fn non_empty(rows: Vec<RawSponsorRow>, source: &str) -> Result<Vec<RawSponsorRow>, ProviderError> {
    if rows.is_empty() {
        Err(ProviderError::Empty(source.to_string()))
    } else {
        Ok(rows)
    }
}

/// Scrapes the GOV.UK publication page for the current CSV and downloads it.
pub struct GovUkRegisterProvider {
    http: HttpFetcher,
    archive: Option<SnapshotArchive>,
    clock: Arc<dyn Clock>,
    page_url: String,
}

impl GovUkRegisterProvider {
    pub fn new(http: HttpFetcher, clock: Arc<dyn Clock>) -> Self {
        Self {
            http,
            archive: None,
            clock,
            page_url: DEFAULT_REGISTER_PAGE_URL.to_string(),
        }
    }

    pub fn with_page_url(mut self, page_url: impl Into<String>) -> Self {
        self.page_url = page_url.into();
        self
    }

    pub fn with_archive(mut self, archive: SnapshotArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, ProviderError> {
        self.http
            .get_bytes(url)
            .await
            .map(|resp| resp.body)
            .map_err(|source| ProviderError::Fetch {
                url: url.to_string(),
                source,
            })
    }

    async fn fetch_inner(&self) -> Result<Snapshot, ProviderError> {
        let page = self.get(&self.page_url).await?;
        let href = find_csv_link(&String::from_utf8_lossy(&page), DEFAULT_CSV_LINK_NEEDLE)?
            .ok_or_else(|| ProviderError::LinkNotFound {
                needle: DEFAULT_CSV_LINK_NEEDLE.to_string(),
                page_url: self.page_url.clone(),
            })?;
        let csv_url = resolve_link(GOV_UK_BASE_URL, &href)?;
        let body = self.get(&csv_url).await?;
        let retrieved_at = self.clock.now();

        let archived_path = match &self.archive {
            Some(archive) => {
                let archived = archive
                    .archive(retrieved_at, "csv", &body)
                    .await
                    .map_err(|e| ProviderError::Archive(format!("{e:#}")))?;
                Some(archived.absolute_path)
            }
            None => None,
        };

        let rows = non_empty(parse_register_csv(&body)?, &csv_url)?;
        info!(rows = rows.len(), %csv_url, bytes = body.len(), "downloaded sponsor register");
        Ok(Snapshot {
            rows,
            retrieved_at,
            source_url: csv_url,
            archived_path,
        })
    }
}

#[async_trait]
impl SnapshotProvider for GovUkRegisterProvider {
    fn source_id(&self) -> &str {
        "gov-uk"
    }

    async fn fetch(&self) -> Result<Snapshot, ProviderError> {
        let span = info_span!("fetch_register", page_url = %self.page_url);
        self.fetch_inner().instrument(span).await
    }
}

/// Reads a register CSV already on disk (manual ingestion, replays).
pub struct CsvFileProvider {
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl CsvFileProvider {
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
        }
    }
}

#[async_trait]
impl SnapshotProvider for CsvFileProvider {
    fn source_id(&self) -> &str {
        "csv-file"
    }

    async fn fetch(&self) -> Result<Snapshot, ProviderError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| ProviderError::Io {
                path: self.path.clone(),
                source,
            })?;
        let source_url = self.path.display().to_string();
        let rows = non_empty(parse_register_csv(&bytes)?, &source_url)?;
        Ok(Snapshot {
            rows,
            retrieved_at: self.clock.now(),
            source_url,
            archived_path: Some(self.path.clone()),
        })
    }
}
