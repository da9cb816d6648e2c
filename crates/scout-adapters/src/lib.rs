//! Source adapter contracts + provider adapter implementations.
//!
//! Every provider, whether a public HTML table, a JSON API or a fixture bundle on
//! disk, is reached through [`SourceAdapter::fetch`]. The sync pipeline never sees
//! adapter internals.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use scout_core::{CandidateRecord, Scalar, SyncScope};
use scout_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "scout-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Fixture,
    PublicHtml,
    Api,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{source_id} has no endpoint configured for league {league}")]
    UnsupportedScope { source_id: String, league: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;

    /// Normalized candidates for `scope`, or the reason this provider could not supply them.
    async fn fetch(&self, scope: &SyncScope) -> Result<Vec<CandidateRecord>, AdapterError>;
}

/// Registry entry for one provider, as declared in `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub leagues: BTreeMap<String, String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub html: Option<HtmlTableLayout>,
    #[serde(default)]
    pub json: Option<JsonApiLayout>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Connection settings handed to one adapter by the composition root.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub source_id: String,
    pub base_url: String,
    pub leagues: BTreeMap<String, String>,
    pub credential: Option<String>,
}

impl ProviderSettings {
    pub fn from_config(config: &SourceConfig, credential: Option<String>) -> Self {
        Self {
            source_id: config.source_id.clone(),
            base_url: config.base_url.clone(),
            leagues: config.leagues.clone(),
            credential,
        }
    }

    /// Absolute URL for `scope`; `{season}` expands to the current year.
    pub fn endpoint_for(&self, scope: &SyncScope) -> Result<String, AdapterError> {
        let path = self
            .leagues
            .get(&scope.league)
            .ok_or_else(|| AdapterError::UnsupportedScope {
                source_id: self.source_id.clone(),
                league: scope.league.clone(),
            })?;
        let path = path.replace("{season}", &Utc::now().year().to_string());
        if path.starts_with("http://") || path.starts_with("https://") {
            return Ok(path);
        }
        Ok(format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
    }
}

pub fn build_adapter(
    config: &SourceConfig,
    credential: Option<String>,
    http: Arc<HttpFetcher>,
    fixtures_root: &Path,
) -> Result<Arc<dyn SourceAdapter>, AdapterError> {
    let settings = ProviderSettings::from_config(config, credential);
    match config.kind {
        SourceKind::Fixture => Ok(Arc::new(FixtureAdapter::new(
            config.source_id.clone(),
            fixtures_root,
        ))),
        SourceKind::PublicHtml => {
            let layout = config.html.as_ref().ok_or_else(|| {
                AdapterError::Message(format!("{} is missing an html layout", config.source_id))
            })?;
            Ok(Arc::new(HtmlTableAdapter::new(settings, layout, http)?))
        }
        SourceKind::Api => {
            let layout = config.json.clone().ok_or_else(|| {
                AdapterError::Message(format!("{} is missing a json layout", config.source_id))
            })?;
            Ok(Arc::new(JsonApiAdapter::new(settings, layout, http)))
        }
    }
}

// ---------------------------------------------------------------------------
// Fixture bundles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub source_id: String,
    pub league: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub records: Vec<FixtureRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureRecord {
    #[serde(default)]
    pub external_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub club: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Scalar>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn bundle_to_candidates(bundle: &FixtureBundle) -> Vec<CandidateRecord> {
    bundle
        .records
        .iter()
        .map(|record| CandidateRecord {
            source_id: bundle.source_id.clone(),
            external_id: record.external_id.clone(),
            name: record.name.clone(),
            club: record.club.clone(),
            league: bundle.league.clone(),
            attributes: record.attributes.clone(),
            fetched_at: bundle.fetched_at,
        })
        .collect()
}

/// Reads `<root>/<source_id>/<league-slug>.json`; used for manual ingestion and offline runs.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    source_id: String,
    root: PathBuf,
}

impl FixtureAdapter {
    pub fn new(source_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            root: root.into(),
        }
    }

    pub fn bundle_path(&self, scope: &SyncScope) -> PathBuf {
        self.root
            .join(&self.source_id)
            .join(format!("{}.json", scope.slug()))
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Fixture
    }

    async fn fetch(&self, scope: &SyncScope) -> Result<Vec<CandidateRecord>, AdapterError> {
        let path = self.bundle_path(scope);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(AdapterError::UnsupportedScope {
                    source_id: self.source_id.clone(),
                    league: scope.league.clone(),
                });
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("reading {}", path.display()))
                    .into());
            }
        };
        let bundle: FixtureBundle = serde_json::from_str(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        if bundle.source_id != self.source_id {
            return Err(AdapterError::Message(format!(
                "bundle source_id={} does not match adapter source_id={}",
                bundle.source_id, self.source_id
            )));
        }
        Ok(bundle_to_candidates(&bundle))
    }
}

// ---------------------------------------------------------------------------
// Value parsing
// ---------------------------------------------------------------------------

/// Collapse whitespace runs (including newlines and tabs) to single spaces.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Integer from the digits in `text`, e.g. `"1,234 min"` -> 1234.
pub fn parse_number(text: &str) -> Option<i64> {
    let digits = text.chars().filter(char::is_ascii_digit).collect::<String>();
    digits.parse().ok()
}

/// Finite float only; `f64::from_str` also accepts `NaN` and `inf`.
fn parse_finite(text: &str) -> Option<f64> {
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Float tolerant of a trailing `%` and a decimal comma.
pub fn parse_float(text: &str) -> Option<f64> {
    let cleaned = text.trim().replace('%', "").replace(',', ".");
    parse_finite(&cleaned)
}

/// Market values like `€5.00m`, `€500k` or `€1,500,000`.
pub fn parse_market_value(text: &str) -> Option<f64> {
    let cleaned = text
        .chars()
        .filter(|c| !matches!(*c, '€' | '$' | '£' | ',') && !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    if let Some(millions) = cleaned.strip_suffix('m') {
        return parse_finite(millions).map(|v| v * 1_000_000.0);
    }
    if let Some(thousands) = cleaned.strip_suffix('k') {
        return parse_finite(thousands).map(|v| v * 1_000.0);
    }
    parse_finite(&cleaned)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnParse {
    #[default]
    Auto,
    Text,
    Integer,
    Number,
    MarketValue,
}

impl ColumnParse {
    pub fn apply(&self, raw: &str) -> Option<Scalar> {
        let text = clean_text(raw);
        if text.is_empty() {
            return None;
        }
        match self {
            ColumnParse::Text => Some(Scalar::Text(text)),
            ColumnParse::Integer => parse_number(&text).map(Scalar::Integer),
            ColumnParse::Number => parse_float(&text).map(Scalar::Number),
            ColumnParse::MarketValue => parse_market_value(&text).map(Scalar::Number),
            ColumnParse::Auto => Some(
                match text.parse::<i64>() {
                    Ok(value) => Scalar::Integer(value),
                    Err(_) => parse_finite(&text)
                        .map(Scalar::Number)
                        .unwrap_or(Scalar::Text(text)),
                },
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// HTML table providers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HtmlTableLayout {
    pub row_selector: String,
    pub name_selector: String,
    #[serde(default)]
    pub club_selector: Option<String>,
    /// Read the club from this attribute (e.g. an crest image `title`) instead of the text.
    #[serde(default)]
    pub club_attr: Option<String>,
    /// Path prefix in the name link's `href` that precedes the provider id.
    #[serde(default)]
    pub id_path_prefix: Option<String>,
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnSpec {
    pub selector: String,
    #[serde(default)]
    pub attr: Option<String>,
    #[serde(default)]
    pub parse: ColumnParse,
}

#[derive(Debug)]
struct CompiledColumn {
    name: String,
    selector: Selector,
    attr: Option<String>,
    parse: ColumnParse,
}

#[derive(Debug)]
struct CompiledTableLayout {
    row: Selector,
    name: Selector,
    club: Option<Selector>,
    club_attr: Option<String>,
    id_path_prefix: Option<String>,
    columns: Vec<CompiledColumn>,
}

fn compile_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector)
        .map_err(|e| AdapterError::Parse(format!("invalid selector {selector:?}: {e}")))
}

impl CompiledTableLayout {
    fn compile(layout: &HtmlTableLayout) -> Result<Self, AdapterError> {
        let columns = layout
            .columns
            .iter()
            .map(|(name, spec)| -> Result<CompiledColumn, AdapterError> {
                Ok(CompiledColumn {
                    name: name.clone(),
                    selector: compile_selector(&spec.selector)?,
                    attr: spec.attr.clone(),
                    parse: spec.parse,
                })
            })
            .collect::<Result<Vec<_>, AdapterError>>()?;
        Ok(Self {
            row: compile_selector(&layout.row_selector)?,
            name: compile_selector(&layout.name_selector)?,
            club: layout
                .club_selector
                .as_deref()
                .map(compile_selector)
                .transpose()?,
            club_attr: layout.club_attr.clone(),
            id_path_prefix: layout.id_path_prefix.clone(),
            columns,
        })
    }
}

fn element_value(element: ElementRef<'_>, attr: Option<&str>) -> Option<String> {
    match attr {
        Some(attr) => element.value().attr(attr).map(clean_text),
        None => Some(clean_text(&element.text().collect::<String>())),
    }
    .filter(|v| !v.is_empty())
}

fn id_after_prefix(href: &str, prefix: &str) -> Option<String> {
    let start = href.find(prefix)? + prefix.len();
    let id = href[start..].split(['/', '?', '#']).next()?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Scrapes one stats table per league page; each matching row becomes a candidate.
#[derive(Debug)]
pub struct HtmlTableAdapter {
    settings: ProviderSettings,
    layout: CompiledTableLayout,
    http: Arc<HttpFetcher>,
}

impl HtmlTableAdapter {
    pub fn new(
        settings: ProviderSettings,
        layout: &HtmlTableLayout,
        http: Arc<HttpFetcher>,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            settings,
            layout: CompiledTableLayout::compile(layout)?,
            http,
        })
    }

    pub fn parse_page(
        &self,
        html: &str,
        scope: &SyncScope,
        fetched_at: DateTime<Utc>,
    ) -> Vec<CandidateRecord> {
        let document = Html::parse_document(html);
        document
            .select(&self.layout.row)
            .filter_map(|row| self.parse_row(row, scope, fetched_at))
            .collect()
    }

    fn parse_row(
        &self,
        row: ElementRef<'_>,
        scope: &SyncScope,
        fetched_at: DateTime<Utc>,
    ) -> Option<CandidateRecord> {
        let name_el = row.select(&self.layout.name).next()?;
        let name = element_value(name_el, None)?;

        let external_id = self.layout.id_path_prefix.as_deref().and_then(|prefix| {
            name_el
                .value()
                .attr("href")
                .and_then(|href| id_after_prefix(href, prefix))
        });
        let club = self
            .layout
            .club
            .as_ref()
            .and_then(|sel| row.select(sel).next())
            .and_then(|el| element_value(el, self.layout.club_attr.as_deref()))
            .unwrap_or_default();

        let mut candidate = CandidateRecord::new(
            self.settings.source_id.clone(),
            name,
            club,
            scope.league.clone(),
            fetched_at,
        );
        candidate.external_id = external_id;

        for column in &self.layout.columns {
            let value = row
                .select(&column.selector)
                .next()
                .and_then(|el| element_value(el, column.attr.as_deref()))
                .and_then(|raw| column.parse.apply(&raw));
            if let Some(value) = value {
                candidate.attributes.insert(column.name.clone(), value);
            }
        }
        Some(candidate)
    }
}

#[async_trait]
impl SourceAdapter for HtmlTableAdapter {
    fn source_id(&self) -> &str {
        &self.settings.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::PublicHtml
    }

    async fn fetch(&self, scope: &SyncScope) -> Result<Vec<CandidateRecord>, AdapterError> {
        let url = self.settings.endpoint_for(scope)?;
        let html = self
            .http
            .fetch_text(&self.settings.source_id, &url, None)
            .await?;
        let candidates = self.parse_page(&html, scope, Utc::now());
        debug!(source_id = %self.settings.source_id, url = %url, rows = candidates.len(), "parsed table");
        Ok(candidates)
    }
}

// ---------------------------------------------------------------------------
// JSON API providers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct JsonApiLayout {
    /// JSON pointer to the record array, e.g. `/data`; the payload root when absent.
    #[serde(default)]
    pub records_pointer: Option<String>,
    pub name_field: String,
    #[serde(default)]
    pub club_field: Option<String>,
    #[serde(default)]
    pub id_field: Option<String>,
    /// attribute name -> dotted field path in each record.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

fn json_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path.split('.') {
        cur = cur.get(segment)?;
    }
    Some(cur)
}

fn json_str(value: &JsonValue, path: &str) -> Option<String> {
    match json_path(value, path)? {
        JsonValue::String(s) => Some(clean_text(s)).filter(|s| !s.is_empty()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_scalar(value: &JsonValue) -> Option<Scalar> {
    match value {
        JsonValue::Bool(b) => Some(Scalar::Bool(*b)),
        JsonValue::Number(n) => n
            .as_i64()
            .map(Scalar::Integer)
            .or_else(|| n.as_f64().map(Scalar::Number)),
        JsonValue::String(s) => Some(Scalar::Text(s.clone())),
        _ => None,
    }
}

#[derive(Debug)]
pub struct JsonApiAdapter {
    settings: ProviderSettings,
    layout: JsonApiLayout,
    http: Arc<HttpFetcher>,
}

impl JsonApiAdapter {
    pub fn new(settings: ProviderSettings, layout: JsonApiLayout, http: Arc<HttpFetcher>) -> Self {
        Self {
            settings,
            layout,
            http,
        }
    }

    pub fn parse_payload(
        &self,
        payload: &str,
        scope: &SyncScope,
        fetched_at: DateTime<Utc>,
    ) -> Result<Vec<CandidateRecord>, AdapterError> {
        let value: JsonValue = serde_json::from_str(payload)
            .map_err(|e| AdapterError::Parse(format!("invalid JSON payload: {e}")))?;
        let records = match &self.layout.records_pointer {
            Some(pointer) => value.pointer(pointer),
            None => Some(&value),
        }
        .and_then(JsonValue::as_array)
        .ok_or_else(|| AdapterError::Parse("payload has no record array".to_string()))?;

        Ok(records
            .iter()
            .filter_map(|record| self.parse_record(record, scope, fetched_at))
            .collect())
    }

    fn parse_record(
        &self,
        record: &JsonValue,
        scope: &SyncScope,
        fetched_at: DateTime<Utc>,
    ) -> Option<CandidateRecord> {
        let name = json_str(record, &self.layout.name_field)?;
        let club = self
            .layout
            .club_field
            .as_deref()
            .and_then(|path| json_str(record, path))
            .unwrap_or_default();

        let mut candidate = CandidateRecord::new(
            self.settings.source_id.clone(),
            name,
            club,
            scope.league.clone(),
            fetched_at,
        );
        candidate.external_id = self
            .layout
            .id_field
            .as_deref()
            .and_then(|path| json_str(record, path));
        for (attribute, path) in &self.layout.fields {
            if let Some(value) = json_path(record, path).and_then(json_scalar) {
                candidate.attributes.insert(attribute.clone(), value);
            }
        }
        Some(candidate)
    }
}

#[async_trait]
impl SourceAdapter for JsonApiAdapter {
    fn source_id(&self) -> &str {
        &self.settings.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    async fn fetch(&self, scope: &SyncScope) -> Result<Vec<CandidateRecord>, AdapterError> {
        let url = self.settings.endpoint_for(scope)?;
        let payload = self
            .http
            .fetch_text(
                &self.settings.source_id,
                &url,
                self.settings.credential.as_deref(),
            )
            .await?;
        self.parse_payload(&payload, scope, Utc::now())
    }
}
