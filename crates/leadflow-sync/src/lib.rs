//! Ingestion pipeline orchestration: CSV intake, company resolution,
//! persistence, view refresh and the CDC relay into the search index.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use leadflow_core::{normalize_row, read_lead_file, CompanyRecord, ProspectRecord};
use leadflow_standardize::{FieldType, Scope, Standardizer, DEFAULT_CITY_THRESHOLD};
use leadflow_storage::{
    BackoffPolicy, CacheStore, SearchDocument, SearchIndexClient, StorageError, StoreCounts,
    StrategyThresholds, UpsertEngine, UpsertStrategy,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "leadflow-sync";

const VIEW_NAME: &str = "company_prospect_view";
const CDC_CHECKPOINT: &str = "cdc";
const LAST_RUN_KEY: &str = "last_run";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub redis_url: String,
    pub search_url: String,
    pub search_index: String,
    pub thresholds: StrategyThresholds,
    pub batch_timeout: Duration,
    pub refresh_interval: Duration,
    pub refresh_tick_timeout: Duration,
    pub cdc_flush_interval: Duration,
    pub cdc_batch_size: i64,
    pub cdc_slot: String,
    pub city_fuzzy_threshold: f64,
    pub standardize_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/leadflow".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            search_url: "http://localhost:9200".to_string(),
            search_index: "prospects".to_string(),
            thresholds: StrategyThresholds::default(),
            batch_timeout: Duration::from_secs(600),
            refresh_interval: Duration::from_secs(300),
            refresh_tick_timeout: Duration::from_secs(120),
            cdc_flush_interval: Duration::from_secs(5),
            cdc_batch_size: 1_000,
            cdc_slot: "leadflow_cdc".to_string(),
            city_fuzzy_threshold: DEFAULT_CITY_THRESHOLD,
            standardize_dir: None,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_or("DATABASE_URL", &defaults.database_url),
            redis_url: env_or("REDIS_URL", &defaults.redis_url),
            search_url: env_or("SEARCH_URL", &defaults.search_url),
            search_index: env_or("SEARCH_INDEX", &defaults.search_index),
            thresholds: StrategyThresholds {
                small: env_parse("LEADFLOW_BATCH_THRESHOLD_SMALL", defaults.thresholds.small),
                bulk: env_parse("LEADFLOW_BATCH_THRESHOLD_BULK", defaults.thresholds.bulk),
            },
            batch_timeout: Duration::from_secs(env_parse(
                "LEADFLOW_BATCH_TIMEOUT_SECS",
                defaults.batch_timeout.as_secs(),
            )),
            refresh_interval: Duration::from_secs(env_parse(
                "LEADFLOW_REFRESH_INTERVAL_SECS",
                defaults.refresh_interval.as_secs(),
            )),
            refresh_tick_timeout: Duration::from_secs(env_parse(
                "LEADFLOW_REFRESH_TICK_TIMEOUT_SECS",
                defaults.refresh_tick_timeout.as_secs(),
            )),
            cdc_flush_interval: Duration::from_secs(env_parse(
                "LEADFLOW_CDC_FLUSH_INTERVAL_SECS",
                defaults.cdc_flush_interval.as_secs(),
            )),
            cdc_batch_size: env_parse("LEADFLOW_CDC_BATCH_SIZE", defaults.cdc_batch_size),
            cdc_slot: env_or("LEADFLOW_CDC_SLOT", &defaults.cdc_slot),
            city_fuzzy_threshold: env_parse(
                "LEADFLOW_CITY_FUZZY_THRESHOLD",
                defaults.city_fuzzy_threshold,
            ),
            standardize_dir: std::env::var("LEADFLOW_STANDARDIZE_DIR").ok().map(PathBuf::from),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    /// Merge into the existing dataset (the default).
    Incremental,
    /// Truncate prospects and companies before loading.
    Clear,
}

impl FromStr for IngestMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "incremental" => Ok(Self::Incremental),
            "clear" => Ok(Self::Clear),
            other => bail!("unknown ingest mode {other:?}, expected incremental or clear"),
        }
    }
}

// ---------------------------------------------------------------------------
// Company resolution
// ---------------------------------------------------------------------------

/// Collapse per-row company facts into one record per domain.
///
/// Fields merge independently: for each field the last non-null value in row
/// order wins, except the employee-size pair which moves as a unit so a row
/// can never overwrite only half of another row's range.
pub fn resolve_companies(companies: Vec<CompanyRecord>) -> Vec<CompanyRecord> {
    let mut by_domain: BTreeMap<String, CompanyRecord> = BTreeMap::new();
    for company in companies {
        match by_domain.get_mut(&company.domain) {
            None => {
                by_domain.insert(company.domain.clone(), company);
            }
            Some(existing) => merge_company(existing, company),
        }
    }
    by_domain.into_values().collect()
}

/// Keep the last occurrence of each prospect key. A multi-row statement
/// cannot upsert the same key twice, and later rows supersede earlier ones
/// anyway.
pub fn dedupe_prospects(prospects: Vec<ProspectRecord>) -> Vec<ProspectRecord> {
    let mut by_key: BTreeMap<(String, String), ProspectRecord> = BTreeMap::new();
    for prospect in prospects {
        by_key.insert(
            (prospect.external_source.clone(), prospect.external_id.clone()),
            prospect,
        );
    }
    by_key.into_values().collect()
}

fn merge_company(into: &mut CompanyRecord, from: CompanyRecord) {
    fn take(slot: &mut Option<String>, value: Option<String>) {
        if value.is_some() {
            *slot = value;
        }
    }
    if !from.name.starts_with("Company-") || into.name.starts_with("Company-") {
        into.name = from.name;
    }
    take(&mut into.industry, from.industry);
    if from.min_employee_size.is_some() || from.max_employee_size.is_some() {
        into.min_employee_size = from.min_employee_size;
        into.max_employee_size = from.max_employee_size;
    }
    take(&mut into.employee_size_link, from.employee_size_link);
    if from.revenue.is_some() {
        into.revenue = from.revenue;
    }
    take(&mut into.address, from.address);
    take(&mut into.city, from.city);
    take(&mut into.state, from.state);
    take(&mut into.country, from.country);
    take(&mut into.zip_code, from.zip_code);
    take(&mut into.phone, from.phone);
    take(&mut into.mobile_phone, from.mobile_phone);
}

// ---------------------------------------------------------------------------
// View refresher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshOutcome {
    Refreshed,
    /// A previous refresh was still running; this tick did nothing.
    Skipped,
}

/// Keeps `company_prospect_view` current, with at most one refresh in flight.
pub struct ViewRefresher {
    pool: PgPool,
    tick_timeout: Duration,
    in_flight: AtomicBool,
}

struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ViewRefresher {
    pub fn new(pool: PgPool, tick_timeout: Duration) -> Self {
        Self {
            pool,
            tick_timeout,
            in_flight: AtomicBool::new(false),
        }
    }

    fn begin_tick(&self) -> Option<TickGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| TickGuard(&self.in_flight))
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Refresh now unless a refresh is already running.
    pub async fn run_once(&self) -> Result<RefreshOutcome, StorageError> {
        let Some(_guard) = self.begin_tick() else {
            info!(view = VIEW_NAME, "refresh already in flight, skipping");
            return Ok(RefreshOutcome::Skipped);
        };
        let started = std::time::Instant::now();
        let sql = format!("REFRESH MATERIALIZED VIEW CONCURRENTLY {VIEW_NAME}");
        tokio::time::timeout(self.tick_timeout, sqlx::query(&sql).execute(&self.pool))
            .await
            .map_err(|_| StorageError::Timeout(self.tick_timeout))??;
        info!(view = VIEW_NAME, elapsed = ?started.elapsed(), "view refreshed");
        Ok(RefreshOutcome::Refreshed)
    }

    /// Periodic loop. Ticks that land while a refresh is running are skipped,
    /// not queued; a failed tick is logged and the loop keeps going.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(view = VIEW_NAME, %err, "view refresh failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Ingestion pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub file: String,
    pub mode: IngestMode,
    pub strategy: UpsertStrategy,
    pub rows_read: usize,
    pub rows_rejected: usize,
    pub companies_written: usize,
    pub prospects_written: usize,
    pub rejections: Vec<(u64, String)>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct IngestPipeline {
    engine: UpsertEngine,
    cache: CacheStore,
    search: SearchIndexClient,
    refresher: Arc<ViewRefresher>,
    standardizer: Option<Standardizer>,
    config: PipelineConfig,
}

impl IngestPipeline {
    pub async fn connect(config: PipelineConfig) -> Result<Self> {
        let pool = leadflow_storage::connect_pool(&config.database_url)
            .await
            .context("connecting to the database")?;
        let cache = CacheStore::connect(&config.redis_url, "leadflow")
            .await
            .context("connecting to the cache store")?;
        let search = SearchIndexClient::new(
            &config.search_url,
            &config.search_index,
            BackoffPolicy::default(),
        )?;
        let standardizer = match &config.standardize_dir {
            Some(dir) => Some(
                Standardizer::load_dir(dir, config.city_fuzzy_threshold)
                    .with_context(|| format!("loading standardization tables from {}", dir.display()))?,
            ),
            None => None,
        };
        let refresher = Arc::new(ViewRefresher::new(pool.clone(), config.refresh_tick_timeout));
        let engine = UpsertEngine::new(pool, config.thresholds, config.batch_timeout);
        Ok(Self {
            engine,
            cache,
            search,
            refresher,
            standardizer,
            config,
        })
    }

    pub fn refresher(&self) -> Arc<ViewRefresher> {
        Arc::clone(&self.refresher)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Ingest one CSV file end to end.
    pub async fn ingest_file(&self, path: &Path, mode: IngestMode) -> Result<IngestSummary> {
        let span = info_span!("ingest", file = %path.display(), ?mode);
        self.ingest_file_inner(path, mode).instrument(span).await
    }

    async fn ingest_file_inner(&self, path: &Path, mode: IngestMode) -> Result<IngestSummary> {
        let started_at = Utc::now();
        let (rows, row_errors) =
            read_lead_file(path).with_context(|| format!("reading {}", path.display()))?;
        let rows_read = rows.len() + row_errors.len();

        let mut rejections: Vec<(u64, String)> = row_errors
            .iter()
            .map(|e| (e.row(), e.to_string()))
            .collect();

        let mut companies = Vec::with_capacity(rows.len());
        let mut prospects = Vec::with_capacity(rows.len());
        for (row_no, raw) in &rows {
            match normalize_row(*row_no, raw) {
                Ok((company, mut prospect)) => {
                    if let Some(std) = &self.standardizer {
                        apply_standardization(std, &mut prospect);
                    }
                    companies.push(company);
                    prospects.push(prospect);
                }
                Err(err) => {
                    warn!(row = err.row(), %err, "rejecting row");
                    rejections.push((err.row(), err.to_string()));
                }
            }
        }
        let companies = resolve_companies(companies);
        let prospects = dedupe_prospects(prospects);

        if mode == IngestMode::Clear {
            info!("clear mode: truncating prospects and companies");
            self.engine.clear_all().await?;
        }

        let outcome = self.engine.persist_batch(&companies, &prospects).await?;
        rejections.extend(outcome.skipped.iter().cloned());

        // Cached query results are stale the moment the batch lands. The
        // relay checkpoint lives in the same database, so carry it across
        // the flush instead of waiting for the next relay pass.
        let checkpoint = self.cache.get_checkpoint(CDC_CHECKPOINT).await.ok().flatten();
        if let Err(err) = self.cache.flush_all().await {
            warn!(%err, "cache flush failed after ingestion");
        } else if let Some(cursor) = checkpoint {
            if let Err(err) = self.cache.set_checkpoint(CDC_CHECKPOINT, &cursor).await {
                warn!(%err, "restoring relay checkpoint after cache flush failed");
            }
        }
        if let Err(err) = self.refresher.run_once().await {
            warn!(%err, "post-ingest view refresh failed");
        }

        let summary = IngestSummary {
            file: path.display().to_string(),
            mode,
            strategy: outcome.strategy,
            rows_read,
            rows_rejected: rejections.len(),
            companies_written: outcome.companies_written,
            prospects_written: outcome.prospects_written,
            rejections,
            started_at,
            finished_at: Utc::now(),
        };
        // Written after the flush so the record survives it.
        if let Ok(json) = serde_json::to_string(&summary) {
            if let Err(err) = self.cache.set_string(LAST_RUN_KEY, &json).await {
                warn!(%err, "failed to record last run");
            }
        }
        info!(
            rows = summary.rows_read,
            rejected = summary.rows_rejected,
            companies = summary.companies_written,
            prospects = summary.prospects_written,
            strategy = ?summary.strategy,
            "ingestion finished"
        );
        Ok(summary)
    }

    /// Ingest every `.csv` / `.tsv` file in a directory, in name order.
    pub async fn ingest_dir(&self, dir: &Path, mode: IngestMode) -> Result<Vec<IngestSummary>> {
        let mut paths = lead_files_in(dir)?;
        paths.sort();
        if paths.is_empty() {
            bail!("no .csv or .tsv files found in {}", dir.display());
        }

        let mut summaries = Vec::with_capacity(paths.len());
        // Clear once up front, then merge the rest incrementally.
        let mut mode = mode;
        for path in paths {
            summaries.push(self.ingest_file(&path, mode).await?);
            mode = IngestMode::Incremental;
        }
        Ok(summaries)
    }

    pub async fn status(&self) -> Result<PipelineStatus> {
        let counts = self.engine.counts().await?;
        let checkpoint = self.cache.get_checkpoint(CDC_CHECKPOINT).await?;
        let last_run = self
            .cache
            .get_string(LAST_RUN_KEY)
            .await?
            .and_then(|json| serde_json::from_str(&json).ok());
        Ok(PipelineStatus {
            counts,
            last_run,
            cdc_checkpoint: checkpoint,
            refresh_in_flight: self.refresher.is_in_flight(),
        })
    }

    pub async fn health(&self) -> HealthReport {
        let database = sqlx::query("SELECT 1").execute(self.engine.pool()).await.is_ok();
        let cache = self.cache.ping().await.is_ok();
        let search = self.search.ping().await.is_ok();
        HealthReport {
            database,
            cache,
            search,
        }
    }
}

fn lead_files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(std::fs::read_dir(dir)
        .with_context(|| format!("listing {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension().is_some_and(|ext| {
                ext.eq_ignore_ascii_case("csv") || ext.eq_ignore_ascii_case("tsv")
            })
        })
        .collect())
}

/// What an ingestion run would do, without touching any backing service.
#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub file: String,
    pub strategy: UpsertStrategy,
    pub rows_read: usize,
    pub rows_rejected: usize,
    pub companies: usize,
    pub prospects: usize,
    pub rejections: Vec<(u64, String)>,
}

/// Parse, normalize and resolve a file exactly as ingestion would, reporting
/// the outcome instead of persisting it.
pub fn dry_run_file(path: &Path, thresholds: StrategyThresholds) -> Result<DryRunReport> {
    let (rows, row_errors) =
        read_lead_file(path).with_context(|| format!("reading {}", path.display()))?;
    let rows_read = rows.len() + row_errors.len();

    let mut rejections: Vec<(u64, String)> =
        row_errors.iter().map(|e| (e.row(), e.to_string())).collect();
    let mut companies = Vec::new();
    let mut prospects = Vec::new();
    for (row_no, raw) in &rows {
        match normalize_row(*row_no, raw) {
            Ok((company, prospect)) => {
                companies.push(company);
                prospects.push(prospect);
            }
            Err(err) => rejections.push((err.row(), err.to_string())),
        }
    }
    let companies = resolve_companies(companies);
    let prospects = dedupe_prospects(prospects);

    Ok(DryRunReport {
        file: path.display().to_string(),
        strategy: leadflow_storage::select_strategy(prospects.len(), thresholds),
        rows_read,
        rows_rejected: rejections.len(),
        companies: companies.len(),
        prospects: prospects.len(),
        rejections,
    })
}

fn apply_standardization(std: &Standardizer, prospect: &mut ProspectRecord) {
    if let Some(country) = prospect.country.clone() {
        let out = std.standardize(FieldType::Country, &country, Scope::default());
        prospect.country_code = Some(out.code);
        prospect.country_display = Some(out.display);
    }
    if let Some(state) = prospect.state.clone() {
        let scope = Scope {
            country: prospect.country_display.as_deref(),
            state: None,
        };
        let out = std.standardize(FieldType::State, &state, scope);
        prospect.state_code = Some(out.code);
        prospect.state_display = Some(out.display);
    }
    if let Some(city) = prospect.city.clone() {
        // Scope by resolved display names; city candidates carry their
        // parent country/state by name.
        let scope = Scope {
            country: prospect.country_display.as_deref(),
            state: prospect.state_display.as_deref(),
        };
        let out = std.standardize(FieldType::City, &city, scope);
        prospect.city_code = Some(out.code);
        prospect.city_display = Some(out.display);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub counts: StoreCounts,
    /// Summary of the most recent ingestion run, if one is recorded.
    pub last_run: Option<serde_json::Value>,
    pub cdc_checkpoint: Option<String>,
    pub refresh_in_flight: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthReport {
    pub database: bool,
    pub cache: bool,
    pub search: bool,
}

impl HealthReport {
    pub fn is_ok(&self) -> bool {
        self.database && self.cache && self.search
    }

    pub fn status(&self) -> &'static str {
        if self.is_ok() {
            "ok"
        } else {
            "degraded"
        }
    }
}

// ---------------------------------------------------------------------------
// CDC relay
// ---------------------------------------------------------------------------

/// One decoded logical-decoding message we care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    ProspectUpsert {
        external_source: String,
        external_id: String,
    },
    ProspectDelete {
        external_source: String,
        external_id: String,
    },
    /// A company row changed; every prospect under its domain is re-emitted
    /// so the denormalized documents pick up the new company fields.
    CompanyChanged { domain: String },
}

#[derive(Debug, Deserialize)]
struct Wal2JsonChange {
    action: String,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    columns: Vec<Wal2JsonColumn>,
    #[serde(default)]
    identity: Vec<Wal2JsonColumn>,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonColumn {
    name: String,
    #[serde(default)]
    value: serde_json::Value,
}

fn column_text(columns: &[Wal2JsonColumn], name: &str) -> Option<String> {
    columns
        .iter()
        .find(|c| c.name == name)
        .and_then(|c| c.value.as_str().map(str::to_string))
}

/// Decode one wal2json (format-version 2) line. Transaction markers and
/// tables outside the pipeline return `None`.
pub fn parse_change(data: &str) -> Option<ChangeEvent> {
    let change: Wal2JsonChange = match serde_json::from_str(data) {
        Ok(change) => change,
        Err(err) => {
            warn!(%err, "undecodable logical replication message");
            return None;
        }
    };
    let table = change.table.as_deref()?;
    match (table, change.action.as_str()) {
        ("prospects", "I") | ("prospects", "U") => Some(ChangeEvent::ProspectUpsert {
            external_source: column_text(&change.columns, "external_source")?,
            external_id: column_text(&change.columns, "external_id")?,
        }),
        ("prospects", "D") => Some(ChangeEvent::ProspectDelete {
            external_source: column_text(&change.identity, "external_source")?,
            external_id: column_text(&change.identity, "external_id")?,
        }),
        ("companies", "I") | ("companies", "U") => Some(ChangeEvent::CompanyChanged {
            domain: column_text(&change.columns, "domain")?,
        }),
        _ => None,
    }
}

/// Net effect of one slot batch on the search index.
#[derive(Debug, Default, PartialEq)]
struct RelayPlan {
    prospect_keys: Vec<(String, String)>,
    deletes: Vec<String>,
    company_domains: Vec<String>,
}

/// Collapses a batch of wal2json messages per prospect key. Later changes
/// to the same key win: a delete cancels an earlier upsert and an upsert
/// cancels an earlier delete, so a document never carries both actions in
/// one bulk request.
fn plan_batch<'a>(changes: impl IntoIterator<Item = &'a str>) -> RelayPlan {
    let mut plan = RelayPlan::default();
    for data in changes {
        match parse_change(data) {
            Some(ChangeEvent::ProspectUpsert {
                external_source,
                external_id,
            }) => {
                let doc_id = format!("{external_source}:{external_id}");
                plan.deletes.retain(|d| d != &doc_id);
                let key = (external_source, external_id);
                plan.prospect_keys.retain(|k| k != &key);
                plan.prospect_keys.push(key);
            }
            Some(ChangeEvent::ProspectDelete {
                external_source,
                external_id,
            }) => {
                plan.prospect_keys
                    .retain(|k| k.0 != external_source || k.1 != external_id);
                let doc_id = format!("{external_source}:{external_id}");
                plan.deletes.retain(|d| d != &doc_id);
                plan.deletes.push(doc_id);
            }
            Some(ChangeEvent::CompanyChanged { domain }) => {
                if !plan.company_domains.contains(&domain) {
                    plan.company_domains.push(domain);
                }
            }
            None => {}
        }
    }
    plan
}

#[derive(sqlx::FromRow)]
struct DocRow {
    external_source: String,
    external_id: String,
    salutation: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    email: String,
    job_title: Option<String>,
    job_title_level: Option<String>,
    department: Option<String>,
    city: Option<String>,
    state: Option<String>,
    country: Option<String>,
    company_domain: String,
    company_name: Option<String>,
    company_industry: Option<String>,
    company_revenue: Option<i64>,
    company_min_employee_size: Option<i32>,
    company_max_employee_size: Option<i32>,
}

impl From<DocRow> for SearchDocument {
    fn from(r: DocRow) -> Self {
        SearchDocument {
            external_source: r.external_source,
            external_id: r.external_id,
            salutation: r.salutation,
            first_name: r.first_name,
            last_name: r.last_name,
            email: r.email,
            job_title: r.job_title,
            job_title_level: r.job_title_level,
            department: r.department,
            city: r.city,
            state: r.state,
            country: r.country,
            company_domain: r.company_domain,
            company_name: r.company_name,
            company_industry: r.company_industry,
            company_revenue: r.company_revenue,
            company_min_employee_size: r.company_min_employee_size,
            company_max_employee_size: r.company_max_employee_size,
        }
    }
}

const DOC_SELECT: &str = "SELECT p.external_source, p.external_id, p.salutation, p.first_name, \
     p.last_name, p.email, p.job_title, p.job_title_level, p.department, \
     COALESCE(p.city_display, p.city) AS city, COALESCE(p.state_display, p.state) AS state, \
     COALESCE(p.country_display, p.country) AS country, p.company_domain, \
     c.name AS company_name, c.industry AS company_industry, c.revenue AS company_revenue, \
     c.min_employee_size AS company_min_employee_size, \
     c.max_employee_size AS company_max_employee_size \
     FROM prospects p JOIN companies c ON c.domain = p.company_domain";

/// Streams committed changes from a logical replication slot into the search
/// index. Delivery is at-least-once: the slot and the cache checkpoint only
/// advance after the bulk write is acknowledged, and documents are keyed so
/// replays upsert in place.
pub struct CdcRelay {
    pool: PgPool,
    cache: CacheStore,
    search: SearchIndexClient,
    slot: String,
    batch_size: i64,
    flush_interval: Duration,
}

impl CdcRelay {
    pub fn new(
        pool: PgPool,
        cache: CacheStore,
        search: SearchIndexClient,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            pool,
            cache,
            search,
            slot: config.cdc_slot.clone(),
            batch_size: config.cdc_batch_size,
            flush_interval: config.cdc_flush_interval,
        }
    }

    /// Fail fast unless the server can do logical decoding, then create the
    /// slot if it does not exist yet.
    pub async fn ensure_slot(&self) -> Result<()> {
        let wal_level: String = sqlx::query_scalar("SHOW wal_level")
            .fetch_one(&self.pool)
            .await
            .context("reading wal_level")?;
        if wal_level != "logical" {
            bail!("wal_level is {wal_level:?}, logical decoding requires wal_level=logical");
        }
        let exists: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM pg_replication_slots WHERE slot_name = $1")
                .bind(&self.slot)
                .fetch_optional(&self.pool)
                .await?;
        if exists.is_none() {
            sqlx::query("SELECT pg_create_logical_replication_slot($1, 'wal2json')")
                .bind(&self.slot)
                .execute(&self.pool)
                .await
                .with_context(|| format!("creating replication slot {:?}", self.slot))?;
            info!(slot = %self.slot, "created logical replication slot");
        }
        Ok(())
    }

    /// Drain one batch from the slot. Returns the number of changes relayed.
    pub async fn relay_once(&self) -> Result<usize> {
        let changes: Vec<(String, String)> = sqlx::query_as(
            "SELECT lsn::text, data FROM pg_logical_slot_peek_changes($1, NULL, $2, \
             'format-version', '2', 'add-tables', 'public.companies,public.prospects')",
        )
        .bind(&self.slot)
        .bind(self.batch_size)
        .fetch_all(&self.pool)
        .await
        .context("peeking logical replication slot")?;

        let Some((last_lsn, _)) = changes.last().cloned() else {
            return Ok(0);
        };
        let consumed = changes.len();

        let plan = plan_batch(changes.iter().map(|(_, data)| data.as_str()));

        let mut documents = self.load_prospect_docs(&plan.prospect_keys).await?;
        for domain in &plan.company_domains {
            let extra = self.load_company_docs(domain).await?;
            for doc in extra {
                if !documents.iter().any(|d: &SearchDocument| d.doc_id() == doc.doc_id()) {
                    documents.push(doc);
                }
            }
        }

        self.search.bulk_write(&documents, &plan.deletes).await?;

        // The write is acknowledged, only now does the cursor move.
        sqlx::query("SELECT pg_replication_slot_advance($1, $2::pg_lsn)")
            .bind(&self.slot)
            .bind(&last_lsn)
            .execute(&self.pool)
            .await
            .context("advancing replication slot")?;
        self.cache.set_checkpoint(CDC_CHECKPOINT, &last_lsn).await?;

        info!(
            changes = consumed,
            documents = documents.len(),
            deletes = plan.deletes.len(),
            lsn = %last_lsn,
            "relayed batch to search index"
        );
        Ok(consumed)
    }

    async fn load_prospect_docs(&self, keys: &[(String, String)]) -> Result<Vec<SearchDocument>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let sources: Vec<String> = keys.iter().map(|(s, _)| s.clone()).collect();
        let ids: Vec<String> = keys.iter().map(|(_, i)| i.clone()).collect();
        let rows: Vec<DocRow> = sqlx::query_as(&format!(
            "{DOC_SELECT} WHERE (p.external_source, p.external_id) IN \
             (SELECT * FROM UNNEST($1::text[], $2::text[]))"
        ))
        .bind(sources)
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SearchDocument::from).collect())
    }

    async fn load_company_docs(&self, domain: &str) -> Result<Vec<SearchDocument>> {
        let rows: Vec<DocRow> = sqlx::query_as(&format!("{DOC_SELECT} WHERE c.domain = $1"))
            .bind(domain)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(SearchDocument::from).collect())
    }

    /// Long-running relay loop. Transient failures back off and retry; the
    /// unadvanced slot makes the next pass re-deliver the same batch.
    pub async fn run(&self) -> Result<()> {
        self.ensure_slot().await?;
        let backoff = BackoffPolicy::default();
        let mut failures = 0usize;
        loop {
            match self.relay_once().await {
                Ok(0) => {
                    failures = 0;
                    tokio::time::sleep(self.flush_interval).await;
                }
                Ok(_) => {
                    failures = 0;
                }
                Err(err) => {
                    error!(%err, "relay pass failed");
                    tokio::time::sleep(backoff.delay_for_attempt(failures)).await;
                    failures = failures.saturating_add(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_standardize::LookupEntry;
    use std::collections::HashMap;

    fn company(domain: &str) -> CompanyRecord {
        CompanyRecord {
            domain: domain.to_string(),
            name: format!("Company-{domain}"),
            industry: None,
            min_employee_size: None,
            max_employee_size: None,
            employee_size_link: None,
            revenue: None,
            address: None,
            city: None,
            state: None,
            country: None,
            zip_code: None,
            phone: None,
            mobile_phone: None,
            external_source: "csv".into(),
            external_id: format!("company_{domain}"),
        }
    }

    #[test]
    fn resolver_cross_fills_fields_across_rows() {
        let mut a = company("acme.com");
        a.industry = Some("Software".into());
        let mut b = company("acme.com");
        b.revenue = Some(5_000_000);

        let merged = resolve_companies(vec![a, b]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].industry.as_deref(), Some("Software"));
        assert_eq!(merged[0].revenue, Some(5_000_000));
    }

    #[test]
    fn resolver_last_non_null_wins() {
        let mut a = company("acme.com");
        a.city = Some("Austin".into());
        let mut b = company("acme.com");
        b.city = Some("Boston".into());
        let c = company("acme.com");

        let merged = resolve_companies(vec![a, b, c]);
        assert_eq!(merged[0].city.as_deref(), Some("Boston"));
    }

    #[test]
    fn resolver_replaces_employee_range_as_a_pair() {
        let mut a = company("acme.com");
        a.min_employee_size = Some(100);
        a.max_employee_size = Some(500);
        let mut b = company("acme.com");
        b.min_employee_size = Some(1_000);
        b.max_employee_size = None;

        let merged = resolve_companies(vec![a, b]);
        assert_eq!(merged[0].min_employee_size, Some(1_000));
        assert_eq!(merged[0].max_employee_size, None);
    }

    #[test]
    fn resolver_prefers_real_names_over_fallback() {
        let a = company("acme.com");
        let mut b = company("acme.com");
        b.name = "Acme Corp".into();
        let c = company("acme.com");

        let merged = resolve_companies(vec![a, b, c]);
        assert_eq!(merged[0].name, "Acme Corp");
    }

    #[test]
    fn resolver_keeps_domains_separate() {
        let merged = resolve_companies(vec![company("acme.com"), company("globex.com")]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn duplicate_prospect_keys_collapse_to_the_last_row() {
        let mut first = ProspectRecord {
            salutation: None,
            first_name: Some("Ada".into()),
            last_name: None,
            email: "a@acme.com".into(),
            job_title: None,
            job_title_level: None,
            job_title_link: None,
            department: None,
            address: None,
            city: None,
            state: None,
            country: None,
            country_code: None,
            country_display: None,
            state_code: None,
            state_display: None,
            city_code: None,
            city_display: None,
            zip_code: None,
            phone: None,
            mobile_phone: None,
            company_domain: "acme.com".into(),
            external_source: "csv".into(),
            external_id: "a@acme.com".into(),
        };
        let mut second = first.clone();
        first.job_title = Some("Engineer".into());
        second.job_title = Some("Director".into());

        let deduped = dedupe_prospects(vec![first, second]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].job_title.as_deref(), Some("Director"));
    }

    #[test]
    fn ingest_mode_parses_case_insensitively() {
        assert_eq!(IngestMode::from_str("Clear").unwrap(), IngestMode::Clear);
        assert_eq!(
            IngestMode::from_str("incremental").unwrap(),
            IngestMode::Incremental
        );
        assert!(IngestMode::from_str("replace").is_err());
    }

    #[test]
    fn config_defaults_cover_every_knob() {
        let config = PipelineConfig::default();
        assert_eq!(config.thresholds.small, 1_000);
        assert_eq!(config.thresholds.bulk, 1_000_000);
        assert_eq!(config.cdc_slot, "leadflow_cdc");
        assert_eq!(config.city_fuzzy_threshold, 85.0);
        assert!(config.standardize_dir.is_none());
    }

    #[test]
    fn standardization_fills_code_and_display_fields() {
        let mut tables = HashMap::new();
        tables.insert(
            FieldType::Country,
            vec![LookupEntry {
                name: "United States".into(),
                code: "US".into(),
                display: "United States".into(),
                country: None,
                state: None,
                aliases: vec!["USA".into()],
            }],
        );
        let std = Standardizer::new(tables, DEFAULT_CITY_THRESHOLD);

        let mut prospect = ProspectRecord {
            salutation: None,
            first_name: None,
            last_name: None,
            email: "a@acme.com".into(),
            job_title: None,
            job_title_level: None,
            job_title_link: None,
            department: None,
            address: None,
            city: None,
            state: None,
            country: Some("USA".into()),
            country_code: None,
            country_display: None,
            state_code: None,
            state_display: None,
            city_code: None,
            city_display: None,
            zip_code: None,
            phone: None,
            mobile_phone: None,
            company_domain: "acme.com".into(),
            external_source: "csv".into(),
            external_id: "a@acme.com".into(),
        };
        apply_standardization(&std, &mut prospect);
        assert_eq!(prospect.country_code.as_deref(), Some("US"));
        assert_eq!(prospect.country_display.as_deref(), Some("United States"));
    }

    #[test]
    fn wal2json_prospect_insert_decodes() {
        let data = r#"{"action":"I","schema":"public","table":"prospects","columns":[
            {"name":"external_source","type":"text","value":"csv"},
            {"name":"external_id","type":"text","value":"a@acme.com"},
            {"name":"email","type":"text","value":"a@acme.com"}]}"#;
        assert_eq!(
            parse_change(data),
            Some(ChangeEvent::ProspectUpsert {
                external_source: "csv".into(),
                external_id: "a@acme.com".into(),
            })
        );
    }

    #[test]
    fn wal2json_prospect_delete_uses_identity() {
        let data = r#"{"action":"D","schema":"public","table":"prospects","identity":[
            {"name":"external_source","type":"text","value":"csv"},
            {"name":"external_id","type":"text","value":"a@acme.com"}]}"#;
        assert_eq!(
            parse_change(data),
            Some(ChangeEvent::ProspectDelete {
                external_source: "csv".into(),
                external_id: "a@acme.com".into(),
            })
        );
    }

    #[test]
    fn wal2json_company_update_reports_domain() {
        let data = r#"{"action":"U","schema":"public","table":"companies","columns":[
            {"name":"domain","type":"text","value":"acme.com"},
            {"name":"name","type":"text","value":"Acme Corp"}]}"#;
        assert_eq!(
            parse_change(data),
            Some(ChangeEvent::CompanyChanged {
                domain: "acme.com".into(),
            })
        );
    }

    #[test]
    fn wal2json_transaction_markers_are_ignored() {
        assert_eq!(parse_change(r#"{"action":"B"}"#), None);
        assert_eq!(parse_change(r#"{"action":"C"}"#), None);
        assert_eq!(
            parse_change(r#"{"action":"I","schema":"public","table":"audit_log","columns":[]}"#),
            None
        );
        assert_eq!(parse_change("not json"), None);
    }

    fn prospect_insert(id: &str) -> String {
        format!(
            r#"{{"action":"I","schema":"public","table":"prospects","columns":[
                {{"name":"external_source","type":"text","value":"csv"}},
                {{"name":"external_id","type":"text","value":"{id}"}}]}}"#
        )
    }

    fn prospect_delete(id: &str) -> String {
        format!(
            r#"{{"action":"D","schema":"public","table":"prospects","identity":[
                {{"name":"external_source","type":"text","value":"csv"}},
                {{"name":"external_id","type":"text","value":"{id}"}}]}}"#
        )
    }

    #[test]
    fn batch_delete_then_reinsert_keeps_the_document() {
        let changes = [prospect_delete("a@acme.com"), prospect_insert("a@acme.com")];
        let plan = plan_batch(changes.iter().map(String::as_str));
        assert_eq!(
            plan.prospect_keys,
            vec![("csv".to_string(), "a@acme.com".to_string())]
        );
        assert!(plan.deletes.is_empty());
    }

    #[test]
    fn batch_insert_then_delete_collapses_to_delete() {
        let changes = [prospect_insert("a@acme.com"), prospect_delete("a@acme.com")];
        let plan = plan_batch(changes.iter().map(String::as_str));
        assert!(plan.prospect_keys.is_empty());
        assert_eq!(plan.deletes, vec!["csv:a@acme.com".to_string()]);
    }

    #[test]
    fn batch_keeps_distinct_keys_and_dedupes_domains() {
        let company = r#"{"action":"U","schema":"public","table":"companies","columns":[
            {"name":"domain","type":"text","value":"acme.com"}]}"#;
        let changes = [
            prospect_insert("a@acme.com"),
            prospect_delete("b@acme.com"),
            company.to_string(),
            company.to_string(),
        ];
        let plan = plan_batch(changes.iter().map(String::as_str));
        assert_eq!(
            plan.prospect_keys,
            vec![("csv".to_string(), "a@acme.com".to_string())]
        );
        assert_eq!(plan.deletes, vec!["csv:b@acme.com".to_string()]);
        assert_eq!(plan.company_domains, vec!["acme.com".to_string()]);
    }

    #[test]
    fn dry_run_reports_without_a_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leads.csv");
        std::fs::write(
            &path,
            "Email address,Company\na@acme.com,Acme\nb@acme.com,\nno-at-sign,Broken\n",
        )
        .unwrap();

        let report = dry_run_file(&path, StrategyThresholds::default()).unwrap();
        assert_eq!(report.rows_read, 3);
        assert_eq!(report.prospects, 2);
        assert_eq!(report.companies, 1);
        assert_eq!(report.rows_rejected, 1);
        assert_eq!(report.strategy, UpsertStrategy::Validated);
    }

    #[tokio::test]
    async fn refresher_admits_one_tick_at_a_time() {
        let pool = PgPool::connect_lazy("postgres://localhost/leadflow").unwrap();
        let refresher = ViewRefresher::new(pool, Duration::from_secs(1));

        let guard = refresher.begin_tick();
        assert!(guard.is_some());
        assert!(refresher.is_in_flight());
        assert!(refresher.begin_tick().is_none());

        drop(guard);
        assert!(!refresher.is_in_flight());
        assert!(refresher.begin_tick().is_some());
    }

    #[test]
    fn health_report_degrades_on_any_component() {
        let healthy = HealthReport {
            database: true,
            cache: true,
            search: true,
        };
        assert_eq!(healthy.status(), "ok");
        let degraded = HealthReport {
            database: true,
            cache: false,
            search: true,
        };
        assert_eq!(degraded.status(), "degraded");
    }
}
