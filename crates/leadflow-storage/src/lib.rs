//! Relational upsert engine, cache/checkpoint store and search index client.

use std::fmt::Write as _;
use std::time::Duration;

use leadflow_core::{CompanyRecord, ProspectRecord};
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "leadflow-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),
    #[error("search index request failed: {0}")]
    Search(#[from] reqwest::Error),
    #[error("search index bulk write reported item errors: {0}")]
    SearchBulk(String),
    #[error("batch timed out after {0:?}")]
    Timeout(Duration),
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// Upsert strategy selection
// ---------------------------------------------------------------------------

/// Volume-adaptive write method, selected purely from the batch row count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertStrategy {
    /// Per-row statements with full validation; strongest guarantees.
    Validated,
    /// Multi-row `UNNEST` upserts; required-field validation only.
    Batched,
    /// `COPY` into an unconstrained temp table, then one set-based merge.
    StagingMerge,
}

#[derive(Debug, Clone, Copy)]
pub struct StrategyThresholds {
    /// Below this row count the validated single-row path is used.
    pub small: usize,
    /// At or above this row count the staging-table path is used.
    pub bulk: usize,
}

impl Default for StrategyThresholds {
    fn default() -> Self {
        Self {
            small: 1_000,
            bulk: 1_000_000,
        }
    }
}

pub fn select_strategy(row_count: usize, thresholds: StrategyThresholds) -> UpsertStrategy {
    if row_count < thresholds.small {
        UpsertStrategy::Validated
    } else if row_count < thresholds.bulk {
        UpsertStrategy::Batched
    } else {
        UpsertStrategy::StagingMerge
    }
}

// ---------------------------------------------------------------------------
// SQL text
// ---------------------------------------------------------------------------

const COMPANY_COLUMNS: &str = "domain, name, industry, min_employee_size, max_employee_size, \
     employee_size_link, revenue, address, city, state, country, zip_code, phone, mobile_phone, \
     external_source, external_id";

// Last-non-null-wins per field; the employee-size pair is replaced atomically
// so min and max never mix sources.
const COMPANY_CONFLICT: &str = "ON CONFLICT (domain) DO UPDATE SET \
     name = COALESCE(EXCLUDED.name, companies.name), \
     industry = COALESCE(EXCLUDED.industry, companies.industry), \
     min_employee_size = CASE WHEN EXCLUDED.min_employee_size IS NOT NULL OR EXCLUDED.max_employee_size IS NOT NULL \
         THEN EXCLUDED.min_employee_size ELSE companies.min_employee_size END, \
     max_employee_size = CASE WHEN EXCLUDED.min_employee_size IS NOT NULL OR EXCLUDED.max_employee_size IS NOT NULL \
         THEN EXCLUDED.max_employee_size ELSE companies.max_employee_size END, \
     employee_size_link = COALESCE(EXCLUDED.employee_size_link, companies.employee_size_link), \
     revenue = COALESCE(EXCLUDED.revenue, companies.revenue), \
     address = COALESCE(EXCLUDED.address, companies.address), \
     city = COALESCE(EXCLUDED.city, companies.city), \
     state = COALESCE(EXCLUDED.state, companies.state), \
     country = COALESCE(EXCLUDED.country, companies.country), \
     zip_code = COALESCE(EXCLUDED.zip_code, companies.zip_code), \
     phone = COALESCE(EXCLUDED.phone, companies.phone), \
     mobile_phone = COALESCE(EXCLUDED.mobile_phone, companies.mobile_phone), \
     updated_at = NOW()";

const PROSPECT_COLUMNS: &str = "salutation, first_name, last_name, email, job_title, \
     job_title_level, job_title_link, department, address, city, state, country, country_code, \
     country_display, state_code, state_display, city_code, city_display, zip_code, phone, \
     mobile_phone, company_domain, external_source, external_id";

// Prospects overwrite in place: the latest successful write wins by value.
const PROSPECT_CONFLICT: &str = "ON CONFLICT (external_source, external_id) DO UPDATE SET \
     salutation = EXCLUDED.salutation, \
     first_name = EXCLUDED.first_name, \
     last_name = EXCLUDED.last_name, \
     email = EXCLUDED.email, \
     job_title = EXCLUDED.job_title, \
     job_title_level = EXCLUDED.job_title_level, \
     job_title_link = EXCLUDED.job_title_link, \
     department = EXCLUDED.department, \
     address = EXCLUDED.address, \
     city = EXCLUDED.city, \
     state = EXCLUDED.state, \
     country = EXCLUDED.country, \
     country_code = EXCLUDED.country_code, \
     country_display = EXCLUDED.country_display, \
     state_code = EXCLUDED.state_code, \
     state_display = EXCLUDED.state_display, \
     city_code = EXCLUDED.city_code, \
     city_display = EXCLUDED.city_display, \
     zip_code = EXCLUDED.zip_code, \
     phone = EXCLUDED.phone, \
     mobile_phone = EXCLUDED.mobile_phone, \
     company_domain = EXCLUDED.company_domain, \
     updated_at = NOW()";

fn company_row_sql() -> String {
    let params = (1..=16).map(|i| format!("${i}")).collect::<Vec<_>>().join(", ");
    format!("INSERT INTO companies ({COMPANY_COLUMNS}, created_at, updated_at) VALUES ({params}, NOW(), NOW()) {COMPANY_CONFLICT}")
}

fn prospect_row_sql() -> String {
    let params = (1..=24).map(|i| format!("${i}")).collect::<Vec<_>>().join(", ");
    format!("INSERT INTO prospects ({PROSPECT_COLUMNS}, created_at, updated_at) VALUES ({params}, NOW(), NOW()) {PROSPECT_CONFLICT}")
}

fn company_unnest_sql() -> String {
    format!(
        "INSERT INTO companies ({COMPANY_COLUMNS}, created_at, updated_at) \
         SELECT u.*, NOW(), NOW() FROM UNNEST(\
         $1::text[], $2::text[], $3::text[], $4::int4[], $5::int4[], $6::text[], $7::int8[], \
         $8::text[], $9::text[], $10::text[], $11::text[], $12::text[], $13::text[], $14::text[], \
         $15::text[], $16::text[]) AS u({COMPANY_COLUMNS}) {COMPANY_CONFLICT}"
    )
}

fn prospect_unnest_sql() -> String {
    format!(
        "INSERT INTO prospects ({PROSPECT_COLUMNS}, created_at, updated_at) \
         SELECT u.*, NOW(), NOW() FROM UNNEST(\
         $1::text[], $2::text[], $3::text[], $4::text[], $5::text[], $6::text[], $7::text[], \
         $8::text[], $9::text[], $10::text[], $11::text[], $12::text[], $13::text[], $14::text[], \
         $15::text[], $16::text[], $17::text[], $18::text[], $19::text[], $20::text[], \
         $21::text[], $22::text[], $23::text[], $24::text[]) AS u({PROSPECT_COLUMNS}) {PROSPECT_CONFLICT}"
    )
}

fn company_merge_sql() -> String {
    format!(
        "INSERT INTO companies ({COMPANY_COLUMNS}, created_at, updated_at) \
         SELECT DISTINCT ON (domain) {COMPANY_COLUMNS}, NOW(), NOW() \
         FROM staging_companies ORDER BY domain, ordinal DESC {COMPANY_CONFLICT}"
    )
}

fn prospect_merge_sql() -> String {
    format!(
        "INSERT INTO prospects ({PROSPECT_COLUMNS}, created_at, updated_at) \
         SELECT DISTINCT ON (external_source, external_id) {PROSPECT_COLUMNS}, NOW(), NOW() \
         FROM staging_prospects ORDER BY external_source, external_id, ordinal DESC {PROSPECT_CONFLICT}"
    )
}

// ---------------------------------------------------------------------------
// COPY row encoding (text format, tab separated)
// ---------------------------------------------------------------------------

/// Encode one row for `COPY ... FROM STDIN` text format. `None` becomes `\N`.
pub fn encode_copy_row(fields: &[Option<&str>]) -> String {
    let mut line = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            line.push('\t');
        }
        match field {
            None => line.push_str("\\N"),
            Some(value) => {
                for c in value.chars() {
                    match c {
                        '\\' => line.push_str("\\\\"),
                        '\t' => line.push_str("\\t"),
                        '\n' => line.push_str("\\n"),
                        '\r' => line.push_str("\\r"),
                        other => line.push(other),
                    }
                }
            }
        }
    }
    line.push('\n');
    line
}

fn company_copy_row(ordinal: usize, c: &CompanyRecord) -> String {
    let min = c.min_employee_size.map(|v| v.to_string());
    let max = c.max_employee_size.map(|v| v.to_string());
    let revenue = c.revenue.map(|v| v.to_string());
    let ordinal = ordinal.to_string();
    encode_copy_row(&[
        Some(ordinal.as_str()),
        Some(c.domain.as_str()),
        Some(c.name.as_str()),
        c.industry.as_deref(),
        min.as_deref(),
        max.as_deref(),
        c.employee_size_link.as_deref(),
        revenue.as_deref(),
        c.address.as_deref(),
        c.city.as_deref(),
        c.state.as_deref(),
        c.country.as_deref(),
        c.zip_code.as_deref(),
        c.phone.as_deref(),
        c.mobile_phone.as_deref(),
        Some(c.external_source.as_str()),
        Some(c.external_id.as_str()),
    ])
}

fn prospect_copy_row(ordinal: usize, p: &ProspectRecord) -> String {
    let ordinal = ordinal.to_string();
    encode_copy_row(&[
        Some(ordinal.as_str()),
        p.salutation.as_deref(),
        p.first_name.as_deref(),
        p.last_name.as_deref(),
        Some(p.email.as_str()),
        p.job_title.as_deref(),
        p.job_title_level.as_deref(),
        p.job_title_link.as_deref(),
        p.department.as_deref(),
        p.address.as_deref(),
        p.city.as_deref(),
        p.state.as_deref(),
        p.country.as_deref(),
        p.country_code.as_deref(),
        p.country_display.as_deref(),
        p.state_code.as_deref(),
        p.state_display.as_deref(),
        p.city_code.as_deref(),
        p.city_display.as_deref(),
        p.zip_code.as_deref(),
        p.phone.as_deref(),
        p.mobile_phone.as_deref(),
        Some(p.company_domain.as_str()),
        Some(p.external_source.as_str()),
        Some(p.external_id.as_str()),
    ])
}

// ---------------------------------------------------------------------------
// Record validation
// ---------------------------------------------------------------------------

/// Required-field check applied on every path.
pub fn validate_company(c: &CompanyRecord) -> Result<(), String> {
    if c.domain.trim().is_empty() {
        return Err("company domain is empty".into());
    }
    if c.external_source.is_empty() || c.external_id.is_empty() {
        return Err("company external identity is empty".into());
    }
    Ok(())
}

/// Full check for the validated single-row path.
pub fn validate_company_strict(c: &CompanyRecord) -> Result<(), String> {
    validate_company(c)?;
    if c.name.trim().is_empty() {
        return Err("company name is empty".into());
    }
    if let (Some(min), Some(max)) = (c.min_employee_size, c.max_employee_size) {
        if min > max {
            return Err(format!("employee size range inverted: {min} > {max}"));
        }
    }
    if matches!(c.revenue, Some(r) if r < 0) {
        return Err("revenue is negative".into());
    }
    Ok(())
}

pub fn validate_prospect(p: &ProspectRecord) -> Result<(), String> {
    if !p.email.contains('@') {
        return Err(format!("prospect email {:?} has no '@'", p.email));
    }
    if p.company_domain.trim().is_empty() {
        return Err("prospect has no owning company domain".into());
    }
    if p.external_source.is_empty() || p.external_id.is_empty() {
        return Err("prospect external identity is empty".into());
    }
    Ok(())
}

pub fn validate_prospect_strict(p: &ProspectRecord) -> Result<(), String> {
    validate_prospect(p)?;
    let domain = p.email.rsplit('@').next().unwrap_or_default().to_ascii_lowercase();
    if domain != p.company_domain {
        return Err(format!(
            "prospect email domain {domain:?} does not match company domain {:?}",
            p.company_domain
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Upsert engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct UpsertOutcome {
    pub strategy: UpsertStrategy,
    pub companies_written: usize,
    pub prospects_written: usize,
    pub skipped: Vec<(u64, String)>,
}

/// Writes normalized batches into Postgres with volume-adaptive strategies.
///
/// Companies always commit before their dependent prospects; each phase runs
/// in one transaction, so a transport failure leaves no partial commit.
pub struct UpsertEngine {
    pool: PgPool,
    thresholds: StrategyThresholds,
    batch_timeout: Duration,
}

impl UpsertEngine {
    pub fn new(pool: PgPool, thresholds: StrategyThresholds, batch_timeout: Duration) -> Self {
        Self {
            pool,
            thresholds,
            batch_timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Persist one normalized batch. The strategy is picked from the pair
    /// count (one raw row produces one prospect).
    pub async fn persist_batch(
        &self,
        companies: &[CompanyRecord],
        prospects: &[ProspectRecord],
    ) -> Result<UpsertOutcome, StorageError> {
        let strategy = select_strategy(prospects.len(), self.thresholds);
        info!(
            ?strategy,
            companies = companies.len(),
            prospects = prospects.len(),
            "persisting batch"
        );

        let mut skipped = Vec::new();
        let companies_written = self
            .run_phase(self.write_companies(strategy, companies, &mut skipped))
            .await?;
        let prospects_written = self
            .run_phase(self.write_prospects(strategy, prospects, &mut skipped))
            .await?;

        Ok(UpsertOutcome {
            strategy,
            companies_written,
            prospects_written,
            skipped,
        })
    }

    async fn run_phase<F>(&self, fut: F) -> Result<usize, StorageError>
    where
        F: std::future::Future<Output = Result<usize, StorageError>>,
    {
        tokio::time::timeout(self.batch_timeout, fut)
            .await
            .map_err(|_| StorageError::Timeout(self.batch_timeout))?
    }

    async fn write_companies(
        &self,
        strategy: UpsertStrategy,
        companies: &[CompanyRecord],
        skipped: &mut Vec<(u64, String)>,
    ) -> Result<usize, StorageError> {
        let strict = strategy == UpsertStrategy::Validated;
        let mut accepted = Vec::with_capacity(companies.len());
        for (idx, company) in companies.iter().enumerate() {
            let check = if strict {
                validate_company_strict(company)
            } else {
                validate_company(company)
            };
            match check {
                Ok(()) => accepted.push(company),
                Err(reason) => {
                    warn!(row = idx, %reason, "skipping malformed company row");
                    skipped.push((idx as u64, reason));
                }
            }
        }
        if accepted.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        match strategy {
            UpsertStrategy::Validated => {
                let sql = company_row_sql();
                for &company in &accepted {
                    bind_company(sqlx::query(&sql), company).execute(&mut *tx).await?;
                }
            }
            UpsertStrategy::Batched => {
                let sql = company_unnest_sql();
                for chunk in accepted.chunks(1_000) {
                    bind_company_arrays(sqlx::query(&sql), chunk).execute(&mut *tx).await?;
                }
            }
            UpsertStrategy::StagingMerge => {
                sqlx::query(
                    "CREATE TEMP TABLE staging_companies \
                     (ordinal int8, LIKE companies INCLUDING DEFAULTS) ON COMMIT DROP",
                )
                .execute(&mut *tx)
                .await?;
                let mut payload = String::new();
                for (ordinal, &company) in accepted.iter().enumerate() {
                    payload.push_str(&company_copy_row(ordinal, company));
                }
                copy_into(&mut tx, &format!("COPY staging_companies (ordinal, {COMPANY_COLUMNS}) FROM STDIN"), payload).await?;
                sqlx::query(&company_merge_sql()).execute(&mut *tx).await?;
            }
        }
        tx.commit().await?;
        Ok(accepted.len())
    }

    async fn write_prospects(
        &self,
        strategy: UpsertStrategy,
        prospects: &[ProspectRecord],
        skipped: &mut Vec<(u64, String)>,
    ) -> Result<usize, StorageError> {
        let strict = strategy == UpsertStrategy::Validated;
        let mut accepted = Vec::with_capacity(prospects.len());
        for (idx, prospect) in prospects.iter().enumerate() {
            let check = if strict {
                validate_prospect_strict(prospect)
            } else {
                validate_prospect(prospect)
            };
            match check {
                Ok(()) => accepted.push(prospect),
                Err(reason) => {
                    warn!(row = idx, %reason, "skipping malformed prospect row");
                    skipped.push((idx as u64, reason));
                }
            }
        }
        if accepted.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        match strategy {
            UpsertStrategy::Validated => {
                let sql = prospect_row_sql();
                for &prospect in &accepted {
                    bind_prospect(sqlx::query(&sql), prospect).execute(&mut *tx).await?;
                }
            }
            UpsertStrategy::Batched => {
                let sql = prospect_unnest_sql();
                for chunk in accepted.chunks(1_000) {
                    bind_prospect_arrays(sqlx::query(&sql), chunk).execute(&mut *tx).await?;
                }
            }
            UpsertStrategy::StagingMerge => {
                sqlx::query(
                    "CREATE TEMP TABLE staging_prospects \
                     (ordinal int8, LIKE prospects INCLUDING DEFAULTS) ON COMMIT DROP",
                )
                .execute(&mut *tx)
                .await?;
                let mut payload = String::new();
                for (ordinal, &prospect) in accepted.iter().enumerate() {
                    payload.push_str(&prospect_copy_row(ordinal, prospect));
                }
                copy_into(&mut tx, &format!("COPY staging_prospects (ordinal, {PROSPECT_COLUMNS}) FROM STDIN"), payload).await?;
                sqlx::query(&prospect_merge_sql()).execute(&mut *tx).await?;
            }
        }
        tx.commit().await?;
        Ok(accepted.len())
    }

    /// `clear` ingestion mode: drop dependents first, then owners.
    pub async fn clear_all(&self) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM prospects").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM companies").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn counts(&self) -> Result<StoreCounts, StorageError> {
        let companies: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM companies")
            .fetch_one(&self.pool)
            .await?;
        let prospects: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM prospects")
            .fetch_one(&self.pool)
            .await?;
        // The view may not exist yet on a fresh database; report zero but
        // keep the error visible.
        let view_rows: i64 = match sqlx::query_scalar("SELECT COUNT(*) FROM company_prospect_view")
            .fetch_one(&self.pool)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(%err, "counting company_prospect_view failed, reporting zero");
                0
            }
        };
        Ok(StoreCounts {
            companies,
            prospects,
            view_rows,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StoreCounts {
    pub companies: i64,
    pub prospects: i64,
    pub view_rows: i64,
}

async fn copy_into(
    tx: &mut Transaction<'_, Postgres>,
    statement: &str,
    payload: String,
) -> Result<(), StorageError> {
    let mut sink = tx.copy_in_raw(statement).await?;
    sink.send(payload.as_bytes()).await?;
    sink.finish().await?;
    Ok(())
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

fn bind_company<'q>(query: PgQuery<'q>, c: &'q CompanyRecord) -> PgQuery<'q> {
    query
        .bind(&c.domain)
        .bind(&c.name)
        .bind(&c.industry)
        .bind(c.min_employee_size)
        .bind(c.max_employee_size)
        .bind(&c.employee_size_link)
        .bind(c.revenue)
        .bind(&c.address)
        .bind(&c.city)
        .bind(&c.state)
        .bind(&c.country)
        .bind(&c.zip_code)
        .bind(&c.phone)
        .bind(&c.mobile_phone)
        .bind(&c.external_source)
        .bind(&c.external_id)
}

fn bind_company_arrays<'q>(query: PgQuery<'q>, chunk: &[&CompanyRecord]) -> PgQuery<'q> {
    let col = |f: fn(&CompanyRecord) -> Option<String>| -> Vec<Option<String>> {
        chunk.iter().map(|c| f(c)).collect()
    };
    query
        .bind(chunk.iter().map(|c| c.domain.clone()).collect::<Vec<_>>())
        .bind(chunk.iter().map(|c| c.name.clone()).collect::<Vec<_>>())
        .bind(col(|c| c.industry.clone()))
        .bind(chunk.iter().map(|c| c.min_employee_size).collect::<Vec<_>>())
        .bind(chunk.iter().map(|c| c.max_employee_size).collect::<Vec<_>>())
        .bind(col(|c| c.employee_size_link.clone()))
        .bind(chunk.iter().map(|c| c.revenue).collect::<Vec<_>>())
        .bind(col(|c| c.address.clone()))
        .bind(col(|c| c.city.clone()))
        .bind(col(|c| c.state.clone()))
        .bind(col(|c| c.country.clone()))
        .bind(col(|c| c.zip_code.clone()))
        .bind(col(|c| c.phone.clone()))
        .bind(col(|c| c.mobile_phone.clone()))
        .bind(chunk.iter().map(|c| c.external_source.clone()).collect::<Vec<_>>())
        .bind(chunk.iter().map(|c| c.external_id.clone()).collect::<Vec<_>>())
}

fn bind_prospect<'q>(query: PgQuery<'q>, p: &'q ProspectRecord) -> PgQuery<'q> {
    query
        .bind(&p.salutation)
        .bind(&p.first_name)
        .bind(&p.last_name)
        .bind(&p.email)
        .bind(&p.job_title)
        .bind(&p.job_title_level)
        .bind(&p.job_title_link)
        .bind(&p.department)
        .bind(&p.address)
        .bind(&p.city)
        .bind(&p.state)
        .bind(&p.country)
        .bind(&p.country_code)
        .bind(&p.country_display)
        .bind(&p.state_code)
        .bind(&p.state_display)
        .bind(&p.city_code)
        .bind(&p.city_display)
        .bind(&p.zip_code)
        .bind(&p.phone)
        .bind(&p.mobile_phone)
        .bind(&p.company_domain)
        .bind(&p.external_source)
        .bind(&p.external_id)
}

fn bind_prospect_arrays<'q>(query: PgQuery<'q>, chunk: &[&ProspectRecord]) -> PgQuery<'q> {
    let col = |f: fn(&ProspectRecord) -> Option<String>| -> Vec<Option<String>> {
        chunk.iter().map(|p| f(p)).collect()
    };
    query
        .bind(col(|p| p.salutation.clone()))
        .bind(col(|p| p.first_name.clone()))
        .bind(col(|p| p.last_name.clone()))
        .bind(chunk.iter().map(|p| p.email.clone()).collect::<Vec<_>>())
        .bind(col(|p| p.job_title.clone()))
        .bind(col(|p| p.job_title_level.clone()))
        .bind(col(|p| p.job_title_link.clone()))
        .bind(col(|p| p.department.clone()))
        .bind(col(|p| p.address.clone()))
        .bind(col(|p| p.city.clone()))
        .bind(col(|p| p.state.clone()))
        .bind(col(|p| p.country.clone()))
        .bind(col(|p| p.country_code.clone()))
        .bind(col(|p| p.country_display.clone()))
        .bind(col(|p| p.state_code.clone()))
        .bind(col(|p| p.state_display.clone()))
        .bind(col(|p| p.city_code.clone()))
        .bind(col(|p| p.city_display.clone()))
        .bind(col(|p| p.zip_code.clone()))
        .bind(col(|p| p.phone.clone()))
        .bind(col(|p| p.mobile_phone.clone()))
        .bind(chunk.iter().map(|p| p.company_domain.clone()).collect::<Vec<_>>())
        .bind(chunk.iter().map(|p| p.external_source.clone()).collect::<Vec<_>>())
        .bind(chunk.iter().map(|p| p.external_id.clone()).collect::<Vec<_>>())
}

/// Connect a pool sized for bulk ingestion work.
pub async fn connect_pool(database_url: &str) -> Result<PgPool, StorageError> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

// ---------------------------------------------------------------------------
// Cache + CDC checkpoint store (redis)
// ---------------------------------------------------------------------------

/// Shared cache layer. The pipeline only ever flushes it wholesale and uses
/// it to persist the CDC checkpoint cursor.
#[derive(Clone)]
pub struct CacheStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl CacheStore {
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url, "connected to cache store");
        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
        })
    }

    /// Coarse-grained invalidation after a successful ingestion batch.
    pub async fn flush_all(&self) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await?;
        info!("cache flushed after ingestion");
        Ok(())
    }

    pub async fn get_string(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(format!("{}:{}", self.key_prefix, key)).await?;
        Ok(value)
    }

    pub async fn set_string(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(format!("{}:{}", self.key_prefix, key), value)
            .await?;
        Ok(())
    }

    pub async fn get_checkpoint(&self, name: &str) -> Result<Option<String>, StorageError> {
        self.get_string(&format!("checkpoint:{name}")).await
    }

    /// Advanced only after the corresponding index write is acknowledged.
    /// The replication slot is authoritative; this cursor is reporting only.
    pub async fn set_checkpoint(&self, name: &str, cursor: &str) -> Result<(), StorageError> {
        self.set_string(&format!("checkpoint:{name}"), cursor).await
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Search index client
// ---------------------------------------------------------------------------

/// One denormalized search document per prospect, keyed by its external
/// identity so CDC re-delivery upserts instead of duplicating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub external_source: String,
    pub external_id: String,
    pub salutation: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: String,
    pub job_title: Option<String>,
    pub job_title_level: Option<String>,
    pub department: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub company_domain: String,
    pub company_name: Option<String>,
    pub company_industry: Option<String>,
    pub company_revenue: Option<i64>,
    pub company_min_employee_size: Option<i32>,
    pub company_max_employee_size: Option<i32>,
}

impl SearchDocument {
    /// Stable `_id` shared with the relational conflict key.
    pub fn doc_id(&self) -> String {
        format!("{}:{}", self.external_source, self.external_id)
    }
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
}

pub struct SearchIndexClient {
    client: reqwest::Client,
    base_url: String,
    index: String,
    backoff: BackoffPolicy,
}

impl SearchIndexClient {
    pub fn new(base_url: &str, index: &str, backoff: BackoffPolicy) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            index: index.to_string(),
            backoff,
        })
    }

    /// Render the NDJSON body for a bulk upsert + delete request.
    pub fn bulk_body(&self, upserts: &[SearchDocument], deletes: &[String]) -> String {
        let mut body = String::new();
        for doc in upserts {
            let _ = writeln!(
                body,
                "{}",
                serde_json::json!({"index": {"_index": self.index, "_id": doc.doc_id()}})
            );
            let _ = writeln!(body, "{}", serde_json::to_string(doc).expect("document serializes"));
        }
        for id in deletes {
            let _ = writeln!(
                body,
                "{}",
                serde_json::json!({"delete": {"_index": self.index, "_id": id}})
            );
        }
        body
    }

    /// Idempotent bulk write with bounded retry; an `errors: true` bulk
    /// response is surfaced as a flush failure so the checkpoint stays put.
    pub async fn bulk_write(
        &self,
        upserts: &[SearchDocument],
        deletes: &[String],
    ) -> Result<(), StorageError> {
        if upserts.is_empty() && deletes.is_empty() {
            return Ok(());
        }
        let url = format!("{}/_bulk", self.base_url);
        let body = self.bulk_body(upserts, deletes);

        let mut last_err: Option<StorageError> = None;
        for attempt in 0..=self.backoff.max_retries {
            let result = self
                .client
                .post(&url)
                .header("content-type", "application/x-ndjson")
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    let parsed: BulkResponse = resp.json().await?;
                    if parsed.errors {
                        return Err(StorageError::SearchBulk(format!(
                            "{} upserts / {} deletes had item failures",
                            upserts.len(),
                            deletes.len()
                        )));
                    }
                    return Ok(());
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !status.is_server_error() {
                        return Err(StorageError::SearchBulk(format!("http status {status}")));
                    }
                    last_err = Some(StorageError::SearchBulk(format!("http status {status}")));
                }
                Err(err) => last_err = Some(StorageError::Search(err)),
            }

            if attempt < self.backoff.max_retries {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            }
        }
        Err(last_err.expect("retry loop records an error before exhausting"))
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        self.client
            .get(&self.base_url)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
