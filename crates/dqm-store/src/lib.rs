//! Relational mirror store (Postgres + in-memory) and HTTP page fetch
//! utilities for the dataset quality mirror.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dqm_core::{
    Collection, Dataset, DatasetResource, IssueTally, IssueType, Organisation,
    OrganisationResource, Resource, Triple,
};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "dqm-store";

// ---------------------------------------------------------------------------
// HTTP page fetching
// ---------------------------------------------------------------------------

/// One page of a paginated catalog listing: the decoded records plus the
/// resolved next-page cursor, already absent when the feed is exhausted.
#[derive(Debug, Clone, Default)]
pub struct FetchedPage {
    pub records: Vec<JsonValue>,
    pub next_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("body of {url} is not a JSON array of records")]
    Decode { url: String },
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

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
    pub fn delay_for(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Parse the `rel="next"` target out of an RFC 5988 `Link` header value.
/// Malformed segments are skipped rather than surfaced; an unparseable
/// header simply means no next page.
pub fn parse_next_link(header: &str) -> Option<String> {
    for part in header.split(',') {
        let mut pieces = part.split(';');
        let target = match pieces.next() {
            Some(target) => target.trim(),
            None => continue,
        };
        if !(target.starts_with('<') && target.ends_with('>')) {
            continue;
        }
        let is_next = pieces.any(|param| {
            let param = param.trim();
            param.eq_ignore_ascii_case(r#"rel="next""#) || param.eq_ignore_ascii_case("rel=next")
        });
        if is_next {
            return Some(target[1..target.len() - 1].to_string());
        }
    }
    None
}

/// Fetches one page at a time. The engine only ever talks to this trait, so
/// tests can script page sequences without a network.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

#[derive(Debug)]
pub struct HttpPageFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpPageFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut last_transport: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let next_url = resp
                            .headers()
                            .get(reqwest::header::LINK)
                            .and_then(|value| value.to_str().ok())
                            .and_then(parse_next_link)
                            .and_then(|next| resp.url().join(&next).ok())
                            .map(|absolute| absolute.to_string());
                        let body = resp.bytes().await?;
                        let records: Vec<JsonValue> = serde_json::from_slice(&body)
                            .map_err(|_| FetchError::Decode {
                                url: final_url.clone(),
                            })?;
                        debug!(url = %final_url, records = records.len(), has_next = next_url.is_some(), "page fetched");
                        return Ok(FetchedPage { records, next_url });
                    }

                    if is_retryable_status(status) && attempt < self.backoff.max_retries {
                        tokio::time::sleep(self.backoff.delay_for(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if is_retryable_transport(&err) && attempt < self.backoff.max_retries {
                        last_transport = Some(err);
                        tokio::time::sleep(self.backoff.delay_for(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_transport.expect("retry loop captures the transport error"),
        ))
    }
}

// ---------------------------------------------------------------------------
// Mirror store
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("duplicate key {key} in {table}")]
    Duplicate { table: &'static str, key: String },
}

/// Outcome of committing one triple's aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportOutcome {
    pub report_id: i64,
    pub created_report: bool,
    pub issue_rows: u64,
}

/// Row counts across the whole mirror, for progress lines and round-trip
/// comparisons.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorCounts {
    pub organisations: i64,
    pub resources: i64,
    pub collections: i64,
    pub datasets: i64,
    pub dataset_links: i64,
    pub organisation_links: i64,
    pub issue_types: i64,
    pub reports: i64,
    pub issues: i64,
}

/// The relational mirror. Each mutating call is one committed transaction;
/// the loader relies on that for its per-page / per-stage commit boundaries
/// and the report generator for its commit-once-per-triple rule.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_organisations(&self, rows: &[Organisation]) -> Result<u64, StoreError>;
    async fn insert_issue_types(&self, rows: &[IssueType]) -> Result<u64, StoreError>;
    async fn insert_resources(&self, rows: &[Resource]) -> Result<u64, StoreError>;
    async fn organisation_ids(&self) -> Result<HashSet<String>, StoreError>;
    async fn insert_organisation_resources(
        &self,
        rows: &[OrganisationResource],
    ) -> Result<u64, StoreError>;
    async fn insert_collections(&self, rows: &[Collection]) -> Result<u64, StoreError>;
    async fn insert_datasets(&self, rows: &[Dataset]) -> Result<u64, StoreError>;
    async fn dataset_ids(&self) -> Result<Vec<String>, StoreError>;
    async fn insert_dataset_resources(&self, rows: &[DatasetResource]) -> Result<u64, StoreError>;
    async fn discover_triples(&self) -> Result<Vec<Triple>, StoreError>;
    async fn apply_report(
        &self,
        triple: &Triple,
        tallies: &[IssueTally],
    ) -> Result<ReportOutcome, StoreError>;
    async fn clear_mirror(&self) -> Result<(), StoreError>;
    async fn mirror_counts(&self) -> Result<MirrorCounts, StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_organisations(&self, rows: &[Organisation]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for row in rows {
            written += sqlx::query(
                r#"
                INSERT INTO organisation (organisation, name)
                VALUES ($1, $2)
                ON CONFLICT (organisation) DO UPDATE SET name = EXCLUDED.name
                "#,
            )
            .bind(&row.organisation)
            .bind(&row.name)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn insert_issue_types(&self, rows: &[IssueType]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for row in rows {
            // First-write insert: a rerun over existing rows conflicts, and
            // the operator is expected to drop before reloading.
            written += sqlx::query(
                r#"
                INSERT INTO issue_type
                    (issue_type, name, description, severity, severity_name,
                     severity_description, category)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(&row.issue_type)
            .bind(&row.name)
            .bind(&row.description)
            .bind(&row.severity)
            .bind(&row.severity_name)
            .bind(&row.severity_description)
            .bind(row.category.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn insert_resources(&self, rows: &[Resource]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for row in rows {
            written += sqlx::query(
                r#"
                INSERT INTO resource (resource, start_date, end_date)
                VALUES ($1, $2, $3)
                ON CONFLICT (resource) DO NOTHING
                "#,
            )
            .bind(&row.resource)
            .bind(row.start_date)
            .bind(row.end_date)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn organisation_ids(&self) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query("SELECT organisation FROM organisation")
            .fetch_all(&self.pool)
            .await?;
        let mut ids = HashSet::with_capacity(rows.len());
        for row in rows {
            ids.insert(row.try_get::<String, _>("organisation")?);
        }
        Ok(ids)
    }

    async fn insert_organisation_resources(
        &self,
        rows: &[OrganisationResource],
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for row in rows {
            written += sqlx::query(
                r#"
                INSERT INTO organisation_resource (organisation, resource)
                VALUES ($1, $2)
                ON CONFLICT (organisation, resource) DO NOTHING
                "#,
            )
            .bind(&row.organisation)
            .bind(&row.resource)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn insert_collections(&self, rows: &[Collection]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for row in rows {
            written += sqlx::query(
                r#"
                INSERT INTO collection (collection)
                VALUES ($1)
                ON CONFLICT (collection) DO NOTHING
                "#,
            )
            .bind(&row.collection)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn insert_datasets(&self, rows: &[Dataset]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for row in rows {
            written += sqlx::query(
                r#"
                INSERT INTO dataset (dataset, name, collection)
                VALUES ($1, $2, $3)
                ON CONFLICT (dataset) DO NOTHING
                "#,
            )
            .bind(&row.dataset)
            .bind(&row.name)
            .bind(&row.collection)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn dataset_ids(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT dataset FROM dataset ORDER BY dataset")
            .fetch_all(&self.pool)
            .await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get::<String, _>("dataset")?);
        }
        Ok(ids)
    }

    async fn insert_dataset_resources(&self, rows: &[DatasetResource]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for row in rows {
            written += sqlx::query(
                r#"
                INSERT INTO dataset_resource (dataset, resource)
                VALUES ($1, $2)
                ON CONFLICT (dataset, resource) DO NOTHING
                "#,
            )
            .bind(&row.dataset)
            .bind(&row.resource)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn discover_triples(&self) -> Result<Vec<Triple>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT dr.dataset, dr.resource, org_r.organisation
              FROM dataset_resource dr
              JOIN dataset d ON d.dataset = dr.dataset
              JOIN resource r ON r.resource = dr.resource
              JOIN organisation_resource org_r ON org_r.resource = dr.resource
              JOIN organisation o ON o.organisation = org_r.organisation
             ORDER BY dr.dataset, dr.resource, org_r.organisation
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut triples = Vec::with_capacity(rows.len());
        for row in rows {
            triples.push(Triple {
                dataset: row.try_get("dataset")?,
                resource: row.try_get("resource")?,
                organisation: row.try_get("organisation")?,
            });
        }
        Ok(triples)
    }

    async fn apply_report(
        &self,
        triple: &Triple,
        tallies: &[IssueTally],
    ) -> Result<ReportOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // xmax = 0 only holds for a freshly inserted row, which is how we
        // tell create from find without a second round trip. The no-op
        // DO UPDATE keeps RETURNING populated on conflict; created stays
        // untouched either way.
        let row = sqlx::query(
            r#"
            INSERT INTO dataset_report (dataset, resource, organisation)
            VALUES ($1, $2, $3)
            ON CONFLICT (dataset, resource, organisation)
                DO UPDATE SET dataset = EXCLUDED.dataset
            RETURNING id, (xmax = 0) AS created_report
            "#,
        )
        .bind(&triple.dataset)
        .bind(&triple.resource)
        .bind(&triple.organisation)
        .fetch_one(&mut *tx)
        .await?;
        let report_id: i64 = row.try_get("id")?;
        let created_report: bool = row.try_get("created_report")?;

        let mut issue_rows = 0u64;
        for tally in tallies {
            issue_rows += sqlx::query(
                r#"
                INSERT INTO dataset_issue
                    (dataset_report_id, issue_type, field, value, count)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (dataset_report_id, issue_type, field)
                    DO UPDATE SET count = dataset_issue.count + EXCLUDED.count
                "#,
            )
            .bind(report_id)
            .bind(&tally.issue_type)
            .bind(&tally.field)
            .bind(&tally.value)
            .bind(tally.count)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        Ok(ReportOutcome {
            report_id,
            created_report,
            issue_rows,
        })
    }

    async fn clear_mirror(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "dataset_issue",
            "dataset_report",
            "organisation_resource",
            "dataset_resource",
            "dataset",
            "collection",
            "organisation",
            "resource",
            "issue_type",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn mirror_counts(&self) -> Result<MirrorCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT count(*) FROM organisation) AS organisations,
                (SELECT count(*) FROM resource) AS resources,
                (SELECT count(*) FROM collection) AS collections,
                (SELECT count(*) FROM dataset) AS datasets,
                (SELECT count(*) FROM dataset_resource) AS dataset_links,
                (SELECT count(*) FROM organisation_resource) AS organisation_links,
                (SELECT count(*) FROM issue_type) AS issue_types,
                (SELECT count(*) FROM dataset_report) AS reports,
                (SELECT count(*) FROM dataset_issue) AS issues
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(MirrorCounts {
            organisations: row.try_get("organisations")?,
            resources: row.try_get("resources")?,
            collections: row.try_get("collections")?,
            datasets: row.try_get("datasets")?,
            dataset_links: row.try_get("dataset_links")?,
            organisation_links: row.try_get("organisation_links")?,
            issue_types: row.try_get("issue_types")?,
            reports: row.try_get("reports")?,
            issues: row.try_get("issues")?,
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct MemoryReport {
    id: i64,
    created: DateTime<Utc>,
    issues: BTreeMap<(String, String), MemoryIssue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MemoryIssue {
    value: Option<String>,
    count: i64,
}

#[derive(Debug, Default)]
struct MemoryInner {
    organisations: BTreeMap<String, Organisation>,
    resources: BTreeMap<String, Resource>,
    collections: BTreeSet<String>,
    datasets: BTreeMap<String, Dataset>,
    dataset_resources: BTreeSet<(String, String)>,
    organisation_resources: BTreeSet<(String, String)>,
    issue_types: BTreeMap<String, IssueType>,
    reports: BTreeMap<(String, String, String), MemoryReport>,
    next_report_id: i64,
}

/// Same contract as [`PgStore`], held in process memory. Backs the engine's
/// test suites and local dry runs where no Postgres is reachable.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

/// Point-in-time view of one stored report, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportView {
    pub report_id: i64,
    pub created: DateTime<Utc>,
    pub issues: Vec<IssueTally>,
}

/// Ordered row sets of the whole mirror; equality-comparable regardless of
/// insert order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MirrorSnapshot {
    pub organisations: Vec<Organisation>,
    pub resources: Vec<Resource>,
    pub collections: Vec<String>,
    pub datasets: Vec<Dataset>,
    pub dataset_links: Vec<(String, String)>,
    pub organisation_links: Vec<(String, String)>,
    pub issue_types: Vec<IssueType>,
    pub report_keys: Vec<(String, String, String)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn report_for(&self, triple: &Triple) -> Option<ReportView> {
        let inner = self.inner.lock().await;
        let key = (
            triple.dataset.clone(),
            triple.resource.clone(),
            triple.organisation.clone(),
        );
        inner.reports.get(&key).map(|report| ReportView {
            report_id: report.id,
            created: report.created,
            issues: report
                .issues
                .iter()
                .map(|((issue_type, field), issue)| IssueTally {
                    issue_type: issue_type.clone(),
                    field: field.clone(),
                    value: issue.value.clone(),
                    count: issue.count,
                })
                .collect(),
        })
    }

    pub async fn snapshot(&self) -> MirrorSnapshot {
        let inner = self.inner.lock().await;
        MirrorSnapshot {
            organisations: inner.organisations.values().cloned().collect(),
            resources: inner.resources.values().cloned().collect(),
            collections: inner.collections.iter().cloned().collect(),
            datasets: inner.datasets.values().cloned().collect(),
            dataset_links: inner.dataset_resources.iter().cloned().collect(),
            organisation_links: inner.organisation_resources.iter().cloned().collect(),
            issue_types: inner.issue_types.values().cloned().collect(),
            report_keys: inner.reports.keys().cloned().collect(),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_organisations(&self, rows: &[Organisation]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            inner
                .organisations
                .insert(row.organisation.clone(), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn insert_issue_types(&self, rows: &[IssueType]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            if inner.issue_types.contains_key(&row.issue_type) {
                return Err(StoreError::Duplicate {
                    table: "issue_type",
                    key: row.issue_type.clone(),
                });
            }
            inner.issue_types.insert(row.issue_type.clone(), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn insert_resources(&self, rows: &[Resource]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut written = 0u64;
        for row in rows {
            if !inner.resources.contains_key(&row.resource) {
                inner.resources.insert(row.resource.clone(), row.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn organisation_ids(&self) -> Result<HashSet<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.organisations.keys().cloned().collect())
    }

    async fn insert_organisation_resources(
        &self,
        rows: &[OrganisationResource],
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut written = 0u64;
        for row in rows {
            if inner
                .organisation_resources
                .insert((row.organisation.clone(), row.resource.clone()))
            {
                written += 1;
            }
        }
        Ok(written)
    }

    async fn insert_collections(&self, rows: &[Collection]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut written = 0u64;
        for row in rows {
            if inner.collections.insert(row.collection.clone()) {
                written += 1;
            }
        }
        Ok(written)
    }

    async fn insert_datasets(&self, rows: &[Dataset]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut written = 0u64;
        for row in rows {
            if !inner.datasets.contains_key(&row.dataset) {
                inner.datasets.insert(row.dataset.clone(), row.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn dataset_ids(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.datasets.keys().cloned().collect())
    }

    async fn insert_dataset_resources(&self, rows: &[DatasetResource]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut written = 0u64;
        for row in rows {
            if inner
                .dataset_resources
                .insert((row.dataset.clone(), row.resource.clone()))
            {
                written += 1;
            }
        }
        Ok(written)
    }

    async fn discover_triples(&self) -> Result<Vec<Triple>, StoreError> {
        let inner = self.inner.lock().await;
        let mut triples = Vec::new();
        for (dataset, resource) in &inner.dataset_resources {
            for (organisation, linked_resource) in &inner.organisation_resources {
                if linked_resource == resource {
                    triples.push(Triple {
                        dataset: dataset.clone(),
                        resource: resource.clone(),
                        organisation: organisation.clone(),
                    });
                }
            }
        }
        triples.sort();
        Ok(triples)
    }

    async fn apply_report(
        &self,
        triple: &Triple,
        tallies: &[IssueTally],
    ) -> Result<ReportOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (
            triple.dataset.clone(),
            triple.resource.clone(),
            triple.organisation.clone(),
        );

        let created_report = !inner.reports.contains_key(&key);
        if created_report {
            inner.next_report_id += 1;
            let report = MemoryReport {
                id: inner.next_report_id,
                created: Utc::now(),
                issues: BTreeMap::new(),
            };
            inner.reports.insert(key.clone(), report);
        }

        let mut report_id = 0i64;
        let mut issue_rows = 0u64;
        if let Some(report) = inner.reports.get_mut(&key) {
            report_id = report.id;
            for tally in tallies {
                let entry = report
                    .issues
                    .entry((tally.issue_type.clone(), tally.field.clone()))
                    .or_insert(MemoryIssue {
                        value: tally.value.clone(),
                        count: 0,
                    });
                entry.count += tally.count;
                issue_rows += 1;
            }
        }

        Ok(ReportOutcome {
            report_id,
            created_report,
            issue_rows,
        })
    }

    async fn clear_mirror(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        *inner = MemoryInner::default();
        Ok(())
    }

    async fn mirror_counts(&self) -> Result<MirrorCounts, StoreError> {
        let inner = self.inner.lock().await;
        Ok(MirrorCounts {
            organisations: inner.organisations.len() as i64,
            resources: inner.resources.len() as i64,
            collections: inner.collections.len() as i64,
            datasets: inner.datasets.len() as i64,
            dataset_links: inner.dataset_resources.len() as i64,
            organisation_links: inner.organisation_resources.len() as i64,
            issue_types: inner.issue_types.len() as i64,
            reports: inner.reports.len() as i64,
            issues: inner
                .reports
                .values()
                .map(|report| report.issues.len() as i64)
                .sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dqm_core::{category_for, IssueCategory};

    #[test]
    fn next_link_is_extracted_from_link_header() {
        let header = r#"<https://example.org/resource.json?_next=abc>; rel="next""#;
        assert_eq!(
            parse_next_link(header),
            Some("https://example.org/resource.json?_next=abc".to_string())
        );
    }

    #[test]
    fn next_link_ignores_other_relations() {
        let header = r#"<https://example.org/a>; rel="prev", <https://example.org/b>; rel="next""#;
        assert_eq!(parse_next_link(header), Some("https://example.org/b".to_string()));
        assert_eq!(parse_next_link(r#"<https://example.org/a>; rel="prev""#), None);
    }

    #[test]
    fn malformed_link_header_means_no_next_page() {
        assert_eq!(parse_next_link(""), None);
        assert_eq!(parse_next_link("not a link header"), None);
        assert_eq!(parse_next_link(r#"https://no-brackets; rel="next""#), None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(6), Duration::from_millis(350));
    }

    fn triple() -> Triple {
        Triple {
            dataset: "conservation-area".into(),
            resource: "res-1".into(),
            organisation: "local-authority:CAT".into(),
        }
    }

    fn tally(issue_type: &str, field: &str, count: i64) -> IssueTally {
        IssueTally {
            issue_type: issue_type.to_string(),
            field: field.to_string(),
            value: Some("x".to_string()),
            count,
        }
    }

    #[tokio::test]
    async fn apply_report_creates_then_increments() {
        let store = MemoryStore::new();

        let first = store
            .apply_report(&triple(), &[tally("invalid-date", "start-date", 2)])
            .await
            .expect("first apply");
        assert!(first.created_report);

        let second = store
            .apply_report(&triple(), &[tally("invalid-date", "start-date", 1)])
            .await
            .expect("second apply");
        assert!(!second.created_report);
        assert_eq!(second.report_id, first.report_id);

        let view = store.report_for(&triple()).await.expect("report exists");
        assert_eq!(view.issues.len(), 1);
        assert_eq!(view.issues[0].count, 3);
    }

    #[tokio::test]
    async fn report_created_timestamp_is_set_once() {
        let store = MemoryStore::new();
        store
            .apply_report(&triple(), &[tally("invalid-date", "start-date", 1)])
            .await
            .expect("first apply");
        let before = store.report_for(&triple()).await.expect("view").created;

        store
            .apply_report(&triple(), &[tally("invalid-date", "start-date", 1)])
            .await
            .expect("second apply");
        let after = store.report_for(&triple()).await.expect("view").created;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn issue_type_reload_conflicts() {
        let store = MemoryStore::new();
        let row = IssueType {
            issue_type: "invalid-date".into(),
            name: "Invalid date".into(),
            description: "date could not be parsed".into(),
            severity: "error".into(),
            severity_name: "Error".into(),
            severity_description: "blocking".into(),
            category: category_for("Invalid date"),
        };
        assert_eq!(row.category, IssueCategory::InvalidData);

        store
            .insert_issue_types(std::slice::from_ref(&row))
            .await
            .expect("first load");
        let err = store
            .insert_issue_types(std::slice::from_ref(&row))
            .await
            .expect_err("second load conflicts");
        assert!(matches!(err, StoreError::Duplicate { table: "issue_type", .. }));
    }

    #[tokio::test]
    async fn clear_mirror_on_empty_store_is_a_noop() {
        let store = MemoryStore::new();
        store.clear_mirror().await.expect("clear empty");
        assert_eq!(store.mirror_counts().await.expect("counts"), MirrorCounts::default());
    }

    #[tokio::test]
    async fn triples_join_links_on_resource() {
        let store = MemoryStore::new();
        store
            .upsert_organisations(&[Organisation {
                organisation: "local-authority:CAT".into(),
                name: "Catshire".into(),
            }])
            .await
            .expect("orgs");
        store
            .insert_resources(&[Resource {
                resource: "res-1".into(),
                start_date: None,
                end_date: None,
            }])
            .await
            .expect("resources");
        store
            .insert_collections(&[Collection { collection: "conservation".into() }])
            .await
            .expect("collections");
        store
            .insert_datasets(&[Dataset {
                dataset: "conservation-area".into(),
                name: "Conservation area".into(),
                collection: Some("conservation".into()),
            }])
            .await
            .expect("datasets");
        store
            .insert_dataset_resources(&[DatasetResource {
                dataset: "conservation-area".into(),
                resource: "res-1".into(),
            }])
            .await
            .expect("dataset links");
        store
            .insert_organisation_resources(&[OrganisationResource {
                organisation: "local-authority:CAT".into(),
                resource: "res-1".into(),
            }])
            .await
            .expect("organisation links");

        let triples = store.discover_triples().await.expect("triples");
        assert_eq!(triples, vec![triple()]);
    }
}
