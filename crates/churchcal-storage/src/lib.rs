//! Event table storage + HTTP fetch utilities for churchcal.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use churchcal_core::{parse_datetime, Event, EventDraft, DATETIME_FORMAT};
use chrono::NaiveDateTime;
use reqwest::StatusCode;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "churchcal-storage";

/// Base name of the event table; the configured prefix is prepended.
pub const TABLE_NAME: &str = "church_cal";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid table prefix {0:?}: only ASCII letters, digits and '_' are allowed")]
    InvalidTablePrefix(String),
    #[error("column `{column}` holds an unreadable value {value:?}")]
    InvalidRow { column: &'static str, value: String },
}

/// Fully qualified event table name. Validated once because it is spliced into SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName(String);

impl TableName {
    pub fn with_prefix(prefix: &str) -> Result<Self, StoreError> {
        if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::InvalidTablePrefix(prefix.to_string()));
        }
        Ok(Self(format!("{prefix}{TABLE_NAME}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TableName {
    fn default() -> Self {
        Self(TABLE_NAME.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaceOutcome {
    pub inserted: u64,
    pub pruned: u64,
}

pub async fn connect(database_url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Single-connection in-memory database. The connection is never recycled, since
/// closing it would discard the data.
pub async fn connect_in_memory() -> Result<SqlitePool, StoreError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct EventStore {
    pool: SqlitePool,
    table: TableName,
}

impl EventStore {
    pub fn new(pool: SqlitePool, table: TableName) -> Self {
        Self { pool, table }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub async fn create_table(&self) -> Result<(), StoreError> {
        let t = self.table.as_str();
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    lastchanged INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    startdate TEXT NOT NULL,
                    enddate TEXT NOT NULL,
                    contact TEXT,
                    link TEXT
                )"
            ),
            format!("CREATE INDEX IF NOT EXISTS {t}_title_index ON {t} (title)"),
            format!("CREATE INDEX IF NOT EXISTS {t}_startdate_index ON {t} (startdate)"),
            format!("CREATE INDEX IF NOT EXISTS {t}_enddate_index ON {t} (enddate)"),
        ];
        for sql in &statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        info!(table = t, "event table ready");
        Ok(())
    }

    pub async fn drop_table(&self) -> Result<(), StoreError> {
        let t = self.table.as_str();
        sqlx::query(&format!("DROP TABLE IF EXISTS {t}"))
            .execute(&self.pool)
            .await?;
        info!(table = t, "event table dropped");
        Ok(())
    }

    pub async fn table_exists(&self) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(self.table.as_str())
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count > 0)
    }

    pub async fn insert(&self, run_tag: i64, draft: &EventDraft) -> Result<i64, StoreError> {
        let result = bind_draft(sqlx::query(&self.insert_sql()), run_tag, draft)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn prune_older_than(&self, run_tag: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(&self.prune_sql())
            .bind(run_tag)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Insert every draft under `run_tag`, then delete all rows from earlier runs.
    /// Both steps commit together or not at all.
    #[tracing::instrument(skip(self, drafts), fields(table = self.table.as_str()))]
    pub async fn replace_all(
        &self,
        run_tag: i64,
        drafts: &[EventDraft],
    ) -> Result<ReplaceOutcome, StoreError> {
        let insert_sql = self.insert_sql();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for draft in drafts {
            bind_draft(sqlx::query(&insert_sql), run_tag, draft)
                .execute(&mut *tx)
                .await?;
            inserted += 1;
        }
        let pruned = sqlx::query(&self.prune_sql())
            .bind(run_tag)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        debug!(inserted, pruned, "event table replaced");
        Ok(ReplaceOutcome { inserted, pruned })
    }

    pub async fn latest_run_tag(&self) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT MAX(lastchanged) FROM {}",
            self.table.as_str()
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<Option<i64>, _>(0)?)
    }

    /// Events starting in `[from, to)`, earliest first.
    pub async fn query_range(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT id, lastchanged, title, startdate, enddate, contact, link
               FROM {}
              WHERE startdate >= ? AND startdate < ?
              ORDER BY startdate, id",
            self.table.as_str()
        ))
        .bind(from.format(DATETIME_FORMAT).to_string())
        .bind(to.format(DATETIME_FORMAT).to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query(&format!("SELECT COUNT(*) FROM {}", self.table.as_str()))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get(0)?)
    }

    fn insert_sql(&self) -> String {
        format!(
            "INSERT INTO {} (lastchanged, title, startdate, enddate, contact, link)
             VALUES (?, ?, ?, ?, ?, ?)",
            self.table.as_str()
        )
    }

    fn prune_sql(&self) -> String {
        format!("DELETE FROM {} WHERE lastchanged < ?", self.table.as_str())
    }
}

fn bind_draft<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    run_tag: i64,
    draft: &EventDraft,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(run_tag)
        .bind(draft.title.clone())
        .bind(draft.start.format(DATETIME_FORMAT).to_string())
        .bind(draft.end.format(DATETIME_FORMAT).to_string())
        .bind(draft.contact.clone())
        .bind(draft.link.clone())
}

fn row_to_event(row: &SqliteRow) -> Result<Event, StoreError> {
    Ok(Event {
        id: row.try_get("id")?,
        last_changed: row.try_get("lastchanged")?,
        title: row.try_get("title")?,
        start: datetime_column(row, "startdate")?,
        end: datetime_column(row, "enddate")?,
        contact: row.try_get("contact")?,
        link: row.try_get("link")?,
    })
}

fn datetime_column(row: &SqliteRow, column: &'static str) -> Result<NaiveDateTime, StoreError> {
    let raw: String = row.try_get(column)?;
    parse_datetime(&raw).ok_or(StoreError::InvalidRow { column, value: raw })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
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
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Skip TLS certificate verification (self-hosted instances with broken chains).
    pub accept_invalid_certs: bool,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            accept_invalid_certs: false,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{url} answered with http status {status}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if config.accept_invalid_certs {
            warn!("TLS certificate verification is disabled");
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// POST `form` as `application/x-www-form-urlencoded`, retrying transient failures.
    #[tracing::instrument(name = "http_post", skip(self, form))]
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let failure = match self.client.post(url).form(form).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => (
                    classify_status(resp.status()),
                    FetchError::HttpStatus {
                        status: resp.status().as_u16(),
                        url: resp.url().to_string(),
                    },
                ),
                Err(err) => (classify_reqwest_error(&err), FetchError::Request(err)),
            };

            match failure {
                (RetryDisposition::Retryable, err) if attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(error = %err, attempt, ?delay, "retrying ChurchTools request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                (_, err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::{extract::State, http::StatusCode as AxumStatus, routing::post, Form, Router};
    use tempfile::tempdir;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, DATETIME_FORMAT).unwrap()
    }

    fn draft(title: &str, start: &str) -> EventDraft {
        EventDraft {
            title: title.to_string(),
            start: dt(start),
            end: dt(start) + chrono::Duration::hours(1),
            contact: None,
            link: None,
        }
    }

    async fn memory_store() -> EventStore {
        let store = EventStore::new(connect_in_memory().await.unwrap(), TableName::default());
        store.create_table().await.unwrap();
        store
    }

    #[test]
    fn table_prefix_is_validated() {
        assert_eq!(TableName::with_prefix("wp_").unwrap().as_str(), "wp_church_cal");
        assert!(matches!(
            TableName::with_prefix("x; DROP TABLE y"),
            Err(StoreError::InvalidTablePrefix(_))
        ));
    }

    #[tokio::test]
    async fn create_and_drop_are_idempotent() {
        let store = memory_store().await;
        store.create_table().await.unwrap();
        assert!(store.table_exists().await.unwrap());
        store.drop_table().await.unwrap();
        store.drop_table().await.unwrap();
        assert!(!store.table_exists().await.unwrap());
    }

    #[tokio::test]
    async fn replace_all_inserts_new_rows_and_prunes_older_runs() {
        let store = memory_store().await;
        let first = store
            .replace_all(100, &[draft("A", "2026-05-03 10:00:00"), draft("B", "2026-05-04 10:00:00")])
            .await
            .unwrap();
        assert_eq!(first, ReplaceOutcome { inserted: 2, pruned: 0 });

        let second = store
            .replace_all(200, &[draft("A", "2026-05-03 10:00:00")])
            .await
            .unwrap();
        assert_eq!(second, ReplaceOutcome { inserted: 1, pruned: 2 });
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.latest_run_tag().await.unwrap(), Some(200));
    }

    #[tokio::test]
    async fn identical_records_are_not_deduplicated() {
        let store = memory_store().await;
        let same = draft("Chor", "2026-05-03 10:00:00");
        store.replace_all(1, &[same.clone(), same]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_run_clears_the_table() {
        let store = memory_store().await;
        store.insert(5, &draft("A", "2026-05-03 10:00:00")).await.unwrap();
        let outcome = store.replace_all(6, &[]).await.unwrap();
        assert_eq!(outcome, ReplaceOutcome { inserted: 0, pruned: 1 });
        assert_eq!(store.latest_run_tag().await.unwrap(), None);
    }

    #[tokio::test]
    async fn prune_keeps_rows_from_the_current_run() {
        let store = memory_store().await;
        store.insert(1, &draft("old", "2026-05-03 10:00:00")).await.unwrap();
        store.insert(2, &draft("new", "2026-05-03 11:00:00")).await.unwrap();
        assert_eq!(store.prune_older_than(2).await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_range_is_half_open_and_ordered() {
        let store = memory_store().await;
        let mut with_extras = draft("Gottesdienst", "2026-05-03 10:00:00");
        with_extras.contact = Some("Anna".into());
        with_extras.link = Some("https://example.org".into());
        store
            .replace_all(
                1,
                &[
                    draft("Montag", "2026-05-04 00:00:00"),
                    with_extras,
                    draft("Früh", "2026-05-03 08:00:00"),
                    draft("Vorher", "2026-05-02 23:59:59"),
                ],
            )
            .await
            .unwrap();

        let events = store
            .query_range(dt("2026-05-03 00:00:00"), dt("2026-05-04 00:00:00"))
            .await
            .unwrap();
        let titles = events.iter().map(|e| e.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["Früh", "Gottesdienst"]);
        assert_eq!(events[1].contact.as_deref(), Some("Anna"));
        assert_eq!(events[1].link.as_deref(), Some("https://example.org"));
        assert_eq!(events[1].end, dt("2026-05-03 11:00:00"));
    }

    #[tokio::test]
    async fn file_backed_store_survives_reconnect() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("events.db").display());
        let table = TableName::with_prefix("wp_").unwrap();

        let store = EventStore::new(connect(&url).await.unwrap(), table.clone());
        store.create_table().await.unwrap();
        store.insert(9, &draft("A", "2026-05-03 10:00:00")).await.unwrap();
        store.pool().close().await;

        let reopened = EventStore::new(connect(&url).await.unwrap(), table);
        assert_eq!(reopened.count().await.unwrap(), 1);
    }

    #[test]
    fn retry_delay_doubles_until_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(700),
        };

        let delays = (0..4).map(|i| policy.delay_for_attempt(i)).collect::<Vec<_>>();
        assert_eq!(
            delays,
            [200, 400, 700, 700].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn only_server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn post_form_sends_urlencoded_body() {
        let router = Router::new().route(
            "/echo",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                format!("{}|{}", form["func"], form["category_ids[0]"])
            }),
        );
        let base = spawn(router).await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let resp = fetcher
            .post_form(
                &format!("{base}/echo"),
                &[
                    ("func".to_string(), "getCalendarEvents".to_string()),
                    ("category_ids[0]".to_string(), "4".to_string()),
                ],
            )
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, b"getCalendarEvents|4");
    }

    #[tokio::test]
    async fn post_form_retries_server_errors_then_gives_up() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/flaky",
                post(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    AxumStatus::SERVICE_UNAVAILABLE
                }),
            )
            .with_state(hits.clone());
        let base = spawn(router).await;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..Default::default()
        })
        .unwrap();

        let err = fetcher
            .post_form(&format!("{base}/flaky"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
