//! Import pipeline orchestration: configuration, the fetch/parse/replace cycle,
//! table lifecycle and the cron schedule.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use churchcal_adapters::{ApiClient, ChurchToolsSource, EventQuery, EventSource};
use churchcal_core::{next_quarter_hour, EventDraft, RemoteEventRecord};
use churchcal_storage::{connect, EventStore, HttpClientConfig, HttpFetcher, TableName};
use serde::{Deserialize, Deserializer, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "churchcal-sync";

/// Every quarter hour, at second zero. The scheduler requires a seconds field.
pub const DEFAULT_IMPORT_CRON: &str = "0 */15 * * * *";

/// Prefix a classic 5-field cron expression with a zero seconds field.
pub fn with_seconds_field(cron: &str) -> String {
    let cron = cron.trim();
    if cron.split_whitespace().count() == 5 {
        format!("0 {cron}")
    } else {
        cron.to_string()
    }
}

/// Contents of the settings file (`settings.json` unless `CHURCHCAL_SETTINGS` says otherwise).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub tenant_name: Option<String>,
    #[serde(default)]
    pub ignore_cert: Option<bool>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default, deserialize_with = "lenient_ids")]
    pub event_category_ids: Vec<i64>,
    #[serde(default)]
    pub event_lookup_from_day: Option<i64>,
    #[serde(default)]
    pub event_lookup_to_day: Option<i64>,
}

/// Category ids show up both as numbers and as numeric strings.
fn lenient_ids<'de, D>(deserializer: D) -> std::result::Result<Vec<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Int(i64),
        Text(String),
    }

    let raw = Option::<Vec<Id>>::deserialize(deserializer)?.unwrap_or_default();
    raw.into_iter()
        .map(|id| match id {
            Id::Int(v) => Ok(v),
            Id::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| serde::de::Error::custom(format!("invalid category id {s:?}"))),
        })
        .collect()
}

/// Read the settings file. A missing file means "no settings", not an error.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if is_yaml {
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    } else {
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub table_prefix: String,
    pub tenant: Option<String>,
    pub api_base_url: Option<String>,
    pub access_token: Option<String>,
    pub ignore_cert: bool,
    pub category_ids: Vec<i64>,
    pub lookup_from_day: i64,
    pub lookup_to_day: i64,
    pub scheduler_enabled: bool,
    pub import_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub weeks: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://churchcal.db?mode=rwc".to_string(),
            table_prefix: String::new(),
            tenant: None,
            api_base_url: None,
            access_token: None,
            ignore_cert: false,
            category_ids: Vec::new(),
            lookup_from_day: 0,
            lookup_to_day: 30,
            scheduler_enabled: false,
            import_cron: DEFAULT_IMPORT_CRON.to_string(),
            user_agent: "churchcal/0.1".to_string(),
            http_timeout_secs: 20,
            weeks: 2,
        }
    }
}

impl SyncConfig {
    /// Settings file (`CHURCHCAL_SETTINGS`, default `./settings.json`) overlaid with env vars.
    pub fn from_env() -> Result<Self> {
        let settings_path = std::env::var("CHURCHCAL_SETTINGS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("settings.json"));
        let settings = load_settings(&settings_path)?;
        let env = std::env::vars().collect::<HashMap<_, _>>();
        Ok(Self::from_sources(settings, |key| env.get(key).cloned()))
    }

    pub fn from_sources(settings: Settings, env: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        Self {
            database_url: env("DATABASE_URL").unwrap_or(defaults.database_url),
            table_prefix: env("CHURCHCAL_TABLE_PREFIX").unwrap_or(defaults.table_prefix),
            tenant: non_empty("CHURCHCAL_TENANT").or(settings.tenant_name),
            api_base_url: non_empty("CHURCHCAL_API_BASE_URL"),
            access_token: non_empty("CHURCHCAL_ACCESS_TOKEN").or(settings.access_token),
            ignore_cert: settings.ignore_cert == Some(true),
            category_ids: settings.event_category_ids,
            lookup_from_day: settings
                .event_lookup_from_day
                .unwrap_or(defaults.lookup_from_day),
            lookup_to_day: settings.event_lookup_to_day.unwrap_or(defaults.lookup_to_day),
            scheduler_enabled: env("CHURCHCAL_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            import_cron: env("CHURCHCAL_IMPORT_CRON").unwrap_or(defaults.import_cron),
            user_agent: env("CHURCHCAL_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env("CHURCHCAL_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            weeks: env("CHURCHCAL_WEEKS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.weeks),
        }
    }

    pub fn has_access_token(&self) -> bool {
        self.access_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn event_query(&self) -> EventQuery {
        EventQuery {
            category_ids: self.category_ids.clone(),
            from_day: self.lookup_from_day,
            to_day: self.lookup_to_day,
            access_token: self
                .has_access_token()
                .then(|| self.access_token.clone())
                .flatten(),
        }
    }

    pub fn table_name(&self) -> Result<TableName> {
        Ok(TableName::with_prefix(&self.table_prefix)?)
    }

    pub async fn open_store(&self) -> Result<EventStore> {
        let pool = connect(&self.database_url)
            .await
            .with_context(|| format!("opening database {}", self.database_url))?;
        Ok(EventStore::new(pool, self.table_name()?))
    }

    pub fn churchtools_source(&self) -> Result<ChurchToolsSource> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            accept_invalid_certs: self.ignore_cert,
            ..Default::default()
        })?;
        let client = match &self.api_base_url {
            Some(base) => ApiClient::with_base_url(base.clone(), http),
            None => ApiClient::for_tenant(self.tenant.as_deref().unwrap_or_default(), http)?,
        };
        Ok(ChurchToolsSource::new(client))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportRunSummary {
    pub run_id: Uuid,
    pub run_tag: i64,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_records: usize,
    pub skipped_records: usize,
    pub inserted: u64,
    pub pruned: u64,
}

/// Tag for a new run: wall-clock millis, kept strictly above every stored tag so
/// the prune step always removes the previous run even if the clock stalls.
pub fn next_run_tag(now_millis: i64, latest: Option<i64>) -> i64 {
    match latest {
        Some(latest) if latest >= now_millis => latest + 1,
        _ => now_millis,
    }
}

pub struct ImportPipeline {
    config: SyncConfig,
    store: EventStore,
    source: Box<dyn EventSource>,
}

impl ImportPipeline {
    pub fn new(config: SyncConfig, store: EventStore, source: Box<dyn EventSource>) -> Self {
        Self {
            config,
            store,
            source,
        }
    }

    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = config.open_store().await?;
        let source = config.churchtools_source()?;
        Ok(Self::new(config, store, Box::new(source)))
    }

    pub fn with_source(mut self, source: Box<dyn EventSource>) -> Self {
        self.source = source;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// One fetch, parse, replace cycle. A failed fetch leaves the table untouched.
    pub async fn run_once(&self) -> Result<ImportRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("import_run", %run_id, source = self.source.source_id());
        self.run_once_inner(run_id).instrument(span).await
    }

    async fn run_once_inner(&self, run_id: Uuid) -> Result<ImportRunSummary> {
        let started_at = Utc::now();
        self.store
            .create_table()
            .await
            .context("preparing event table")?;

        let records = self
            .source
            .fetch_records(&self.config.event_query())
            .await
            .with_context(|| format!("fetching events from {}", self.source.source_id()))?;

        let fetched_records = records.len();
        let mut drafts = Vec::with_capacity(fetched_records);
        for record in records {
            let parsed = serde_json::from_value::<RemoteEventRecord>(record)
                .map_err(|err| err.to_string())
                .and_then(|r| EventDraft::from_record(&r).map_err(|err| err.to_string()));
            match parsed {
                Ok(draft) => drafts.push(draft),
                Err(err) => warn!(error = %err, "skipping calendar record"),
            }
        }
        let skipped_records = fetched_records - drafts.len();

        let latest = self
            .store
            .latest_run_tag()
            .await
            .context("reading latest run tag")?;
        let run_tag = next_run_tag(Utc::now().timestamp_millis(), latest);
        let outcome = self
            .store
            .replace_all(run_tag, &drafts)
            .await
            .context("replacing stored events")?;

        let summary = ImportRunSummary {
            run_id,
            run_tag,
            source_id: self.source.source_id().to_string(),
            started_at,
            finished_at: Utc::now(),
            fetched_records,
            skipped_records,
            inserted: outcome.inserted,
            pruned: outcome.pruned,
        };
        info!(
            fetched = summary.fetched_records,
            skipped = summary.skipped_records,
            inserted = summary.inserted,
            pruned = summary.pruned,
            "import run complete"
        );
        Ok(summary)
    }

    /// Create the event table and run the first import.
    pub async fn activate(&self) -> Result<ImportRunSummary> {
        self.store
            .create_table()
            .await
            .context("creating event table")?;
        self.run_once().await
    }

    /// Drop the event table with all imported rows.
    pub async fn deactivate(&self) -> Result<()> {
        self.store
            .drop_table()
            .await
            .context("dropping event table")?;
        Ok(())
    }

    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = with_seconds_field(&self.config.import_cron);
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                if let Err(err) = pipeline.run_once().await {
                    error!("scheduled import failed: {err:#}");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;

        if cron == DEFAULT_IMPORT_CRON {
            let next = next_quarter_hour(Utc::now().timestamp());
            info!(next_run_unix = next, "import scheduled every quarter hour");
        } else {
            info!(%cron, "import scheduled");
        }
        Ok(Some(sched))
    }
}

/// Run the import schedule until ctrl-c.
pub async fn run_scheduler_until_shutdown(pipeline: Arc<ImportPipeline>) -> Result<()> {
    let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
        warn!("scheduler disabled; set CHURCHCAL_SCHEDULER_ENABLED=1");
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

pub async fn run_import_once_from_env() -> Result<ImportRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = ImportPipeline::from_config(config).await?;
    pipeline.run_once().await
}
