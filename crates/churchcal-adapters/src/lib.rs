//! Event source contracts + the ChurchTools API client.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use churchcal_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "churchcal-adapters";

/// Remote function returning calendar entries for a set of categories.
pub const GET_CALENDAR_EVENTS: &str = "getCalendarEvents";

const TENANT_HOST_SUFFIX: &str = "church.tools";

/// ChurchTools ajax modules reachable through `index.php?q=<module>/ajax`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Api {
    ChurchCal,
    ChurchResource,
}

impl Api {
    pub fn key(self) -> &'static str {
        match self {
            Api::ChurchCal => "churchcal/ajax",
            Api::ChurchResource => "churchresource/ajax",
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no ChurchTools tenant configured")]
    MissingTenant,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding api response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Error accessing CT API ({status}): {message}")]
    ApiStatus { status: String, message: String },
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// `{ "status": ..., "data": ... }` wrapper around every ajax response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope {
    pub status: String,
    #[serde(default)]
    pub data: JsonValue,
}

impl ApiEnvelope {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }

    /// Records carried in `data`, which the API sends either as a list or as an
    /// id-keyed object. A non-success status is an error carrying the message.
    pub fn into_records(self) -> Result<Vec<JsonValue>, SourceError> {
        if !self.is_success() {
            let message = match self.data {
                JsonValue::String(message) => message,
                JsonValue::Null => String::new(),
                other => other.to_string(),
            };
            return Err(SourceError::ApiStatus {
                status: self.status,
                message,
            });
        }

        Ok(match self.data {
            JsonValue::Array(items) => items,
            JsonValue::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
            _ => Vec::new(),
        })
    }
}

/// Filter sent with `getCalendarEvents`. Day offsets are relative to the remote's today.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQuery {
    pub category_ids: Vec<i64>,
    pub from_day: i64,
    pub to_day: i64,
    pub access_token: Option<String>,
}

impl EventQuery {
    /// Form pairs in the layout PHP's `http_build_query` produces for this query.
    pub fn to_form(&self) -> Vec<(String, String)> {
        let mut form = self
            .category_ids
            .iter()
            .enumerate()
            .map(|(idx, id)| (format!("category_ids[{idx}]"), id.to_string()))
            .collect::<Vec<_>>();
        form.push(("from".to_string(), self.from_day.to_string()));
        form.push(("to".to_string(), self.to_day.to_string()));
        if let Some(token) = self.access_token.as_deref().filter(|t| !t.is_empty()) {
            form.push(("csrf-token".to_string(), token.to_string()));
        }
        form
    }
}

#[derive(Debug)]
pub struct ApiClient {
    http: HttpFetcher,
    base_url: String,
}

impl ApiClient {
    pub fn for_tenant(tenant: &str, http: HttpFetcher) -> Result<Self, SourceError> {
        let tenant = tenant.trim();
        if tenant.is_empty() {
            return Err(SourceError::MissingTenant);
        }
        Ok(Self::with_base_url(
            format!("https://{tenant}.{TENANT_HOST_SUFFIX}"),
            http,
        ))
    }

    pub fn with_base_url(base_url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self, api: Api) -> String {
        format!("{}/index.php?q={}", self.base_url, api.key())
    }

    /// POST `func` with `params` to the given module and decode the JSON reply.
    pub async fn call(
        &self,
        api: Api,
        func: &str,
        params: &[(String, String)],
    ) -> Result<JsonValue, SourceError> {
        let url = self.endpoint(api);
        let mut form = params.to_vec();
        form.push(("func".to_string(), func.to_string()));

        debug!(%url, func, "calling ChurchTools api");
        let response = self.http.post_form(&url, &form).await?;
        Ok(serde_json::from_slice(&response.body)?)
    }

    pub async fn call_envelope(
        &self,
        api: Api,
        func: &str,
        params: &[(String, String)],
    ) -> Result<ApiEnvelope, SourceError> {
        let value = self.call(api, func, params).await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
pub trait EventSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Raw calendar records; decoding into events happens downstream so a single
    /// malformed record does not fail the whole batch.
    async fn fetch_records(&self, query: &EventQuery) -> Result<Vec<JsonValue>, SourceError>;
}

pub struct ChurchToolsSource {
    client: ApiClient,
}

impl ChurchToolsSource {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }
}

#[async_trait]
impl EventSource for ChurchToolsSource {
    fn source_id(&self) -> &'static str {
        "churchtools"
    }

    async fn fetch_records(&self, query: &EventQuery) -> Result<Vec<JsonValue>, SourceError> {
        let envelope = self
            .client
            .call_envelope(Api::ChurchCal, GET_CALENDAR_EVENTS, &query.to_form())
            .await?;
        let records = envelope.into_records()?;
        info!(records = records.len(), "received calendar records");
        Ok(records)
    }
}

/// Replays a saved `getCalendarEvents` response from disk.
#[derive(Debug, Clone)]
pub struct FixtureEventSource {
    path: PathBuf,
}

impl FixtureEventSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventSource for FixtureEventSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_records(&self, _query: &EventQuery) -> Result<Vec<JsonValue>, SourceError> {
        let text = fs::read_to_string(&self.path).map_err(|source| SourceError::Fixture {
            path: self.path.clone(),
            source,
        })?;
        let envelope: ApiEnvelope = serde_json::from_str(&text)?;
        envelope.into_records()
    }
}
