//! Remote data source contract plus REST and fixture-backed implementations.

use std::cmp::Reverse;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use storesync_core::{JsonObject, RemoteProductRecord, RemoteSettingsRecord};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "storesync-source";

pub const SETTINGS_FIXTURE_FILE: &str = "store_settings.json";
pub const PRODUCTS_FIXTURE_FILE: &str = "products.json";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("remote source is not configured: {0}")]
    NotConfigured(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("remote returned http {status} for {query}: {body}")]
    Status {
        status: u16,
        query: &'static str,
        body: String,
    },
    #[error("unexpected {query} payload: {reason}")]
    Schema { query: &'static str, reason: String },
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The two read queries the synchronizers depend on.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Human-readable label, safe to log.
    fn label(&self) -> &str;

    /// Most recently created active settings row, if any.
    async fn active_settings(&self) -> Result<Option<RemoteSettingsRecord>, SourceError>;

    /// Every product, most recently created first.
    async fn list_products(&self) -> Result<Vec<RemoteProductRecord>, SourceError>;
}

#[async_trait]
impl<T: RemoteSource + ?Sized> RemoteSource for Arc<T> {
    fn label(&self) -> &str {
        (**self).label()
    }

    async fn active_settings(&self) -> Result<Option<RemoteSettingsRecord>, SourceError> {
        (**self).active_settings().await
    }

    async fn list_products(&self) -> Result<Vec<RemoteProductRecord>, SourceError> {
        (**self).list_products().await
    }
}

#[derive(Clone)]
pub struct RestSourceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

// The api key must never reach a log line.
impl fmt::Debug for RestSourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestSourceConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// PostgREST-style HTTP API exposing `store_settings` and `products` tables.
pub struct RestSource {
    config: RestSourceConfig,
    client: reqwest::Client,
}

impl RestSource {
    pub fn new(config: RestSourceConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building remote source client")?;
        Ok(Self { config, client })
    }

    fn endpoint(&self, table: &str) -> Result<String, SourceError> {
        let base = self.config.base_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(SourceError::NotConfigured("remote base url is empty".into()));
        }
        Ok(format!("{base}/rest/v1/{table}"))
    }

    async fn get_rows<T: DeserializeOwned>(
        &self,
        query: &'static str,
        table: &str,
        params: &[(&str, &str)],
    ) -> Result<Vec<T>, SourceError> {
        let url = self.endpoint(table)?;
        let mut request = self
            .client
            .get(&url)
            .query(params)
            .header("Accept", "application/json");
        if let Some(key) = &self.config.api_key {
            request = request
                .header("apikey", key)
                .header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|err| SourceError::Network(err.without_url().to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                query,
                body: body.chars().take(200).collect(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| SourceError::Network(err.without_url().to_string()))?;
        debug!(query, byte_size = bytes.len(), "remote query complete");
        serde_json::from_slice(&bytes).map_err(|err| SourceError::Schema {
            query,
            reason: err.to_string(),
        })
    }
}

#[async_trait]
impl RemoteSource for RestSource {
    fn label(&self) -> &str {
        &self.config.base_url
    }

    async fn active_settings(&self) -> Result<Option<RemoteSettingsRecord>, SourceError> {
        let rows: Vec<RemoteSettingsRecord> = self
            .get_rows(
                "active settings",
                "store_settings",
                &[
                    ("select", "*"),
                    ("is_active", "eq.true"),
                    ("order", "created_at.desc"),
                    ("limit", "1"),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn list_products(&self) -> Result<Vec<RemoteProductRecord>, SourceError> {
        self.get_rows(
            "products",
            "products",
            &[("select", "*"), ("order", "created_at.desc")],
        )
        .await
    }
}

/// Apply the settings query semantics to an unordered set of rows.
pub fn select_active_settings(rows: Vec<JsonObject>) -> Option<RemoteSettingsRecord> {
    rows.into_iter()
        .filter(|row| row.get("is_active").and_then(Value::as_bool) == Some(true))
        .max_by_key(|row| created_at(row))
        .map(RemoteSettingsRecord::new)
}

/// Newest first; ties keep their input order.
pub fn order_products(mut products: Vec<RemoteProductRecord>) -> Vec<RemoteProductRecord> {
    products.sort_by_key(|product| Reverse(product.created_at.instant()));
    products
}

fn created_at(row: &JsonObject) -> Option<DateTime<Utc>> {
    row.get("created_at")
        .and_then(Value::as_str)
        .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SettingsFixture {
    Rows(Vec<JsonObject>),
    Row(JsonObject),
    Empty(()),
}

/// Reads `store_settings.json` and `products.json` from a local directory.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    dir: PathBuf,
    label: String,
}

impl FixtureSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let label = format!("fixtures:{}", dir.display());
        Self { dir, label }
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        query: &'static str,
        file: &str,
    ) -> Result<T, SourceError> {
        let path = self.dir.join(file);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| SourceError::Io {
                path: path.clone(),
                source,
            })?;
        serde_json::from_str(&text).map_err(|err| SourceError::Schema {
            query,
            reason: format!("{}: {err}", path.display()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl RemoteSource for FixtureSource {
    fn label(&self) -> &str {
        &self.label
    }

    async fn active_settings(&self) -> Result<Option<RemoteSettingsRecord>, SourceError> {
        let rows = match self
            .read_json::<SettingsFixture>("active settings", SETTINGS_FIXTURE_FILE)
            .await?
        {
            SettingsFixture::Rows(rows) => rows,
            SettingsFixture::Row(row) => vec![row],
            SettingsFixture::Empty(()) => Vec::new(),
        };
        Ok(select_active_settings(rows))
    }

    async fn list_products(&self) -> Result<Vec<RemoteProductRecord>, SourceError> {
        let products = self.read_json("products", PRODUCTS_FIXTURE_FILE).await?;
        Ok(order_products(products))
    }
}

/// In-memory source, mainly for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    pub settings: Vec<JsonObject>,
    pub products: Vec<RemoteProductRecord>,
}

impl StaticSource {
    pub fn new(settings: Vec<JsonObject>, products: Vec<RemoteProductRecord>) -> Self {
        Self { settings, products }
    }
}

#[async_trait]
impl RemoteSource for StaticSource {
    fn label(&self) -> &str {
        "static"
    }

    async fn active_settings(&self) -> Result<Option<RemoteSettingsRecord>, SourceError> {
        Ok(select_active_settings(self.settings.clone()))
    }

    async fn list_products(&self) -> Result<Vec<RemoteProductRecord>, SourceError> {
        Ok(order_products(self.products.clone()))
    }
}
