//! Settings and catalog synchronizers plus the run orchestrator.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use storesync_core::{
    CatalogSnapshot, ProductSnapshot, SettingsSnapshot, CATALOG_SNAPSHOT_FILE, FAVICON_FIELD,
    LOGO_FIELD, SETTINGS_SNAPSHOT_FILE,
};
use storesync_source::{FixtureSource, RemoteSource, RestSource, RestSourceConfig, SourceError};
use storesync_storage::{
    read_snapshot, write_snapshot, AssetFetcher, AssetLayout, AssetTarget, HttpClientConfig,
    PersistError, SettingsAsset, SnapshotWritten,
};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "storesync-sync";

#[derive(Clone)]
pub struct SyncConfig {
    pub remote_url: String,
    pub remote_key: Option<String>,
    pub data_dir: PathBuf,
    pub assets_dir: PathBuf,
    pub assets_public_prefix: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub require_settings: bool,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("remote_url", &self.remote_url)
            .field("remote_key", &self.remote_key.as_ref().map(|_| "<redacted>"))
            .field("data_dir", &self.data_dir)
            .field("assets_dir", &self.assets_dir)
            .field("assets_public_prefix", &self.assets_public_prefix)
            .field("user_agent", &self.user_agent)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("require_settings", &self.require_settings)
            .finish()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_url: String::new(),
            remote_key: None,
            data_dir: PathBuf::from("./src/data"),
            assets_dir: PathBuf::from("./public/images"),
            assets_public_prefix: "/images".to_string(),
            user_agent: "storesync/0.1".to_string(),
            http_timeout_secs: 20,
            require_settings: false,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            remote_url: std::env::var("STORESYNC_REMOTE_URL").unwrap_or_default(),
            remote_key: std::env::var("STORESYNC_REMOTE_KEY")
                .ok()
                .filter(|key| !key.is_empty()),
            data_dir: std::env::var("STORESYNC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            assets_dir: std::env::var("STORESYNC_ASSETS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.assets_dir),
            assets_public_prefix: std::env::var("STORESYNC_ASSETS_PUBLIC_PREFIX")
                .unwrap_or(defaults.assets_public_prefix),
            user_agent: std::env::var("STORESYNC_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("STORESYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            require_settings: std::env::var("STORESYNC_REQUIRE_SETTINGS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.require_settings),
        }
    }

    pub fn settings_snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_SNAPSHOT_FILE)
    }

    pub fn catalog_snapshot_path(&self) -> PathBuf {
        self.data_dir.join(CATALOG_SNAPSHOT_FILE)
    }

    pub fn asset_layout(&self) -> AssetLayout {
        AssetLayout::new(self.assets_dir.clone(), self.assets_public_prefix.clone())
    }

    fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn rest_source_config(&self) -> RestSourceConfig {
        RestSourceConfig {
            base_url: self.remote_url.clone(),
            api_key: self.remote_key.clone(),
            timeout: self.http_timeout(),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// REST source from config, or a fixture directory when one is given.
pub fn source_from_config(
    config: &SyncConfig,
    fixtures: Option<PathBuf>,
) -> anyhow::Result<Arc<dyn RemoteSource>> {
    Ok(match fixtures {
        Some(dir) => Arc::new(FixtureSource::new(dir)),
        None => Arc::new(RestSource::new(config.rest_source_config())?),
    })
}

/// Failures that end a synchronizer run. Asset failures are not
/// representable here; they surface as [`AssetWarning`]s.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote query failed: {0}")]
    RemoteQueryFailed(#[from] SourceError),
    #[error("persisting snapshot failed: {0}")]
    PersistenceFailed(#[from] PersistError),
    #[error("no active settings record in the remote source and the default record is disabled")]
    SettingsMissing,
}

/// One asset that could not be mirrored. The record it belongs to was still
/// written, minus this reference.
#[derive(Debug, Clone, Serialize)]
pub struct AssetWarning {
    pub subject: String,
    pub url: String,
    pub destination: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettingsReport {
    pub used_default: bool,
    pub logo: Option<String>,
    pub favicon: Option<String>,
    pub warnings: Vec<AssetWarning>,
    pub snapshot: SnapshotWritten,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogReport {
    pub products: usize,
    pub images_attempted: usize,
    pub images_stored: usize,
    pub warnings: Vec<AssetWarning>,
    pub snapshot: SnapshotWritten,
}

/// Which steps to run and whether a failed settings step stops the catalog step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPlan {
    pub settings: bool,
    pub catalog: bool,
    pub fail_fast: bool,
}

impl Default for SyncPlan {
    fn default() -> Self {
        Self {
            settings: true,
            catalog: true,
            fail_fast: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome<T> {
    Succeeded(T),
    Failed { error: String },
    Skipped { reason: String },
    NotRequested,
}

impl<T> StepOutcome<T> {
    pub fn report(&self) -> Option<&T> {
        match self {
            Self::Succeeded(report) => Some(report),
            _ => None,
        }
    }

    fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Skipped { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub settings: StepOutcome<SettingsReport>,
    pub catalog: StepOutcome<CatalogReport>,
}

impl SyncRunSummary {
    /// True when every requested step wrote its snapshot. Asset warnings do
    /// not count against success.
    pub fn succeeded(&self) -> bool {
        !self.settings.is_failure() && !self.catalog.is_failure()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &AssetWarning> {
        let settings = self.settings.report().map(|r| r.warnings.as_slice());
        let catalog = self.catalog.report().map(|r| r.warnings.as_slice());
        settings
            .unwrap_or_default()
            .iter()
            .chain(catalog.unwrap_or_default())
    }

    pub fn render_text(&self) -> String {
        let warnings = self.warnings().collect::<Vec<_>>();
        let headline = match (self.succeeded(), warnings.is_empty()) {
            (false, _) => "sync failed",
            (true, true) => "sync complete",
            (true, false) => "sync complete with warnings",
        };
        let mut lines = vec![
            format!("{headline}: run_id={} source={}", self.run_id, self.source),
            format!(
                "- settings: {}",
                describe_step(&self.settings, |r| format!(
                    "{}{} ({} bytes, sha256 {})",
                    r.snapshot.path.display(),
                    if r.used_default { " [default record]" } else { "" },
                    r.snapshot.bytes,
                    short_hash(&r.snapshot.sha256)
                ))
            ),
            format!(
                "- catalog: {}",
                describe_step(&self.catalog, |r| format!(
                    "{} ({} products, {}/{} images, {} bytes, sha256 {})",
                    r.snapshot.path.display(),
                    r.products,
                    r.images_stored,
                    r.images_attempted,
                    r.snapshot.bytes,
                    short_hash(&r.snapshot.sha256)
                ))
            ),
        ];
        if !warnings.is_empty() {
            lines.push(format!("## Asset warnings ({})", warnings.len()));
            lines.extend(
                warnings
                    .iter()
                    .map(|w| format!("- {}: {} ({})", w.subject, w.url, w.error)),
            );
        }
        lines.join("\n")
    }
}

fn describe_step<T>(step: &StepOutcome<T>, ok: impl FnOnce(&T) -> String) -> String {
    match step {
        StepOutcome::Succeeded(report) => format!("ok -> {}", ok(report)),
        StepOutcome::Failed { error } => format!("FAILED: {error}"),
        StepOutcome::Skipped { reason } => format!("skipped: {reason}"),
        StepOutcome::NotRequested => "not requested".to_string(),
    }
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

pub struct SyncPipeline {
    source: Arc<dyn RemoteSource>,
    fetcher: AssetFetcher,
    layout: AssetLayout,
    settings_path: PathBuf,
    catalog_path: PathBuf,
    require_settings: bool,
}

impl SyncPipeline {
    pub fn new(config: &SyncConfig, source: Arc<dyn RemoteSource>) -> anyhow::Result<Self> {
        let layout = config.asset_layout();
        let fetcher = AssetFetcher::new(
            layout.root().to_path_buf(),
            HttpClientConfig {
                timeout: config.http_timeout(),
                user_agent: Some(config.user_agent.clone()),
            },
        )?;
        Ok(Self {
            source,
            fetcher,
            layout,
            settings_path: config.settings_snapshot_path(),
            catalog_path: config.catalog_snapshot_path(),
            require_settings: config.require_settings,
        })
    }

    /// Run the requested steps in order: settings, then catalog.
    pub async fn run(&self, plan: SyncPlan) -> SyncRunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("sync_run", %run_id, source = self.source.label());

        async move {
            let settings = if plan.settings {
                match self.sync_settings().await {
                    Ok(report) => StepOutcome::Succeeded(report),
                    Err(err) => {
                        error!(error = %err, "settings sync failed");
                        StepOutcome::Failed {
                            error: err.to_string(),
                        }
                    }
                }
            } else {
                StepOutcome::NotRequested
            };

            let catalog = if !plan.catalog {
                StepOutcome::NotRequested
            } else if plan.fail_fast && settings.is_failure() {
                warn!("catalog sync skipped after settings failure");
                StepOutcome::Skipped {
                    reason: "settings sync failed".to_string(),
                }
            } else {
                match self.sync_catalog().await {
                    Ok(report) => StepOutcome::Succeeded(report),
                    Err(err) => {
                        error!(error = %err, "catalog sync failed");
                        StepOutcome::Failed {
                            error: err.to_string(),
                        }
                    }
                }
            };

            SyncRunSummary {
                run_id,
                source: self.source.label().to_string(),
                started_at,
                finished_at: Utc::now(),
                settings,
                catalog,
            }
        }
        .instrument(span)
        .await
    }

    /// Fetch the active settings row, mirror its logo and favicon, sanitize
    /// it and replace the settings snapshot.
    pub async fn sync_settings(&self) -> Result<SettingsReport, SyncError> {
        info!("syncing store settings");
        let record = self.source.active_settings().await?;
        let mut warnings = Vec::new();

        let (snapshot, used_default) = match record {
            None if self.require_settings => return Err(SyncError::SettingsMissing),
            None => {
                warn!("no active settings record; writing the default settings");
                (SettingsSnapshot::default_record(), true)
            }
            Some(mut record) => {
                for (field, asset) in [
                    (LOGO_FIELD, SettingsAsset::Logo),
                    (FAVICON_FIELD, SettingsAsset::Favicon),
                ] {
                    let reference = match record.image_url(field).map(str::to_owned) {
                        Some(url) => {
                            let target = self.layout.settings_asset(asset, &url);
                            match self.mirror(&format!("settings {field}"), &url, &target).await {
                                Ok(reference) => Some(reference),
                                Err(warning) => {
                                    warnings.push(warning);
                                    None
                                }
                            }
                        }
                        None => None,
                    };
                    record.set_image_reference(field, reference);
                }
                (record.sanitize(), false)
            }
        };

        let written = write_snapshot(&self.settings_path, &snapshot).await?;
        info!(path = %written.path.display(), bytes = written.bytes, "settings snapshot written");
        Ok(SettingsReport {
            used_default,
            logo: snapshot.logo_url().map(str::to_owned),
            favicon: snapshot.favicon_url().map(str::to_owned),
            warnings,
            snapshot: written,
        })
    }

    /// Fetch every product, mirror each image in order, and replace the
    /// catalog snapshot. Products are never dropped for missing images.
    pub async fn sync_catalog(&self) -> Result<CatalogReport, SyncError> {
        let records = self.source.list_products().await?;
        info!(products = records.len(), "syncing catalog");

        let mut catalog: CatalogSnapshot = Vec::with_capacity(records.len());
        let mut warnings = Vec::new();
        let mut images_attempted = 0usize;
        let mut images_stored = 0usize;

        for record in records {
            let subject = format!("product {}", record.id);
            let mut images = Vec::with_capacity(record.images.len());
            for (position, entry) in record.images.iter().enumerate() {
                images_attempted += 1;
                // Names follow the position in the remote list, so a failed
                // image leaves a gap instead of shifting later ones.
                let Some(url) = entry.as_deref() else {
                    let target = self.layout.product_image(&record.id, position + 1, "");
                    warn!(subject = %subject, position = position + 1, "image entry is not a url; skipped");
                    warnings.push(AssetWarning {
                        subject: subject.clone(),
                        url: String::new(),
                        destination: target.path.display().to_string(),
                        error: format!("image entry {} is not a url string", position + 1),
                    });
                    continue;
                };
                let target = self.layout.product_image(&record.id, position + 1, url);
                match self.mirror(&subject, url, &target).await {
                    Ok(reference) => {
                        images_stored += 1;
                        images.push(reference);
                    }
                    Err(warning) => warnings.push(warning),
                }
            }
            catalog.push(ProductSnapshot::from_remote(record, images));
        }

        let written = write_snapshot(&self.catalog_path, &catalog).await?;
        info!(
            path = %written.path.display(),
            products = catalog.len(),
            images_stored,
            images_attempted,
            "catalog snapshot written"
        );
        Ok(CatalogReport {
            products: catalog.len(),
            images_attempted,
            images_stored,
            warnings,
            snapshot: written,
        })
    }

    async fn mirror(
        &self,
        subject: &str,
        url: &str,
        target: &AssetTarget,
    ) -> Result<String, AssetWarning> {
        match self.fetcher.download(url, &target.path).await {
            Ok(stored) => {
                info!(subject, url, reference = %target.reference, byte_size = stored.byte_size, "asset mirrored");
                Ok(target.reference.clone())
            }
            Err(err) => {
                warn!(subject, url, destination = %target.path.display(), error = %err, "asset unavailable; reference dropped");
                Err(AssetWarning {
                    subject: subject.to_string(),
                    url: url.to_string(),
                    destination: target.path.display().to_string(),
                    error: err.to_string(),
                })
            }
        }
    }
}

/// What the snapshot files on disk currently contain.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SnapshotReport {
    pub settings_present: bool,
    pub store_name: Option<String>,
    pub catalog_present: bool,
    pub products: usize,
    pub image_references: usize,
    pub missing_assets: Vec<String>,
    pub external_references: Vec<String>,
}

impl SnapshotReport {
    pub fn render_markdown(&self) -> String {
        let mut lines = vec!["# Storefront Snapshot Report".to_string(), String::new()];
        lines.push(format!(
            "- settings: {}",
            match (self.settings_present, &self.store_name) {
                (false, _) => "missing".to_string(),
                (true, Some(name)) => format!("present (store `{name}`)"),
                (true, None) => "present".to_string(),
            }
        ));
        lines.push(format!(
            "- catalog: {}",
            if self.catalog_present {
                format!("{} products", self.products)
            } else {
                "missing".to_string()
            }
        ));
        lines.push(format!("- image references: {}", self.image_references));
        lines.push(format!("- missing asset files: {}", self.missing_assets.len()));
        lines.extend(self.missing_assets.iter().map(|r| format!("  - `{r}`")));
        if !self.external_references.is_empty() {
            lines.push(format!(
                "- references outside the assets tree: {}",
                self.external_references.len()
            ));
            lines.extend(self.external_references.iter().map(|r| format!("  - `{r}`")));
        }
        lines.join("\n")
    }
}

/// Read both snapshots and check every asset reference against the assets tree.
pub async fn inspect_snapshots(config: &SyncConfig) -> anyhow::Result<SnapshotReport> {
    let layout = config.asset_layout();
    let settings: Option<Value> = read_snapshot(&config.settings_snapshot_path()).await?;
    let catalog: Option<Value> = read_snapshot(&config.catalog_snapshot_path()).await?;

    let mut report = SnapshotReport {
        settings_present: settings.is_some(),
        catalog_present: catalog.is_some(),
        ..Default::default()
    };
    let mut references = Vec::new();

    if let Some(settings) = &settings {
        report.store_name = settings
            .get("store_name")
            .and_then(Value::as_str)
            .map(str::to_owned);
        references.extend(
            [LOGO_FIELD, FAVICON_FIELD]
                .iter()
                .filter_map(|field| settings.get(*field).and_then(Value::as_str))
                .map(str::to_owned),
        );
    }

    if let Some(products) = catalog.as_ref().and_then(Value::as_array) {
        report.products = products.len();
        references.extend(
            products
                .iter()
                .filter_map(|p| p.get("images").and_then(Value::as_array))
                .flatten()
                .filter_map(Value::as_str)
                .map(str::to_owned),
        );
    }

    report.image_references = references.len();
    for reference in references {
        match layout.resolve_reference(&reference) {
            Some(path) => {
                if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    report.missing_assets.push(reference);
                }
            }
            None => report.external_references.push(reference),
        }
    }
    Ok(report)
}
