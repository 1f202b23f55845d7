//! Asset mirroring and snapshot persistence for storesync.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "storesync-storage";

/// Extension used when the source URL path carries none.
pub const DEFAULT_ASSET_EXTENSION: &str = "jpg";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Store-level images, each stored under a fixed name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsAsset {
    Logo,
    Favicon,
}

impl SettingsAsset {
    pub fn file_stem(self) -> &'static str {
        match self {
            Self::Logo => "logo",
            Self::Favicon => "favicon",
        }
    }
}

/// Where a mirrored asset lives on disk and how snapshots refer to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetTarget {
    pub path: PathBuf,
    pub reference: String,
}

/// Deterministic layout of the assets tree:
/// `store/<logo|favicon>.<ext>` and `products/<id>/image-<n>.<ext>`.
#[derive(Debug, Clone)]
pub struct AssetLayout {
    root: PathBuf,
    public_prefix: String,
}

impl AssetLayout {
    pub fn new(root: impl Into<PathBuf>, public_prefix: impl Into<String>) -> Self {
        let public_prefix = public_prefix.into().trim_end_matches('/').to_string();
        Self {
            root: root.into(),
            public_prefix,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_asset(&self, asset: SettingsAsset, source_url: &str) -> AssetTarget {
        let file_name = format!("{}.{}", asset.file_stem(), extension_for(source_url));
        self.target(&["store", &file_name])
    }

    /// `index` is 1-based and follows the order of the record's image list.
    pub fn product_image(&self, product_id: &str, index: usize, source_url: &str) -> AssetTarget {
        let namespace = safe_segment(product_id);
        let file_name = format!("image-{index}.{}", extension_for(source_url));
        self.target(&["products", &namespace, &file_name])
    }

    /// Map a snapshot reference back to its file under the assets root.
    pub fn resolve_reference(&self, reference: &str) -> Option<PathBuf> {
        let relative = reference
            .strip_prefix(&self.public_prefix)?
            .trim_start_matches('/');
        let relative = Path::new(relative);
        if relative.as_os_str().is_empty() || !is_contained(relative) {
            return None;
        }
        Some(self.root.join(relative))
    }

    fn target(&self, segments: &[&str]) -> AssetTarget {
        let path = segments
            .iter()
            .fold(self.root.clone(), |path, segment| path.join(segment));
        let reference = format!("{}/{}", self.public_prefix, segments.join("/"));
        AssetTarget { path, reference }
    }
}

/// Extension of the last path segment of `url`, lowercased, or the default.
pub fn extension_for(url: &str) -> String {
    Url::parse(url.trim())
        .ok()
        .and_then(|parsed| {
            let segment = parsed.path_segments()?.next_back()?.to_string();
            let ext = Path::new(&segment).extension()?.to_str()?.to_ascii_lowercase();
            let valid = (1..=5).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric());
            valid.then_some(ext)
        })
        .unwrap_or_else(|| DEFAULT_ASSET_EXTENSION.to_string())
}

/// Reduce an identifier to a single path segment that cannot climb out of its
/// parent directory. Identifiers that need rewriting get a short hash of the
/// raw id appended, so distinct ids never share a directory.
pub fn safe_segment(id: &str) -> String {
    let cleaned = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    if cleaned == id && !cleaned.is_empty() && !cleaned.chars().all(|c| c == '.') {
        cleaned
    } else {
        let digest = sha256_hex(id.as_bytes());
        format!("{cleaned}-{}", &digest[..10])
    }
}

fn is_contained(relative: &Path) -> bool {
    relative
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// A single asset could not be mirrored. Always recoverable for the caller.
#[derive(Debug, Error)]
pub enum AssetUnavailable {
    #[error("invalid asset url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("destination {} is outside the assets root", path.display())]
    OutsideAssetsRoot { path: PathBuf },
    #[error("request for {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("writing {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct DownloadedAsset {
    pub path: PathBuf,
    pub byte_size: u64,
}

/// Downloads one URL to one file under the assets root. No retries.
#[derive(Debug, Clone)]
pub struct AssetFetcher {
    client: reqwest::Client,
    root: PathBuf,
}

impl AssetFetcher {
    pub fn new(root: impl Into<PathBuf>, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            root: root.into(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fetch `url` into `destination`. On failure the destination does not
    /// exist afterwards, whatever was there before.
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
    ) -> Result<DownloadedAsset, AssetUnavailable> {
        self.check_destination(destination)?;
        let span = info_span!("asset_fetch", url, destination = %destination.display());

        let result = self.download_inner(url, destination).instrument(span).await;
        if result.is_err() {
            let _ = fs::remove_file(destination).await;
        }
        result
    }

    async fn download_inner(
        &self,
        url: &str,
        destination: &Path,
    ) -> Result<DownloadedAsset, AssetUnavailable> {
        let parsed = parse_http_url(url)?;
        let mut response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|source| AssetUnavailable::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AssetUnavailable::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }

        let parent = destination
            .parent()
            .ok_or_else(|| AssetUnavailable::OutsideAssetsRoot {
                path: destination.to_path_buf(),
            })?;
        fs::create_dir_all(parent)
            .await
            .map_err(|source| AssetUnavailable::Write {
                path: parent.to_path_buf(),
                source,
            })?;

        let temp_path = temp_sibling(destination);
        let written = async {
            let write_err = |source| AssetUnavailable::Write {
                path: temp_path.clone(),
                source,
            };
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await
                .map_err(write_err)?;

            let mut byte_size = 0u64;
            while let Some(chunk) =
                response
                    .chunk()
                    .await
                    .map_err(|source| AssetUnavailable::Request {
                        url: url.to_string(),
                        source,
                    })?
            {
                file.write_all(&chunk).await.map_err(write_err)?;
                byte_size += chunk.len() as u64;
            }
            file.flush().await.map_err(write_err)?;
            file.sync_all().await.map_err(write_err)?;
            drop(file);

            fs::rename(&temp_path, destination)
                .await
                .map_err(|source| AssetUnavailable::Write {
                    path: destination.to_path_buf(),
                    source,
                })?;
            Ok::<_, AssetUnavailable>(byte_size)
        }
        .await;

        match written {
            Ok(byte_size) => {
                debug!(byte_size, "asset stored");
                Ok(DownloadedAsset {
                    path: destination.to_path_buf(),
                    byte_size,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err)
            }
        }
    }

    fn check_destination(&self, destination: &Path) -> Result<(), AssetUnavailable> {
        let inside = destination
            .strip_prefix(&self.root)
            .map(|relative| !relative.as_os_str().is_empty() && is_contained(relative))
            .unwrap_or(false);
        if inside {
            Ok(())
        } else {
            Err(AssetUnavailable::OutsideAssetsRoot {
                path: destination.to_path_buf(),
            })
        }
    }
}

fn parse_http_url(url: &str) -> Result<Url, AssetUnavailable> {
    let invalid = |reason: String| AssetUnavailable::InvalidUrl {
        url: url.to_string(),
        reason,
    };
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty url".into()));
    }
    let parsed = Url::parse(trimmed).map_err(|err| invalid(err.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(invalid(format!("unsupported scheme {other}"))),
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()))
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("serializing snapshot for {}: {source}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot path {} has no file name", path.display())]
    InvalidPath { path: PathBuf },
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotWritten {
    pub path: PathBuf,
    pub bytes: usize,
    pub sha256: String,
}

/// Pretty JSON with two-space indentation, no trailing newline.
pub fn render_snapshot<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(value)
}

/// Serialize `value` and replace `path` atomically. Readers see either the
/// previous file or the new one in full.
pub async fn write_snapshot<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<SnapshotWritten, PersistError> {
    let bytes = render_snapshot(value).map_err(|source| PersistError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes).await?;
    Ok(SnapshotWritten {
        path: path.to_path_buf(),
        bytes: bytes.len(),
        sha256: sha256_hex(&bytes),
    })
}

pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    if path.file_name().is_none() {
        return Err(PersistError::InvalidPath {
            path: path.to_path_buf(),
        });
    }
    let io_err = |action: &'static str, path: &Path| {
        let path = path.to_path_buf();
        move |source| PersistError::Io {
            action,
            path,
            source,
        }
    };

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(io_err("creating snapshot directory", &parent))?;

    let temp_path = temp_sibling(path);
    let staged = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err("opening temp snapshot", &temp_path))?;
        file.write_all(bytes)
            .await
            .map_err(io_err("writing temp snapshot", &temp_path))?;
        file.flush()
            .await
            .map_err(io_err("flushing temp snapshot", &temp_path))?;
        file.sync_all()
            .await
            .map_err(io_err("syncing temp snapshot", &temp_path))?;
        drop(file);
        fs::rename(&temp_path, path)
            .await
            .map_err(io_err("replacing snapshot", path))
    }
    .await;

    if let Err(err) = staged {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }

    sync_parent_dir(&parent).await
}

async fn sync_parent_dir(parent: &Path) -> Result<(), PersistError> {
    #[cfg(unix)]
    {
        let dir = fs::File::open(parent).await.map_err(|source| PersistError::Io {
            action: "opening snapshot directory",
            path: parent.to_path_buf(),
            source,
        })?;
        dir.sync_all().await.map_err(|source| PersistError::Io {
            action: "syncing snapshot directory",
            path: parent.to_path_buf(),
            source,
        })?;
    }
    #[cfg(not(unix))]
    let _ = parent;
    Ok(())
}

/// Read and parse a snapshot file; `None` if it has never been written.
pub async fn read_snapshot<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let value = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn snapshot_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn extensions_come_from_the_url_path() {
        assert_eq!(extension_for("https://x/a.PNG"), "png");
        assert_eq!(extension_for("https://x/photo.webp?w=400#top"), "webp");
        assert_eq!(extension_for("https://x/missing"), DEFAULT_ASSET_EXTENSION);
        assert_eq!(extension_for("https://x.example.com/"), DEFAULT_ASSET_EXTENSION);
        assert_eq!(extension_for("not a url"), DEFAULT_ASSET_EXTENSION);
        assert_eq!(extension_for("https://x/archive.tar.gz"), "gz");
        assert_eq!(extension_for("https://x/weird.p%20g"), DEFAULT_ASSET_EXTENSION);
    }

    #[test]
    fn layout_paths_are_deterministic() {
        let layout = AssetLayout::new("/srv/public/images", "/images/");

        let logo = layout.settings_asset(SettingsAsset::Logo, "https://cdn/logo.svg");
        assert_eq!(logo.path, PathBuf::from("/srv/public/images/store/logo.svg"));
        assert_eq!(logo.reference, "/images/store/logo.svg");

        let image = layout.product_image("p-1", 2, "https://cdn/b.png");
        assert_eq!(
            image.path,
            PathBuf::from("/srv/public/images/products/p-1/image-2.png")
        );
        assert_eq!(image.reference, "/images/products/p-1/image-2.png");

        assert_eq!(
            layout.resolve_reference("/images/products/p-1/image-2.png"),
            Some(image.path)
        );
        assert_eq!(layout.resolve_reference("/images/../etc/passwd"), None);
        assert_eq!(layout.resolve_reference("https://cdn/b.png"), None);
    }

    #[test]
    fn product_ids_cannot_escape_the_products_directory() {
        for id in ["../../etc", "..", ".", "", "a/../../b"] {
            let segment = safe_segment(id);
            assert!(
                is_contained(Path::new(&segment)) && Path::new(&segment).components().count() == 1,
                "{id:?} -> {segment:?}"
            );
        }
        assert!(safe_segment("../../etc").starts_with(".._.._etc-"));
        assert_eq!(safe_segment("9f1c-22"), "9f1c-22");
    }

    #[test]
    fn rewritten_product_ids_do_not_collide() {
        let plain = safe_segment("sku_1");
        let spaced = safe_segment("sku 1");
        let slashed = safe_segment("sku/1");
        let padded = safe_segment(" sku_1");
        assert_eq!(plain, "sku_1");
        assert!(spaced.starts_with("sku_1-"));
        assert_eq!(spaced, safe_segment("sku 1"), "stable across runs");

        let all = [&plain, &spaced, &slashed, &padded];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }

        let layout = AssetLayout::new("/srv/images", "/images");
        assert_ne!(
            layout.product_image("sku 1", 1, "https://x/one.png").path,
            layout.product_image("sku_1", 1, "https://x/two.png").path
        );
    }

    #[tokio::test]
    async fn download_writes_the_body_under_the_root() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\x89PNG-bytes".to_vec()))
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir");
        let fetcher = AssetFetcher::new(dir.path(), HttpClientConfig::default()).expect("fetcher");
        let destination = dir.path().join("products/p1/image-1.png");

        let stored = fetcher
            .download(&format!("{}/a.png", server.uri()), &destination)
            .await
            .expect("download");

        assert_eq!(stored.byte_size, 10);
        assert_eq!(std::fs::read(&destination).expect("read"), b"\x89PNG-bytes");
        let leftovers = std::fs::read_dir(dir.path().join("products/p1"))
            .expect("read_dir")
            .count();
        assert_eq!(leftovers, 1, "no temp files remain");
    }

    #[tokio::test]
    async fn failed_download_leaves_no_file_behind() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir");
        let fetcher = AssetFetcher::new(dir.path(), HttpClientConfig::default()).expect("fetcher");
        let destination = dir.path().join("products/p1/image-2.jpg");
        std::fs::create_dir_all(destination.parent().unwrap()).unwrap();
        std::fs::write(&destination, b"stale").unwrap();

        let err = fetcher
            .download(&format!("{}/missing", server.uri()), &destination)
            .await
            .unwrap_err();

        assert!(matches!(err, AssetUnavailable::HttpStatus { status: 404, .. }));
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn non_http_urls_and_foreign_destinations_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let fetcher = AssetFetcher::new(dir.path(), HttpClientConfig::default()).expect("fetcher");

        let err = fetcher
            .download("file:///etc/passwd", &dir.path().join("store/logo.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, AssetUnavailable::InvalidUrl { .. }));

        let err = fetcher
            .download("", &dir.path().join("store/logo.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, AssetUnavailable::InvalidUrl { .. }));

        let err = fetcher
            .download("https://x/a.png", &dir.path().join("../outside.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, AssetUnavailable::OutsideAssetsRoot { .. }));
    }

    #[tokio::test]
    async fn snapshots_are_pretty_printed_and_replaced_whole() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("data/products.json");

        let empty: Vec<serde_json::Value> = Vec::new();
        let written = write_snapshot(&target, &empty).await.expect("write empty");
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "[]");
        assert_eq!(written.bytes, 2);

        write_snapshot(&target, &json!([{"id": "p1", "images": []}]))
            .await
            .expect("write");
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "[\n  {\n    \"id\": \"p1\",\n    \"images\": []\n  }\n]"
        );

        let parsed: Option<serde_json::Value> = read_snapshot(&target).await.expect("read");
        assert_eq!(parsed, Some(json!([{"id": "p1", "images": []}])));
        let missing: Option<serde_json::Value> =
            read_snapshot(&dir.path().join("nope.json")).await.expect("read");
        assert!(missing.is_none());
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("boom"))
        }
    }

    #[tokio::test]
    async fn failed_write_keeps_the_previous_snapshot() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("store-settings.json");
        write_snapshot(&target, &json!({"currency": "USD"}))
            .await
            .expect("first write");
        let before = std::fs::read(&target).unwrap();

        let err = write_snapshot(&target, &Unserializable).await.unwrap_err();
        assert!(matches!(err, PersistError::Serialize { .. }));
        assert_eq!(std::fs::read(&target).unwrap(), before);

        // A directory squatting on the temp file's rename target makes the
        // replace step itself fail.
        let blocked = dir.path().join("blocked.json");
        std::fs::create_dir_all(blocked.join("child")).unwrap();
        let err = write_snapshot(&blocked, &json!([])).await.unwrap_err();
        assert!(matches!(err, PersistError::Io { .. }));
        assert!(blocked.join("child").is_dir());

        let entries = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert!(entries.iter().all(|name| !name.ends_with(".tmp")), "{entries:?}");
    }
}
