//! Core record and snapshot types for the storefront content sync.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub const CRATE_NAME: &str = "storesync-core";

pub type JsonObject = serde_json::Map<String, Value>;

pub const SETTINGS_SNAPSHOT_FILE: &str = "store-settings.json";
pub const CATALOG_SNAPSHOT_FILE: &str = "products.json";

pub const LOGO_FIELD: &str = "logo_url";
pub const FAVICON_FIELD: &str = "favicon_url";

/// Settings columns that only mean something to the remote source.
pub const SETTINGS_INTERNAL_FIELDS: &[&str] = &[
    "id",
    "created_at",
    "updated_at",
    "is_active",
    "logo_path",
    "favicon_path",
];

pub const DEFAULT_CURRENCY: &str = "USD";
pub const DEFAULT_STORE_NAME: &str = "My Store";
pub const DEFAULT_STORE_DESCRIPTION: &str = "Welcome to our store";
pub const DEFAULT_PRIMARY_COLOR: &str = "#3b82f6";
pub const DEFAULT_SECONDARY_COLOR: &str = "#1e40af";

/// Returns a copy of `record` without the named fields. Everything else,
/// including fields the caller already rewrote, is carried over untouched.
pub fn sanitize_record(record: &JsonObject, internal_fields: &[&str]) -> JsonObject {
    record
        .iter()
        .filter(|(key, _)| !internal_fields.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// The active store-configuration row as the remote source returns it.
///
/// Columns other than the two image URLs are passed through verbatim, so the
/// record is kept as an object rather than a fixed struct.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteSettingsRecord {
    pub fields: JsonObject,
}

impl RemoteSettingsRecord {
    pub fn new(fields: JsonObject) -> Self {
        Self { fields }
    }

    /// Non-empty string value of an image field, if any.
    pub fn image_url(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn logo_url(&self) -> Option<&str> {
        self.image_url(LOGO_FIELD)
    }

    pub fn favicon_url(&self) -> Option<&str> {
        self.image_url(FAVICON_FIELD)
    }

    /// Replace an image field with a local reference, or null when unresolved.
    pub fn set_image_reference(&mut self, field: &str, reference: Option<String>) {
        self.fields.insert(
            field.to_string(),
            reference.map(Value::String).unwrap_or(Value::Null),
        );
    }

    pub fn sanitize(&self) -> SettingsSnapshot {
        SettingsSnapshot {
            fields: sanitize_record(&self.fields, SETTINGS_INTERNAL_FIELDS),
        }
    }
}

/// Sanitized settings with image URLs replaced by local asset references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettingsSnapshot {
    pub fields: JsonObject,
}

impl SettingsSnapshot {
    /// Fallback used when the remote source has no active settings row.
    pub fn default_record() -> Self {
        let mut fields = JsonObject::new();
        fields.insert("store_name".into(), DEFAULT_STORE_NAME.into());
        fields.insert("store_description".into(), DEFAULT_STORE_DESCRIPTION.into());
        fields.insert("currency".into(), DEFAULT_CURRENCY.into());
        fields.insert("primary_color".into(), DEFAULT_PRIMARY_COLOR.into());
        fields.insert("secondary_color".into(), DEFAULT_SECONDARY_COLOR.into());
        fields.insert(LOGO_FIELD.into(), Value::Null);
        fields.insert(FAVICON_FIELD.into(), Value::Null);
        Self { fields }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn logo_url(&self) -> Option<&str> {
        self.fields.get(LOGO_FIELD).and_then(Value::as_str)
    }

    pub fn favicon_url(&self) -> Option<&str> {
        self.fields.get(FAVICON_FIELD).and_then(Value::as_str)
    }
}

/// A timestamp column kept in the exact text the source sent. The parsed
/// instant is only used for ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTimestamp {
    raw: String,
    instant: DateTime<Utc>,
}

impl SourceTimestamp {
    /// Accepts RFC 3339, or a zone-less timestamp which is read as UTC.
    pub fn parse(raw: impl Into<String>) -> Result<Self, chrono::ParseError> {
        let raw = raw.into();
        let instant = match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(err) => NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S%.f"))
                .map_err(|_| err)?
                .and_utc(),
        };
        Ok(Self { raw, instant })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.instant
    }
}

impl fmt::Display for SourceTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for SourceTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for SourceTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(raw.as_str()).map_err(|err| {
            serde::de::Error::custom(format!("invalid timestamp {raw:?}: {err}"))
        })
    }
}

/// One catalog entry as returned by the remote source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteProductRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(deserialize_with = "non_negative_price")]
    pub price: f64,
    /// One slot per remote entry, in remote order. Entries that are not
    /// strings are `None` so later entries keep their position.
    #[serde(default, deserialize_with = "image_entries")]
    pub images: Vec<Option<String>>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub stock: u64,
    pub created_at: SourceTimestamp,
    #[serde(default)]
    pub updated_at: Option<SourceTimestamp>,
    /// Remaining columns (storage paths, flags). Never written to a snapshot.
    #[serde(flatten)]
    pub extra: JsonObject,
}

/// Sanitized catalog entry. Only these fields reach the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub images: Vec<String>,
    pub category: Option<String>,
    pub stock: u64,
    pub created_at: SourceTimestamp,
    pub updated_at: Option<SourceTimestamp>,
}

impl ProductSnapshot {
    /// Project a remote record onto the snapshot fields, using `images` as the
    /// already-resolved local image list.
    pub fn from_remote(record: RemoteProductRecord, images: Vec<String>) -> Self {
        Self {
            id: record.id,
            name: record.name,
            description: record.description,
            price: record.price,
            images,
            category: record.category,
            stock: record.stock,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

pub type CatalogSnapshot = Vec<ProductSnapshot>;

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(text) => text,
        Id::Number(number) => number.to_string(),
    })
}

fn non_negative_price<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let price = f64::deserialize(deserializer)?;
    if price.is_finite() && price >= 0.0 {
        Ok(price)
    } else {
        Err(serde::de::Error::custom(format!(
            "price must be a non-negative number, got {price}"
        )))
    }
}

fn image_entries<'de, D>(deserializer: D) -> Result<Vec<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            Value::String(url) => Some(url),
            _ => None,
        })
        .collect())
}
