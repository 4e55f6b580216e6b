//! Works out which checkpoint model generated an image.
//!
//! Generation metadata comes in several shapes depending on the client that uploaded the
//! image. Each shape gets its own extractor; [`extract_model`] tries them in priority order and
//! keeps the first hit. Names that are only hashes, UUIDs or numeric file names are resolved
//! through the model-version API, memoized in a [`ModelCache`] owned by the run.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::Local;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::record::{Record, RecordId};
use crate::request::HttpSource;
use crate::retry::{RetryError, RetryPolicy};
use crate::sink::{NdjsonSink, RecordSink};
use crate::{info_time, Result};

static UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("valid regex")
});
static NUMERIC_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\d+(\.safetensors|\.ckpt|\.pt)?$").expect("valid regex"));
static EXTENSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(safetensors|ckpt|pt)$").expect("valid regex"));
static NUMERIC_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[_ .-]?").expect("valid regex"));
static TECHNICAL_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[_ -]?(fp8|fp16|bf16|nf4|int8|noclip|gguf|q4_k|q8_0|pruned|baked|vae).*")
        .expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    /// `meta.resources[]` entry of type `model`.
    Resources,
    /// `meta.civitaiResources[]` entry of type `checkpoint`.
    CivitaiResources,
    /// `meta.Model` free text.
    MetaModel,
    /// Name looked up through the model-version API.
    Api,
}

impl ModelSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSource::Resources => "resources",
            ModelSource::CivitaiResources => "civitaiResources",
            ModelSource::MetaModel => "meta.Model",
            ModelSource::Api => "api",
        }
    }
}

/// Evidence that a checkpoint was used, with whatever identifies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub source: ModelSource,
    pub name: Option<String>,
    pub hash: Option<String>,
    pub version_id: Option<RecordId>,
}

impl ModelRef {
    /// The cleaned name, unless it is missing or only identifies a file.
    pub fn usable_name(&self) -> Option<String> {
        self.name
            .as_deref()
            .filter(|name| !is_placeholder_name(name))
            .map(clean_technical_name)
            .filter(|name| !name.is_empty())
    }

    fn fill_ids_from(&mut self, other: &ModelRef) {
        if self.version_id.is_none() {
            self.version_id = other.version_id.clone();
        }
        if self.hash.is_none() {
            self.hash = other.hash.clone();
        }
    }
}

pub type Extractor = fn(&Map<String, Value>) -> Option<ModelRef>;

/// Extractors in priority order.
pub const EXTRACTORS: &[Extractor] = &[from_resources, from_civitai_resources, from_meta_model];

/// First extractor with a usable name wins. Without one, the highest priority hit is returned
/// with the version id and hash of later hits filled in, so it can still be looked up.
pub fn extract_model(meta: &Map<String, Value>) -> Option<ModelRef> {
    let mut fallback: Option<ModelRef> = None;
    for mut found in EXTRACTORS.iter().filter_map(|extract| extract(meta)) {
        if found.usable_name().is_some() {
            if let Some(earlier) = &fallback {
                found.fill_ids_from(earlier);
            }
            return Some(found);
        }
        match fallback.as_mut() {
            Some(earlier) => earlier.fill_ids_from(&found),
            None => fallback = Some(found),
        }
    }
    fallback
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn find_typed<'a>(meta: &'a Map<String, Value>, list: &str, kind: &str) -> Option<&'a Value> {
    meta.get(list)?
        .as_array()?
        .iter()
        .find(|entry| entry.get("type").and_then(Value::as_str) == Some(kind))
}

pub fn from_resources(meta: &Map<String, Value>) -> Option<ModelRef> {
    let entry = find_typed(meta, "resources", "model")?;
    Some(ModelRef {
        source: ModelSource::Resources,
        name: str_field(entry, "name"),
        hash: str_field(entry, "hash"),
        version_id: None,
    })
}

pub fn from_civitai_resources(meta: &Map<String, Value>) -> Option<ModelRef> {
    let entry = find_typed(meta, "civitaiResources", "checkpoint")?;
    Some(ModelRef {
        source: ModelSource::CivitaiResources,
        name: None,
        hash: None,
        version_id: entry.get("modelVersionId").and_then(RecordId::from_value),
    })
}

/// `meta.Model` holds either a file name or an AIR urn; urns carry no usable name.
pub fn from_meta_model(meta: &Map<String, Value>) -> Option<ModelRef> {
    let model = meta.get("Model").filter(|m| !m.is_null())?;
    let name = match model {
        Value::String(s) if s.starts_with("urn:") => None,
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        other => Some(other.to_string()),
    };
    let hash = meta
        .get("Model hash")
        .and_then(Value::as_str)
        .or_else(|| meta.get("hashes")?.get("model")?.as_str())
        .map(String::from);
    Some(ModelRef {
        source: ModelSource::MetaModel,
        name,
        hash,
        version_id: None,
    })
}

/// A name that only identifies a file (UUID or bare numeric id) rather than a model.
pub fn is_placeholder_name(name: &str) -> bool {
    UUID.is_match(name) || NUMERIC_FILE.is_match(name)
}

/// Strips file extension, numeric download prefix and precision/quantization suffixes.
pub fn clean_technical_name(raw: &str) -> String {
    let name = raw.trim();
    let name = EXTENSION.replace(name, "");
    let name = NUMERIC_PREFIX.replace(&name, "");
    let name = TECHNICAL_SUFFIX.replace(&name, "");
    name.trim_matches(|c| c == '_' || c == ' ' || c == '-').to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LookupKey {
    Version(RecordId),
    Hash(String),
}

/// Resolves a model version id or file hash to a display name.
#[async_trait]
pub trait ModelLookup: Send + Sync {
    /// `Ok(None)` means the service does not know the key.
    async fn lookup(&self, key: &LookupKey) -> Result<Option<String>, FetchError>;
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    name: Option<String>,
    model: Option<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    name: Option<String>,
}

/// [`ModelLookup`] against the `model-versions` resource.
#[derive(Debug, Clone)]
pub struct VersionLookup {
    source: HttpSource,
    endpoint: String,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl VersionLookup {
    pub fn new(
        source: HttpSource,
        endpoint: impl Into<String>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        VersionLookup {
            source,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            retry,
            cancel,
        }
    }
}

#[async_trait]
impl ModelLookup for VersionLookup {
    async fn lookup(&self, key: &LookupKey) -> Result<Option<String>, FetchError> {
        let url = match key {
            LookupKey::Version(id) => format!("{}/{id}", self.endpoint),
            LookupKey::Hash(hash) => format!("{}/by-hash/{hash}", self.endpoint),
        };
        let what = format!("lookup {url}");
        let info: VersionInfo = match self
            .retry
            .run(&what, &self.cancel, || self.source.request_json(&url, &[]))
            .await
        {
            Ok((info, _)) => info,
            Err(RetryError::Fatal(FetchError::Status(status)))
                if status == reqwest::StatusCode::NOT_FOUND =>
            {
                return Ok(None)
            }
            Err(err) => return Err(err.into_inner()),
        };

        let name = [info.model.and_then(|m| m.name), info.name]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        Ok(Some(name.trim().to_string()).filter(|n| !n.is_empty()))
    }
}

/// Memo of lookups for one run. Failed lookups are remembered too, so a broken key is only
/// asked once.
#[derive(Debug, Default)]
pub struct ModelCache {
    entries: HashMap<LookupKey, Option<String>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve<L>(&mut self, lookup: &L, key: LookupKey) -> Option<String>
    where
        L: ModelLookup + ?Sized,
    {
        if let Some(hit) = self.entries.get(&key) {
            return hit.clone();
        }
        let name = match lookup.lookup(&key).await {
            Ok(name) => name,
            Err(e) => {
                warn!("Lookup of {key:?} failed: {e}");
                None
            }
        };
        debug!("Resolved {key:?} -> {name:?}");
        self.entries.insert(key, name.clone());
        name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    Named {
        clean_name: String,
        original_name: Option<String>,
        source: ModelSource,
        version_id: Option<RecordId>,
    },
    /// Nothing in the metadata points at a checkpoint.
    NoCheckpoint,
    /// A checkpoint was used but neither its name nor a lookup gave a usable name.
    NoName,
}

pub async fn annotate_record<L>(record: &Record, lookup: &L, cache: &mut ModelCache) -> Annotation
where
    L: ModelLookup + ?Sized,
{
    let Some(model) = record.meta().and_then(extract_model) else {
        return Annotation::NoCheckpoint;
    };

    if let Some(clean_name) = model.usable_name() {
        return Annotation::Named {
            clean_name,
            original_name: model.name,
            source: model.source,
            version_id: model.version_id,
        };
    }

    let key = match (&model.version_id, &model.hash) {
        (Some(id), _) => LookupKey::Version(id.clone()),
        (None, Some(hash)) => LookupKey::Hash(hash.clone()),
        (None, None) => return Annotation::NoName,
    };
    match cache.resolve(lookup, key).await {
        Some(clean_name) => Annotation::Named {
            clean_name,
            original_name: model.name,
            source: ModelSource::Api,
            version_id: model.version_id,
        },
        None => Annotation::NoName,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotateReport {
    pub annotated: usize,
    pub not_image: usize,
    pub no_base_model: usize,
    pub no_checkpoint: usize,
    pub no_name: usize,
    pub malformed: usize,
}

/// Annotates every image record of `input` that has a `baseModel` and writes the kept records,
/// extended with `clean_model_name`, `original_model_name`, `model_source` and
/// `model_version_id`, to `output`.
pub async fn annotate_file<L>(
    input: &Path,
    output: &Path,
    lookup: &L,
    cache: &mut ModelCache,
) -> Result<AnnotateReport>
where
    L: ModelLookup + ?Sized,
{
    let start_time = Local::now();
    let content = tokio::fs::read_to_string(input).await?;
    let mut sink = NdjsonSink::create(output).await?;
    let mut report = AnnotateReport::default();

    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some(mut record) = serde_json::from_str::<Value>(line)
            .ok()
            .and_then(Record::from_value)
        else {
            report.malformed += 1;
            continue;
        };
        if record.get("type").is_some_and(|t| t != "image") {
            report.not_image += 1;
            continue;
        }
        if record.get("baseModel").map_or(true, |b| b.is_null() || b == "") {
            report.no_base_model += 1;
            continue;
        }

        match annotate_record(&record, lookup, cache).await {
            Annotation::Named {
                clean_name,
                original_name,
                source,
                version_id,
            } => {
                record.insert("clean_model_name", clean_name);
                if let Some(original) = original_name {
                    record.insert("original_model_name", original);
                }
                record.insert("model_source", source.as_str());
                if let Some(id) = version_id {
                    record.insert("model_version_id", id.as_str());
                }
                sink.append(&record).await?;
                report.annotated += 1;
            }
            Annotation::NoCheckpoint => report.no_checkpoint += 1,
            Annotation::NoName => report.no_name += 1,
        }
    }
    sink.flush().await?;

    info_time!(
        start_time,
        "Annotated {} records ({} lookups cached). {report:?}",
        report.annotated,
        cache.len()
    );
    Ok(report)
}
