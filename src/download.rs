use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Local;
use reqwest::{header::REFERER, Client, Response};
use serde_json::Value;
use tokio::{fs::File, io::AsyncWriteExt, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use crate::error::FetchError;
use crate::ledger::append_line;
use crate::record::{Record, RecordId};
use crate::retry::{RetryError, RetryPolicy};
use crate::{info_time, Error, Result, DOWNLOAD_WORKERS, MAX_WORKERS, MIN_IMAGE_BYTES};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "gif"];
const DEFAULT_EXTENSION: &str = "jpeg";
const IMAGE_REFERER: &str = "https://civitai.com/";

/// One image to fetch: the record it came from plus the two fields we need.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub id: RecordId,
    pub url: String,
    pub record: Record,
}

#[derive(Debug, Clone)]
pub struct DownloadParams {
    pub root: PathBuf,
    pub workers: usize,
    pub retry: RetryPolicy,
    /// `id,url,reason` lines are appended here for every failed download.
    pub failed_log: Option<PathBuf>,
}

impl DownloadParams {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DownloadParams {
            root: root.into(),
            workers: DOWNLOAD_WORKERS,
            retry: RetryPolicy::default(),
            failed_log: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailureKind {
    NotFound,
    Forbidden,
    Status(u16),
    Network,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::NotFound => f.write_str("404_not_found"),
            FailureKind::Forbidden => f.write_str("403_forbidden"),
            FailureKind::Status(code) => write!(f, "status_{code}"),
            FailureKind::Network => f.write_str("network"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Saved,
    /// A usable copy was already on disk.
    Skipped,
    Failed(FailureKind),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub saved: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Lines that were not records or lacked `id` or `url`.
    pub unusable: usize,
    pub errors: BTreeMap<String, usize>,
}

impl DownloadReport {
    fn count(&mut self, outcome: &DownloadOutcome) {
        match outcome {
            DownloadOutcome::Saved => self.saved += 1,
            DownloadOutcome::Skipped => self.skipped += 1,
            DownloadOutcome::Failed(kind) => {
                self.failed += 1;
                *self.errors.entry(kind.to_string()).or_default() += 1;
            }
        }
    }
}

/// Directory for an image: `root/<thousands digit>/<last four digits>` of the id, zero-padded
/// to four digits, so no directory grows past a few thousand files.
pub fn storage_dir(root: &Path, id: &RecordId) -> PathBuf {
    let padded = format!("{:0>4}", id.as_str());
    let chars: Vec<char> = padded.chars().collect();
    let last_four: String = chars[chars.len() - 4..].iter().collect();
    let thousands = chars[chars.len() - 4].to_string();
    root.join(thousands).join(last_four)
}

/// File extension taken from the URL path when it is a known image type, `jpeg` otherwise.
pub fn extension_for(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|url| {
            let last = url.path_segments()?.last()?.to_string();
            let (_, ext) = last.rsplit_once('.')?;
            IMAGE_EXTENSIONS
                .contains(&ext.to_ascii_lowercase().as_str())
                .then(|| ext.to_string())
        })
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

/// Ids become path components, so only plain digits are accepted.
fn is_numeric_id(id: &RecordId) -> bool {
    let id = id.as_str();
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())
}

/// Reads download tasks from an NDJSON file. Records need a numeric `id` and a `url`; when a
/// `type` key is present it must be `image`. Unreadable lines are counted, not fatal.
pub async fn read_tasks(input: &Path) -> Result<(Vec<DownloadTask>, usize)> {
    let content = tokio::fs::read_to_string(input).await?;
    let mut tasks = Vec::new();
    let mut unusable = 0;

    for (line_num, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(record) = serde_json::from_str::<Value>(line)
            .ok()
            .and_then(Record::from_value)
        else {
            warn!("Line {} is not a JSON object, skipping.", line_num + 1);
            unusable += 1;
            continue;
        };
        if record.get("type").is_some_and(|t| t != "image") {
            continue;
        }
        let url = record.get("url").and_then(Value::as_str).map(String::from);
        match (record.id(), url) {
            (Some(id), Some(url)) if is_numeric_id(&id) => {
                tasks.push(DownloadTask { id, url, record })
            }
            (Some(id), Some(_)) => {
                warn!("Line {}: id {id:?} is not numeric, skipping.", line_num + 1);
                unusable += 1;
            }
            _ => unusable += 1,
        }
    }
    Ok((tasks, unusable))
}

/// Downloads every task with at most `params.workers` transfers in flight.
/// Filesystem errors are fatal; remote failures are counted and logged to `params.failed_log`.
pub async fn download_all(
    client: &Client,
    tasks: Vec<DownloadTask>,
    params: &DownloadParams,
    cancel: &CancellationToken,
) -> Result<DownloadReport> {
    let start_time = Local::now();
    let workers = params.workers.clamp(1, MAX_WORKERS);
    let total = tasks.len();
    let mut report = DownloadReport::default();
    let mut task_set: JoinSet<Result<(DownloadTask, DownloadOutcome)>> = JoinSet::new();
    let mut pending = tasks.into_iter();

    info_time!("Downloading {total} images with {workers} workers into {}", params.root.display());

    loop {
        while task_set.len() < workers && !cancel.is_cancelled() {
            let Some(task) = pending.next() else { break };
            task_set.spawn({
                let client = client.clone();
                let root = params.root.clone();
                let retry = params.retry.clone();
                let cancel = cancel.clone();
                async move {
                    let outcome = download_one(&client, &task, &root, &retry, &cancel).await?;
                    Ok((task, outcome))
                }
            });
        }

        let Some(joined) = task_set.join_next().await else { break };
        let (task, outcome) = joined??;
        report.count(&outcome);

        if let DownloadOutcome::Failed(kind) = &outcome {
            error!("Download of {} failed ({kind}): {}", task.id, task.url);
            if let Some(log) = &params.failed_log {
                append_line(log, &format!("{},{},{kind}", task.id, task.url)).await?;
            }
        }

        let done = report.saved + report.skipped + report.failed;
        if done % 100 == 0 {
            info_time!(
                "{done}/{total} done, saved {}, skipped {}, failed {}",
                report.saved,
                report.skipped,
                report.failed
            );
        }
    }

    info_time!(
        start_time,
        "Downloads finished: saved {}, skipped {}, failed {}, errors {:?}",
        report.saved,
        report.skipped,
        report.failed,
        report.errors
    );
    Ok(report)
}

/// Writes the sidecar `<id>.json`, then fetches the image unless a usable copy exists.
pub async fn download_one(
    client: &Client,
    task: &DownloadTask,
    root: &Path,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<DownloadOutcome> {
    let dir = storage_dir(root, &task.id);
    tokio::fs::create_dir_all(&dir).await?;

    let json_path = dir.join(format!("{}.json", task.id));
    if !tokio::fs::try_exists(&json_path).await? {
        let pretty = serde_json::to_string_pretty(task.record.as_map())?;
        tokio::fs::write(&json_path, pretty).await?;
    }

    let img_path = dir.join(format!("{}.{}", task.id, extension_for(&task.url)));
    if let Ok(meta) = tokio::fs::metadata(&img_path).await {
        if meta.len() > MIN_IMAGE_BYTES {
            debug!("{} already on disk, skipping.", img_path.display());
            return Ok(DownloadOutcome::Skipped);
        }
    }

    let what = format!("image {}", task.id);
    let response = match retry
        .run(&what, cancel, || request_image(client, &task.url))
        .await
    {
        Ok((response, _)) => response,
        Err(err) => return Ok(DownloadOutcome::Failed(failure_kind(err))),
    };

    match write_body(response, &img_path).await {
        Ok(()) => Ok(DownloadOutcome::Saved),
        Err(Error::Reqwest(e)) => {
            warn!("Transfer of {} broke off: {e}", task.id);
            Ok(DownloadOutcome::Failed(FailureKind::Network))
        }
        Err(e) => Err(e),
    }
}

/// `<path>.part`, where a transfer lives until it is complete.
fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn request_image(client: &Client, url: &str) -> Result<Response, FetchError> {
    let res = client.get(url).header(REFERER, IMAGE_REFERER).send().await?;
    let status = res.status();
    if !status.is_success() {
        return Err(FetchError::Status(status));
    }
    Ok(res)
}

/// Streams the body into `<path>.part` and renames it to `path` once the transfer completed,
/// so an interrupted download never looks like a finished one.
async fn write_body(response: Response, path: &Path) -> Result<()> {
    let part = part_path(path);
    match stream_to(response, &part).await {
        Ok(()) => {
            tokio::fs::rename(&part, path).await?;
            Ok(())
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&part).await;
            Err(e)
        }
    }
}

async fn stream_to(mut response: Response, path: &Path) -> Result<()> {
    let mut file = File::create(path).await?;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

fn failure_kind(err: RetryError<FetchError>) -> FailureKind {
    match err.into_inner() {
        FetchError::Status(status) if status == reqwest::StatusCode::NOT_FOUND => {
            FailureKind::NotFound
        }
        FetchError::Status(status) if status == reqwest::StatusCode::FORBIDDEN => {
            FailureKind::Forbidden
        }
        FetchError::Status(status) => FailureKind::Status(status.as_u16()),
        FetchError::Network(_) | FetchError::Malformed(_) => FailureKind::Network,
    }
}
