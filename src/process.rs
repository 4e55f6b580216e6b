use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use rand::Rng;
use tokio::{sync::Semaphore, task::JoinSet, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::ledger::Ledger;
use crate::parse::{inspect_item, Item};
use crate::record::{ClassificationFilter, RecordId};
use crate::request::PageSource;
use crate::retry::{RetryError, RetryPolicy};
use crate::shutdown::ExitCode;
use crate::sink::{RecordSink, SinkHandle};
use crate::{
    info_time, Result, MAX_WORKERS, PAGE_DELAY_MILLIS, PAGE_LIMIT, SORT_HIGHEST_RATED, SORT_NEWEST,
};

/// Everything one cursor walk needs to know.
#[derive(Debug, Clone)]
pub struct WalkParams {
    pub endpoint: String,
    /// Sent with the first request only; continuation URLs already carry it.
    pub query: Vec<(String, String)>,
    /// Exclusive lower bound on `createdAt`.
    pub cutoff: DateTime<Utc>,
    pub filter: ClassificationFilter,
    pub retry: RetryPolicy,
    pub page_delay: Duration,
    /// Random extra delay, up to this much, added on top of `page_delay`.
    pub page_jitter: Duration,
    /// Shows up in the logs, e.g. `modelId=1234`.
    pub label: String,
}

impl WalkParams {
    /// Newest-first walk over `endpoint` with full pages and the default politeness settings.
    pub fn new(
        endpoint: impl Into<String>,
        cutoff: DateTime<Utc>,
        filter: ClassificationFilter,
    ) -> Self {
        WalkParams {
            endpoint: endpoint.into(),
            query: vec![
                ("sort".to_string(), SORT_NEWEST.to_string()),
                ("limit".to_string(), PAGE_LIMIT.to_string()),
            ],
            cutoff,
            filter,
            retry: RetryPolicy::default(),
            page_delay: Duration::from_millis(PAGE_DELAY_MILLIS),
            page_jitter: Duration::ZERO,
            label: "listing".to_string(),
        }
    }

    /// Sets (or replaces) a query parameter. `sort` cannot be changed: the cutoff only works
    /// on a newest-first listing.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        if key == "sort" {
            warn!("Ignoring sort override, the walk always requests {SORT_NEWEST}");
            return self;
        }
        let value = value.into();
        match self.query.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.query.push((key, value)),
        }
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_page_delay(mut self, delay: Duration, jitter: Duration) -> Self {
        self.page_delay = delay;
        self.page_jitter = jitter;
        self
    }

    /// Same walk restricted to a single scope, e.g. one `modelId`.
    pub fn for_scope(&self, scope_key: &str, scope: &RecordId) -> Self {
        let mut params = self.clone().with_query(scope_key, scope.as_str());
        params.label = format!("{scope_key}={scope}");
        params
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.page_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.page_delay;
        }
        self.page_delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Why a walk ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Empty page or no `nextPage` cursor.
    EndOfData,
    /// A record at or before the cutoff was observed.
    Cutoff,
    /// Shutdown was requested between pages.
    Cancelled,
    /// A page could not be fetched or parsed. Everything accepted before it is in the sink.
    Failed {
        url: String,
        error: String,
        retries_exhausted: bool,
    },
}

impl StopReason {
    /// The walk saw everything it was supposed to see.
    pub fn is_complete(&self) -> bool {
        matches!(self, StopReason::EndOfData | StopReason::Cutoff)
    }
}

/// Counters reported at the end of a run, so they can be reconciled with the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub accepted: usize,
    /// Observed before the cutoff but not whitelisted.
    pub rejected: usize,
    pub skipped_missing_field: usize,
    pub pages: usize,
    pub retries: usize,
    /// Pages abandoned after every retry failed.
    pub retries_exhausted: usize,
}

impl Counters {
    pub fn absorb(&mut self, other: &Counters) {
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        self.skipped_missing_field += other.skipped_missing_field;
        self.pages += other.pages;
        self.retries += other.retries;
        self.retries_exhausted += other.retries_exhausted;
    }
}

impl fmt::Display for Counters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "accepted: {}, rejected: {}, skipped (missing field): {}, skipped (retries exhausted): {}, pages: {}, retries: {}",
            self.accepted,
            self.rejected,
            self.skipped_missing_field,
            self.retries_exhausted,
            self.pages,
            self.retries
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkReport {
    pub counters: Counters,
    pub stop: StopReason,
}

/// Follows the cursor of a newest-first listing until the data ends, the cutoff is reached,
/// shutdown is requested or a page fails.
///
/// Accepted records go to `sink` in arrival order and the sink is flushed before the next page
/// is requested. Only sink failures are returned as `Err`; remote failures end the walk with
/// [`StopReason::Failed`] so the counters survive.
pub async fn walk<P, S>(
    source: &P,
    params: &WalkParams,
    sink: &mut S,
    cancel: &CancellationToken,
) -> Result<WalkReport>
where
    P: PageSource + ?Sized,
    S: RecordSink + ?Sized,
{
    let start_time = Local::now();
    let label = params.label.as_str();
    let mut counters = Counters::default();
    let mut next_url = Some(params.endpoint.clone());

    info_time!("[{label}] Started walking {}, cutoff {}", params.endpoint, params.cutoff);

    let stop = loop {
        let Some(url) = next_url.take() else {
            break StopReason::EndOfData;
        };
        if cancel.is_cancelled() {
            break StopReason::Cancelled;
        }

        let query: &[(String, String)] = if counters.pages == 0 { &params.query } else { &[] };
        counters.pages += 1;
        let page_num = counters.pages;
        let page_time = Local::now();

        let what = format!("[{label}] page {page_num}");
        let page = match params
            .retry
            .run(&what, cancel, || source.fetch_page(&url, query))
            .await
        {
            Ok((page, retries)) => {
                counters.retries += retries;
                page
            }
            Err(RetryError::Cancelled(_)) => break StopReason::Cancelled,
            Err(err) => {
                let retries_exhausted = err.is_exhausted();
                let err = err.into_inner();
                if retries_exhausted {
                    counters.retries_exhausted += 1;
                }
                error!("{what}: giving up on {url}: {err}");
                break StopReason::Failed {
                    url,
                    error: err.to_string(),
                    retries_exhausted,
                };
            }
        };

        let next_page = page.next_page().map(String::from);
        let items = page.items.unwrap_or_default();
        if items.is_empty() {
            info_time!("[{label}] Page {page_num} is empty.");
            break StopReason::EndOfData;
        }

        let mut reached_cutoff = false;
        let mut page_accepted = 0;
        for item in items {
            match inspect_item(item) {
                Item::Incomplete { id, missing } => {
                    counters.skipped_missing_field += 1;
                    match id {
                        Some(id) => warn!("[{label}] Skipping item {id}: missing {missing}"),
                        None => warn!("[{label}] Skipping item on page {page_num}: missing {missing}"),
                    }
                }
                Item::Observed {
                    record,
                    id,
                    created_at,
                } => {
                    if created_at <= params.cutoff {
                        info_time!("[{label}] Item {id} from {created_at} reached the cutoff.");
                        reached_cutoff = true;
                        break;
                    }
                    if params.filter.accepts(&record) {
                        sink.append(&record).await?;
                        counters.accepted += 1;
                        page_accepted += 1;
                    } else {
                        counters.rejected += 1;
                    }
                }
            }
        }
        sink.flush().await?;
        info_time!(
            page_time,
            "[{label}] Processed page {page_num}: accepted {page_accepted}, total {}",
            counters.accepted
        );

        if reached_cutoff {
            break StopReason::Cutoff;
        }
        let Some(next) = next_page else {
            info_time!("[{label}] Reached the last page.");
            break StopReason::EndOfData;
        };

        let delay = params.next_delay();
        if !delay.is_zero() {
            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => break StopReason::Cancelled,
            }
        }
        next_url = Some(next);
    };

    info_time!(start_time, "[{label}] Walk stopped ({stop:?}). {counters}");
    Ok(WalkReport { counters, stop })
}

/// Outcome of [`process_scopes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopesReport {
    pub counters: Counters,
    pub completed: usize,
    pub failed: Vec<RecordId>,
    pub cancelled: usize,
    /// Already listed in the ledger by an earlier run.
    pub skipped: usize,
}

impl ScopesReport {
    /// Exit code for a scopes run, counting model searches that failed before it started.
    pub fn exit_code(&self, failed_searches: &[String], cancelled: bool) -> ExitCode {
        if cancelled || self.cancelled > 0 {
            ExitCode::Interrupted
        } else if !self.failed.is_empty() || !failed_searches.is_empty() {
            ExitCode::Incomplete
        } else {
            ExitCode::Success
        }
    }
}

/// Runs one independent walk per scope on a bounded worker pool.
///
/// All walks feed the same writer through `sink`. A scope is appended to `ledger` as soon as
/// its walk ends by cutoff or end of data; failed and cancelled scopes are left out so the
/// next run picks them up again.
pub async fn process_scopes<P>(
    source: Arc<P>,
    base: &WalkParams,
    scope_key: &str,
    scopes: Vec<RecordId>,
    workers: usize,
    sink: SinkHandle,
    ledger: &mut Ledger,
    cancel: &CancellationToken,
) -> Result<ScopesReport>
where
    P: PageSource + 'static,
{
    let start_time = Local::now();
    let workers = workers.clamp(1, MAX_WORKERS);
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut report = ScopesReport::default();
    let mut task_set = JoinSet::new();

    info_time!("Processing {} scopes with {workers} workers", scopes.len());

    for scope in scopes {
        if ledger.contains(scope.as_str()) {
            info!("Scope {scope_key}={scope} already completed, skipping.");
            report.skipped += 1;
            continue;
        }

        let params = base.for_scope(scope_key, &scope);
        task_set.spawn({
            // Client uses Arc so we can clone cheaply
            let source = source.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let mut sink = sink.clone();

            async move {
                let _permit = semaphore.acquire_owned().await?;
                let report = walk(source.as_ref(), &params, &mut sink, &cancel).await?;
                Ok::<_, crate::Error>((scope, report))
            }
        });
    }
    // Only the workers keep the writer alive from here on.
    drop(sink);

    while let Some(task) = task_set.join_next().await {
        let (scope, walk_report) = task??;
        report.counters.absorb(&walk_report.counters);

        match walk_report.stop {
            stop if stop.is_complete() => {
                ledger.mark(scope.as_str()).await?;
                report.completed += 1;
                info_time!(
                    "Scope {scope_key}={scope} done: {} records",
                    walk_report.counters.accepted
                );
            }
            StopReason::Cancelled => report.cancelled += 1,
            StopReason::Failed { url, error, .. } => {
                error!("Scope {scope_key}={scope} failed at {url}: {error}");
                report.failed.push(scope);
            }
            _ => {}
        }
    }

    info_time!(
        start_time,
        "Finished {} scopes ({} failed, {} cancelled, {} skipped). {}",
        report.completed,
        report.failed.len(),
        report.cancelled,
        report.skipped,
        report.counters
    );
    Ok(report)
}

/// Scope ids found by [`discover_scopes`], plus the names whose search failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    pub scopes: Vec<RecordId>,
    pub failed_names: Vec<String>,
}

/// Turns model names into scope ids by searching `endpoint` (one page per name, best rated
/// first) and merges them with `explicit` ids. Duplicates are dropped, first occurrence wins.
/// A name whose search fails is logged and returned in [`Discovery::failed_names`].
pub async fn discover_scopes<P>(
    source: &P,
    endpoint: &str,
    names: &[String],
    explicit: Vec<RecordId>,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Discovery
where
    P: PageSource + ?Sized,
{
    let mut discovery = Discovery {
        scopes: explicit,
        failed_names: Vec::new(),
    };

    for name in names {
        if cancel.is_cancelled() {
            break;
        }
        let query = vec![
            ("query".to_string(), name.clone()),
            ("sort".to_string(), SORT_HIGHEST_RATED.to_string()),
            ("limit".to_string(), PAGE_LIMIT.to_string()),
        ];
        let what = format!("search '{name}'");
        match retry
            .run(&what, cancel, || source.fetch_page(endpoint, &query))
            .await
        {
            Ok((page, _)) => {
                let found: Vec<RecordId> = page
                    .items
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|item| item.get("id").and_then(RecordId::from_value))
                    .collect();
                info_time!("Search '{name}' matched {} models", found.len());
                discovery.scopes.extend(found);
            }
            Err(RetryError::Cancelled(_)) => break,
            Err(err) => {
                error!("{what} failed: {}", err.into_inner());
                discovery.failed_names.push(name.clone());
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    discovery.scopes.retain(|id| seen.insert(id.clone()));
    discovery
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::parse::{Page, PageMetadata};
    use crate::record::Record;
    use crate::sink::{spawn_writer, NdjsonSink};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use reqwest::StatusCode;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted responses per URL, consumed front to back. Every request is logged.
    #[derive(Default)]
    struct ScriptedSource {
        responses: Mutex<HashMap<String, Vec<Result<Page, FetchError>>>>,
        requests: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl ScriptedSource {
        fn respond(self, url: &str, response: Result<Page, FetchError>) -> Self {
            self.responses
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push(response);
            self
        }

        fn requested_urls(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|(url, _)| url.clone())
                .collect()
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        async fn fetch_page(
            &self,
            url: &str,
            query: &[(String, String)],
        ) -> Result<Page, FetchError> {
            self.requests
                .lock()
                .unwrap()
                .push((url.to_string(), query.to_vec()));
            let mut responses = self.responses.lock().unwrap();
            match responses.get_mut(url) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => Err(FetchError::Status(StatusCode::NOT_FOUND)),
            }
        }
    }

    fn item(id: u64, day: u32, level: &str) -> Value {
        json!({
            "id": id,
            "createdAt": format!("2024-09-{day:02}T12:00:00.000Z"),
            "nsfwLevel": level,
            "meta": {"prompt": "a cat"}
        })
    }

    fn page(items: Vec<Value>, next: Option<&str>) -> Page {
        Page {
            items: Some(items),
            metadata: Some(PageMetadata {
                next_page: next.map(String::from),
            }),
        }
    }

    fn cutoff(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, day, 12, 0, 0).unwrap()
    }

    fn params(cutoff: DateTime<Utc>, levels: &[&str]) -> WalkParams {
        let filter = ClassificationFilter::new(levels.iter().copied());
        WalkParams::new("https://api/images", cutoff, filter)
            .with_retry(RetryPolicy::immediate(5))
            .with_page_delay(Duration::ZERO, Duration::ZERO)
    }

    fn ids(records: &[Record]) -> Vec<String> {
        records.iter().map(|r| r.id().unwrap().to_string()).collect()
    }

    /// Three pages of two items each, newest first: ids 6..1 on days 30..25.
    fn three_pages() -> ScriptedSource {
        ScriptedSource::default()
            .respond(
                "https://api/images",
                Ok(page(vec![item(6, 30, "None"), item(5, 29, "None")], Some("https://api/p2"))),
            )
            .respond(
                "https://api/p2",
                Ok(page(vec![item(4, 28, "None"), item(3, 27, "None")], Some("https://api/p3"))),
            )
            .respond(
                "https://api/p3",
                Ok(page(vec![item(2, 26, "None"), item(1, 25, "None")], Some("https://api/p4"))),
            )
    }

    #[tokio::test]
    async fn cutoff_on_last_item_of_third_page() {
        let source = three_pages();
        let mut sink = Vec::new();

        let report = walk(&source, &params(cutoff(25), &["None"]), &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ids(&sink), vec!["6", "5", "4", "3", "2"]);
        assert_eq!(report.stop, StopReason::Cutoff);
        assert_eq!(report.counters.pages, 3);
        assert_eq!(
            source.requested_urls(),
            vec!["https://api/images", "https://api/p2", "https://api/p3"]
        );
    }

    #[tokio::test]
    async fn cutoff_mid_page_stops_before_next_page() {
        let source = three_pages();
        let mut sink = Vec::new();

        let report = walk(&source, &params(cutoff(28), &["None"]), &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        // Item 4 sits exactly on the cutoff, which is exclusive.
        assert_eq!(ids(&sink), vec!["6", "5"]);
        assert_eq!(report.stop, StopReason::Cutoff);
        assert_eq!(source.requested_urls().len(), 2);
        assert!(sink.iter().all(|r| r.created_at().unwrap() > cutoff(28)));
    }

    #[tokio::test]
    async fn first_request_carries_query_then_cursor_only() {
        let source = three_pages();
        let mut sink = Vec::new();
        let params = params(cutoff(1), &["None"]).with_query("modelId", "77");

        walk(&source, &params, &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        let requests = source.requests.lock().unwrap();
        let first = &requests[0].1;
        assert!(first.contains(&("sort".to_string(), "Newest".to_string())));
        assert!(first.contains(&("limit".to_string(), "100".to_string())));
        assert!(first.contains(&("modelId".to_string(), "77".to_string())));
        assert!(requests[1..].iter().all(|(_, q)| q.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let source = ScriptedSource::default()
            .respond(
                "https://api/images",
                Ok(page(vec![item(6, 30, "None"), item(5, 29, "None")], Some("https://api/p2"))),
            )
            .respond("https://api/p2", Err(FetchError::Status(StatusCode::SERVICE_UNAVAILABLE)))
            .respond("https://api/p2", Err(FetchError::Status(StatusCode::SERVICE_UNAVAILABLE)))
            .respond(
                "https://api/p2",
                Ok(page(vec![item(4, 28, "None"), item(3, 27, "None")], Some("https://api/p3"))),
            )
            .respond(
                "https://api/p3",
                Ok(page(vec![item(2, 26, "None"), item(1, 25, "None")], None)),
            );
        let params = params(cutoff(1), &["None"]).with_retry(RetryPolicy::bounded(
            5,
            crate::retry::Backoff::Fixed,
            Duration::from_secs(2),
        ));
        let mut sink = Vec::new();

        let start = tokio::time::Instant::now();
        let report = walk(&source, &params, &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ids(&sink), vec!["6", "5", "4", "3", "2", "1"]);
        assert_eq!(report.stop, StopReason::EndOfData);
        assert_eq!(report.counters.retries, 2);
        assert_eq!(report.counters.pages, 3);
        // Two fixed retry delays, no page delay configured.
        assert_eq!(start.elapsed(), Duration::from_secs(4));
        assert_eq!(
            source
                .requested_urls()
                .iter()
                .filter(|u| *u == "https://api/p2")
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn retries_exhausted_keeps_flushed_records() {
        let source = ScriptedSource::default()
            .respond(
                "https://api/images",
                Ok(page(vec![item(6, 30, "None")], Some("https://api/p2"))),
            )
            .respond("https://api/p2", Err(FetchError::Status(StatusCode::BAD_GATEWAY)))
            .respond("https://api/p2", Err(FetchError::Status(StatusCode::BAD_GATEWAY)));
        let params = params(cutoff(1), &["None"]).with_retry(RetryPolicy::immediate(2));
        let mut sink = Vec::new();

        let report = walk(&source, &params, &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ids(&sink), vec!["6"]);
        assert_eq!(report.counters.retries_exhausted, 1);
        assert!(matches!(
            report.stop,
            StopReason::Failed { ref url, retries_exhausted: true, .. } if url == "https://api/p2"
        ));
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let source = ScriptedSource::default();
        let mut sink = Vec::new();

        let report = walk(&source, &params(cutoff(1), &["None"]), &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(source.requested_urls().len(), 1);
        assert!(matches!(
            report.stop,
            StopReason::Failed { retries_exhausted: false, .. }
        ));
    }

    #[tokio::test]
    async fn missing_timestamp_skips_only_that_item() {
        let source = ScriptedSource::default().respond(
            "https://api/images",
            Ok(page(
                vec![
                    item(3, 30, "None"),
                    json!({"id": 2, "nsfwLevel": "None"}),
                    json!({"createdAt": "2024-09-29T00:00:00Z", "nsfwLevel": "None"}),
                    item(1, 28, "None"),
                ],
                None,
            )),
        );
        let mut sink = Vec::new();

        let report = walk(&source, &params(cutoff(1), &["None"]), &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ids(&sink), vec!["3", "1"]);
        assert_eq!(report.counters.skipped_missing_field, 2);
        assert_eq!(report.stop, StopReason::EndOfData);
    }

    #[tokio::test]
    async fn only_whitelisted_levels_are_kept() {
        let source = ScriptedSource::default().respond(
            "https://api/images",
            Ok(page(
                vec![
                    item(4, 30, "None"),
                    item(3, 30, "Soft"),
                    item(2, 29, "None"),
                    item(1, 29, "Soft"),
                ],
                None,
            )),
        );
        let mut sink = Vec::new();

        let report = walk(&source, &params(cutoff(1), &["None"]), &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ids(&sink), vec!["4", "2"]);
        assert!(sink.iter().all(|r| r.classification().as_deref() == Some("None")));
        assert_eq!(report.counters.rejected, 2);
    }

    #[tokio::test]
    async fn empty_page_ends_the_walk() {
        let source = ScriptedSource::default().respond(
            "https://api/images",
            Ok(Page {
                items: None,
                metadata: None,
            }),
        );
        let mut sink = Vec::new();

        let report = walk(&source, &params(cutoff(1), &["None"]), &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert!(sink.is_empty());
        assert_eq!(report.stop, StopReason::EndOfData);
    }

    #[tokio::test]
    async fn cancelled_walk_requests_nothing() {
        let source = three_pages();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut sink = Vec::new();

        let report = walk(&source, &params(cutoff(1), &["None"]), &mut sink, &cancel)
            .await
            .unwrap();

        assert_eq!(report.stop, StopReason::Cancelled);
        assert!(source.requested_urls().is_empty());
    }

    #[tokio::test]
    async fn scopes_share_one_writer_and_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.jsonl");
        let ledger_path = dir.path().join("completed_ids.txt");
        tokio::fs::write(&ledger_path, "3\n").await.unwrap();

        let source = Arc::new(
            ScriptedSource::default()
                .respond(
                    "https://api/images",
                    Ok(page(vec![item(11, 30, "None"), item(10, 20, "None")], Some("https://api/m1p2"))),
                )
                .respond(
                    "https://api/images",
                    Ok(page(vec![item(21, 30, "None"), item(20, 29, "Soft")], None)),
                ),
        );
        let base = params(cutoff(25), &["None"]);
        let mut ledger = Ledger::load(&ledger_path).await.unwrap();
        let (handle, writer) = spawn_writer(NdjsonSink::create(&out).await.unwrap(), 16);

        let report = process_scopes(
            source.clone(),
            &base,
            "modelId",
            vec![RecordId::from(1), RecordId::from(2), RecordId::from(3)],
            1,
            handle,
            &mut ledger,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(writer.await.unwrap().unwrap(), 2);
        assert_eq!(report.completed, 2);
        assert_eq!(report.skipped, 1);
        assert!(report.failed.is_empty());
        assert_eq!(report.counters.accepted, 2);

        let reloaded = Ledger::load(&ledger_path).await.unwrap();
        assert!(reloaded.contains("1") && reloaded.contains("2") && reloaded.contains("3"));

        let scope_queries: Vec<String> = source
            .requests
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, q)| q.iter().filter(|(k, _)| k == "modelId").map(|(_, v)| v.clone()))
            .collect();
        assert_eq!(scope_queries.len(), 2);
        assert!(!scope_queries.contains(&"3".to_string()));
    }

    #[tokio::test]
    async fn failed_scope_is_not_checkpointed() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("completed_ids.txt");
        let source = Arc::new(ScriptedSource::default());
        let mut ledger = Ledger::load(&ledger_path).await.unwrap();
        let (handle, writer) = spawn_writer(Vec::<Record>::new(), 4);

        let report = process_scopes(
            source,
            &params(cutoff(1), &["None"]),
            "modelId",
            vec![RecordId::from(9)],
            3,
            handle,
            &mut ledger,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        writer.await.unwrap().unwrap();
        assert_eq!(report.failed, vec![RecordId::from(9)]);
        assert!(Ledger::load(&ledger_path).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn discovery_merges_and_dedups() {
        let source = ScriptedSource::default()
            .respond(
                "https://api/models",
                Ok(page(vec![json!({"id": 5}), json!({"id": 7}), json!({"name": "no id"})], None)),
            )
            .respond("https://api/models", Ok(page(vec![json!({"id": 7}), json!({"id": 8})], None)));

        let discovery = discover_scopes(
            &source,
            "https://api/models",
            &["Illustrious".to_string(), "Pony".to_string(), "Missing".to_string()],
            vec![RecordId::from(5)],
            &RetryPolicy::immediate(1),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(
            discovery.scopes,
            vec![RecordId::from(5), RecordId::from(7), RecordId::from(8)]
        );
        assert_eq!(discovery.failed_names, vec!["Missing".to_string()]);

        let requests = source.requests.lock().unwrap();
        assert!(requests[0]
            .1
            .contains(&("sort".to_string(), "Highest Rated".to_string())));
    }

    #[tokio::test]
    async fn failed_searches_are_reported() {
        let source = ScriptedSource::default()
            .respond("https://api/models", Err(FetchError::Status(StatusCode::SERVICE_UNAVAILABLE)))
            .respond("https://api/models", Err(FetchError::Status(StatusCode::SERVICE_UNAVAILABLE)));

        let discovery = discover_scopes(
            &source,
            "https://api/models",
            &["Flux".to_string()],
            Vec::new(),
            &RetryPolicy::immediate(2),
            &CancellationToken::new(),
        )
        .await;

        assert!(discovery.scopes.is_empty());
        assert_eq!(discovery.failed_names, vec!["Flux".to_string()]);
        assert_eq!(source.requested_urls().len(), 2);
        assert_eq!(
            ScopesReport::default().exit_code(&discovery.failed_names, false),
            ExitCode::Incomplete
        );
    }

    #[test]
    fn scopes_exit_code() {
        let clean = ScopesReport {
            completed: 2,
            ..ScopesReport::default()
        };
        let searches_failed = vec!["Pony".to_string()];

        assert_eq!(clean.exit_code(&[], false), ExitCode::Success);
        assert_eq!(clean.exit_code(&searches_failed, false), ExitCode::Incomplete);
        assert_eq!(clean.exit_code(&searches_failed, true), ExitCode::Interrupted);

        let scope_failed = ScopesReport {
            failed: vec![RecordId::from(9)],
            ..clean.clone()
        };
        assert_eq!(scope_failed.exit_code(&[], false), ExitCode::Incomplete);
        assert_eq!(ScopesReport::default().exit_code(&[], false), ExitCode::Success);
    }

    /// Records what was made durable by the last flush.
    #[derive(Default)]
    struct FlushTracking {
        records: Vec<Record>,
        durable: usize,
    }

    #[async_trait]
    impl RecordSink for FlushTracking {
        async fn append(&mut self, record: &Record) -> Result<()> {
            self.records.push(record.clone());
            Ok(())
        }

        async fn flush(&mut self) -> Result<()> {
            self.durable = self.records.len();
            Ok(())
        }
    }

    struct FullDisk;

    #[async_trait]
    impl RecordSink for FullDisk {
        async fn append(&mut self, _record: &Record) -> Result<()> {
            Err(crate::Error::SinkWrite(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }

        async fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn malformed_page_keeps_flushed_records() {
        let garbage = serde_json::from_str::<Value>("{\"items\": [").unwrap_err();
        let source = ScriptedSource::default()
            .respond(
                "https://api/images",
                Ok(page(vec![item(6, 30, "None"), item(5, 29, "None")], Some("https://api/p2"))),
            )
            .respond("https://api/p2", Err(FetchError::Malformed(garbage)));
        let mut sink = FlushTracking::default();

        let report = walk(&source, &params(cutoff(1), &["None"]), &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ids(&sink.records), vec!["6", "5"]);
        assert_eq!(sink.durable, 2);
        assert_eq!(source.requested_urls().len(), 2);
        assert!(matches!(
            report.stop,
            StopReason::Failed { ref url, retries_exhausted: false, .. } if url == "https://api/p2"
        ));
    }

    #[tokio::test]
    async fn sink_failure_aborts_the_walk() {
        let source = three_pages();

        let params = params(cutoff(1), &["None"]);

        let res = walk(&source, &params, &mut FullDisk, &CancellationToken::new()).await;

        assert!(matches!(res, Err(crate::Error::SinkWrite(_))));
        assert_eq!(source.requested_urls(), vec!["https://api/images".to_string()]);
    }
}
