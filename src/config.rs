use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use clap::builder::TypedValueParser;
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::process::WalkParams;
use crate::record::{parse_timestamp, ClassificationFilter, RecordId};
use crate::retry::{Backoff, RetryPolicy};
use crate::{
    IMAGES_ENDPOINT, MODELS_ENDPOINT, MODEL_VERSIONS_ENDPOINT, PAGE_DELAY_MILLIS, PAGE_LIMIT,
    RATE_LIMIT_DELAY_MILLIS, REQUEST_TIMEOUT_SECS, RETRY_BASE_DELAY_MILLIS, RETRY_MAX_ATTEMPTS,
    RETRY_MAX_DELAY_MILLIS, SCOPE_WORKERS,
};

#[derive(Debug, Parser)]
#[command(name = "civit-scrap", version, about = "Image metadata scraper")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// API token sent as a bearer token with every request
    #[arg(long, env = "CIVITAI_TOKEN", hide_env_values = true, global = true)]
    pub token: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = REQUEST_TIMEOUT_SECS, global = true)]
    pub timeout: u64,
}

impl Cli {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Walk the image listing once and append accepted records to an NDJSON file
    Fetch {
        #[command(flatten)]
        walk: WalkArgs,

        #[arg(long, short, help = "NDJSON output file")]
        output: PathBuf,

        #[arg(long, help = "Truncate the output file instead of appending to it")]
        truncate: bool,
    },
    /// Run one walk per model, a few at a time, checkpointing finished models
    Scopes {
        #[command(flatten)]
        walk: WalkArgs,

        #[arg(long, short, help = "NDJSON output file, always appended to")]
        output: PathBuf,

        #[arg(long, help = "File listing completed scope ids, one per line")]
        ledger: PathBuf,

        #[arg(long = "model-id", help = "Model id to walk, repeatable")]
        model_ids: Vec<u64>,

        #[arg(long = "model-name", help = "Model name to search for, repeatable")]
        model_names: Vec<String>,

        #[arg(long, default_value = MODELS_ENDPOINT)]
        models_endpoint: String,

        #[arg(long, default_value = "modelId", help = "Query parameter naming the scope")]
        scope_key: String,

        #[arg(long, default_value_t = SCOPE_WORKERS, value_parser = clap::value_parser!(u64).range(1..=8).map(|n| n as usize))]
        workers: usize,
    },
    /// Download the images referenced by an NDJSON file
    Download {
        #[arg(long, short)]
        input: PathBuf,

        #[arg(long, help = "Root directory images are sharded under")]
        root: PathBuf,

        #[arg(long, help = "Append `id,url,reason` for every failed download here")]
        failed_log: Option<PathBuf>,

        #[arg(long, default_value_t = crate::DOWNLOAD_WORKERS, value_parser = clap::value_parser!(u64).range(1..=8).map(|n| n as usize))]
        workers: usize,

        #[command(flatten)]
        retry: RetryArgs,
    },
    /// Add the checkpoint model name to every image record of an NDJSON file
    Annotate {
        #[arg(long, short)]
        input: PathBuf,

        #[arg(long, short)]
        output: PathBuf,

        #[arg(long, default_value = MODEL_VERSIONS_ENDPOINT)]
        versions_endpoint: String,

        #[command(flatten)]
        retry: RetryArgs,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackoffArg {
    Fixed,
    Exponential,
}

impl From<BackoffArg> for Backoff {
    fn from(value: BackoffArg) -> Self {
        match value {
            BackoffArg::Fixed => Backoff::Fixed,
            BackoffArg::Exponential => Backoff::Exponential,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct RetryArgs {
    /// Attempts per request; 0 retries until interrupted
    #[arg(long, default_value_t = RETRY_MAX_ATTEMPTS)]
    pub retry_attempts: usize,

    #[arg(long, value_enum, default_value_t = BackoffArg::Exponential)]
    pub backoff: BackoffArg,

    #[arg(long, default_value_t = RETRY_BASE_DELAY_MILLIS)]
    pub retry_delay_ms: u64,

    #[arg(long, default_value_t = RETRY_MAX_DELAY_MILLIS)]
    pub retry_max_delay_ms: u64,

    /// Wait after a 429 response
    #[arg(long, default_value_t = RATE_LIMIT_DELAY_MILLIS)]
    pub rate_limit_delay_ms: u64,
}

impl RetryArgs {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: (self.retry_attempts > 0).then_some(self.retry_attempts),
            backoff: self.backoff.into(),
            base_delay: Duration::from_millis(self.retry_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            rate_limit_delay: Duration::from_millis(self.rate_limit_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct WalkArgs {
    #[arg(long, default_value = IMAGES_ENDPOINT)]
    pub endpoint: String,

    /// Keep records created strictly after this point (RFC 3339 or YYYY-MM-DD, UTC)
    #[arg(long, value_parser = parse_cutoff, default_value = "2024-08-15")]
    pub cutoff: DateTime<Utc>,

    /// Classification to keep, repeatable
    #[arg(long = "level", default_values_t = ["None".to_string()])]
    pub levels: Vec<String>,

    /// Keep every classification
    #[arg(long, conflicts_with = "levels")]
    pub any_level: bool,

    #[arg(long, default_value_t = PAGE_LIMIT)]
    pub limit: usize,

    /// Listing period filter, e.g. Day, Week, Month, Year, AllTime
    #[arg(long)]
    pub period: Option<String>,

    #[arg(long, default_value_t = PAGE_DELAY_MILLIS)]
    pub page_delay_ms: u64,

    /// Random extra delay between pages, up to this much
    #[arg(long, default_value_t = 0)]
    pub page_jitter_ms: u64,

    #[command(flatten)]
    pub retry: RetryArgs,
}

impl WalkArgs {
    pub fn filter(&self) -> ClassificationFilter {
        if self.any_level {
            ClassificationFilter::any()
        } else {
            ClassificationFilter::new(self.levels.iter().cloned())
        }
    }

    pub fn walk_params(&self) -> WalkParams {
        let mut params = WalkParams::new(&self.endpoint, self.cutoff, self.filter())
            .with_query("limit", self.limit.to_string())
            .with_retry(self.retry.policy())
            .with_page_delay(
                Duration::from_millis(self.page_delay_ms),
                Duration::from_millis(self.page_jitter_ms),
            );
        if let Some(period) = &self.period {
            params = params.with_query("period", period);
        }
        params
    }
}

pub fn scope_ids(model_ids: &[u64]) -> Vec<RecordId> {
    model_ids.iter().copied().map(RecordId::from).collect()
}

/// Accepts a full timestamp or a bare date, which means midnight UTC.
pub fn parse_cutoff(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Some(ts) = parse_timestamp(raw) {
        return Ok(ts);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("'{raw}' is neither an RFC 3339 timestamp nor a YYYY-MM-DD date"))
}
