//! Cursor-paginated image metadata scraper.
//!
//! The heart of the crate is [`process::walk`]: it follows the `nextPage` cursor of a
//! newest-first listing endpoint, keeps the records whose classification is whitelisted and
//! stops as soon as it sees a record at or before the cutoff. Accepted records are appended to
//! a [`sink::RecordSink`] before the next page is requested.
//!
//! [`process::process_scopes`] runs many independent walks (one per scope) on a bounded worker
//! pool and checkpoints finished scopes to a [`ledger::Ledger`].

mod macros;

pub mod config;
pub mod download;
mod error;
pub mod extract;
pub mod ledger;
pub mod parse;
pub mod process;
pub mod record;
pub mod request;
pub mod retry;
pub mod shutdown;
pub mod sink;

pub use error::{Error, FetchError, Result};

/// Image listing resource.
pub const IMAGES_ENDPOINT: &str = "https://civitai.com/api/v1/images";
/// Model search resource, used to turn model names into scope ids.
pub const MODELS_ENDPOINT: &str = "https://civitai.com/api/v1/models";
/// Model version lookup resource, used by the annotation pass.
pub const MODEL_VERSIONS_ENDPOINT: &str = "https://civitai.com/api/v1/model-versions";

/// Largest page the listing endpoint hands out.
const PAGE_LIMIT: usize = 100;
/// Sort order the cutoff logic relies on.
const SORT_NEWEST: &str = "Newest";
/// Sort order for model name searches, so the best matches come first.
const SORT_HIGHEST_RATED: &str = "Highest Rated";
const REQUEST_TIMEOUT_SECS: u64 = 30;
const PAGE_DELAY_MILLIS: u64 = 500;

const RETRY_MAX_ATTEMPTS: usize = 5;
const RETRY_BASE_DELAY_MILLIS: u64 = 5_000;
const RETRY_MAX_DELAY_MILLIS: u64 = 120_000;
const RATE_LIMIT_DELAY_MILLIS: u64 = 30_000;

/// Concurrent walks when fanning out over scopes.
const SCOPE_WORKERS: usize = 3;
/// Upper bound for any worker pool, to stay below the service's rate limit.
const MAX_WORKERS: usize = 8;
const DOWNLOAD_WORKERS: usize = 8;
/// Anything smaller than this on disk is treated as a broken download.
const MIN_IMAGE_BYTES: u64 = 100;
