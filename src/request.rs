use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONNECTION};
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::FetchError;
use crate::parse::{parse_page, Page};
use crate::{Error, Result};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Anything that can hand out pages of a cursor-paginated listing.
///
/// The first request of a walk carries the full query; continuation requests pass the
/// `nextPage` URL verbatim with an empty query, since it already encodes the cursor.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, url: &str, query: &[(String, String)]) -> Result<Page, FetchError>;
}

/// [`PageSource`] backed by a `reqwest::Client`. The client is reference counted, so clones
/// share one connection pool.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    /// Builds the client. When `token` is set every request carries it as a bearer token.
    pub fn new(token: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        // Long-lived keep-alive connections get reset by the service under load.
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| Error::Config("API token contains invalid characters".into()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(HttpSource { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// GETs `url` and returns the body of a successful response.
    pub async fn request_text(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<String, FetchError> {
        debug!("GET {url}");
        let mut req = self.client.get(url);
        if !query.is_empty() {
            req = req.query(query);
        }
        let res = req.send().await?;
        let status = res.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }
        Ok(res.text().await?)
    }

    pub async fn request_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<T, FetchError> {
        let body = self.request_text(url, query).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl PageSource for HttpSource {
    async fn fetch_page(&self, url: &str, query: &[(String, String)]) -> Result<Page, FetchError> {
        let body = self.request_text(url, query).await?;
        parse_page(&body)
    }
}
