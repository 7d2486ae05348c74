//! Payload fetching.
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use reqwest::{Client, Response};
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

/// A fetch error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum FetchError {
    /// The HTTP client could not be built.
    #[snafu(display("Failed to build HTTP client: {}", source))]
    BuildClient {
        /// Error source.
        source: reqwest::Error,
    },

    /// The request could not be sent, or no response was received.
    #[snafu(display("Request to '{}' failed: {}", url, source))]
    Request {
        /// Endpoint URL.
        url: String,

        /// Error source.
        source: reqwest::Error,
    },

    /// The request did not complete before the configured timeout.
    #[snafu(display("Request to '{}' timed out.", url))]
    Timeout {
        /// Endpoint URL.
        url: String,
    },

    /// The endpoint responded with a non-success status code.
    #[snafu(display("Endpoint '{}' responded with unexpected status code {}.", url, status))]
    Status {
        /// Endpoint URL.
        url: String,

        /// Response status code.
        status: StatusCode,
    },

    /// The response body could not be read.
    #[snafu(display("Failed to read response body from '{}': {}", url, source))]
    Body {
        /// Endpoint URL.
        url: String,

        /// Error source.
        source: reqwest::Error,
    },
}

/// Retrieves raw payloads from endpoints.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches the payload served at the given URL.
    ///
    /// # Errors
    ///
    /// If the payload cannot be retrieved, an error is returned.
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

/// A [`Fetcher`] that issues HTTP GET requests.
///
/// Any non-2xx response is treated as a failure, and the body is not read.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    inner: Client,
}

impl HttpFetcher {
    /// Creates a new `HttpFetcher` whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// If the underlying HTTP client cannot be built, an error is returned.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let inner = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("jsonscrape/", env!("CARGO_PKG_VERSION")))
            .build()
            .context(BuildClient)?;

        Ok(Self { inner })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let response = match self.inner.get(url).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return Err(FetchError::Timeout { url: url.to_string() }),
            Err(e) => return Err(e).context(Request { url }),
        };

        let response = process_response(url, response)?;
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => return Err(FetchError::Timeout { url: url.to_string() }),
            Err(e) => return Err(e).context(Body { url }),
        };

        debug!(endpoint = url, bytes = body.len(), "Fetched payload.");
        Ok(body)
    }
}

fn process_response(url: &str, response: Response) -> Result<Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(FetchError::Status {
            url: url.to_string(),
            status,
        })
    }
}
