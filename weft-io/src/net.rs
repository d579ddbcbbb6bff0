//! HTTP transport
//!
//! The client fetches descriptors and segment bodies through the [`Net`]
//! trait. [`HttpClient`] implements it on top of `reqwest`; tests substitute
//! an in-memory implementation.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Streamed response body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, NetError>> + Send>>;

/// Network errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("HTTP {status} for URL: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Timeout")]
    Timeout,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl NetError {
    /// Gets the HTTP status code if this is an HTTP status error
    pub fn status_code(&self) -> Option<u16> {
        match self {
            NetError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for NetError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            NetError::Timeout
        } else {
            NetError::Http(error.to_string())
        }
    }
}

impl From<url::ParseError> for NetError {
    fn from(error: url::ParseError) -> Self {
        NetError::InvalidUrl(error.to_string())
    }
}

/// HTTP GET transport
#[async_trait]
pub trait Net: Send + Sync {
    /// Start a GET; resolves once response headers arrive with a 2xx status
    async fn stream(&self, url: Url) -> Result<ByteStream, NetError>;

    /// GET a small body in full
    async fn get_bytes(&self, url: Url) -> Result<Bytes, NetError> {
        let mut body = self.stream(url).await?;
        let mut out = BytesMut::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }
}

/// HTTP client settings
#[derive(Debug, Clone)]
pub struct NetOptions {
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Idle connections kept per host
    pub pool_max_idle_per_host: usize,
}

impl Default for NetOptions {
    fn default() -> Self {
        NetOptions {
            connect_timeout: Duration::from_secs(5),
            pool_max_idle_per_host: 8,
        }
    }
}

/// `reqwest`-backed [`Net`]
#[derive(Clone, Debug)]
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    pub fn new(options: NetOptions) -> Result<Self, NetError> {
        let inner = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .pool_max_idle_per_host(options.pool_max_idle_per_host)
            .build()?;
        Ok(HttpClient { inner })
    }
}

#[async_trait]
impl Net for HttpClient {
    async fn stream(&self, url: Url) -> Result<ByteStream, NetError> {
        // No overall timeout: live segment bodies arrive over their whole duration
        let resp = self.inner.get(url.clone()).send().await?;
        let status = resp.status();

        if !status.is_success() {
            return Err(NetError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        tracing::trace!("GET {} -> {}", url, status);
        let stream = resp.bytes_stream().map_err(NetError::from);
        Ok(Box::pin(stream))
    }
}
