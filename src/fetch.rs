//! Network fetch abstraction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CACHE_CONTROL, PRAGMA};

use crate::error::{Error, Result};
use crate::http::{CacheMode, Method, Request, Response};

/// Fetches requests from the network.
///
/// Any completed HTTP exchange is `Ok`, whatever its status; callers decide
/// what a non-ok response means. `Err` is reserved for transport failures.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

#[async_trait]
impl<T: Fetcher + ?Sized> Fetcher for Arc<T> {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        (**self).fetch(request).await
    }
}

/// [`Fetcher`] backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Wraps an existing client.
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Builds a client tuned for fetching static bundles.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn with_defaults() -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;
        Ok(Self::new(client))
    }
}

const fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Head => reqwest::Method::HEAD,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
        Method::Options => reqwest::Method::OPTIONS,
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if request.cache == CacheMode::Reload {
            builder = builder
                .header(CACHE_CONTROL, "no-cache")
                .header(PRAGMA, "no-cache");
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let reply = builder.send().await?;
        let status = reply.status().as_u16();
        let headers = reply
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = reply.bytes().await?;

        log::debug!("{} {} -> {status}", request.method, request.url);
        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

/// Fetches `request`, failing with [`Error::Timeout`] if it does not settle
/// within `bound`.
pub(crate) async fn fetch_bounded<F: Fetcher + ?Sized>(
    fetcher: &F,
    request: &Request,
    bound: Option<Duration>,
) -> Result<Response> {
    match bound {
        Some(after) => tokio::time::timeout(after, fetcher.fetch(request))
            .await
            .map_err(|_| Error::Timeout {
                url: request.url.clone(),
                after,
            })?,
        None => fetcher.fetch(request).await,
    }
}
