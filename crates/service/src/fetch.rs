//! Network fetch collaborator.
//!
//! Update jobs only see the [`Fetcher`] contract. [`HttpFetcher`] implements it
//! over `reqwest` with redirects disabled: a 3xx reaches the job as a plain
//! response and fails the fetch as a redirect.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use stowage_core::ResponseInfo;
use stowage_core::config::FetchConfig;
use thiserror::Error;
use url::Url;

/// One GET request, optionally conditional.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: Url,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
}

impl FetchRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            if_none_match: None,
            if_modified_since: None,
        }
    }

    /// Revalidate against a previously stored response.
    pub fn with_validators(mut self, info: &ResponseInfo) -> Self {
        self.if_none_match = info.etag().map(str::to_string);
        self.if_modified_since = info.last_modified().map(str::to_string);
        self
    }

    pub fn is_conditional(&self) -> bool {
        self.if_none_match.is_some() || self.if_modified_since.is_some()
    }
}

/// A complete response.
#[derive(Clone, Debug)]
pub struct FetchResponse {
    pub info: ResponseInfo,
    pub body: Bytes,
}

impl FetchResponse {
    pub fn status(&self) -> u16 {
        self.info.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.info.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.info.status) && self.info.status != 304
    }
}

/// Transport-level failure; no response was received.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// HTTP fetcher over `reqwest`.
#[derive(Clone)]
pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout())
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self { http })
    }

    fn collect_headers(headers: &HeaderMap) -> Vec<(String, String)> {
        headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect()
    }

    fn map_error(e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let mut builder = self.http.get(request.url.clone());
        if let Some(etag) = &request.if_none_match {
            builder = builder.header(IF_NONE_MATCH, etag);
        }
        if let Some(since) = &request.if_modified_since {
            builder = builder.header(IF_MODIFIED_SINCE, since);
        }

        let response = builder.send().await.map_err(Self::map_error)?;
        let status = response.status().as_u16();
        let headers = Self::collect_headers(response.headers());
        let body = response.bytes().await.map_err(Self::map_error)?;

        tracing::debug!(url = %request.url, status, size = body.len(), "Fetched");
        Ok(FetchResponse {
            info: ResponseInfo::new(status, headers),
            body,
        })
    }
}
