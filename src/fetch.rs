use crate::config::Config;
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use mime::Mime;
use reqwest::{StatusCode, header};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

const USER_AGENT: &str = concat!("nft-image-harvester/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct FetchedContent {
    pub url: String,
    pub bytes: Bytes,
    pub content_type: Option<Mime>,
}

impl FetchedContent {
    pub fn json<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_slice(&self.bytes).ok()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid uri {url}")]
    InvalidUri { url: String },
    #[error("fetch failed from {url}: {status}")]
    Status { status: StatusCode, url: String },
    #[error("fetch failed from {url}: {message}")]
    Transport { url: String, message: String },
    #[error("response from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },
}

pub trait ContentFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<FetchedContent, FetchError>> + Send;
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpFetcher {
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_limits(
            Duration::from_secs(config.http_timeout_seconds),
            Duration::from_secs(config.http_connect_timeout_seconds),
            config.max_download_bytes,
        )
    }

    pub fn with_limits(timeout: Duration, connect_timeout: Duration, max_bytes: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(USER_AGENT)
            .build()
            .context("build reqwest client")?;
        Ok(Self { client, max_bytes })
    }
}

impl ContentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedContent, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUri {
            url: url.to_string(),
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(FetchError::InvalidUri {
                url: url.to_string(),
            });
        }
        let transport = |err: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            message: err.without_url().to_string(),
        };
        let mut response = self.client.get(parsed).send().await.map_err(transport)?;
        if response.status() != StatusCode::OK {
            return Err(FetchError::Status {
                status: response.status(),
                url: url.to_string(),
            });
        }
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<Mime>().ok());
        if let Some(length) = response.content_length() {
            if length > self.max_bytes as u64 {
                return Err(FetchError::TooLarge {
                    url: url.to_string(),
                    limit: self.max_bytes,
                });
            }
        }
        let mut buffer = BytesMut::with_capacity(std::cmp::min(self.max_bytes, 64 * 1024));
        let mut total = 0usize;
        while let Some(chunk) = response.chunk().await.map_err(transport)? {
            total = total.saturating_add(chunk.len());
            if total > self.max_bytes {
                return Err(FetchError::TooLarge {
                    url: url.to_string(),
                    limit: self.max_bytes,
                });
            }
            buffer.extend_from_slice(&chunk);
        }
        debug!(url = %url, size = total, "fetched content");
        Ok(FetchedContent {
            url: final_url,
            bytes: buffer.freeze(),
            content_type,
        })
    }
}
