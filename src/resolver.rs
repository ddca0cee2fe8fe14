use crate::config::Config;
use crate::fetch::{ContentFetcher, FetchError};
use crate::links::LinkNormalizer;
use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub image_extensions: Vec<String>,
    pub fallback_extension: String,
    pub max_depth: usize,
}

impl ResolverConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            image_extensions: config.image_extensions.clone(),
            fallback_extension: config.fallback_image_extension.clone(),
            max_depth: config.max_resolve_depth,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub url: String,
    pub bytes: Bytes,
    pub extension: String,
    pub extension_in_url: bool,
    pub hops: usize,
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("metadata indirection exceeded {max_depth} hops at {url}")]
    DepthExceeded { max_depth: usize, url: String },
}

#[derive(Debug, Deserialize)]
struct MetadataJson {
    image: Option<String>,
}

pub struct ImageResolver<F> {
    fetcher: F,
    links: LinkNormalizer,
    config: ResolverConfig,
}

impl<F: ContentFetcher> ImageResolver<F> {
    pub fn new(fetcher: F, links: LinkNormalizer, config: ResolverConfig) -> Self {
        Self {
            fetcher,
            links,
            config,
        }
    }

    pub async fn resolve(&self, uri: &str) -> Result<ResolvedImage, ResolutionError> {
        let mut current = self.links.normalize(uri);
        let mut remaining = self.config.max_depth;
        let mut hops = 0;
        loop {
            let fetched = self.fetcher.fetch(&current).await?;
            if let Some(extension) = self.image_extension(&current) {
                debug!(url = %current, served_from = %fetched.url, hops, "resolved image link");
                return Ok(ResolvedImage {
                    url: current,
                    bytes: fetched.bytes,
                    extension,
                    extension_in_url: true,
                    hops,
                });
            }
            let next = fetched
                .json::<MetadataJson>()
                .and_then(|metadata| metadata.image)
                .map(|image| image.trim().to_string())
                .filter(|image| !image.is_empty());
            let Some(next) = next else {
                debug!(
                    url = %current,
                    hops,
                    content_type = ?fetched.content_type,
                    "no image field, keeping body as image"
                );
                return Ok(ResolvedImage {
                    url: current,
                    bytes: fetched.bytes,
                    extension: self.config.fallback_extension.clone(),
                    extension_in_url: false,
                    hops,
                });
            };
            if remaining == 0 {
                return Err(ResolutionError::DepthExceeded {
                    max_depth: self.config.max_depth,
                    url: current,
                });
            }
            remaining -= 1;
            hops += 1;
            let next = self.links.normalize(&next);
            debug!(from = %current, to = %next, "following metadata image field");
            current = next;
        }
    }

    fn image_extension(&self, link: &str) -> Option<String> {
        let path = Url::parse(link)
            .map(|url| url.path().to_string())
            .unwrap_or_else(|_| link.to_string());
        self.config
            .image_extensions
            .iter()
            .find(|extension| path.ends_with(extension.as_str()))
            .cloned()
    }
}
