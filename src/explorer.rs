use crate::canonical::WalletAddress;
use crate::config::Config;
use anyhow::{Context, Result};
use ethers::abi::Abi;
use ethers::types::U256;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

const NO_TRANSACTIONS: &str = "No transactions found";

#[derive(Debug, Error)]
pub enum ExplorerError {
    #[error("explorer request failed: {message}")]
    Transport { message: String },
    #[error("explorer returned {status}")]
    Status { status: StatusCode },
    #[error("explorer error: {message}")]
    Api { message: String },
    #[error("explorer response malformed: {message}")]
    Decode { message: String },
}

pub trait TokenIndex: Send + Sync {
    fn contract_interface(
        &self,
        wallet: &WalletAddress,
    ) -> impl Future<Output = Result<Abi, ExplorerError>> + Send;

    fn token_ids(
        &self,
        wallet: &WalletAddress,
    ) -> impl Future<Output = Result<Vec<U256>, ExplorerError>> + Send;
}

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    message: String,
    result: Value,
}

#[derive(Debug, Deserialize)]
struct TokenTransfer {
    #[serde(rename = "tokenID")]
    token_id: String,
}

#[derive(Clone)]
pub struct ExplorerClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
    page_size: usize,
    max_pages: usize,
}

impl ExplorerClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .connect_timeout(Duration::from_secs(config.http_connect_timeout_seconds))
            .build()
            .context("build explorer client")?;
        Ok(Self {
            client,
            base_url: config.explorer_api_url.clone(),
            api_key: config.api_key.clone(),
            page_size: config.explorer_page_size.max(1),
            max_pages: config.explorer_max_pages.max(1),
        })
    }

    async fn get(&self, params: &[(&str, String)]) -> Result<ExplorerResponse, ExplorerError> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .extend_pairs(params.iter().map(|(key, value)| (*key, value.as_str())))
            .append_pair("apikey", &self.api_key);
        // errors are stripped of the url, it carries the api key
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| ExplorerError::Transport {
                message: err.without_url().to_string(),
            })?;
        if response.status() != StatusCode::OK {
            return Err(ExplorerError::Status {
                status: response.status(),
            });
        }
        response
            .json::<ExplorerResponse>()
            .await
            .map_err(|err| ExplorerError::Decode {
                message: err.without_url().to_string(),
            })
    }
}

impl TokenIndex for ExplorerClient {
    async fn contract_interface(&self, wallet: &WalletAddress) -> Result<Abi, ExplorerError> {
        let response = self
            .get(&[
                ("module", "contract".to_string()),
                ("action", "getabi".to_string()),
                ("address", wallet.checksummed.clone()),
            ])
            .await?;
        parse_abi_response(response)
    }

    async fn token_ids(&self, wallet: &WalletAddress) -> Result<Vec<U256>, ExplorerError> {
        let listing = self.transfer_pages(wallet).await?;
        if !listing.complete {
            warn!(
                wallet = %wallet,
                pages = self.max_pages,
                transfers = listing.token_ids.len(),
                "transfer history exceeds ETHERSCAN_MAX_PAGES; later token ids are not listed"
            );
        }
        Ok(listing.token_ids)
    }
}

struct TransferListing {
    token_ids: Vec<U256>,
    // false when the page cap was reached before a short page
    complete: bool,
}

impl ExplorerClient {
    async fn transfer_pages(&self, wallet: &WalletAddress) -> Result<TransferListing, ExplorerError> {
        let mut token_ids = Vec::new();
        for page in 1..=self.max_pages {
            let response = self
                .get(&[
                    ("module", "account".to_string()),
                    ("action", "tokennfttx".to_string()),
                    ("contractaddress", wallet.checksummed.clone()),
                    ("page", page.to_string()),
                    ("offset", self.page_size.to_string()),
                    ("sort", "asc".to_string()),
                ])
                .await?;
            let batch = parse_transfer_response(response)?;
            let count = batch.len();
            token_ids.extend(batch);
            debug!(wallet = %wallet, page, transfers = count, "fetched transfer page");
            if count < self.page_size {
                return Ok(TransferListing {
                    token_ids,
                    complete: true,
                });
            }
        }
        Ok(TransferListing {
            token_ids,
            complete: false,
        })
    }
}

fn parse_abi_response(response: ExplorerResponse) -> Result<Abi, ExplorerError> {
    if response.status != "1" {
        return Err(api_error(&response));
    }
    let raw = response.result.as_str().ok_or_else(|| ExplorerError::Decode {
        message: "abi result is not a string".to_string(),
    })?;
    serde_json::from_str::<Abi>(raw).map_err(|err| ExplorerError::Decode {
        message: format!("abi: {err}"),
    })
}

fn parse_transfer_response(response: ExplorerResponse) -> Result<Vec<U256>, ExplorerError> {
    if response.status != "1" {
        if response.message.starts_with(NO_TRANSACTIONS) {
            return Ok(Vec::new());
        }
        return Err(api_error(&response));
    }
    let transfers: Vec<TokenTransfer> =
        serde_json::from_value(response.result).map_err(|err| ExplorerError::Decode {
            message: format!("transfers: {err}"),
        })?;
    transfers
        .into_iter()
        .map(|transfer| {
            U256::from_dec_str(transfer.token_id.trim()).map_err(|_| ExplorerError::Decode {
                message: format!("invalid token id {:?}", transfer.token_id),
            })
        })
        .collect()
}

fn api_error(response: &ExplorerResponse) -> ExplorerError {
    let detail = response.result.as_str().unwrap_or_default();
    let message = if detail.is_empty() || detail == response.message {
        response.message.clone()
    } else {
        format!("{}: {}", response.message, detail)
    };
    ExplorerError::Api { message }
}
