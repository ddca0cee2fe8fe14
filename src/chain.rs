use crate::config::Config;
use anyhow::{Context, Result, anyhow};
use ethers::abi::Abi;
use ethers::prelude::*;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use url::Url;

const TOKEN_URI: &str = "tokenURI";
const IMAGE_URI: &str = "imageURI";

#[derive(Debug, Clone)]
pub struct ContractInterface {
    pub address: Address,
    pub abi: Abi,
    uri_function: Option<&'static str>,
}

impl ContractInterface {
    pub fn new(address: Address, abi: Abi) -> Self {
        let uri_function = [TOKEN_URI, IMAGE_URI]
            .into_iter()
            .find(|name| abi.function(name).is_ok());
        Self {
            address,
            abi,
            uri_function,
        }
    }

    pub fn uri_function(&self) -> Option<&'static str> {
        self.uri_function
    }
}

pub trait TokenUriSource: Send + Sync {
    fn token_uri(
        &self,
        contract: &ContractInterface,
        token_id: U256,
    ) -> impl Future<Output = Result<String>> + Send;
}

#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub endpoints: Vec<String>,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub failure_threshold: u32,
    pub failure_cooldown: Duration,
}

impl ChainSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            endpoints: config.rpc_endpoints.clone(),
            timeout: Duration::from_secs(config.rpc_timeout_seconds),
            connect_timeout: Duration::from_secs(config.rpc_connect_timeout_seconds),
            failure_threshold: config.rpc_failure_threshold,
            failure_cooldown: Duration::from_secs(config.rpc_failure_cooldown_seconds),
        }
    }
}

#[derive(Clone)]
pub struct ChainClient {
    settings: Arc<ChainSettings>,
    providers: Arc<Mutex<HashMap<String, Arc<Provider<Http>>>>>,
    endpoint_health: Arc<Mutex<HashMap<String, EndpointHealth>>>,
}

#[derive(Debug, Clone)]
struct EndpointHealth {
    failures: u32,
    cooldown_until: Option<Instant>,
}

impl ChainClient {
    pub fn new(settings: ChainSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            providers: Arc::new(Mutex::new(HashMap::new())),
            endpoint_health: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn check_connectivity(&self) -> Result<U256> {
        self.call_with_failover(|provider| async move {
            provider.get_chainid().await.map_err(|err| err.into())
        })
        .await
    }

    async fn call_with_failover<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: Fn(Arc<Provider<Http>>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let now = Instant::now();
        let mut available = Vec::new();
        let mut cooldown = Vec::new();
        for endpoint in &self.settings.endpoints {
            if self.is_endpoint_on_cooldown(endpoint, now) {
                cooldown.push(endpoint);
            } else {
                available.push(endpoint);
            }
        }
        if available.is_empty() {
            available = cooldown;
        }
        if available.is_empty() {
            return Err(anyhow!("no rpc endpoints configured"));
        }
        let mut last_err: Option<anyhow::Error> = None;
        for endpoint in available {
            let provider = match self.provider_for_url(endpoint) {
                Ok(provider) => provider,
                Err(err) => {
                    self.record_endpoint_failure(endpoint);
                    last_err = Some(anyhow!(
                        "rpc endpoint {} init failed: {}",
                        redact_endpoint(endpoint),
                        err
                    ));
                    continue;
                }
            };
            match f(provider).await {
                Ok(result) => {
                    self.record_endpoint_success(endpoint);
                    return Ok(result);
                }
                Err(err) => {
                    self.record_endpoint_failure(endpoint);
                    last_err = Some(anyhow!(
                        "rpc endpoint {} failed: {}",
                        redact_endpoint(endpoint),
                        err
                    ));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("rpc call failed")))
    }

    fn is_endpoint_on_cooldown(&self, url: &str, now: Instant) -> bool {
        let mut map = self
            .endpoint_health
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        if let Some(entry) = map.get_mut(url) {
            if let Some(until) = entry.cooldown_until {
                if until > now {
                    return true;
                }
                entry.cooldown_until = None;
            }
        }
        false
    }

    fn record_endpoint_failure(&self, url: &str) {
        if self.settings.failure_threshold == 0 || self.settings.failure_cooldown.is_zero() {
            return;
        }
        let mut map = self
            .endpoint_health
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        let entry = map.entry(url.to_string()).or_insert(EndpointHealth {
            failures: 0,
            cooldown_until: None,
        });
        entry.failures = entry.failures.saturating_add(1);
        if entry.failures >= self.settings.failure_threshold {
            entry.failures = 0;
            entry.cooldown_until = Some(Instant::now() + self.settings.failure_cooldown);
        }
    }

    fn record_endpoint_success(&self, url: &str) {
        let mut map = self
            .endpoint_health
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        if let Some(entry) = map.get_mut(url) {
            entry.failures = 0;
            entry.cooldown_until = None;
        }
    }

    fn provider_for_url(&self, url: &str) -> Result<Arc<Provider<Http>>> {
        if let Some(provider) = self
            .providers
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .get(url)
            .cloned()
        {
            return Ok(provider);
        }
        let client = reqwest11::Client::builder()
            .timeout(self.settings.timeout)
            .connect_timeout(self.settings.connect_timeout)
            .build()
            .context("build rpc http client")?;
        let parsed = Url::parse(url).context("invalid rpc url")?;
        let http = Http::new_with_client(parsed, client);
        let provider = Arc::new(Provider::new(http));
        self.providers
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .insert(url.to_string(), provider.clone());
        Ok(provider)
    }
}

impl TokenUriSource for ChainClient {
    async fn token_uri(&self, contract: &ContractInterface, token_id: U256) -> Result<String> {
        let function = contract
            .uri_function()
            .ok_or_else(|| anyhow!("contract exposes neither {TOKEN_URI} nor {IMAGE_URI}"))?;
        let address = contract.address;
        let abi = contract.abi.clone();
        self.call_with_failover(move |provider| {
            let instance = Contract::new(address, abi.clone(), provider);
            async move {
                let uri = instance
                    .method::<_, String>(function, token_id)?
                    .call()
                    .await?;
                Ok::<_, anyhow::Error>(uri)
            }
        })
        .await
    }
}

// Hosted RPC urls routinely embed a project key in the path.
fn redact_endpoint(endpoint: &str) -> String {
    match Url::parse(endpoint) {
        Ok(url) => match url.host_str() {
            Some(host) => format!("{}://{}", url.scheme(), host),
            None => url.scheme().to_string(),
        },
        Err(_) => "<invalid>".to_string(),
    }
}
