use crate::writer::FileNaming;
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Download NFT images for a list of contract wallets.
#[derive(Parser, Debug, Clone)]
#[command(name = "nft-image-harvester", version, about, long_about = None)]
pub struct Cli {
    /// File whose first line is the block explorer API key
    #[arg(long, env = "ETHERSCAN_API_KEY_FILE")]
    pub api_key_file: Option<PathBuf>,

    /// Block explorer API key (takes precedence over --api-key-file)
    #[arg(long, env = "ETHERSCAN_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Newline separated list of wallet addresses
    #[arg(long, env = "WALLETS_FILE")]
    pub wallets_file: Option<PathBuf>,

    /// Wallet address to download from; may be repeated
    #[arg(long = "wallet")]
    pub wallets: Vec<String>,

    /// File with one RPC endpoint URL per line
    #[arg(long, env = "RPC_URL_FILE")]
    pub rpc_url_file: Option<PathBuf>,

    /// RPC endpoint URL; several enable failover
    #[arg(long = "rpc-url", env = "RPC_URL", value_delimiter = ',')]
    pub rpc_urls: Vec<String>,

    /// Base directory for downloaded images
    #[arg(long, env = "OUTPUT_DIR", default_value = "downloads")]
    pub output_dir: PathBuf,

    /// Maximum downloads per wallet, 0 for no limit
    #[arg(long, env = "DOWNLOAD_CAP", default_value_t = 100)]
    pub cap: usize,

    /// Write every wallet's images directly into the output directory
    #[arg(long, env = "FLAT_OUTPUT")]
    pub flat: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub explorer_api_url: Url,
    pub explorer_page_size: usize,
    pub explorer_max_pages: usize,
    pub rpc_endpoints: Vec<String>,
    pub wallets: Vec<String>,
    pub download_dir: PathBuf,
    pub download_cap: usize,
    pub create_wallet_dirs: bool,
    pub ipfs_gateway: String,
    pub ipfs_scheme_prefix: String,
    pub image_extensions: Vec<String>,
    pub fallback_image_extension: String,
    pub max_resolve_depth: usize,
    pub http_timeout_seconds: u64,
    pub http_connect_timeout_seconds: u64,
    pub max_download_bytes: usize,
    pub rpc_timeout_seconds: u64,
    pub rpc_connect_timeout_seconds: u64,
    pub rpc_failure_threshold: u32,
    pub rpc_failure_cooldown_seconds: u64,
    pub token_call_interval: Duration,
    pub token_call_burst: u64,
    pub max_concurrent_wallets: usize,
    pub max_concurrent_tokens: usize,
    pub file_naming: FileNaming,
    pub download_log_path: Option<PathBuf>,
    pub download_log_max_bytes: u64,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let api_key = match (cli.api_key, cli.api_key_file) {
            (Some(key), _) if !key.trim().is_empty() => key.trim().to_string(),
            (_, Some(path)) => read_first_line(&path)?,
            _ => return Err(anyhow!("an explorer API key is required (--api-key or --api-key-file)")),
        };
        if api_key.is_empty() {
            return Err(anyhow!("explorer API key is empty"));
        }

        let mut wallets = cli.wallets;
        if let Some(path) = cli.wallets_file.as_deref() {
            wallets.extend(read_lines(path)?);
        }
        let wallets: Vec<String> = wallets
            .into_iter()
            .map(|wallet| wallet.trim().to_string())
            .filter(|wallet| !wallet.is_empty())
            .collect();
        if wallets.is_empty() {
            return Err(anyhow!("no wallet addresses given (--wallet or --wallets-file)"));
        }

        let mut rpc_endpoints = cli.rpc_urls;
        if let Some(path) = cli.rpc_url_file.as_deref() {
            rpc_endpoints.extend(read_lines(path)?);
        }
        let rpc_endpoints: Vec<String> = rpc_endpoints
            .into_iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if rpc_endpoints.is_empty() {
            return Err(anyhow!("no RPC endpoint given (--rpc-url or --rpc-url-file)"));
        }
        for endpoint in &rpc_endpoints {
            Url::parse(endpoint).with_context(|| format!("invalid rpc url {endpoint}"))?;
        }

        let explorer_api_url = env::var("ETHERSCAN_API_URL")
            .unwrap_or_else(|_| "https://api.etherscan.io/api".to_string());
        let explorer_api_url =
            Url::parse(explorer_api_url.trim()).context("invalid ETHERSCAN_API_URL")?;
        let explorer_page_size = parse_usize("ETHERSCAN_PAGE_SIZE", 1000).max(1);
        let explorer_max_pages = parse_usize("ETHERSCAN_MAX_PAGES", 10).max(1);

        let ipfs_gateway = normalize_gateway(
            &env::var("IPFS_GATEWAY").unwrap_or_else(|_| "https://ipfs.io/ipfs/".to_string()),
        )?;
        let ipfs_scheme_prefix =
            env::var("IPFS_SCHEME_PREFIX").unwrap_or_else(|_| "ipfs://".to_string());
        let image_extensions = parse_list_env("IMAGE_EXTENSIONS").unwrap_or_else(|| {
            vec![".png".to_string(), ".jpg".to_string(), ".jpeg".to_string()]
        });
        if image_extensions.is_empty() {
            return Err(anyhow!("IMAGE_EXTENSIONS must not be empty"));
        }
        let fallback_image_extension =
            env::var("FALLBACK_IMAGE_EXTENSION").unwrap_or_else(|_| ".png".to_string());
        let max_resolve_depth = parse_usize("MAX_RESOLVE_DEPTH", 8);

        let http_timeout_seconds = parse_u64("HTTP_TIMEOUT_SECONDS", 30);
        let http_connect_timeout_seconds = parse_u64("HTTP_CONNECT_TIMEOUT_SECONDS", 10);
        let max_download_bytes = parse_usize("MAX_DOWNLOAD_BYTES", 50 * 1024 * 1024);
        let rpc_timeout_seconds = parse_u64("RPC_TIMEOUT_SECONDS", 30);
        let rpc_connect_timeout_seconds = parse_u64("RPC_CONNECT_TIMEOUT_SECONDS", 5);
        let rpc_failure_threshold =
            parse_u64("RPC_FAILURE_THRESHOLD", 2).min(u32::MAX as u64) as u32;
        let rpc_failure_cooldown_seconds = parse_u64("RPC_FAILURE_COOLDOWN_SECONDS", 60);

        let token_call_interval = Duration::from_millis(parse_u64("TOKEN_CALL_INTERVAL_MS", 100));
        let token_call_burst = parse_u64("TOKEN_CALL_BURST", 1);
        let max_concurrent_wallets = parse_usize("MAX_CONCURRENT_WALLETS", 1).max(1);
        let max_concurrent_tokens = parse_usize("MAX_CONCURRENT_TOKENS", 1).max(1);
        let file_naming = parse_file_naming("FILE_NAMING")?;
        let download_log_path = env::var("DOWNLOAD_LOG_PATH")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case("off"))
            .map(PathBuf::from);
        let download_log_max_bytes = parse_u64("DOWNLOAD_LOG_MAX_BYTES", 1_048_576);

        Ok(Self {
            api_key,
            explorer_api_url,
            explorer_page_size,
            explorer_max_pages,
            rpc_endpoints,
            wallets,
            download_dir: cli.output_dir,
            download_cap: cli.cap,
            create_wallet_dirs: !cli.flat,
            ipfs_gateway,
            ipfs_scheme_prefix,
            image_extensions,
            fallback_image_extension,
            max_resolve_depth,
            http_timeout_seconds,
            http_connect_timeout_seconds,
            max_download_bytes,
            rpc_timeout_seconds,
            rpc_connect_timeout_seconds,
            rpc_failure_threshold,
            rpc_failure_cooldown_seconds,
            token_call_interval,
            token_call_burst,
            max_concurrent_wallets,
            max_concurrent_tokens,
            file_naming,
            download_log_path,
            download_log_max_bytes,
        })
    }
}

fn read_first_line(path: &Path) -> Result<String> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    Ok(contents.lines().next().unwrap_or("").trim().to_string())
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    Ok(contents
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.to_string())
        .collect())
}

fn normalize_gateway(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("IPFS_GATEWAY must not be empty"));
    }
    Url::parse(trimmed).context("invalid IPFS_GATEWAY")?;
    if trimmed.ends_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{trimmed}/"))
    }
}

fn parse_file_naming(key: &str) -> Result<FileNaming> {
    let value = env::var(key)
        .ok()
        .map(|value| value.trim().to_ascii_lowercase());
    match value.as_deref() {
        None | Some("") | Some("segments") | Some("uri") => Ok(FileNaming::UriSegments),
        Some("token") | Some("token_id") => Ok(FileNaming::TokenId),
        Some(_) => Err(anyhow!("invalid {key} value")),
    }
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_list_env(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    if raw.trim_start().starts_with('[') {
        serde_json::from_str(&raw).ok()
    } else {
        let list = raw
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect::<Vec<_>>();
        if list.is_empty() { None } else { Some(list) }
    }
}
