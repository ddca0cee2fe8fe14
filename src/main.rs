mod canonical;
mod chain;
mod config;
mod download_log;
mod explorer;
mod fetch;
mod links;
mod pipeline;
mod rate_limit;
mod resolver;
mod writer;

use crate::chain::{ChainClient, ChainSettings};
use crate::config::{Cli, Config};
use crate::download_log::{DownloadLog, run_download_log};
use crate::explorer::ExplorerClient;
use crate::fetch::HttpFetcher;
use crate::links::LinkNormalizer;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::rate_limit::RateLimiter;
use crate::resolver::{ImageResolver, ResolverConfig};
use crate::writer::AssetWriter;
use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DOWNLOAD_LOG_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "harvest failed");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = Config::from_cli(cli)?;
    info!(
        wallets = config.wallets.len(),
        rpc_endpoints = config.rpc_endpoints.len(),
        download_dir = %config.download_dir.display(),
        download_cap = config.download_cap,
        per_wallet_dirs = config.create_wallet_dirs,
        ipfs_gateway = %config.ipfs_gateway,
        max_resolve_depth = config.max_resolve_depth,
        file_naming = ?config.file_naming,
        token_call_interval_ms = config.token_call_interval.as_millis() as u64,
        max_concurrent_wallets = config.max_concurrent_wallets,
        max_concurrent_tokens = config.max_concurrent_tokens,
        "startup config summary"
    );

    let chain = ChainClient::new(ChainSettings::from_config(&config));
    match chain.check_connectivity().await {
        Ok(chain_id) => info!(chain_id = %chain_id, "rpc endpoint reachable"),
        Err(err) => {
            error!(error = %format!("{err:#}"), "no rpc endpoint reachable");
            return Ok(ExitCode::from(2));
        }
    }

    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .with_context(|| format!("create {}", config.download_dir.display()))?;

    let index = ExplorerClient::new(&config)?;
    let resolver = ImageResolver::new(
        HttpFetcher::new(&config)?,
        LinkNormalizer::from_config(&config),
        ResolverConfig::from_config(&config),
    );
    let limiter = RateLimiter::new(config.token_call_interval, config.token_call_burst);
    if !limiter.enabled() {
        info!("per-token call throttling disabled");
    }
    let mut pipeline = Pipeline::new(
        index,
        chain,
        resolver,
        AssetWriter::new(config.file_naming).with_shared_directory(!config.create_wallet_dirs),
        limiter,
        PipelineSettings::from_config(&config),
    );

    let download_log = config
        .download_log_path
        .clone()
        .and_then(|path| DownloadLog::new(path, config.download_log_max_bytes));
    let log_task = match download_log {
        Some(log) => {
            let (tx, rx) = mpsc::channel(DOWNLOAD_LOG_CHANNEL_CAPACITY);
            pipeline = pipeline.with_download_log(tx);
            Some(tokio::spawn(run_download_log(log, rx)))
        }
        None => None,
    };

    let summary = Arc::new(pipeline).run(config.wallets.clone()).await;
    if let Some(handle) = log_task {
        if let Err(err) = handle.await {
            error!(error = ?err, "download log task failed");
        }
    }

    let tokens_found: usize = summary.reports.iter().map(|report| report.tokens_found).sum();
    info!(
        wallets_completed = summary.wallets_completed,
        wallets_aborted = summary.wallets_aborted,
        tokens_found,
        tokens_attempted = summary.tokens_attempted,
        written = summary.tokens_written,
        skipped = summary.tokens_skipped,
        failed = summary.tokens_failed,
        "harvest finished"
    );
    Ok(ExitCode::SUCCESS)
}
