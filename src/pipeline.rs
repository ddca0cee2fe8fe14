use crate::canonical::{WalletAddress, canonicalize_wallet};
use crate::chain::{ContractInterface, TokenUriSource};
use crate::config::Config;
use crate::download_log::{DownloadLogEntry, DownloadStatus};
use crate::explorer::TokenIndex;
use crate::fetch::ContentFetcher;
use crate::rate_limit::RateLimiter;
use crate::resolver::{ImageResolver, ResolutionError};
use crate::writer::{AssetWriter, WriteError, WriteOutcome};
use ethers::types::U256;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub download_dir: PathBuf,
    pub download_cap: usize,
    pub create_wallet_dirs: bool,
    pub max_concurrent_wallets: usize,
    pub max_concurrent_tokens: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            download_dir: config.download_dir.clone(),
            download_cap: config.download_cap,
            create_wallet_dirs: config.create_wallet_dirs,
            max_concurrent_wallets: config.max_concurrent_wallets,
            max_concurrent_tokens: config.max_concurrent_tokens,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalletStage {
    Address,
    Interface,
    Tokens,
    Directory,
}

impl fmt::Display for WalletStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WalletStage::Address => "address",
            WalletStage::Interface => "contract interface",
            WalletStage::Tokens => "token ids",
            WalletStage::Directory => "directory",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum TokenFailure {
    #[error("token uri call failed: {0}")]
    Call(String),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("token task ended abnormally: {0}")]
    Task(String),
}

#[derive(Debug)]
pub enum TokenOutcome {
    Written(PathBuf),
    Skipped(PathBuf),
    Failed(TokenFailure),
}

#[derive(Debug)]
pub enum WalletStatus {
    Completed,
    Aborted { stage: WalletStage, reason: String },
}

#[derive(Debug)]
pub struct WalletReport {
    pub wallet: String,
    pub status: WalletStatus,
    pub tokens_found: usize,
    pub attempted: usize,
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl WalletReport {
    fn aborted(wallet: String, stage: WalletStage, reason: String) -> Self {
        Self {
            wallet,
            status: WalletStatus::Aborted { stage, reason },
            tokens_found: 0,
            attempted: 0,
            written: 0,
            skipped: 0,
            failed: 0,
        }
    }

    fn record(&mut self, outcome: &TokenOutcome) {
        match outcome {
            TokenOutcome::Written(_) => self.written += 1,
            TokenOutcome::Skipped(_) => self.skipped += 1,
            TokenOutcome::Failed(_) => self.failed += 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub wallets_completed: usize,
    pub wallets_aborted: usize,
    pub tokens_attempted: usize,
    pub tokens_written: usize,
    pub tokens_skipped: usize,
    pub tokens_failed: usize,
    pub reports: Vec<WalletReport>,
}

impl RunSummary {
    fn record(&mut self, report: WalletReport) {
        match report.status {
            WalletStatus::Completed => self.wallets_completed += 1,
            WalletStatus::Aborted { .. } => self.wallets_aborted += 1,
        }
        self.tokens_attempted += report.attempted;
        self.tokens_written += report.written;
        self.tokens_skipped += report.skipped;
        self.tokens_failed += report.failed;
        self.reports.push(report);
    }
}

pub fn download_limit(cap: usize, token_count: usize) -> usize {
    if cap == 0 {
        token_count
    } else {
        cap.min(token_count)
    }
}

pub struct Pipeline<I, C, F> {
    index: I,
    chain: C,
    resolver: ImageResolver<F>,
    writer: AssetWriter,
    limiter: RateLimiter,
    settings: PipelineSettings,
    download_log: Option<mpsc::Sender<DownloadLogEntry>>,
}

struct TokenJob {
    wallet: WalletAddress,
    contract: ContractInterface,
    directory: PathBuf,
}

impl<I, C, F> Pipeline<I, C, F>
where
    I: TokenIndex + 'static,
    C: TokenUriSource + 'static,
    F: ContentFetcher + 'static,
{
    pub fn new(
        index: I,
        chain: C,
        resolver: ImageResolver<F>,
        writer: AssetWriter,
        limiter: RateLimiter,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            index,
            chain,
            resolver,
            writer,
            limiter,
            settings,
            download_log: None,
        }
    }

    pub fn with_download_log(mut self, sender: mpsc::Sender<DownloadLogEntry>) -> Self {
        self.download_log = Some(sender);
        self
    }

    pub async fn run(self: Arc<Self>, wallets: Vec<String>) -> RunSummary {
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_wallets.max(1)));
        let mut tasks = JoinSet::new();
        for raw in wallets {
            let pipeline = self.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                pipeline.process_wallet(raw).await
            });
        }
        let mut summary = RunSummary::default();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(report) => summary.record(report),
                Err(err) => {
                    warn!(error = ?err, "wallet task ended abnormally");
                    summary.wallets_aborted += 1;
                }
            }
        }
        summary
    }

    async fn process_wallet(self: Arc<Self>, raw: String) -> WalletReport {
        let wallet = match canonicalize_wallet(&raw) {
            Ok(wallet) => wallet,
            Err(err) => return self.abort(raw, WalletStage::Address, err.to_string()),
        };
        let label = wallet.to_string();
        info!(wallet = %label, "processing wallet");

        let abi = match self.index.contract_interface(&wallet).await {
            Ok(abi) => abi,
            Err(err) => return self.abort(label, WalletStage::Interface, err.to_string()),
        };
        let token_ids = match self.index.token_ids(&wallet).await {
            Ok(ids) => ids,
            Err(err) => return self.abort(label, WalletStage::Tokens, err.to_string()),
        };
        let distinct: BTreeSet<U256> = token_ids.into_iter().collect();
        let tokens_found = distinct.len();
        let limit = download_limit(self.settings.download_cap, tokens_found);
        info!(
            wallet = %label,
            tokens = tokens_found,
            attempts = limit,
            "token ids collected"
        );

        let directory = if self.settings.create_wallet_dirs {
            self.settings.download_dir.join(&wallet.checksummed)
        } else {
            self.settings.download_dir.clone()
        };
        if let Err(err) = fs::create_dir_all(&directory).await {
            let reason = format!("create {}: {err}", directory.display());
            return self.abort(label, WalletStage::Directory, reason);
        }

        let job = Arc::new(TokenJob {
            contract: ContractInterface::new(wallet.address, abi),
            wallet,
            directory,
        });
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_tokens.max(1)));
        let mut tasks = JoinSet::new();
        for token_id in distinct.into_iter().take(limit) {
            let pipeline = self.clone();
            let job = job.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                pipeline.process_token(&job, token_id).await
            });
        }

        let mut report = WalletReport {
            wallet: label,
            status: WalletStatus::Completed,
            tokens_found,
            attempted: 0,
            written: 0,
            skipped: 0,
            failed: 0,
        };
        while let Some(result) = tasks.join_next().await {
            let outcome = result.unwrap_or_else(|err| {
                TokenOutcome::Failed(TokenFailure::Task(err.to_string()))
            });
            report.attempted += 1;
            report.record(&outcome);
        }
        info!(
            wallet = %report.wallet,
            written = report.written,
            skipped = report.skipped,
            failed = report.failed,
            "wallet done"
        );
        report
    }

    async fn process_token(&self, job: &TokenJob, token_id: U256) -> TokenOutcome {
        let wallet = job.wallet.to_string();
        let mut entry =
            DownloadLogEntry::new(wallet.clone(), token_id.to_string(), DownloadStatus::Failed);

        self.limiter.acquire().await;
        let uri = match self.chain.token_uri(&job.contract, token_id).await {
            Ok(uri) => uri.trim().to_string(),
            Err(err) => {
                let failure = TokenFailure::Call(format!("{err:#}"));
                return self.finish(entry, TokenOutcome::Failed(failure)).await;
            }
        };
        entry.token_uri = Some(uri.clone());

        let image = match self.resolver.resolve(&uri).await {
            Ok(image) => image,
            Err(err) => return self.finish(entry, TokenOutcome::Failed(err.into())).await,
        };
        debug!(token_id = %token_id, url = %image.url, hops = image.hops, "token image resolved");
        entry.image_url = Some(image.url.clone());

        let outcome = match self
            .writer
            .write(&image, &wallet, &token_id, &job.directory)
            .await
        {
            Ok(WriteOutcome::Written(path)) => TokenOutcome::Written(path),
            Ok(WriteOutcome::Skipped(path)) => TokenOutcome::Skipped(path),
            Err(err) => TokenOutcome::Failed(err.into()),
        };
        self.finish(entry, outcome).await
    }

    async fn finish(&self, mut entry: DownloadLogEntry, outcome: TokenOutcome) -> TokenOutcome {
        match &outcome {
            TokenOutcome::Written(path) => {
                info!(wallet = %entry.wallet, token_id = %entry.token_id, path = %path.display(), "image written");
                entry.status = DownloadStatus::Written;
                entry.file = Some(path.display().to_string());
            }
            TokenOutcome::Skipped(path) => {
                info!(wallet = %entry.wallet, token_id = %entry.token_id, path = %path.display(), "image already present, skipped");
                entry.status = DownloadStatus::Skipped;
                entry.file = Some(path.display().to_string());
                entry.reason = Some("already exists".to_string());
            }
            TokenOutcome::Failed(failure) => {
                warn!(wallet = %entry.wallet, token_id = %entry.token_id, error = %failure, "token skipped");
                entry.status = DownloadStatus::Failed;
                entry.reason = Some(failure.to_string());
            }
        }
        if let Some(sender) = &self.download_log {
            let _ = sender.send(entry).await;
        }
        outcome
    }

    fn abort(&self, wallet: String, stage: WalletStage, reason: String) -> WalletReport {
        warn!(wallet = %wallet, stage = %stage, error = %reason, "wallet aborted");
        WalletReport::aborted(wallet, stage, reason)
    }
}
