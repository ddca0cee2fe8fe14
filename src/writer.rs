use crate::resolver::ResolvedImage;
use dashmap::DashMap;
use ethers::types::U256;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileNaming {
    #[default]
    UriSegments,
    TokenId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(PathBuf),
    Skipped(PathBuf),
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("write to {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Default)]
pub struct AssetWriter {
    naming: FileNaming,
    shared_directory: bool,
    dir_locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl AssetWriter {
    pub fn new(naming: FileNaming) -> Self {
        Self {
            naming,
            shared_directory: false,
            dir_locks: Arc::new(DashMap::new()),
        }
    }

    // every wallet writes into one directory, so token names carry the wallet
    pub fn with_shared_directory(mut self, shared: bool) -> Self {
        self.shared_directory = shared;
        self
    }

    pub fn file_name(&self, image: &ResolvedImage, wallet: &str, token_id: &U256) -> String {
        match self.naming {
            FileNaming::UriSegments => segment_file_name(image),
            FileNaming::TokenId if self.shared_directory => {
                format!("{wallet}_{token_id}{}", image.extension)
            }
            FileNaming::TokenId => format!("{token_id}{}", image.extension),
        }
    }

    // an existing file with the same name is left alone, even from another token
    pub async fn write(
        &self,
        image: &ResolvedImage,
        wallet: &str,
        token_id: &U256,
        directory: &Path,
    ) -> Result<WriteOutcome, WriteError> {
        let path = directory.join(self.file_name(image, wallet, token_id));
        let lock = self.lock_for(directory);
        let _guard = lock.lock().await;
        match fs::try_exists(&path).await {
            Ok(true) => return Ok(WriteOutcome::Skipped(path)),
            Ok(false) => {}
            Err(source) => return Err(WriteError::Io { path, source }),
        }
        match store_file_atomic(&path, &image.bytes).await {
            Ok(()) => Ok(WriteOutcome::Written(path)),
            Err(source) => Err(WriteError::Io { path, source }),
        }
    }

    fn lock_for(&self, directory: &Path) -> Arc<Mutex<()>> {
        self.dir_locks
            .entry(directory.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub fn segment_file_name(image: &ResolvedImage) -> String {
    let link = image
        .url
        .split(['?', '#'])
        .next()
        .unwrap_or(image.url.as_str());
    let segments: Vec<&str> = link.split('/').collect();
    let start = segments.len().saturating_sub(2);
    let mut name: String = segments[start..]
        .iter()
        .map(|segment| sanitize_segment(segment))
        .collect();
    if name.is_empty() || name.chars().all(|ch| ch == '.') {
        name = sha256_hex(&image.url);
    }
    if !image.extension_in_url {
        name.push_str(&image.extension);
    }
    name
}

fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|ch| match ch {
            '\\' | ':' | '\0' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect()
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

async fn store_file_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("image");
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    let temp_path = parent.join(format!(".{file_name}.tmp-{nonce}"));
    if let Err(err) = fs::write(&temp_path, bytes).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    const WALLET: &str = "0x521f9C7505005CFA19A8E5786a9c3c9c9F5e6f42";

    fn image(url: &str, bytes: &'static [u8], extension: &str, in_url: bool) -> ResolvedImage {
        ResolvedImage {
            url: url.to_string(),
            bytes: Bytes::from_static(bytes),
            extension: extension.to_string(),
            extension_in_url: in_url,
            hops: 0,
        }
    }

    #[test]
    fn segments_concatenate_last_two_path_parts() {
        let img = image("https://ipfs.io/ipfs/abc/img.png", b"", ".png", true);
        assert_eq!(segment_file_name(&img), "abcimg.png");
    }

    #[test]
    fn fallback_extension_is_appended() {
        let img = image("https://api.example.org/token/42", b"", ".png", false);
        assert_eq!(segment_file_name(&img), "token42.png");
    }

    #[test]
    fn query_and_unsafe_characters_are_dropped() {
        let img = image("https://host/a:b/c.jpg?size=large", b"", ".jpg", true);
        assert_eq!(segment_file_name(&img), "a_bc.jpg");
    }

    #[test]
    fn single_segment_links_use_host() {
        let img = image("https://host.example/art.jpeg", b"", ".jpeg", true);
        assert_eq!(segment_file_name(&img), "host.exampleart.jpeg");
    }

    #[test]
    fn dot_only_names_fall_back_to_hash() {
        let img = image("..", b"", ".png", false);
        let name = segment_file_name(&img);
        assert_eq!(name.len(), 64 + ".png".len());
        assert!(name.ends_with(".png"));
    }

    #[test]
    fn token_naming_uses_token_id() {
        let writer = AssetWriter::new(FileNaming::TokenId);
        let img = image("https://ipfs.io/ipfs/abc/img.jpg", b"", ".jpg", true);
        assert_eq!(writer.file_name(&img, WALLET, &U256::from(7u64)), "7.jpg");
    }

    #[tokio::test]
    async fn shared_directory_token_names_keep_wallets_apart() {
        let dir = tempdir().unwrap();
        let writer = AssetWriter::new(FileNaming::TokenId).with_shared_directory(true);
        let img = image("https://ipfs.io/ipfs/abc/img.png", b"a", ".png", true);
        let other = "0x36d16e0758D1B52c28c4579e12B9EfA0D23BAB29";
        let first = writer.write(&img, WALLET, &U256::from(1u64), dir.path()).await.unwrap();
        let second = writer.write(&img, other, &U256::from(1u64), dir.path()).await.unwrap();
        assert_eq!(
            first,
            WriteOutcome::Written(dir.path().join(format!("{WALLET}_1.png")))
        );
        assert_eq!(
            second,
            WriteOutcome::Written(dir.path().join(format!("{other}_1.png")))
        );
    }

    #[tokio::test]
    async fn writes_then_skips_existing_file() {
        let dir = tempdir().unwrap();
        let writer = AssetWriter::new(FileNaming::UriSegments);
        let first = image("https://ipfs.io/ipfs/abc/img.png", b"first", ".png", true);
        let outcome = writer.write(&first, WALLET, &U256::from(1u64), dir.path()).await.unwrap();
        let path = dir.path().join("abcimg.png");
        assert_eq!(outcome, WriteOutcome::Written(path.clone()));
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        // different token, same trailing segments: skipped, not overwritten
        let second = image("https://other.gateway/ipfs/abc/img.png", b"second", ".png", true);
        let outcome = writer.write(&second, WALLET, &U256::from(2u64), dir.path()).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Skipped(path.clone()));
        assert_eq!(std::fs::read(&path).unwrap(), b"first");
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let writer = AssetWriter::default();
        let img = image("https://host/a/b.png", b"x", ".png", true);
        let err = writer
            .write(&img, WALLET, &U256::from(1u64), &dir.path().join("absent"))
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::Io { .. }));
    }

    #[tokio::test]
    async fn concurrent_writes_to_same_name_write_once() {
        let dir = tempdir().unwrap();
        let writer = AssetWriter::default();
        let mut tasks = tokio::task::JoinSet::new();
        for index in 0..8u64 {
            let writer = writer.clone();
            let path = dir.path().to_path_buf();
            tasks.spawn(async move {
                let img = image("https://host/a/b.png", b"same", ".png", true);
                writer.write(&img, WALLET, &U256::from(index), &path).await.unwrap()
            });
        }
        let mut written = 0;
        while let Some(outcome) = tasks.join_next().await {
            if matches!(outcome.unwrap(), WriteOutcome::Written(_)) {
                written += 1;
            }
        }
        assert_eq!(written, 1);
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
