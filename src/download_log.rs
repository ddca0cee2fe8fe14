use serde::Serialize;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Written,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadLogEntry {
    pub timestamp: String,
    pub wallet: String,
    pub token_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub status: DownloadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DownloadLogEntry {
    pub fn new(wallet: String, token_id: String, status: DownloadStatus) -> Self {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        Self {
            timestamp,
            wallet,
            token_id,
            token_uri: None,
            image_url: None,
            file: None,
            status,
            reason: None,
        }
    }
}

// Where the JSON lines go. When the file would grow past `max_bytes` it is
// renamed to `<name>.1` (replacing the previous generation) and a fresh file
// is started, so no record is ever cut in half. `max_bytes == 0` never rotates.
#[derive(Debug, Clone)]
pub struct DownloadLog {
    path: PathBuf,
    max_bytes: u64,
}

struct Sink {
    writer: BufWriter<File>,
    written: u64,
}

impl DownloadLog {
    pub fn new(path: PathBuf, max_bytes: u64) -> Option<Self> {
        if path.as_os_str().is_empty() {
            return None;
        }
        Some(Self { path, max_bytes })
    }

    fn rotated_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| OsString::from("downloads"));
        name.push(".1");
        self.path.with_file_name(name)
    }

    async fn open(&self) -> io::Result<Sink> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let written = file.metadata().await?.len();
        Ok(Sink {
            writer: BufWriter::new(file),
            written,
        })
    }

    async fn rotate(&self, sink: &mut Sink) -> io::Result<()> {
        sink.writer.flush().await?;
        fs::rename(&self.path, self.rotated_path()).await?;
        *sink = self.open().await?;
        Ok(())
    }

    async fn append(&self, sink: &mut Sink, entry: &DownloadLogEntry) -> io::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let len = line.len() as u64;
        if self.max_bytes > 0 && sink.written > 0 && sink.written + len > self.max_bytes {
            self.rotate(sink).await?;
        }
        sink.writer.write_all(&line).await?;
        sink.written += len;
        Ok(())
    }
}

// Owns the log file for the whole run. Buffered lines are flushed whenever
// the channel runs dry and once more after the last sender is gone.
pub async fn run_download_log(log: DownloadLog, mut receiver: mpsc::Receiver<DownloadLogEntry>) {
    let mut sink = match log.open().await {
        Ok(sink) => sink,
        Err(err) => {
            warn!(error = ?err, path = %log.path.display(), "download log unavailable");
            return;
        }
    };
    while let Some(entry) = receiver.recv().await {
        if let Err(err) = log.append(&mut sink, &entry).await {
            warn!(error = ?err, path = %log.path.display(), "failed to write download log");
        }
        if receiver.is_empty() {
            if let Err(err) = sink.writer.flush().await {
                warn!(error = ?err, path = %log.path.display(), "failed to flush download log");
            }
        }
    }
    if let Err(err) = sink.writer.flush().await {
        warn!(error = ?err, path = %log.path.display(), "failed to flush download log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::tempdir;

    fn entry(token_id: &str, status: DownloadStatus) -> DownloadLogEntry {
        let mut entry = DownloadLogEntry::new("0xabc".to_string(), token_id.to_string(), status);
        entry.file = Some(format!("{token_id}.png"));
        entry
    }

    fn read_lines(path: &std::path::Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    async fn write_all(log: DownloadLog, entries: Vec<DownloadLogEntry>) {
        let (tx, rx) = mpsc::channel(entries.len().max(1));
        let handle = tokio::spawn(run_download_log(log, rx));
        for entry in entries {
            tx.send(entry).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();
    }

    #[test]
    fn empty_path_disables_log() {
        assert!(DownloadLog::new(PathBuf::new(), 0).is_none());
    }

    #[tokio::test]
    async fn entries_are_appended_as_json_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/downloads.jsonl");
        let log = DownloadLog::new(path.clone(), 0).unwrap();
        write_all(
            log,
            vec![
                entry("1", DownloadStatus::Written),
                entry("2", DownloadStatus::Failed),
            ],
        )
        .await;

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["token_id"], "1");
        assert_eq!(lines[0]["status"], "written");
        assert!(lines[0].get("reason").is_none());
        assert_eq!(lines[1]["status"], "failed");
        assert_eq!(lines[1]["file"], "2.png");
    }

    #[tokio::test]
    async fn existing_log_is_extended_across_runs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("downloads.jsonl");
        let log = DownloadLog::new(path.clone(), 0).unwrap();
        write_all(log.clone(), vec![entry("1", DownloadStatus::Written)]).await;
        write_all(log, vec![entry("2", DownloadStatus::Skipped)]).await;
        assert_eq!(read_lines(&path).len(), 2);
    }

    #[tokio::test]
    async fn full_log_rotates_on_record_boundary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("downloads.jsonl");
        let log = DownloadLog::new(path.clone(), 300).unwrap();
        let rotated = log.rotated_path();
        let entries = (0..10)
            .map(|index| entry(&index.to_string(), DownloadStatus::Skipped))
            .collect();
        write_all(log, entries).await;

        for file in [&path, &rotated] {
            let size = std::fs::metadata(file).unwrap().len();
            assert!(size > 0 && size <= 300, "{} is {size} bytes", file.display());
            // every line still parses, nothing was cut mid-record
            assert!(!read_lines(file).is_empty());
        }
        let current = read_lines(&path);
        assert_eq!(current.last().unwrap()["token_id"], "9");
        assert_eq!(rotated.file_name().unwrap(), "downloads.jsonl.1");
    }

    #[tokio::test]
    async fn unopenable_log_does_not_panic() {
        let dir = tempdir().unwrap();
        // a directory where the file should be
        let log = DownloadLog::new(dir.path().to_path_buf(), 0).unwrap();
        write_all(log, vec![entry("1", DownloadStatus::Written)]).await;
    }
}
