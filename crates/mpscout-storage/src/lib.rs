//! Durable state for the scout: dedup ledger, record sinks, notifier and debug snapshots.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod ledger;
pub mod notify;
pub mod sink;

pub use ledger::{DedupLedger, LedgerError};
pub use notify::{
    classify_reqwest_error, classify_status, slack_payload, webhook_is_configured, BackoffPolicy,
    NoopNotifier, NotifyError, Notifier, RetryDisposition, SlackNotifier, WebhookClientConfig,
};
pub use sink::{sink_for_path, CsvSink, JsonLinesSink, RecordSink, SinkError, CSV_COLUMNS};

pub const CRATE_NAME: &str = "mpscout-storage";

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed store for debug screenshots captured when a detail view misbehaves.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn snapshot_relative_path(
        &self,
        captured_at: DateTime<Utc>,
        label: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = captured_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "png" } else { ext };
        PathBuf::from(day)
            .join(sanitize_label(label))
            .join(format!("{content_hash}.{ext}"))
    }

    /// Writes bytes under a hash-addressed path via an atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        captured_at: DateTime<Utc>,
        label: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.snapshot_relative_path(captured_at, label, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let stored = |deduplicated| StoredSnapshot {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        write_temp_file(&temp_path, bytes).await?;

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp snapshot {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

async fn write_temp_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("opening temp snapshot file {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp snapshot file {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp snapshot file {}", path.display()))?;
    Ok(())
}

fn sanitize_label(label: &str) -> String {
    let cleaned = label
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect::<String>();
    let cleaned = cleaned.trim_matches('-');
    if cleaned.is_empty() {
        "unlabeled".to_string()
    } else {
        cleaned.to_string()
    }
}
