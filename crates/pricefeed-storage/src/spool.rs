use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SpooledLetter {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub deduplicated: bool,
}

/// Filesystem dead-letter channel. Letters are addressed by content hash, so a
/// message dead-lettered on every redelivery is stored once per day.
#[derive(Debug, Clone)]
pub struct DeadLetterSpool {
    root: PathBuf,
}

impl DeadLetterSpool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn letter_relative_path(&self, received_at: DateTime<Utc>, content_hash: &str) -> PathBuf {
        PathBuf::from(received_at.format("%Y%m%d").to_string()).join(format!("{content_hash}.json"))
    }

    /// A letter already spooled today is not rewritten. New letters land via a
    /// temp file and rename, so readers never see partial files; two writers
    /// racing on the same hash rename identical bytes.
    pub async fn store(
        &self,
        received_at: DateTime<Utc>,
        bytes: &[u8],
    ) -> anyhow::Result<SpooledLetter> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.letter_relative_path(received_at, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let day_dir = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&day_dir)
            .await
            .with_context(|| format!("creating spool directory {}", day_dir.display()))?;

        let deduplicated = fs::try_exists(&absolute_path).await.unwrap_or(false);
        if !deduplicated {
            let temp_path = day_dir.join(format!(".{content_hash}.{}.tmp", Uuid::new_v4()));
            fs::write(&temp_path, bytes)
                .await
                .with_context(|| format!("writing {}", temp_path.display()))?;
            if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err).with_context(|| format!("moving letter to {}", absolute_path.display()));
            }
        }

        Ok(SpooledLetter {
            content_hash,
            relative_path,
            absolute_path,
            deduplicated,
        })
    }
}
