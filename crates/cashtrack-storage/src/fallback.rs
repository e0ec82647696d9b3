//! Write-once JSON capture for scrape results the history database refused.

use std::path::{Path, PathBuf};

use cashtrack_core::ExtractionResult;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::StoreError;

#[derive(Debug, Clone)]
pub struct StoredFallback {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct FallbackStore {
    root: PathBuf,
}

impl FallbackStore {
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

    /// `<YYYYmmdd_HHMMSS>/<merchant-slug>/<hash>.json`
    pub fn relative_path_for(
        &self,
        failed_at: DateTime<Utc>,
        merchant_name: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = failed_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(merchant_slug(merchant_name))
            .join(format!("{content_hash}.json"))
    }

    /// Writes the full result as pretty JSON through a temp file and rename.
    /// An identical payload already on disk is reported as deduplicated.
    pub async fn store(
        &self,
        failed_at: DateTime<Utc>,
        result: &ExtractionResult,
    ) -> Result<StoredFallback, StoreError> {
        let bytes = serde_json::to_vec_pretty(result)?;
        let content_hash = Self::sha256_hex(&bytes);
        let relative_path = self.relative_path_for(failed_at, &result.merchant_name, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let Some(parent) = absolute_path.parent().map(Path::to_path_buf) else {
            return Err(StoreError::io(&absolute_path, std::io::ErrorKind::InvalidInput.into()));
        };

        fs::create_dir_all(&parent)
            .await
            .map_err(|e| StoreError::io(&parent, e))?;

        let stored = |deduplicated| StoredFallback {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .map_err(|e| StoreError::io(&absolute_path, e))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => {
                info!(path = %absolute_path.display(), merchant = %result.merchant_name, "scrape result captured to fallback");
                Ok(stored(false))
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                warn!(path = %absolute_path.display(), error = %err, "fallback rename failed");
                Err(StoreError::io(&absolute_path, err))
            }
        }
    }
}

fn merchant_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_alphanumeric() {
            slug.extend(ch.to_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "unknown".to_string()
    } else {
        slug.to_string()
    }
}
