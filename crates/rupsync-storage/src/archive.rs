//! Content-addressed archive of raw endpoint payloads and detail pages.

use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub sha256: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The same bytes were already archived for this channel and day.
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn digest(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `<channel>/<yyyymmdd>/<sha256>.<ext>`
    pub fn relative_path_for(
        channel: &str,
        fetched_at: DateTime<Utc>,
        sha256: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        PathBuf::from(channel)
            .join(fetched_at.format("%Y%m%d").to_string())
            .join(format!("{sha256}.{ext}"))
    }

    pub async fn archive(
        &self,
        channel: &str,
        fetched_at: DateTime<Utc>,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let sha256 = Self::digest(bytes);
        let relative_path = Self::relative_path_for(channel, fetched_at, &sha256, extension);
        let absolute_path = self.root.join(&relative_path);
        let Some(dir) = absolute_path.parent() else {
            bail!("archive path {} has no parent", absolute_path.display());
        };

        let payload = |reused| ArchivedPayload {
            sha256: sha256.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            reused,
        };

        if fs::try_exists(&absolute_path).await.unwrap_or(false) {
            return Ok(payload(true));
        }

        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        let staging = dir.join(format!(".{}.partial", Uuid::new_v4()));
        fs::write(&staging, bytes)
            .await
            .with_context(|| format!("writing {}", staging.display()))?;

        if let Err(err) = fs::rename(&staging, &absolute_path).await {
            let _ = fs::remove_file(&staging).await;
            if fs::try_exists(&absolute_path).await.unwrap_or(false) {
                return Ok(payload(true));
            }
            return Err(err).with_context(|| {
                format!("moving {} into {}", staging.display(), absolute_path.display())
            });
        }

        Ok(payload(false))
    }
}
