use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Where a raw page ended up and whether an identical copy was already there.
#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub digest: String,
    pub location: PathBuf,
    pub bytes: usize,
    pub reused: bool,
}

/// Raw source pages kept on disk as `<dataset>/<yyyymmdd>/<sha256>.<ext>`.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

pub fn payload_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a page relative to the archive root.
    pub fn page_location(dataset_id: &str, fetched_at: DateTime<Utc>, digest: &str, extension: &str) -> PathBuf {
        let extension = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        let mut location = PathBuf::from(dataset_id);
        location.push(fetched_at.format("%Y%m%d").to_string());
        location.push(format!("{digest}.{extension}"));
        location
    }

    pub async fn archive_page(
        &self,
        fetched_at: DateTime<Utc>,
        dataset_id: &str,
        extension: &str,
        payload: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let digest = payload_digest(payload);
        let location = Self::page_location(dataset_id, fetched_at, &digest, extension);
        let target = self.root.join(&location);

        let reused = if fs::try_exists(&target).await.unwrap_or(false) {
            true
        } else {
            !write_once(&target, payload).await?
        };

        Ok(ArchivedPage {
            digest,
            location,
            bytes: payload.len(),
            reused,
        })
    }
}

/// Writes `payload` to `target` through a sibling temp file. Returns false
/// when another writer got there first.
async fn write_once(target: &Path, payload: &[u8]) -> anyhow::Result<bool> {
    let dir = target.parent().context("archive target has no parent directory")?;
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating archive directory {}", dir.display()))?;

    let staging = dir.join(format!(".{}.part", Uuid::new_v4()));
    let mut file = fs::File::create(&staging)
        .await
        .with_context(|| format!("creating {}", staging.display()))?;
    file.write_all(payload)
        .await
        .with_context(|| format!("writing {}", staging.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing {}", staging.display()))?;
    drop(file);

    let renamed = fs::rename(&staging, target).await;
    if renamed.is_err() {
        let _ = fs::remove_file(&staging).await;
    }
    match renamed {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("moving page into {}", target.display())),
    }
}
