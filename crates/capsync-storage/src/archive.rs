use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use capsync_core::EndpointFamily;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Location of one archived provider response.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw response bodies, laid out as
/// `<family>/<YYYY-MM-DD>/<sha256>.<ext>`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn relative_path_for(
        fetched_at: DateTime<Utc>,
        family: EndpointFamily,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        PathBuf::from(family.as_str())
            .join(fetched_at.format("%Y-%m-%d").to_string())
            .join(format!("{content_hash}.{ext}"))
    }

    /// Archives `bytes` once per (family, day, content). Re-archiving identical
    /// content is a no-op reported as `deduplicated`.
    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        family: EndpointFamily,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path_for(fetched_at, family, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let written = write_once(&absolute_path, bytes)
            .await
            .with_context(|| format!("archiving response to {}", absolute_path.display()))?;

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: !written,
        })
    }
}

/// Writes through a sibling temp file and a rename so readers never observe a
/// partial file. Returns `false` when the target already existed.
async fn write_once(target: &Path, bytes: &[u8]) -> std::io::Result<bool> {
    let parent = target
        .parent()
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "archive path has no parent"))?;
    fs::create_dir_all(parent).await?;

    if fs::try_exists(target).await? {
        return Ok(false);
    }

    let temp_path = parent.join(format!(".{}.partial", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    let staged = match file.write_all(bytes).await {
        Ok(()) => file.flush().await,
        Err(err) => Err(err),
    };
    drop(file);

    if let Err(err) = staged {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }

    match fs::rename(&temp_path, target).await {
        Ok(()) => Ok(true),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            if err.kind() == ErrorKind::AlreadyExists {
                Ok(false)
            } else {
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn noon() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(
            ArtifactStore::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn paths_group_by_family_and_day() {
        let path = ArtifactStore::relative_path_for(noon(), EndpointFamily::Metadata, "abc", ".json");
        assert_eq!(path, PathBuf::from("metadata/2026-02-24/abc.json"));

        let bare = ArtifactStore::relative_path_for(noon(), EndpointFamily::Asset, "abc", "");
        assert_eq!(bare, PathBuf::from("asset/2026-02-24/abc.bin"));
    }

    #[tokio::test]
    async fn identical_responses_are_archived_once() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let body = br#"{"status":{"error_code":0},"data":[]}"#;

        let first = store
            .archive(noon(), EndpointFamily::Directory, "json", body)
            .await
            .expect("first archive");
        let second = store
            .archive(noon(), EndpointFamily::Directory, "json", body)
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert_eq!(
            std::fs::read(&first.absolute_path).expect("archived file"),
            body.to_vec()
        );

        let leftovers = std::fs::read_dir(first.absolute_path.parent().expect("parent"))
            .expect("list")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".partial"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
