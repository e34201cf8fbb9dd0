use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use async_trait::async_trait;
use capsync_core::{EndpointFamily, PageWindow};
use serde_json::Value;
use tracing::warn;

use crate::envelope::{into_keyed_records, into_records, parse_envelope};
use crate::{FeedError, MarketFeed};

/// Replays recorded provider responses from a directory:
///
/// ```text
/// <root>/map.json        directory envelope (all entries)
/// <root>/info.json       metadata envelope keyed by id
/// <root>/listings.json   listings envelope (all entries)
/// <root>/assets/<name>   logo bytes, looked up by the URL's last path segment
/// ```
///
/// Missing envelope files replay as empty responses. Pagination and batching
/// are applied in memory so the pipeline sees the same shapes as live.
/// [`FixtureFeed::from_archive`] loads the same state from a raw response
/// archive instead.
#[derive(Debug, Clone)]
pub struct FixtureFeed {
    root: PathBuf,
    directory: Vec<Value>,
    metadata: BTreeMap<String, Value>,
    listings: Vec<Value>,
}

impl FixtureFeed {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            anyhow::bail!("fixture directory {} does not exist", root.display());
        }

        let directory = match read_envelope(&root.join("map.json"), EndpointFamily::Directory)? {
            Some(data) => into_records(EndpointFamily::Directory, data)?,
            None => Vec::new(),
        };
        let metadata = match read_envelope(&root.join("info.json"), EndpointFamily::Metadata)? {
            Some(data) => into_keyed_records(EndpointFamily::Metadata, data)?,
            None => BTreeMap::new(),
        };
        let listings = match read_envelope(&root.join("listings.json"), EndpointFamily::Listings)? {
            Some(data) => into_records(EndpointFamily::Listings, data)?,
            None => Vec::new(),
        };

        Ok(Self {
            root,
            directory,
            metadata,
            listings,
        })
    }

    /// Replays a raw response archive (`<family>/<YYYY-MM-DD>/<sha256>.json`,
    /// as written by the live feed's archive). All envelopes of a family are
    /// merged by record id and the newest day wins. Archived provider error
    /// responses are skipped. Logos are archived by content hash and cannot
    /// be found from a URL, so assets still resolve from `<root>/assets/`.
    pub fn from_archive(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            anyhow::bail!("archive directory {} does not exist", root.display());
        }

        let directory = archived_records(&root, EndpointFamily::Directory)?;
        let listings = archived_records(&root, EndpointFamily::Listings)?;
        let mut metadata = BTreeMap::new();
        for path in archived_envelopes(&root, EndpointFamily::Metadata)? {
            if let Some(data) = read_archived(&path, EndpointFamily::Metadata)? {
                metadata.extend(into_keyed_records(EndpointFamily::Metadata, data)?);
            }
        }

        Ok(Self {
            root,
            directory,
            metadata,
            listings,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn directory_len(&self) -> usize {
        self.directory.len()
    }
}

fn read_envelope(path: &Path, family: EndpointFamily) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let body = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let data = parse_envelope(family, &body).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(data))
}

/// Archived envelopes of one family, oldest first.
fn archived_envelopes(root: &Path, family: EndpointFamily) -> Result<Vec<PathBuf>> {
    let family_dir = root.join(family.as_str());
    if !family_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut found: Vec<(String, SystemTime, PathBuf)> = Vec::new();
    for day in fs::read_dir(&family_dir).with_context(|| format!("listing {}", family_dir.display()))? {
        let day = day?.path();
        if !day.is_dir() {
            continue;
        }
        let day_name = day
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        for entry in fs::read_dir(&day).with_context(|| format!("listing {}", day.display()))? {
            let path = entry?.path();
            // skips in-flight `.partial` files
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let modified = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((day_name.clone(), modified, path));
        }
    }
    found.sort();
    Ok(found.into_iter().map(|(_, _, path)| path).collect())
}

fn read_archived(path: &Path, family: EndpointFamily) -> Result<Option<Value>> {
    let body = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    match parse_envelope(family, &body) {
        Ok(data) => Ok(Some(data)),
        Err(FeedError::Status { code, message }) => {
            warn!(path = %path.display(), code, %message, "skipping archived error response");
            Ok(None)
        }
        Err(err) => Err(err).with_context(|| format!("parsing {}", path.display())),
    }
}

/// Merges list envelopes by `id`, ordered by id. Entries without a numeric id
/// are kept after the keyed ones so the pipeline can reject them.
fn archived_records(root: &Path, family: EndpointFamily) -> Result<Vec<Value>> {
    let mut keyed = BTreeMap::new();
    let mut unkeyed = Vec::new();
    for path in archived_envelopes(root, family)? {
        let Some(data) = read_archived(&path, family)? else {
            continue;
        };
        for record in into_records(family, data)? {
            match record.get("id").and_then(Value::as_i64) {
                Some(id) => {
                    keyed.insert(id, record);
                }
                None => unkeyed.push(record),
            }
        }
    }
    Ok(keyed.into_values().chain(unkeyed).collect())
}

fn window_slice(records: &[Value], window: PageWindow) -> Vec<Value> {
    let from = window.start.saturating_sub(1).min(records.len());
    let to = from.saturating_add(window.limit).min(records.len());
    records[from..to].to_vec()
}

#[async_trait]
impl MarketFeed for FixtureFeed {
    fn feed_id(&self) -> &'static str {
        "fixture"
    }

    async fn directory_page(&self, window: PageWindow) -> Result<Vec<Value>, FeedError> {
        Ok(window_slice(&self.directory, window))
    }

    async fn metadata_batch(&self, ids: &[i64]) -> Result<BTreeMap<String, Value>, FeedError> {
        Ok(ids
            .iter()
            .map(i64::to_string)
            .filter_map(|id| self.metadata.get(&id).cloned().map(|record| (id, record)))
            .collect())
    }

    async fn listings_page(&self, window: PageWindow) -> Result<Vec<Value>, FeedError> {
        Ok(window_slice(&self.listings, window))
    }

    async fn fetch_asset(&self, url: &str) -> Result<Vec<u8>, FeedError> {
        let name = url
            .split(['?', '#'])
            .next()
            .and_then(|path| path.rsplit('/').next())
            .filter(|name| !name.is_empty() && *name != "." && *name != "..")
            .ok_or_else(|| FeedError::AssetNotFound(url.to_string()))?;
        let path = self.root.join("assets").join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(FeedError::AssetNotFound(url.to_string()))
            }
            Err(err) => Err(FeedError::Fixture {
                path,
                reason: err.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsync_storage::ArtifactStore;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tempfile::tempdir;

    fn entries(n: i64) -> Vec<Value> {
        (1..=n).map(|id| json!({"id": id})).collect()
    }

    #[test]
    fn windows_slice_one_based_and_clamp_at_the_end() {
        let records = entries(7);
        let page = |start, limit| {
            window_slice(&records, PageWindow { index: 0, start, limit })
                .iter()
                .map(|record| record["id"].as_i64().unwrap())
                .collect::<Vec<_>>()
        };

        assert_eq!(page(1, 3), vec![1, 2, 3]);
        assert_eq!(page(7, 3), vec![7]);
        assert!(page(8, 3).is_empty());
        assert!(page(100, 3).is_empty());
    }

    #[tokio::test]
    async fn missing_files_replay_as_empty_and_assets_resolve_by_name() {
        let dir = tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("assets")).unwrap();
        fs::write(dir.path().join("assets").join("1.png"), [0x89, b'P', b'N', b'G']).unwrap();
        fs::write(
            dir.path().join("info.json"),
            r#"{"status":{"error_code":0},"data":{"1":{"id":1,"name":"Bitcoin"}}}"#,
        )
        .unwrap();

        let feed = FixtureFeed::open(dir.path()).expect("open");
        assert_eq!(feed.directory_len(), 0);

        let batch = feed.metadata_batch(&[1, 2]).await.unwrap();
        assert_eq!(batch.keys().collect::<Vec<_>>(), vec!["1"]);

        let logo = feed
            .fetch_asset("https://s2.coinmarketcap.com/static/img/coins/64x64/1.png")
            .await
            .unwrap();
        assert_eq!(logo, vec![0x89, b'P', b'N', b'G']);

        let missing = feed.fetch_asset("https://example.org/404.png").await.unwrap_err();
        assert!(matches!(missing, FeedError::AssetNotFound(_)));
    }

    #[tokio::test]
    async fn unreadable_asset_is_a_fixture_error_not_a_missing_logo() {
        let dir = tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("assets").join("2.png")).unwrap();

        let feed = FixtureFeed::open(dir.path()).expect("open");
        let err = feed
            .fetch_asset("https://s2.coinmarketcap.com/static/img/coins/64x64/2.png")
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Fixture { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn archive_replays_merged_envelopes_with_newest_day_winning() {
        let dir = tempdir().expect("tempdir");
        let archive = ArtifactStore::new(dir.path());
        let day = |d| Utc.with_ymd_and_hms(2024, 3, d, 12, 0, 0).unwrap();

        archive
            .archive(
                day(1),
                EndpointFamily::Directory,
                "json",
                br#"{"status":{"error_code":0},"data":[{"id":2,"name":"Old"},{"id":1,"name":"Bitcoin"}]}"#,
            )
            .await
            .unwrap();
        archive
            .archive(
                day(2),
                EndpointFamily::Directory,
                "json",
                br#"{"status":{"error_code":0},"data":[{"id":2,"name":"Litecoin"},{"id":3,"name":"Namecoin"}]}"#,
            )
            .await
            .unwrap();
        archive
            .archive(
                day(2),
                EndpointFamily::Directory,
                "json",
                br#"{"status":{"error_code":1008,"error_message":"rate limited"}}"#,
            )
            .await
            .unwrap();
        archive
            .archive(
                day(2),
                EndpointFamily::Metadata,
                "json",
                br#"{"status":{"error_code":0},"data":{"1":{"id":1,"name":"Bitcoin"}}}"#,
            )
            .await
            .unwrap();

        let feed = FixtureFeed::from_archive(dir.path()).expect("from_archive");
        let page = feed
            .directory_page(PageWindow { index: 0, start: 1, limit: 10 })
            .await
            .unwrap();
        let names: Vec<_> = page.iter().map(|record| record["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["Bitcoin", "Litecoin", "Namecoin"]);

        let batch = feed.metadata_batch(&[1, 3]).await.unwrap();
        assert_eq!(batch.keys().collect::<Vec<_>>(), vec!["1"]);
        assert!(feed.listings_page(PageWindow { index: 0, start: 1, limit: 10 }).await.unwrap().is_empty());
    }

    #[test]
    fn provider_errors_in_recordings_fail_open() {
        let dir = tempdir().expect("tempdir");
        fs::write(
            dir.path().join("map.json"),
            r#"{"status":{"error_code":1002,"error_message":"API key missing."}}"#,
        )
        .unwrap();

        let err = FixtureFeed::open(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("API key missing."));
    }
}
