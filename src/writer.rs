use std::path::PathBuf;
use url::Url;

use crate::record::Record;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Invalid snapshot URL: {0}")]
    InvalidUrl(String),
    #[error("Failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Writes the full record set of one page to a JSON file addressed by the
/// page URL. Every write replaces the previous file.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    root: PathBuf,
}

impl SnapshotWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `https://news.ycombinator.com/news?p=1` maps to
    /// `<root>/news.ycombinator.com/news?p=1.json`.
    pub fn snapshot_path(&self, url: &str) -> Result<PathBuf, SnapshotError> {
        let parsed = Url::parse(url).map_err(|_| SnapshotError::InvalidUrl(url.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| SnapshotError::InvalidUrl(url.to_string()))?;

        let mut path = self.root.join(host);
        let segments: Vec<&str> = parsed
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..").collect())
            .unwrap_or_default();

        let (dirs, file) = match segments.split_last() {
            Some((last, dirs)) => (dirs, (*last).to_string()),
            None => (&[][..], "index".to_string()),
        };
        for dir in dirs {
            path.push(dir);
        }

        let file = match parsed.query() {
            Some(query) => format!("{file}?{}.json", query.replace('/', "_")),
            None => format!("{file}.json"),
        };
        path.push(file);
        Ok(path)
    }

    pub async fn write_snapshot(&self, url: &str, records: &[Record]) -> Result<PathBuf, SnapshotError> {
        let path = self.snapshot_path(url)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| SnapshotError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let json = serde_json::to_vec_pretty(records)?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|source| SnapshotError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}
