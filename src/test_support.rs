use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::record::Record;

static NEXT_DIR: AtomicUsize = AtomicUsize::new(0);

/// Scratch directory under the OS temp dir, removed on drop.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new(label: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "hncrawler-{label}-{}-{}",
            std::process::id(),
            NEXT_DIR.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_dir_all(&path);
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

pub fn sample_record(id: &str, page: u32) -> Record {
    Record {
        id: id.to_string(),
        title: format!("Story {id}"),
        page,
        rank: 1,
        link: format!("https://example.com/{id}"),
        score: Some(42),
        age: "1 hour ago".to_string(),
        comment_count: 7,
        updated_at: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default(),
    }
}
