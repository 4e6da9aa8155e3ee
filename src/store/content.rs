//! Key-addressed blob store for externalized message content.
//!
//! Large inline bodies are swapped for `[STORED:<id>]` sentinels whose
//! bodies live here, one file per blob under the thread's `.content`
//! directory. Ids are content-addressed so re-storing the same body is a
//! no-op.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Blob store backing one thread's externalized content.
pub struct ContentStore {
    dir: PathBuf,
}

impl ContentStore {
    pub fn open(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Store a blob and return its id.
    pub async fn put(&self, blob: &str) -> Result<String> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating content store {}", self.dir.display()))?;
        let id = blob_id(blob);
        let path = self.blob_path(&id);
        if !path.exists() {
            fs::write(&path, blob)
                .with_context(|| format!("writing content blob {}", path.display()))?;
        }
        Ok(id)
    }

    /// Fetch a blob by id.
    pub async fn get(&self, id: &str) -> Result<String> {
        let path = self.blob_path(id);
        fs::read_to_string(&path)
            .with_context(|| format!("content blob {id} not found in {}", self.dir.display()))
    }

    /// Ids of blobs whose body contains `query` (case-insensitive).
    pub async fn search(&self, query: &str) -> Result<Vec<String>> {
        let needle = query.to_lowercase();
        let mut hits = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(hits), // store not created yet
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|ext| ext == "txt").unwrap_or(false) {
                if let Ok(body) = fs::read_to_string(&path) {
                    if body.to_lowercase().contains(&needle) {
                        if let Some(stem) = path.file_stem() {
                            hits.push(stem.to_string_lossy().into_owned());
                        }
                    }
                }
            }
        }
        hits.sort();
        Ok(hits)
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.txt"))
    }
}

fn blob_id(blob: &str) -> String {
    let mut hasher = DefaultHasher::new();
    blob.hash(&mut hasher);
    blob.len().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path().join("t1.content"));
        let id = store.put("a large body").await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), "a large body");
    }

    #[tokio::test]
    async fn put_is_stable_for_identical_blobs() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path().join("t1.content"));
        let first = store.put("same").await.unwrap();
        let second = store.put("same").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn search_finds_matching_blobs() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path().join("t1.content"));
        let wanted = store.put("the Deployment log").await.unwrap();
        store.put("unrelated").await.unwrap();
        let hits = store.search("deployment").await.unwrap();
        assert_eq!(hits, vec![wanted]);
    }

    #[tokio::test]
    async fn search_on_missing_store_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path().join("nope.content"));
        assert!(store.search("x").await.unwrap().is_empty());
    }
}
