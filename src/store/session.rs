//! Per-thread session records.
//!
//! A session identifier links the messages of related turns; it is
//! established once per thread open and reused until the thread is torn
//! down. Exchange updates are best-effort bookkeeping appended to the
//! session file; callers treat failures as non-fatal.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::now_millis;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    session_id: String,
    #[serde(rename = "type")]
    kind: String,
    timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    assistant: Option<String>,
}

/// Session log for one thread.
pub struct SessionStore {
    path: PathBuf,
    current: RwLock<Option<String>>,
}

impl SessionStore {
    pub fn open(path: PathBuf) -> Self {
        Self {
            path,
            current: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// The session id for this thread, resuming the last recorded session
    /// or starting a fresh one.
    pub async fn session_id(&self) -> Result<String> {
        {
            let current = self.current.read().await;
            if let Some(id) = current.as_ref() {
                return Ok(id.clone());
            }
        }

        let mut current = self.current.write().await;
        if let Some(id) = current.as_ref() {
            return Ok(id.clone());
        }

        let resumed = self.last_session_id()?;
        let id = match resumed {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                self.append_record(&SessionRecord {
                    session_id: id.clone(),
                    kind: "started".to_string(),
                    timestamp: now_millis(),
                    user: None,
                    assistant: None,
                })?;
                id
            }
        };
        *current = Some(id.clone());
        Ok(id)
    }

    /// Record the latest user/assistant exchange for the current session.
    pub async fn update_exchange(&self, user: &str, assistant: &str) -> Result<()> {
        let session_id = self.session_id().await?;
        self.append_record(&SessionRecord {
            session_id,
            kind: "exchange".to_string(),
            timestamp: now_millis(),
            user: Some(truncate_for_record(user)),
            assistant: Some(truncate_for_record(assistant)),
        })
    }

    fn last_session_id(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("reading session store {}", self.path.display()))?;
        Ok(raw
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str::<SessionRecord>(line).ok())
            .map(|record| record.session_id)
            .next())
    }

    fn append_record(&self, record: &SessionRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating session directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening session store {}", self.path.display()))?;
        writeln!(
            file,
            "{}",
            serde_json::to_string(record).context("serializing session record")?
        )
        .context("appending session record")?;
        Ok(())
    }
}

/// Exchange records keep a bounded preview, not the full body.
fn truncate_for_record(text: &str) -> String {
    const MAX: usize = 2000;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut cut = MAX;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn session_id_is_stable_within_a_store() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path().join("t1.sessions"));
        let first = store.session_id().await.unwrap();
        let second = store.session_id().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn session_id_resumes_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t1.sessions");
        let original = {
            let store = SessionStore::open(path.clone());
            store.session_id().await.unwrap()
        };
        let store = SessionStore::open(path);
        assert_eq!(store.session_id().await.unwrap(), original);
    }

    #[tokio::test]
    async fn update_exchange_appends_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t1.sessions");
        let store = SessionStore::open(path.clone());
        store.update_exchange("hi", "hello").await.unwrap();
        store.update_exchange("more", "sure").await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let exchanges = raw
            .lines()
            .filter(|line| line.contains("\"exchange\""))
            .count();
        assert_eq!(exchanges, 2);
    }
}
