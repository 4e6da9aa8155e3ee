//! Append-only JSONL history log with monotonic message ids.
//!
//! The log keeps an in-memory cache of all messages behind a `RwLock`; the
//! file on disk is the source of truth across restarts. Appends are atomic
//! at the granularity of a single line write. Damaged lines are skipped on
//! load rather than failing the whole log.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::warn;
use tokio::sync::RwLock;

use crate::context::estimate_tokens;

use super::{Message, NewMessage};

/// Aggregate statistics over a thread's history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryStats {
    pub count: usize,
    pub total_tokens: usize,
}

struct LogState {
    messages: Vec<Message>,
    next_id: u64,
}

/// Append-only sequence of [`Message`]s for one thread.
pub struct HistoryLog {
    path: PathBuf,
    home: PathBuf,
    state: RwLock<LogState>,
}

impl HistoryLog {
    /// Open (or lazily create) the log at `path`. Relative attachment paths
    /// in read results are resolved against `home`.
    pub fn open(path: PathBuf, home: PathBuf) -> Result<Self> {
        let mut messages = Vec::new();
        let mut next_id = 1u64;

        if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading history log {}", path.display()))?;
            for (lineno, line) in raw.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Message>(line) {
                    Ok(message) => {
                        next_id = next_id.max(message.id + 1);
                        messages.push(message);
                    }
                    Err(err) => {
                        warn!(
                            "skipping damaged history line {} in {}: {err}",
                            lineno + 1,
                            path.display()
                        );
                    }
                }
            }
        }

        Ok(Self {
            path,
            home,
            state: RwLock::new(LogState { messages, next_id }),
        })
    }

    /// Append a message, assigning the next id, and return the stored copy.
    pub async fn append(&self, new: NewMessage) -> Result<Message> {
        let mut state = self.state.write().await;
        let message = Message {
            id: state.next_id,
            role: new.role,
            content: new.content,
            timestamp: super::now_millis(),
            tokens: new.tokens,
            metadata: new.metadata,
            attachments: new.attachments,
        };

        let line = serde_json::to_string(&message).context("serializing history message")?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating history directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening history log {}", self.path.display()))?;
        writeln!(file, "{line}").context("appending history message")?;

        state.next_id += 1;
        state.messages.push(message.clone());
        Ok(self.resolve(message))
    }

    /// The most recent `n` messages in conversational order.
    pub async fn get_recent(&self, n: usize) -> Vec<Message> {
        let state = self.state.read().await;
        let start = state.messages.len().saturating_sub(n);
        state.messages[start..]
            .iter()
            .cloned()
            .map(|message| self.resolve(message))
            .collect()
    }

    /// Every message in conversational order.
    pub async fn get_all(&self) -> Vec<Message> {
        let state = self.state.read().await;
        state
            .messages
            .iter()
            .cloned()
            .map(|message| self.resolve(message))
            .collect()
    }

    pub async fn get_stats(&self) -> HistoryStats {
        let state = self.state.read().await;
        let total_tokens = state
            .messages
            .iter()
            .map(|message| {
                message
                    .tokens
                    .map(|tokens| tokens as usize)
                    .unwrap_or_else(|| estimate_tokens(&message.content))
            })
            .sum();
        HistoryStats {
            count: state.messages.len(),
            total_tokens,
        }
    }

    /// Case-insensitive substring search over message content.
    pub async fn search(&self, query: &str) -> Vec<Message> {
        let needle = query.to_lowercase();
        let state = self.state.read().await;
        state
            .messages
            .iter()
            .filter(|message| message.content.to_lowercase().contains(&needle))
            .cloned()
            .map(|message| self.resolve(message))
            .collect()
    }

    /// Drop the message with `id` and everything after it, rewriting the
    /// file. Returns the number of removed messages.
    pub async fn truncate_from(&self, id: u64) -> Result<usize> {
        let mut state = self.state.write().await;
        let keep = state
            .messages
            .iter()
            .position(|message| message.id >= id)
            .unwrap_or(state.messages.len());
        let removed = state.messages.len() - keep;
        if removed == 0 {
            return Ok(0);
        }
        state.messages.truncate(keep);

        let mut out = String::new();
        for message in &state.messages {
            out.push_str(&serde_json::to_string(message).context("serializing history message")?);
            out.push('\n');
        }
        fs::write(&self.path, out)
            .with_context(|| format!("rewriting history log {}", self.path.display()))?;
        Ok(removed)
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    fn resolve(&self, mut message: Message) -> Message {
        message.attachments = message
            .attachments
            .iter()
            .map(|attachment| attachment.resolved(&self.home))
            .collect();
        message
    }
}
