//! Durable per-thread state: message model, history log, content store, and
//! session store.
//!
//! Each thread owns one history log (`<root>/<name>.jsonl`), one content
//! store (`<root>/<name>.content/`) and one session store
//! (`<root>/<name>.sessions`). All three are plain files under the threads
//! root so they survive host restarts and can be handed to spawned tools by
//! absolute path.

mod content;
mod history;
mod session;

pub use content::ContentStore;
pub use history::{HistoryLog, HistoryStats};
pub use session::SessionStore;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Conversational role of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    User,
    Assistant,
    SystemMarker,
}

/// Kind of an attachment carried on a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
}

/// A file or image attached to a message.
///
/// `stored_path` may be recorded relative to the thread's home directory;
/// read paths resolve it to an absolute path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub stored_path: String,
    pub kind: AttachmentKind,
    pub mime_type: String,
}

impl Attachment {
    /// Resolve the stored path against a thread home if it is relative.
    pub fn resolved(&self, home: &Path) -> Attachment {
        let mut resolved = self.clone();
        let path = Path::new(&self.stored_path);
        if path.is_relative() {
            resolved.stored_path = home.join(path).to_string_lossy().into_owned();
        }
        resolved
    }
}

/// Free-form metadata carried on a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_snapshot: Option<String>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.git_snapshot.is_none()
    }
}

/// One immutable entry of a thread's conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Monotonically assigned by the history log; never reused.
    pub id: u64,
    pub role: Role,
    /// UTF-8 text, possibly containing `[STORED:<id>]` sentinels.
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

/// A message as handed to the history log, before an id is assigned.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub tokens: Option<u32>,
    pub metadata: Option<MessageMetadata>,
    pub attachments: Vec<Attachment>,
}

impl NewMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tokens: None,
            metadata: None,
            attachments: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Path helpers for the per-thread file layout under the threads root.
pub fn history_path(root: &Path, name: &str) -> PathBuf {
    root.join(format!("{name}.jsonl"))
}

pub fn content_dir(root: &Path, name: &str) -> PathBuf {
    root.join(format!("{name}.content"))
}

pub fn sessions_path(root: &Path, name: &str) -> PathBuf {
    root.join(format!("{name}.sessions"))
}
