//! A named, durable conversation thread.
//!
//! Each thread ties together its history log, content store, and session
//! store under the threads root, plus a tool-config file handed to every
//! subprocess spawned for the thread. Threads are created lazily on first
//! reference and persist across host restarts; teardown releases in-memory
//! caches and removes the tool-config file but never on-disk state.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};
use serde_json::json;

use crate::store::{self, ContentStore, HistoryLog, SessionStore};

/// One conversation thread and its on-disk stores.
pub struct Thread {
    name: String,
    root: PathBuf,
    project_path: Option<PathBuf>,
    tool_config_path: PathBuf,
    base_url: String,
    pub history: HistoryLog,
    pub content: ContentStore,
    pub sessions: SessionStore,
}

impl Thread {
    /// Open (or create) the thread named `name` under `root`.
    ///
    /// `base_url` is the host's local control API base URL, exported to the
    /// agent tool server via the tool-config file.
    pub fn open(
        name: &str,
        root: &Path,
        project_path: Option<PathBuf>,
        base_url: &str,
    ) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("creating threads root {}", root.display()))?;

        let history = HistoryLog::open(store::history_path(root, name), root.to_path_buf())?;
        let content = ContentStore::open(store::content_dir(root, name));
        let sessions = SessionStore::open(store::sessions_path(root, name));
        let tool_config_path = unique_tool_config_path(root)?;

        let thread = Self {
            name: name.to_string(),
            root: root.to_path_buf(),
            project_path,
            tool_config_path,
            base_url: base_url.to_string(),
            history,
            content,
            sessions,
        };
        thread.ensure_tool_config()?;
        Ok(thread)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn home(&self) -> &Path {
        &self.root
    }

    pub fn project_path(&self) -> Option<&Path> {
        self.project_path.as_deref()
    }

    /// Directory the subprocess runs in: the project path, else user home.
    pub fn working_dir(&self) -> PathBuf {
        self.project_path
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn tool_config_path(&self) -> &Path {
        &self.tool_config_path
    }

    /// Write the tool-config file if it is missing.
    ///
    /// Spawned subprocesses read it by absolute path, so it must exist
    /// regardless of the host's own working directory.
    pub fn ensure_tool_config(&self) -> Result<()> {
        if self.tool_config_path.exists() {
            return Ok(());
        }

        let document = json!({
            "mcpServers": {
                "conversation": {
                    "command": "cumulus-conversation-mcp",
                    "args": [
                        "--history", absolute(&store::history_path(&self.root, &self.name)),
                        "--content", absolute(self.content.dir()),
                        "--sessions", absolute(self.sessions.path()),
                    ],
                },
                "agents": {
                    "command": "cumulus-agent-mcp",
                    "env": {
                        "CUMULUS_BASE_URL": self.base_url,
                        "CUMULUS_AGENT_NAME": self.name,
                    },
                },
            },
        });

        if let Some(parent) = self.tool_config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("creating tool-config directory {}", parent.display())
            })?;
        }
        fs::write(
            &self.tool_config_path,
            serde_json::to_string_pretty(&document).context("serializing tool config")?,
        )
        .with_context(|| {
            format!(
                "writing tool config {}",
                self.tool_config_path.display()
            )
        })?;
        debug!(
            "wrote tool config for thread {} at {}",
            self.name,
            self.tool_config_path.display()
        );
        Ok(())
    }

    /// Release the thread's process-scoped resources. On-disk history,
    /// content, and sessions are left untouched.
    pub fn teardown(&self) {
        if self.tool_config_path.exists() {
            if let Err(err) = fs::remove_file(&self.tool_config_path) {
                warn!(
                    "failed to remove tool config {}: {err}",
                    self.tool_config_path.display()
                );
            }
        }
    }
}

/// Tool-config files live next to the threads root and are regenerated per
/// process; the timestamp is bumped until the path is free so two threads
/// opened in the same millisecond never share one.
fn unique_tool_config_path(root: &Path) -> Result<PathBuf> {
    let parent = root
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.to_path_buf());
    let mut stamp = store::now_millis();
    loop {
        let candidate = parent.join(format!("mcp-config-{stamp}.json"));
        if !candidate.exists() {
            return Ok(candidate);
        }
        stamp += 1;
    }
}

fn absolute(path: &Path) -> String {
    if path.is_absolute() {
        path.to_string_lossy().into_owned()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .into_owned()
    }
}
