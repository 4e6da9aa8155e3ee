//! Locating and invoking the claude CLI.
//!
//! The binary is resolved from a fixed candidate list (user-home install
//! locations first, then system paths) before falling back to a `PATH`
//! lookup. The child's environment is the host environment minus any
//! `ANTHROPIC_`-prefixed variable and the legacy `CLAUDECODE` flag, so the
//! child never re-inherits host credentials or personas.

use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use base64::Engine;
use once_cell::sync::Lazy;
use serde_json::json;
use tokio::process::Command;

/// User-facing message when no binary can be located.
pub const CLI_NOT_FOUND: &str = "Claude CLI not found. Please install it first.";

/// Install locations tried before the `PATH` lookup; home-relative entries
/// first, then absolute system paths.
static HOME_CANDIDATES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        ".claude/local/claude",
        ".local/bin/claude",
        ".npm-global/bin/claude",
        "bin/claude",
    ]
});

static SYSTEM_CANDIDATES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "/usr/local/bin/claude",
        "/opt/homebrew/bin/claude",
        "/usr/bin/claude",
    ]
});

/// Resolve the claude binary, honoring an explicit override.
pub fn resolve_claude_bin(override_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = override_path {
        return path.exists().then(|| path.to_path_buf());
    }
    resolve_from(dirs::home_dir(), env::var_os("PATH").as_deref())
}

fn resolve_from(home: Option<PathBuf>, path_var: Option<&OsStr>) -> Option<PathBuf> {
    if let Some(home) = home {
        for candidate in HOME_CANDIDATES.iter() {
            let path = home.join(candidate);
            if path.exists() {
                return Some(path);
            }
        }
    }
    for candidate in SYSTEM_CANDIDATES.iter() {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Some(path);
        }
    }
    let path_var = path_var?;
    for dir in env::split_paths(path_var) {
        let candidate = dir.join("claude");
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

/// Host environment filtered for the child process.
pub fn filtered_env() -> Vec<(String, String)> {
    filter_env(env::vars())
}

fn filter_env(vars: impl Iterator<Item = (String, String)>) -> Vec<(String, String)> {
    vars.filter(|(key, _)| !key.starts_with("ANTHROPIC_") && key != "CLAUDECODE")
        .collect()
}

/// A base64-encoded image ready to embed in the stdin payload.
#[derive(Debug, Clone)]
pub struct ImageBlock {
    pub media_type: String,
    pub data: String,
}

impl ImageBlock {
    pub fn read(path: &Path, media_type: &str) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(Self {
            media_type: media_type.to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        })
    }
}

/// The single JSON line written to the child's stdin when images are
/// present. The caller closes stdin immediately after.
pub fn stdin_payload(images: &[ImageBlock], text: &str) -> String {
    let mut content: Vec<serde_json::Value> = images
        .iter()
        .map(|image| {
            json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": image.media_type,
                    "data": image.data,
                },
            })
        })
        .collect();
    content.push(json!({ "type": "text", "text": text }));

    json!({
        "type": "user",
        "message": { "role": "user", "content": content },
    })
    .to_string()
}

/// Build the turn command: print mode, verbose, line-JSON output, prompt
/// bypass, the thread's tool config, and the assembled system prompt. With
/// images the message goes over stdin as line-JSON; otherwise the user text
/// is the final positional argument and stdin stays closed.
pub fn build_command(
    bin: &Path,
    system_prompt: &str,
    tool_config: &Path,
    workdir: &Path,
    user_text: &str,
    with_stdin: bool,
) -> Command {
    let mut cmd = Command::new(bin);
    cmd.arg("-p")
        .arg("--verbose")
        .arg("--output-format")
        .arg("stream-json")
        .arg("--permission-mode")
        .arg("bypassPermissions")
        .arg("--mcp-config")
        .arg(tool_config)
        .arg("--append-system-prompt")
        .arg(system_prompt);

    if with_stdin {
        cmd.arg("--input-format").arg("stream-json");
        cmd.stdin(Stdio::piped());
    } else {
        cmd.arg(user_text);
        cmd.stdin(Stdio::null());
    }

    cmd.current_dir(workdir)
        .env_clear()
        .envs(filtered_env())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}
