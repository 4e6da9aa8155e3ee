//! Subprocess supervision for conversation threads.
//!
//! One `send_message` call executes one LLM turn: it prepares context,
//! spawns the claude CLI, decodes its line-JSON stdout into segments fanned
//! out to subscribers, and reconciles the final state into the thread's
//! history log. The supervisor owns the only two pieces of process-wide
//! mutable state: the thread registry and the active-process map; at most
//! one live subprocess exists per thread at any instant.

mod claude;
mod events;

pub use claude::CLI_NOT_FOUND;
pub use events::{EventHub, Subscription, ThreadEvent};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::context::{estimate_tokens, ContextAssembler, ContextInputs, RECENT_CONTEXT_COUNT};
use crate::retrieval::{KeywordRetriever, Retriever};
use crate::store::{Attachment, AttachmentKind, ContentStore, MessageMetadata, NewMessage, Role};
use crate::stream::{decode_line, LineBuffer, StreamSegment};
use crate::thread::Thread;

/// Tool-result blocks longer than this are swapped for stored sentinels
/// before decoding.
const STREAM_BLOCK_EXTERNALIZE_CHARS: usize = 16_384;

/// Buffer between the stdout reader and the line pump.
const LINE_CHANNEL_SIZE: usize = 64;

/// Host-level settings for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory holding every thread's on-disk state.
    pub threads_root: PathBuf,
    /// Base URL of the local control API, exported to spawned tools.
    pub base_url: String,
    /// Explicit claude binary override; candidate-list resolution otherwise.
    pub claude_bin: Option<PathBuf>,
    /// Always-include block injected into every turn's context.
    pub always_include: String,
}

/// A subprocess currently registered against a thread.
struct ActiveProcess {
    pid: u32,
    turn: u64,
}

/// Per-turn mutable state shared between the line pump and the finalizer.
#[derive(Default)]
struct TurnState {
    accumulated: String,
    segments: Vec<StreamSegment>,
    finished: bool,
}

/// A history message in its public shape (`path` instead of `storedPath`).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: u64,
    pub role: Role,
    pub content: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentView {
    pub name: String,
    pub path: String,
    pub kind: AttachmentKind,
    pub mime_type: String,
}

impl From<crate::store::Message> for HistoryEntry {
    fn from(message: crate::store::Message) -> Self {
        Self {
            id: message.id,
            role: message.role,
            content: message.content,
            timestamp: message.timestamp,
            tokens: message.tokens,
            metadata: message.metadata,
            attachments: message
                .attachments
                .into_iter()
                .map(|attachment| AttachmentView {
                    name: attachment.name,
                    path: attachment.stored_path,
                    kind: attachment.kind,
                    mime_type: attachment.mime_type,
                })
                .collect(),
        }
    }
}

/// Structured result of a revert.
#[derive(Debug, Clone, Serialize)]
pub struct RevertOutcome {
    pub success: bool,
    pub removed_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The host-wide supervisor owning all threads and their subprocesses.
pub struct Supervisor {
    config: SupervisorConfig,
    threads: RwLock<HashMap<String, Arc<Thread>>>,
    active: Mutex<HashMap<String, ActiveProcess>>,
    hub: Arc<EventHub>,
    assembler: ContextAssembler,
    retriever: Arc<dyn Retriever>,
    turn_counter: AtomicU64,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_retriever(config, Arc::new(KeywordRetriever))
    }

    pub fn with_retriever(config: SupervisorConfig, retriever: Arc<dyn Retriever>) -> Self {
        Self {
            config,
            threads: RwLock::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            hub: Arc::new(EventHub::new()),
            assembler: ContextAssembler::new(),
            retriever,
            turn_counter: AtomicU64::new(0),
        }
    }

    /// Subscribe to a thread's lifecycle and stream events.
    pub fn subscribe(&self, thread_name: &str) -> Subscription {
        self.hub.subscribe(thread_name)
    }

    /// Resolve or lazily create the named thread.
    pub async fn get_or_create_thread(&self, name: &str) -> Result<Arc<Thread>> {
        validate_thread_name(name)?;
        {
            let threads = self.threads.read().await;
            if let Some(thread) = threads.get(name) {
                return Ok(Arc::clone(thread));
            }
        }

        let mut threads = self.threads.write().await;
        if let Some(thread) = threads.get(name) {
            return Ok(Arc::clone(thread));
        }
        let thread = Arc::new(Thread::open(
            name,
            &self.config.threads_root,
            None,
            &self.config.base_url,
        )?);
        threads.insert(name.to_string(), Arc::clone(&thread));
        info!("opened thread {name}");
        Ok(thread)
    }

    /// Whether a thread is known without creating it.
    pub async fn thread_exists(&self, name: &str) -> bool {
        if self.threads.read().await.contains_key(name) {
            return true;
        }
        crate::store::history_path(&self.config.threads_root, name).exists()
    }

    /// Every known thread name: loaded threads plus on-disk logs.
    pub async fn known_threads(&self) -> Vec<String> {
        let mut names: Vec<String> = self.threads.read().await.keys().cloned().collect();
        if let Ok(entries) = std::fs::read_dir(&self.config.threads_root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().map(|ext| ext == "jsonl").unwrap_or(false) {
                    if let Some(stem) = path.file_stem() {
                        let name = stem.to_string_lossy().into_owned();
                        if !names.contains(&name) {
                            names.push(name);
                        }
                    }
                }
            }
        }
        names.sort();
        names
    }

    /// Whether a live subprocess is registered for the thread.
    pub async fn is_streaming(&self, thread_name: &str) -> bool {
        self.active.lock().await.contains_key(thread_name)
    }

    /// Execute one LLM turn for `thread_name`.
    ///
    /// Resolves the thread, appends the user message, assembles context,
    /// spawns the CLI, streams its output to subscribers, and finalizes the
    /// turn into history. Exactly one `stream-end` event is emitted per
    /// call, after every per-line task has resolved.
    pub async fn send_message(
        &self,
        thread_name: &str,
        user_text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<()> {
        let thread = self.get_or_create_thread(thread_name).await?;
        let turn = self.turn_counter.fetch_add(1, Ordering::Relaxed) + 1;

        // Image attachments become base64 blocks; everything else becomes a
        // file-reference line appended to the outgoing text.
        let mut images = Vec::new();
        let mut file_refs = Vec::new();
        for attachment in &attachments {
            let resolved = attachment.resolved(thread.home());
            match attachment.kind {
                AttachmentKind::Image => {
                    match claude::ImageBlock::read(
                        Path::new(&resolved.stored_path),
                        &resolved.mime_type,
                    ) {
                        Ok(block) => images.push(block),
                        Err(err) => {
                            warn!(
                                "unreadable image attachment {}: {err}",
                                resolved.stored_path
                            );
                            file_refs.push(format!(
                                "[Attached image (unreadable): {}]",
                                resolved.stored_path
                            ));
                        }
                    }
                }
                AttachmentKind::File => {
                    file_refs.push(format!("[Attached file: {}]", resolved.stored_path));
                }
            }
        }
        let mut outgoing_text = user_text.to_string();
        if !file_refs.is_empty() {
            if !outgoing_text.is_empty() {
                outgoing_text.push('\n');
            }
            outgoing_text.push_str(&file_refs.join("\n"));
        }

        let session_id = thread.sessions.session_id().await?;
        let user_message = thread
            .history
            .append(
                NewMessage::new(Role::User, outgoing_text.clone())
                    .with_metadata(MessageMetadata {
                        session_id: Some(session_id.clone()),
                        git_snapshot: None,
                    })
                    .with_attachments(attachments),
            )
            .await
            .context("appending user message")?;
        self.hub.emit(
            thread_name,
            ThreadEvent::UserMessageAppended {
                message: user_message,
            },
        );

        let stats = thread.history.get_stats().await;
        let recent = thread.history.get_recent(RECENT_CONTEXT_COUNT).await;
        let always_include_tokens = estimate_tokens(&self.config.always_include);
        let rag_budget = self
            .assembler
            .rag_budget(&outgoing_text, always_include_tokens);
        let retrieved = match self
            .retriever
            .retrieve(&outgoing_text, &thread.history, &thread.content, rag_budget)
            .await
        {
            Ok(block) => block,
            Err(err) => {
                warn!("retrieval failed for thread {thread_name}: {err:?}");
                String::new()
            }
        };

        let assembled = self
            .assembler
            .assemble(
                ContextInputs {
                    stats,
                    session_id: &session_id,
                    recent: &recent,
                    user_input: &outgoing_text,
                    retrieved_context: &retrieved,
                    always_include: &self.config.always_include,
                    always_include_tokens,
                },
                &thread.content,
            )
            .await?;

        let Some(bin) = claude::resolve_claude_bin(self.config.claude_bin.as_deref()) else {
            self.emit_fatal(thread_name);
            return Ok(());
        };

        thread.ensure_tool_config()?;
        let mut cmd = claude::build_command(
            &bin,
            &assembled.system_prompt,
            thread.tool_config_path(),
            &thread.working_dir(),
            &assembled.user_input,
            !images.is_empty(),
        );
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.emit_fatal(thread_name);
                return Ok(());
            }
            Err(err) => return Err(err).context("spawning claude CLI"),
        };

        let pid = child.id().unwrap_or(0);
        {
            let mut active = self.active.lock().await;
            active.insert(thread_name.to_string(), ActiveProcess { pid, turn });
        }
        info!("spawned claude pid {pid} for thread {thread_name} (turn {turn})");

        if !images.is_empty() {
            if let Some(mut stdin) = child.stdin.take() {
                let payload = claude::stdin_payload(&images, &assembled.user_input);
                let write = async {
                    stdin.write_all(payload.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.shutdown().await
                };
                if let Err(err) = write.await {
                    warn!("writing stdin payload for thread {thread_name}: {err}");
                }
            }
        }

        let stdout = child.stdout.take().context("claude child has no stdout")?;
        let stderr = child.stderr.take().context("claude child has no stderr")?;

        let turn_state = Arc::new(Mutex::new(TurnState::default()));
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Stderr watcher: only the ENOENT substring is fatal; everything
        // else is the child's own verbose logging and is discarded.
        {
            let hub = Arc::clone(&self.hub);
            let name = thread_name.to_string();
            tasks.push(tokio::spawn(async move {
                let mut stderr = stderr;
                let mut buf = [0u8; 8192];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let chunk = String::from_utf8_lossy(&buf[..n]);
                            if chunk.contains("ENOENT") {
                                hub.emit(
                                    &name,
                                    ThreadEvent::StreamError {
                                        error: CLI_NOT_FOUND.to_string(),
                                    },
                                );
                            } else {
                                debug!("claude stderr ({name}): {}", chunk.trim_end());
                            }
                        }
                    }
                }
            }));
        }

        // Stdout reader: raw chunks through the framing buffer, complete
        // lines into the pump. The trailing fragment is flushed at EOF.
        let (line_tx, mut line_rx) = mpsc::channel::<String>(LINE_CHANNEL_SIZE);
        tasks.push(tokio::spawn(async move {
            let mut stdout = stdout;
            let mut framing = LineBuffer::new();
            let mut buf = [0u8; 8192];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        for line in framing.push_chunk(&buf[..n]) {
                            if line_tx.send(line).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            if let Some(line) = framing.finish() {
                let _ = line_tx.send(line).await;
            }
        }));

        // Line pump: post-process, decode, and fan out in arrival order.
        {
            let hub = Arc::clone(&self.hub);
            let state = Arc::clone(&turn_state);
            let thread = Arc::clone(&thread);
            let name = thread_name.to_string();
            tasks.push(tokio::spawn(async move {
                while let Some(line) = line_rx.recv().await {
                    let processed = post_process_line(&line, &thread.content).await;
                    for segment in decode_line(&processed) {
                        handle_segment(&hub, &name, &state, segment).await;
                    }
                }
            }));
        }

        // The close event can fire while the last lines are still being
        // processed; every task must resolve before the finalizer runs.
        let status = child.wait().await;
        debug!("claude for thread {thread_name} exited: {status:?}");
        join_all(tasks).await;

        self.finalize_turn(&thread, thread_name, turn, &turn_state, &outgoing_text)
            .await;
        Ok(())
    }

    /// Terminate the thread's live subprocess, if any. Safe to call when
    /// nothing is running.
    pub async fn kill_process(&self, thread_name: &str) {
        let removed = self.active.lock().await.remove(thread_name);
        if let Some(process) = removed {
            // pid 0 would signal the whole process group.
            if process.pid == 0 {
                return;
            }
            info!(
                "terminating claude pid {} for thread {thread_name}",
                process.pid
            );
            // SIGTERM, not SIGKILL: the decode loop ends when stdout closes.
            unsafe {
                libc::kill(process.pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    /// The thread's history in its public shape. `count <= 0` returns all.
    pub async fn get_history(&self, thread_name: &str, count: i64) -> Result<Vec<HistoryEntry>> {
        let thread = self.get_or_create_thread(thread_name).await?;
        let messages = if count <= 0 {
            thread.history.get_all().await
        } else {
            thread.history.get_recent(count as usize).await
        };
        Ok(messages.into_iter().map(HistoryEntry::from).collect())
    }

    /// Truncate history from `message_id` onward, optionally restoring the
    /// recorded git snapshot first. Truncation proceeds even if the git
    /// restore fails; the failure is reported alongside the result.
    pub async fn revert(
        &self,
        thread_name: &str,
        message_id: u64,
        restore_git: bool,
    ) -> RevertOutcome {
        let thread = match self.get_or_create_thread(thread_name).await {
            Ok(thread) => thread,
            Err(err) => {
                return RevertOutcome {
                    success: false,
                    removed_count: 0,
                    error: Some(format!("{err:#}")),
                }
            }
        };

        let mut git_error = None;
        if restore_git {
            let snapshot = thread
                .history
                .get_all()
                .await
                .into_iter()
                .find(|message| message.id == message_id)
                .and_then(|message| message.metadata.and_then(|meta| meta.git_snapshot));
            match snapshot {
                Some(snapshot) => {
                    if let Err(err) =
                        restore_git_snapshot(&thread.working_dir(), &snapshot).await
                    {
                        warn!("git restore failed for thread {thread_name}: {err:#}");
                        git_error = Some(format!("{err:#}"));
                    }
                }
                None => {
                    git_error = Some(format!(
                        "no git snapshot recorded for message {message_id}"
                    ));
                }
            }
        }

        match thread.history.truncate_from(message_id).await {
            Ok(removed) => RevertOutcome {
                success: true,
                removed_count: removed,
                error: git_error,
            },
            Err(err) => RevertOutcome {
                success: false,
                removed_count: 0,
                error: Some(format!("{err:#}")),
            },
        }
    }

    /// Kill every live subprocess and tear down in-memory thread state.
    /// On-disk history survives; tool-config files do not.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.active.lock().await.keys().cloned().collect();
        for name in names {
            self.kill_process(&name).await;
        }
        let threads: Vec<Arc<Thread>> = {
            let mut threads = self.threads.write().await;
            threads.drain().map(|(_, thread)| thread).collect()
        };
        for thread in threads {
            thread.teardown();
        }
    }

    fn emit_fatal(&self, thread_name: &str) {
        self.hub.emit(
            thread_name,
            ThreadEvent::StreamError {
                error: CLI_NOT_FOUND.to_string(),
            },
        );
        self.hub.emit(
            thread_name,
            ThreadEvent::StreamEnd {
                message: None,
                fallback_text: None,
                segments: Vec::new(),
            },
        );
    }

    /// Reconcile the finished turn into history and emit `stream-end`.
    /// Idempotent; spurious duplicate invocations are no-ops.
    async fn finalize_turn(
        &self,
        thread: &Arc<Thread>,
        thread_name: &str,
        turn: u64,
        turn_state: &Mutex<TurnState>,
        user_text: &str,
    ) {
        let (accumulated, segments) = {
            let mut state = turn_state.lock().await;
            if state.finished {
                return;
            }
            state.finished = true;
            (
                std::mem::take(&mut state.accumulated),
                std::mem::take(&mut state.segments),
            )
        };

        // A turn whose process was already deregistered was pre-empted by
        // kill_process; its partial accumulator is surfaced as fallback text
        // only, never appended to history.
        let was_registered = {
            let mut active = self.active.lock().await;
            if active.get(thread_name).map(|process| process.turn) == Some(turn) {
                active.remove(thread_name);
                true
            } else {
                false
            }
        };

        if accumulated.is_empty() || !was_registered {
            let fallback_text = (!accumulated.is_empty()).then_some(accumulated);
            self.hub.emit(
                thread_name,
                ThreadEvent::StreamEnd {
                    message: None,
                    fallback_text,
                    segments,
                },
            );
            return;
        }

        let session_id = thread.sessions.session_id().await.ok();
        let appended = thread
            .history
            .append(
                NewMessage::new(Role::Assistant, accumulated.clone()).with_metadata(
                    MessageMetadata {
                        session_id,
                        git_snapshot: None,
                    },
                ),
            )
            .await;

        match appended {
            Ok(message) => {
                if let Err(err) = thread.sessions.update_exchange(user_text, &accumulated).await {
                    warn!("session update failed for thread {thread_name}: {err:?}");
                }
                self.hub.emit(
                    thread_name,
                    ThreadEvent::StreamEnd {
                        message: Some(message),
                        fallback_text: Some(accumulated),
                        segments,
                    },
                );
            }
            Err(err) => {
                // Showing something beats showing nothing: hand subscribers
                // the accumulated text even though the append failed.
                error!("history append failed for thread {thread_name}: {err:?}");
                self.hub.emit(
                    thread_name,
                    ThreadEvent::StreamEnd {
                        message: None,
                        fallback_text: Some(accumulated),
                        segments,
                    },
                );
            }
        }
    }
}

/// Fold one segment into the turn state and fan it out.
async fn handle_segment(
    hub: &EventHub,
    thread_name: &str,
    turn_state: &Mutex<TurnState>,
    segment: StreamSegment,
) {
    let mut state = turn_state.lock().await;
    if let StreamSegment::Text { content } = &segment {
        let chunk = if !state.accumulated.is_empty() && !state.accumulated.ends_with('\n') {
            format!("\n\n{content}")
        } else {
            content.clone()
        };
        state.accumulated.push_str(&chunk);
        hub.emit(thread_name, ThreadEvent::StreamChunk { text: chunk });
    }
    state.segments.push(segment.clone());
    hub.emit(thread_name, ThreadEvent::StreamSegment { segment });
}

/// Rewrite oversized tool-result blocks into stored sentinels. A failed
/// rewrite passes the raw line through untouched.
async fn post_process_line(line: &str, content: &ContentStore) -> String {
    match try_externalize_line(line, content).await {
        Ok(Some(rewritten)) => rewritten,
        Ok(None) => line.to_string(),
        Err(err) => {
            debug!("stream post-processing failed, passing line through: {err:?}");
            line.to_string()
        }
    }
}

async fn try_externalize_line(line: &str, content: &ContentStore) -> Result<Option<String>> {
    let mut value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };

    let is_top_level_tool_result =
        value.get("type").and_then(Value::as_str) == Some("tool_result");
    let mut changed = false;

    if let Some(blocks) = value
        .get_mut("message")
        .and_then(|message| message.get_mut("content"))
        .and_then(Value::as_array_mut)
    {
        for block in blocks {
            if block.get("type").and_then(Value::as_str) == Some("tool_result") {
                changed |= externalize_block(block, content).await?;
            }
        }
    } else if is_top_level_tool_result {
        changed |= externalize_block(&mut value, content).await?;
    }

    Ok(changed.then(|| value.to_string()))
}

async fn externalize_block(block: &mut Value, content: &ContentStore) -> Result<bool> {
    let Some(text) = block.get("content").and_then(Value::as_str) else {
        return Ok(false);
    };
    if text.len() <= STREAM_BLOCK_EXTERNALIZE_CHARS {
        return Ok(false);
    }
    let id = content.put(text).await?;
    block["content"] = Value::String(format!("[STORED:{id}]"));
    Ok(true)
}

async fn restore_git_snapshot(workdir: &Path, snapshot: &str) -> Result<()> {
    let status = tokio::process::Command::new("git")
        .arg("reset")
        .arg("--hard")
        .arg(snapshot)
        .current_dir(workdir)
        .status()
        .await
        .context("running git reset")?;
    if !status.success() {
        bail!("git reset exited with {status}");
    }
    Ok(())
}

/// Thread names become file names under the threads root.
fn validate_thread_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 {
        bail!("invalid thread name: must be 1-128 characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '))
    {
        bail!("invalid thread name {name:?}: only alphanumerics, dash, underscore, dot, space");
    }
    if name.starts_with('.') {
        bail!("invalid thread name {name:?}: must not start with a dot");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Attachment;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn write_stub(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("claude-stub");
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn supervisor_with_stub(dir: &TempDir, stub: Option<PathBuf>) -> Arc<Supervisor> {
        Arc::new(Supervisor::new(SupervisorConfig {
            threads_root: dir.path().join("threads"),
            base_url: "http://127.0.0.1:9223".to_string(),
            claude_bin: stub,
            always_include: "notes".to_string(),
        }))
    }

    async fn next_event(sub: &mut Subscription) -> ThreadEvent {
        timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed")
    }

    const HELLO_STUB: &str = r#"#!/bin/sh
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"Hello."}]}}'
printf '%s\n' '{"type":"result","duration_ms":120,"usage":{"input_tokens":5,"output_tokens":1}}'
"#;

    #[tokio::test]
    async fn single_text_turn_emits_full_event_sequence() {
        let dir = TempDir::new().unwrap();
        let stub = write_stub(dir.path(), HELLO_STUB);
        let supervisor = supervisor_with_stub(&dir, Some(stub));

        let mut sub = supervisor.subscribe("t1");
        supervisor.send_message("t1", "hi", Vec::new()).await.unwrap();

        match next_event(&mut sub).await {
            ThreadEvent::UserMessageAppended { message } => {
                assert_eq!(message.role, Role::User);
                assert_eq!(message.content, "hi");
            }
            other => panic!("expected user-message-appended, got {other:?}"),
        }
        match next_event(&mut sub).await {
            ThreadEvent::StreamChunk { text } => assert_eq!(text, "Hello."),
            other => panic!("expected stream-chunk, got {other:?}"),
        }
        match next_event(&mut sub).await {
            ThreadEvent::StreamSegment { segment } => {
                assert_eq!(
                    segment,
                    StreamSegment::Text {
                        content: "Hello.".to_string()
                    }
                );
            }
            other => panic!("expected stream-segment, got {other:?}"),
        }
        match next_event(&mut sub).await {
            ThreadEvent::StreamSegment { segment } => {
                assert!(matches!(segment, StreamSegment::Result { duration_ms: 120, .. }));
            }
            other => panic!("expected result segment, got {other:?}"),
        }
        match next_event(&mut sub).await {
            ThreadEvent::StreamEnd {
                message, segments, ..
            } => {
                assert_eq!(message.unwrap().content, "Hello.");
                assert_eq!(segments.len(), 2);
            }
            other => panic!("expected stream-end, got {other:?}"),
        }

        let history = supervisor.get_history("t1", 0).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, "Hello.");
    }

    #[tokio::test]
    async fn text_segments_are_joined_with_blank_lines() {
        let dir = TempDir::new().unwrap();
        let stub = write_stub(
            dir.path(),
            r#"#!/bin/sh
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"first"}]}}'
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"second"}]}}'
"#,
        );
        let supervisor = supervisor_with_stub(&dir, Some(stub));
        let mut sub = supervisor.subscribe("t1");
        supervisor.send_message("t1", "go", Vec::new()).await.unwrap();

        let mut final_message = None;
        loop {
            match next_event(&mut sub).await {
                ThreadEvent::StreamEnd { message, .. } => {
                    final_message = message;
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(final_message.unwrap().content, "first\n\nsecond");
    }

    #[tokio::test]
    async fn missing_cli_reports_fatal_then_end() {
        let dir = TempDir::new().unwrap();
        let supervisor =
            supervisor_with_stub(&dir, Some(dir.path().join("does-not-exist")));
        let mut sub = supervisor.subscribe("t1");
        supervisor.send_message("t1", "hi", Vec::new()).await.unwrap();

        assert!(matches!(
            next_event(&mut sub).await,
            ThreadEvent::UserMessageAppended { .. }
        ));
        match next_event(&mut sub).await {
            ThreadEvent::StreamError { error } => {
                assert_eq!(error, CLI_NOT_FOUND);
            }
            other => panic!("expected stream-error, got {other:?}"),
        }
        match next_event(&mut sub).await {
            ThreadEvent::StreamEnd {
                message,
                fallback_text,
                ..
            } => {
                assert!(message.is_none());
                assert!(fallback_text.is_none());
            }
            other => panic!("expected stream-end, got {other:?}"),
        }

        // Only the user message made it into history.
        let history = supervisor.get_history("t1", 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test]
    async fn kill_mid_stream_ends_with_partial_fallback() {
        let dir = TempDir::new().unwrap();
        let stub = write_stub(
            dir.path(),
            r#"#!/bin/sh
trap 'exit 0' TERM
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"partial"}]}}'
sleep 10 >/dev/null 2>&1 &
wait $!
printf '%s\n' '{"type":"result","duration_ms":1}'
"#,
        );
        let supervisor = supervisor_with_stub(&dir, Some(stub));
        let mut sub = supervisor.subscribe("t1");

        let task = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.send_message("t1", "go", Vec::new()).await })
        };

        // Wait until the child is registered and the first chunk arrived.
        loop {
            match next_event(&mut sub).await {
                ThreadEvent::StreamChunk { text } => {
                    assert_eq!(text, "partial");
                    break;
                }
                _ => continue,
            }
        }
        assert!(supervisor.is_streaming("t1").await);
        supervisor.kill_process("t1").await;
        assert!(!supervisor.is_streaming("t1").await);

        let mut end = None;
        loop {
            match next_event(&mut sub).await {
                ThreadEvent::StreamEnd {
                    message,
                    fallback_text,
                    ..
                } => {
                    end = Some((message, fallback_text));
                    break;
                }
                _ => continue,
            }
        }
        let (message, fallback) = end.unwrap();
        // A pre-empted turn surfaces its partial accumulator as fallback
        // text only; nothing is appended to history.
        assert!(message.is_none());
        assert_eq!(fallback.as_deref(), Some("partial"));
        task.await.unwrap().unwrap();

        let history = supervisor.get_history("t1", 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test]
    async fn kill_is_safe_when_idle() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_with_stub(&dir, None);
        supervisor.kill_process("nobody").await;
    }

    #[tokio::test]
    async fn image_attachment_goes_over_stdin_as_one_line() {
        let dir = TempDir::new().unwrap();
        let capture = dir.path().join("stdin-capture");
        let stub = write_stub(
            dir.path(),
            &format!(
                r#"#!/bin/sh
cat > {}
printf '%s\n' '{{"type":"result","duration_ms":1}}'
"#,
                capture.display()
            ),
        );
        let supervisor = supervisor_with_stub(&dir, Some(stub));

        let image_path = dir.path().join("shot.png");
        std::fs::write(&image_path, b"\x89PNG fake").unwrap();

        let mut sub = supervisor.subscribe("t1");
        supervisor
            .send_message(
                "t1",
                "look",
                vec![Attachment {
                    name: "shot.png".to_string(),
                    stored_path: image_path.to_string_lossy().into_owned(),
                    kind: AttachmentKind::Image,
                    mime_type: "image/png".to_string(),
                }],
            )
            .await
            .unwrap();
        loop {
            if matches!(next_event(&mut sub).await, ThreadEvent::StreamEnd { .. }) {
                break;
            }
        }

        let written = std::fs::read_to_string(&capture).unwrap();
        assert!(written.ends_with('\n'));
        let mut lines = written.lines();
        let payload: serde_json::Value =
            serde_json::from_str(lines.next().unwrap()).unwrap();
        assert!(lines.next().is_none(), "expected exactly one stdin line");
        assert_eq!(payload["type"], "user");
        let content = payload["message"]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "image");
        assert_eq!(content.last().unwrap()["type"], "text");
    }

    #[tokio::test]
    async fn no_attachments_leaves_stdin_empty() {
        let dir = TempDir::new().unwrap();
        let capture = dir.path().join("stdin-capture");
        let stub = write_stub(
            dir.path(),
            &format!(
                r#"#!/bin/sh
cat > {}
printf '%s\n' '{{"type":"result","duration_ms":1}}'
"#,
                capture.display()
            ),
        );
        let supervisor = supervisor_with_stub(&dir, Some(stub));
        let mut sub = supervisor.subscribe("t1");
        supervisor.send_message("t1", "hi", Vec::new()).await.unwrap();
        loop {
            if matches!(next_event(&mut sub).await, ThreadEvent::StreamEnd { .. }) {
                break;
            }
        }
        assert_eq!(std::fs::read_to_string(&capture).unwrap(), "");
    }

    #[tokio::test]
    async fn file_attachments_become_reference_lines() {
        let dir = TempDir::new().unwrap();
        let stub = write_stub(dir.path(), HELLO_STUB);
        let supervisor = supervisor_with_stub(&dir, Some(stub));
        let mut sub = supervisor.subscribe("t1");
        supervisor
            .send_message(
                "t1",
                "see file",
                vec![Attachment {
                    name: "report.txt".to_string(),
                    stored_path: "/tmp/report.txt".to_string(),
                    kind: AttachmentKind::File,
                    mime_type: "text/plain".to_string(),
                }],
            )
            .await
            .unwrap();

        match next_event(&mut sub).await {
            ThreadEvent::UserMessageAppended { message } => {
                assert_eq!(
                    message.content,
                    "see file\n[Attached file: /tmp/report.txt]"
                );
            }
            other => panic!("expected user-message-appended, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_history_maps_attachments_to_path_shape() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_with_stub(&dir, None);
        let thread = supervisor.get_or_create_thread("t1").await.unwrap();
        thread
            .history
            .append(
                NewMessage::new(Role::User, "with attachment").with_attachments(vec![
                    Attachment {
                        name: "a.txt".to_string(),
                        stored_path: "rel/a.txt".to_string(),
                        kind: AttachmentKind::File,
                        mime_type: "text/plain".to_string(),
                    },
                ]),
            )
            .await
            .unwrap();

        let history = supervisor.get_history("t1", 0).await.unwrap();
        assert_eq!(history.len(), 1);
        let attachment = &history[0].attachments[0];
        assert!(Path::new(&attachment.path).is_absolute());

        let serialized = serde_json::to_value(&history[0]).unwrap();
        assert!(serialized["attachments"][0].get("path").is_some());
        assert!(serialized["attachments"][0].get("storedPath").is_none());
    }

    #[tokio::test]
    async fn revert_truncates_and_reports_count() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_with_stub(&dir, None);
        let thread = supervisor.get_or_create_thread("t1").await.unwrap();
        for text in ["a", "b", "c"] {
            thread
                .history
                .append(NewMessage::new(Role::User, text))
                .await
                .unwrap();
        }

        let outcome = supervisor.revert("t1", 2, false).await;
        assert!(outcome.success);
        assert_eq!(outcome.removed_count, 2);
        assert!(outcome.error.is_none());
        assert_eq!(supervisor.get_history("t1", 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn oversized_tool_results_are_externalized_before_decode() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_with_stub(&dir, None);
        let thread = supervisor.get_or_create_thread("t1").await.unwrap();

        let big = "z".repeat(STREAM_BLOCK_EXTERNALIZE_CHARS + 1);
        let line = serde_json::json!({
            "type": "user",
            "message": { "content": [
                { "type": "tool_result", "content": big, "is_error": false },
            ]},
        })
        .to_string();

        let processed = post_process_line(&line, &thread.content).await;
        let segments = decode_line(&processed);
        match &segments[0] {
            StreamSegment::ToolResult { content, .. } => {
                assert!(content.starts_with("[STORED:"));
                let id = content
                    .trim_start_matches("[STORED:")
                    .trim_end_matches(']');
                assert_eq!(thread.content.get(id).await.unwrap().len(), big.len());
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn post_processor_failure_passes_raw_line_through() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_with_stub(&dir, None);
        let thread = supervisor.get_or_create_thread("t1").await.unwrap();
        let line = "not json";
        assert_eq!(post_process_line(line, &thread.content).await, line);
    }

    #[tokio::test]
    async fn known_threads_includes_on_disk_logs() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor_with_stub(&dir, None);
        supervisor.get_or_create_thread("live").await.unwrap();

        let root = dir.path().join("threads");
        std::fs::write(root.join("old.jsonl"), "").unwrap();

        let names = supervisor.known_threads().await;
        assert_eq!(names, vec!["live".to_string(), "old".to_string()]);
        assert!(supervisor.thread_exists("old").await);
        assert!(!supervisor.thread_exists("ghost").await);
    }

    struct FailingRetriever;

    #[async_trait::async_trait]
    impl Retriever for FailingRetriever {
        async fn retrieve(
            &self,
            _query: &str,
            _history: &crate::store::HistoryLog,
            _content: &ContentStore,
            _budget_tokens: usize,
        ) -> Result<String> {
            anyhow::bail!("retriever exploded")
        }
    }

    #[tokio::test]
    async fn retrieval_failure_is_non_fatal() {
        let dir = TempDir::new().unwrap();
        let stub = write_stub(dir.path(), HELLO_STUB);
        let supervisor = Arc::new(Supervisor::with_retriever(
            SupervisorConfig {
                threads_root: dir.path().join("threads"),
                base_url: "http://127.0.0.1:9223".to_string(),
                claude_bin: Some(stub),
                always_include: String::new(),
            },
            Arc::new(FailingRetriever),
        ));

        let mut sub = supervisor.subscribe("t1");
        supervisor.send_message("t1", "hi", Vec::new()).await.unwrap();

        // The turn completes normally with an empty retrieved block.
        let mut end = None;
        loop {
            match next_event(&mut sub).await {
                ThreadEvent::StreamError { error } => panic!("unexpected error: {error}"),
                ThreadEvent::StreamEnd { message, .. } => {
                    end = message;
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(end.unwrap().content, "Hello.");
    }

    #[test]
    fn thread_names_are_validated() {
        assert!(validate_thread_name("t1").is_ok());
        assert!(validate_thread_name("my agent.v2").is_ok());
        assert!(validate_thread_name("").is_err());
        assert!(validate_thread_name("../escape").is_err());
        assert!(validate_thread_name("a/b").is_err());
        assert!(validate_thread_name(".hidden").is_err());
    }
}
