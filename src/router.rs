//! Inter-agent message routing.
//!
//! Every thread name doubles as an agent address. Delivery uses the
//! interjection protocol: a message to a busy agent pre-empts its running
//! subprocess, then the message is re-injected as a fresh user turn carrying
//! the sender's attribution. Delivery is fire-and-forget; the caller gets an
//! acknowledgement once the turn is started, not once it finishes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use log::{info, warn};
use serde::Serialize;

use crate::supervisor::Supervisor;

/// Grace period between terminating a busy agent's subprocess and starting
/// the injected turn.
const INTERJECT_GRACE: Duration = Duration::from_millis(100);

/// Liveness of an agent, derived from the active-process map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Streaming,
}

/// One addressable agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub name: String,
    pub status: AgentStatus,
}

/// Routes messages between agents by thread name.
pub struct AgentRouter {
    supervisor: Arc<Supervisor>,
}

impl AgentRouter {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Every known thread with its liveness.
    pub async fn list_agents(&self) -> Vec<AgentInfo> {
        let mut agents = Vec::new();
        for name in self.supervisor.known_threads().await {
            let status = if self.supervisor.is_streaming(&name).await {
                AgentStatus::Streaming
            } else {
                AgentStatus::Idle
            };
            agents.push(AgentInfo { name, status });
        }
        agents
    }

    /// Create the named agent's thread. Returns `false` when it already
    /// existed; creation is idempotent either way.
    pub async fn create_agent(&self, name: &str) -> Result<bool> {
        if self.supervisor.thread_exists(name).await {
            return Ok(false);
        }
        self.supervisor.get_or_create_thread(name).await?;
        Ok(true)
    }

    /// Deliver `body` from `sender` to `target` using interjection.
    ///
    /// A busy target is pre-empted: its subprocess gets a terminate signal
    /// and, after a short grace period, the injected turn starts regardless
    /// of whether the child exited cleanly. The injected turn itself runs
    /// detached; this call returns once it is started.
    pub async fn inject_message(&self, target: &str, body: &str, sender: &str) -> Result<()> {
        if target == sender {
            bail!("agent {target:?} cannot send a message to itself");
        }

        self.supervisor.get_or_create_thread(target).await?;

        if self.supervisor.is_streaming(target).await {
            info!("interjecting into busy agent {target} (from {sender})");
            self.supervisor.kill_process(target).await;
            tokio::time::sleep(INTERJECT_GRACE).await;
        }

        let injected = format!(
            "[From agent \"{sender}\"]:\n{body}\n\n(Reply using send_to_agent(\"{sender}\", your_response) to respond directly. Be concise and task-focused — no pleasantries or sign-offs.)"
        );

        let supervisor = Arc::clone(&self.supervisor);
        let target = target.to_string();
        tokio::spawn(async move {
            if let Err(err) = supervisor.send_message(&target, &injected, Vec::new()).await {
                warn!("injected turn for agent {target} failed: {err:?}");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{SupervisorConfig, ThreadEvent};
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn write_stub(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("claude-stub");
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn router_with_stub(dir: &TempDir, stub: Option<PathBuf>) -> AgentRouter {
        AgentRouter::new(Arc::new(Supervisor::new(SupervisorConfig {
            threads_root: dir.path().join("threads"),
            base_url: "http://127.0.0.1:9223".to_string(),
            claude_bin: stub,
            always_include: String::new(),
        })))
    }

    async fn next_event(sub: &mut crate::supervisor::Subscription) -> ThreadEvent {
        timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed")
    }

    const HELLO_STUB: &str = r#"#!/bin/sh
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"ack"}]}}'
"#;

    #[tokio::test]
    async fn self_send_is_rejected() {
        let dir = TempDir::new().unwrap();
        let router = router_with_stub(&dir, None);
        let err = router.inject_message("t1", "hi", "t1").await.unwrap_err();
        assert!(err.to_string().contains("itself"));
    }

    #[tokio::test]
    async fn fresh_agent_lists_as_idle() {
        let dir = TempDir::new().unwrap();
        let router = router_with_stub(&dir, None);
        assert!(router.create_agent("t1").await.unwrap());
        let agents = router.list_agents().await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].name, "t1");
        assert_eq!(agents[0].status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn create_agent_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let router = router_with_stub(&dir, None);
        assert!(router.create_agent("t1").await.unwrap());
        assert!(!router.create_agent("t1").await.unwrap());
    }

    #[tokio::test]
    async fn inject_attributes_sender_and_starts_a_turn() {
        let dir = TempDir::new().unwrap();
        let stub = write_stub(dir.path(), HELLO_STUB);
        let router = router_with_stub(&dir, Some(stub));

        let mut sub = router.supervisor().subscribe("target");
        router
            .inject_message("target", "please stop", "sender")
            .await
            .unwrap();

        match next_event(&mut sub).await {
            ThreadEvent::UserMessageAppended { message } => {
                assert!(message
                    .content
                    .starts_with("[From agent \"sender\"]:\nplease stop\n"));
                assert!(message.content.contains("send_to_agent(\"sender\""));
            }
            other => panic!("expected user-message-appended, got {other:?}"),
        }
        loop {
            if matches!(next_event(&mut sub).await, ThreadEvent::StreamEnd { .. }) {
                break;
            }
        }
    }

    #[tokio::test]
    async fn interjection_preempts_a_busy_agent() {
        let dir = TempDir::new().unwrap();
        let stub = write_stub(
            dir.path(),
            r#"#!/bin/sh
trap 'exit 0' TERM
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"partial"}]}}'
sleep 10 >/dev/null 2>&1 &
wait $!
"#,
        );
        let router = router_with_stub(&dir, Some(stub));
        let mut sub = router.supervisor().subscribe("t1");

        let supervisor = Arc::clone(router.supervisor());
        let long_turn =
            tokio::spawn(async move { supervisor.send_message("t1", "go", Vec::new()).await });

        // Wait for the first chunk so the turn is mid-stream.
        loop {
            if matches!(next_event(&mut sub).await, ThreadEvent::StreamChunk { .. }) {
                break;
            }
        }
        assert!(router.supervisor().is_streaming("t1").await);

        router.inject_message("t1", "please stop", "t2").await.unwrap();

        // Pre-empted turn ends with the partial fallback, then the injected
        // user message opens a fresh stream.
        let mut saw_preempted_end = false;
        loop {
            match next_event(&mut sub).await {
                ThreadEvent::StreamEnd {
                    message,
                    fallback_text,
                    ..
                } if !saw_preempted_end => {
                    assert!(message.is_none());
                    assert_eq!(fallback_text.as_deref(), Some("partial"));
                    saw_preempted_end = true;
                }
                ThreadEvent::UserMessageAppended { message } => {
                    assert!(saw_preempted_end, "injection must follow the aborted end");
                    assert!(message
                        .content
                        .starts_with("[From agent \"t2\"]:\nplease stop\n"));
                    break;
                }
                _ => continue,
            }
        }
        long_turn.await.unwrap().unwrap();

        // The injected turn re-runs the same stub; after the grace period
        // the agent is streaming again.
        loop {
            if matches!(next_event(&mut sub).await, ThreadEvent::StreamChunk { .. }) {
                break;
            }
        }
        assert!(router.supervisor().is_streaming("t1").await);
    }
}
