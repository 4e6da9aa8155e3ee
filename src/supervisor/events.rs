//! Per-thread event fan-out.
//!
//! The supervisor publishes turn lifecycle events onto one broadcast
//! channel per thread. Consumers hold an owned [`Subscription`]; dropping
//! it unsubscribes. The hub holds only channel senders, never references to
//! subscribers, so there is no cycle between supervisor and consumers.

use dashmap::DashMap;
use log::trace;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::store::Message;
use crate::stream::StreamSegment;

/// Size of each per-thread broadcast buffer.
const EVENT_BUFFER_SIZE: usize = 256;

/// Lifecycle and stream events for one thread.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ThreadEvent {
    /// The user turn was appended to history (attachment paths absolute).
    UserMessageAppended { message: Message },
    /// A chunk of assistant prose, separator included if one was applied.
    StreamChunk { text: String },
    /// Every decoded segment, in decoder output order.
    StreamSegment { segment: StreamSegment },
    /// A fatal turn error (currently only CLI-not-found).
    StreamError { error: String },
    /// Exactly one per `send_message`, after all per-line work resolved.
    StreamEnd {
        message: Option<Message>,
        fallback_text: Option<String>,
        segments: Vec<StreamSegment>,
    },
}

/// Registry of per-thread broadcast channels.
pub struct EventHub {
    channels: DashMap<String, broadcast::Sender<ThreadEvent>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a thread's events. The subscription is live from this
    /// call on; events emitted earlier are not replayed.
    pub fn subscribe(&self, thread: &str) -> Subscription {
        let sender = self
            .channels
            .entry(thread.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_BUFFER_SIZE).0);
        Subscription {
            receiver: sender.subscribe(),
        }
    }

    /// Emit an event to the thread's subscribers, if any.
    pub fn emit(&self, thread: &str, event: ThreadEvent) {
        if let Some(sender) = self.channels.get(thread) {
            trace!("emit {thread}: {event:?}");
            let _ = sender.send(event);
        }
    }
}

/// An owned handle on one thread's event stream.
pub struct Subscription {
    receiver: broadcast::Receiver<ThreadEvent>,
}

impl Subscription {
    /// Receive the next event. Returns `None` once the hub is gone. A slow
    /// subscriber that lags the buffer skips ahead rather than blocking the
    /// supervisor.
    pub async fn next(&mut self) -> Option<ThreadEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("subscriber lagged, skipped {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
