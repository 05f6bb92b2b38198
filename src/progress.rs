//! Session-scoped progress broadcasting.
//!
//! Long operations publish [`ProgressEvent`]s on a topic named
//! `"<kind>_progress_<session_id>"`. Publishing is fire-and-forget: an
//! event with no subscriber is dropped and the job carries on.
//!
//! Each topic follows `processing → completed | failed`. The first
//! `complete` or `error` event is terminal: the [`ProgressBroadcaster`]
//! drops anything sent after it, and a [`Subscription`] ends at the first
//! terminal event it sees, so duplicates are ignored on both sides.
//!
//! The CLI renders events on **stderr** (human or JSON lines) so stdout
//! stays parseable for scripts.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use repo_compare_core::models::OperationKind;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Progress,
    Complete,
    Error,
}

/// Wire payload of one progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_target: Option<String>,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.event_type != EventType::Progress
    }
}

/// Topic name for an operation's progress.
pub fn topic(kind: OperationKind, session_id: &str) -> String {
    format!("{}_progress_{}", kind.as_str(), session_id)
}

type Channels = Arc<Mutex<HashMap<String, broadcast::Sender<ProgressEvent>>>>;

/// Registry of live progress topics.
#[derive(Clone, Default)]
pub struct ProgressHub {
    channels: Channels,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<ProgressEvent> {
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Attach to a session's topic. The session id is the only capability
    /// required, so it must not be blank.
    pub fn subscribe(&self, kind: OperationKind, session_id: &str) -> Result<Subscription> {
        if session_id.trim().is_empty() {
            bail!("session id must not be empty");
        }
        Ok(Subscription {
            receiver: self.sender(&topic(kind, session_id)).subscribe(),
            finished: false,
        })
    }

    /// Publisher for a session's topic.
    pub fn broadcaster(&self, kind: OperationKind, session_id: &str) -> Result<ProgressBroadcaster> {
        if session_id.trim().is_empty() {
            bail!("session id must not be empty");
        }
        let topic = topic(kind, session_id);
        Ok(ProgressBroadcaster {
            sender: self.sender(&topic),
            topic,
            channels: self.channels.clone(),
            finished: AtomicBool::new(false),
        })
    }

    /// Drop a topic without a terminal event. Subscribers see the end of
    /// the stream once no broadcaster holds the channel.
    pub fn close(&self, kind: OperationKind, session_id: &str) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.remove(&topic(kind, session_id));
        }
    }

    /// Number of topics currently open.
    pub fn open_topics(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }
}

/// Publishes events for one session. Cheap to call; never blocks.
pub struct ProgressBroadcaster {
    topic: String,
    sender: broadcast::Sender<ProgressEvent>,
    channels: Channels,
    finished: AtomicBool,
}

impl ProgressBroadcaster {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn broadcast_step(&self, step: &str, message: &str, percentage: Option<u8>) {
        self.publish(ProgressEvent {
            event_type: EventType::Progress,
            message: message.to_string(),
            percentage: percentage.map(|p| p.min(100)),
            step: Some(step.to_string()),
            current: None,
            total: None,
            redirect_target: None,
        });
    }

    /// Step event with an item counter, e.g. "analyzing 2 of 5".
    pub fn broadcast_item(
        &self,
        step: &str,
        message: &str,
        percentage: Option<u8>,
        current: usize,
        total: usize,
    ) {
        self.publish(ProgressEvent {
            event_type: EventType::Progress,
            message: message.to_string(),
            percentage: percentage.map(|p| p.min(100)),
            step: Some(step.to_string()),
            current: Some(current),
            total: Some(total),
            redirect_target: None,
        });
    }

    pub fn broadcast_complete(&self, message: &str, redirect_target: &str) {
        self.publish_terminal(ProgressEvent {
            event_type: EventType::Complete,
            message: message.to_string(),
            percentage: Some(100),
            step: None,
            current: None,
            total: None,
            redirect_target: Some(redirect_target.to_string()),
        });
    }

    pub fn broadcast_error(&self, message: &str) {
        self.publish_terminal(ProgressEvent {
            event_type: EventType::Error,
            message: message.to_string(),
            percentage: None,
            step: None,
            current: None,
            total: None,
            redirect_target: None,
        });
    }

    fn publish(&self, event: ProgressEvent) {
        if self.is_finished() {
            return;
        }
        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    fn publish_terminal(&self, event: ProgressEvent) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.sender.send(event);
        if let Ok(mut channels) = self.channels.lock() {
            channels.remove(&self.topic);
        }
    }
}

/// Receiving side of a topic. Yields events up to and including the first
/// terminal one, then `None`.
pub struct Subscription {
    receiver: broadcast::Receiver<ProgressEvent>,
    finished: bool,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.is_terminal() {
                        self.finished = true;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}

// ============ CLI rendering ============

/// Renders progress events for a terminal or a script.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// Human-friendly progress on stderr: "[ 40%] analyzing  2 / 5  Analyzing rails/rails".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &ProgressEvent) {
        let line = match event.event_type {
            EventType::Progress => {
                let pct = event
                    .percentage
                    .map(|p| format!("[{:>3}%] ", p))
                    .unwrap_or_default();
                let counter = match (event.current, event.total) {
                    (Some(n), Some(total)) => format!(" {} / {} ", n, total),
                    _ => " ".to_string(),
                };
                format!(
                    "{}{}{}{}\n",
                    pct,
                    event.step.as_deref().unwrap_or("progress"),
                    counter,
                    event.message
                )
            }
            EventType::Complete => format!("done  {}\n", event.message),
            EventType::Error => format!("error  {}\n", event.message),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &ProgressEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &ProgressEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_naming() {
        assert_eq!(
            topic(OperationKind::Comparison, "abc"),
            "comparison_progress_abc"
        );
        assert_eq!(topic(OperationKind::Analysis, "s1"), "analysis_progress_s1");
    }

    #[test]
    fn blank_session_is_rejected() {
        let hub = ProgressHub::new();
        assert!(hub.subscribe(OperationKind::Comparison, "  ").is_err());
        assert!(hub.broadcaster(OperationKind::Comparison, "").is_err());
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        let hub = ProgressHub::new();
        let b = hub.broadcaster(OperationKind::Comparison, "s").unwrap();
        b.broadcast_step("searching", "Searching", Some(10));
        b.broadcast_complete("Done", "/comparisons/1");
        assert!(b.is_finished());
        assert_eq!(hub.open_topics(), 0);
    }

    #[tokio::test]
    async fn sender_drops_events_after_terminal() {
        let hub = ProgressHub::new();
        let mut sub = hub.subscribe(OperationKind::Comparison, "s").unwrap();
        let b = hub.broadcaster(OperationKind::Comparison, "s").unwrap();

        b.broadcast_step("parsing", "Understanding your request", Some(5));
        b.broadcast_error("boom");
        b.broadcast_complete("late", "/comparisons/9");
        b.broadcast_step("parsing", "late", None);

        let first = sub.next().await.unwrap();
        assert_eq!(first.event_type, EventType::Progress);
        let second = sub.next().await.unwrap();
        assert_eq!(second.event_type, EventType::Error);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn subscriber_ignores_duplicate_terminals_from_two_senders() {
        let hub = ProgressHub::new();
        let mut sub = hub.subscribe(OperationKind::Analysis, "s").unwrap();
        let a = hub.broadcaster(OperationKind::Analysis, "s").unwrap();
        let b = hub.broadcaster(OperationKind::Analysis, "s").unwrap();

        a.broadcast_complete("first", "/repositories/1");
        b.broadcast_complete("second", "/repositories/1");

        let event = sub.next().await.unwrap();
        assert_eq!(event.message, "first");
        assert!(sub.next().await.is_none());
    }

    #[test]
    fn payload_shape() {
        let event = ProgressEvent {
            event_type: EventType::Complete,
            message: "Done".into(),
            percentage: Some(100),
            step: None,
            current: None,
            total: None,
            redirect_target: Some("/comparisons/3".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "complete");
        assert_eq!(json["redirect_target"], "/comparisons/3");
        assert!(json.get("step").is_none());
    }
}
