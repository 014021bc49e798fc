//! Outbound message bus — trait for publishing domain messages from any
//! module.
//!
//! Modules accept an `Arc<dyn MessageSink>` and publish fire-and-forget with
//! at-least-once semantics; consumers must be idempotent. Production
//! implementations route to a broker, the in-crate implementations cover
//! tests and single-process runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Outbound channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Raw ingested usage events.
    Events,
    /// Bootstrap generator instructions.
    OnboardingEvents,
    /// Domain events for webhook consumers.
    Webhooks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub channel: Channel,
    pub topic: String,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

/// Trait for publishing outbound messages.
pub trait MessageSink: Send + Sync {
    fn publish(&self, msg: OutboundMessage);
}

/// No-op sink for modules that don't need publication.
pub struct NoOpSink;

impl MessageSink for NoOpSink {
    fn publish(&self, _msg: OutboundMessage) {}
}

/// In-memory sink that captures messages for testing.
#[derive(Default)]
pub struct CaptureSink {
    messages: Mutex<Vec<OutboundMessage>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages.lock().expect("message bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.messages.lock().expect("message bus mutex poisoned").len()
    }

    pub fn count_channel(&self, channel: Channel) -> usize {
        self.messages
            .lock()
            .expect("message bus mutex poisoned")
            .iter()
            .filter(|m| m.channel == channel)
            .count()
    }

    pub fn count_topic(&self, topic: &str) -> usize {
        self.messages
            .lock()
            .expect("message bus mutex poisoned")
            .iter()
            .filter(|m| m.topic == topic)
            .count()
    }

    pub fn clear(&self) {
        self.messages.lock().expect("message bus mutex poisoned").clear();
    }
}

impl MessageSink for CaptureSink {
    fn publish(&self, msg: OutboundMessage) {
        self.messages.lock().expect("message bus mutex poisoned").push(msg);
    }
}

/// Convenience builder for an `OutboundMessage`.
pub fn make_message(channel: Channel, topic: impl Into<String>, payload: serde_json::Value) -> OutboundMessage {
    OutboundMessage {
        id: Uuid::new_v4(),
        channel,
        topic: topic.into(),
        payload,
        published_at: Utc::now(),
    }
}

/// Convenience: a no-op sink for modules that don't publish.
pub fn noop_sink() -> Arc<dyn MessageSink> {
    Arc::new(NoOpSink)
}

/// Convenience: a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
