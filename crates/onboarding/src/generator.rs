//! Synthetic event generation for seeded environments.
//!
//! `request_generation` publishes an instruction message on the
//! onboarding_events channel; `run` is the background generator that honors
//! it, pacing one event per tick with no buffering — a stalled sink slows
//! the loop rather than growing a queue — and stopping cooperatively on the
//! shutdown channel.

use meterflow_core::catalog::Meter;
use meterflow_core::config::EventGenerationConfig;
use meterflow_core::error::BillingResult;
use meterflow_core::event_bus::{make_message, Channel, MessageSink, OutboundMessage};
use meterflow_core::types::UsageEvent;
use meterflow_store::contracts::EventRepo;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

/// One meter's share of the generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterTarget {
    pub meter_id: Uuid,
    pub event_name: String,
    pub count: u64,
}

/// Instruction published to the background generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateEventsRequest {
    pub external_customer_id: String,
    pub duration_seconds: u64,
    pub rate_per_second: u32,
    pub targets: Vec<MeterTarget>,
}

/// Split `total` evenly across `n` meters, remainder to the first ones.
pub fn distribute_events(total: u64, meter_count: usize) -> Vec<u64> {
    if meter_count == 0 {
        return Vec::new();
    }
    let n = meter_count as u64;
    let base = total / n;
    let remainder = total % n;
    (0..n).map(|i| base + u64::from(i < remainder)).collect()
}

pub struct EventGenerator {
    events: Arc<dyn EventRepo>,
    sink: Arc<dyn MessageSink>,
    config: EventGenerationConfig,
}

impl EventGenerator {
    pub fn new(
        events: Arc<dyn EventRepo>,
        sink: Arc<dyn MessageSink>,
        config: EventGenerationConfig,
    ) -> Self {
        Self {
            events,
            sink,
            config,
        }
    }

    /// Publish the instruction for a generation run at the configured rate,
    /// distributing the total evenly across the selected meters.
    pub fn request_generation(
        &self,
        external_customer_id: &str,
        duration_seconds: u64,
        meters: &[Meter],
    ) -> GenerateEventsRequest {
        let rate = self.config.rate_per_second;
        let total = duration_seconds * u64::from(rate);
        let counts = distribute_events(total, meters.len());
        let targets = meters
            .iter()
            .zip(counts)
            .map(|(meter, count)| MeterTarget {
                meter_id: meter.id,
                event_name: meter.event_name.clone(),
                count,
            })
            .collect::<Vec<_>>();
        let request = GenerateEventsRequest {
            external_customer_id: external_customer_id.to_string(),
            duration_seconds,
            rate_per_second: rate,
            targets,
        };
        self.sink.publish(make_message(
            Channel::OnboardingEvents,
            "events.generate",
            serde_json::to_value(&request).unwrap_or_default(),
        ));
        info!(
            customer = %external_customer_id,
            duration_seconds,
            rate,
            meters = meters.len(),
            "event generation requested"
        );
        request
    }

    /// Run a generation request to completion or cancellation. Returns the
    /// number of events emitted.
    pub async fn run(
        &self,
        request: &GenerateEventsRequest,
        mut shutdown: watch::Receiver<bool>,
    ) -> BillingResult<u64> {
        let rate = request.rate_per_second.max(1);
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(
            (1000 / u64::from(rate)).max(1),
        ));
        // Round-robin over targets until each reaches its count.
        let mut remaining: Vec<u64> = request.targets.iter().map(|t| t.count).collect();
        let mut emitted = 0u64;
        let mut cursor = 0usize;
        while remaining.iter().any(|&r| r > 0) {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(emitted, "event generation cancelled");
                        return Ok(emitted);
                    }
                }
            }
            // Next target with work left.
            while remaining[cursor % remaining.len()] == 0 {
                cursor += 1;
            }
            let idx = cursor % remaining.len();
            cursor += 1;
            let target = &request.targets[idx];
            remaining[idx] -= 1;

            let event = self.synthetic_event(target, &request.external_customer_id);
            let payload = serde_json::to_value(&event).unwrap_or_default();
            self.events.insert_event(event).await?;
            self.sink
                .publish(make_message(Channel::Events, target.event_name.clone(), payload));
            emitted += 1;
        }
        debug!(emitted, "event generation finished");
        Ok(emitted)
    }

    fn synthetic_event(&self, target: &MeterTarget, external_customer_id: &str) -> UsageEvent {
        let mut rng = rand::thread_rng();
        let mut properties = HashMap::new();
        properties.insert(
            "tokens".to_string(),
            serde_json::json!(rng.gen_range(50..2000)),
        );
        properties.insert(
            "model".to_string(),
            serde_json::json!(["llm-small", "llm-large"][rng.gen_range(0..2)]),
        );
        UsageEvent {
            id: Uuid::new_v4().to_string(),
            event_name: target.event_name.clone(),
            external_customer_id: external_customer_id.to_string(),
            properties,
            timestamp: Utc::now(),
        }
    }
}

/// Convenience: consume a published onboarding_events message back into a
/// request. Generators are idempotent consumers: replaying a message with
/// the same event ids is harmless, fresh ids just add events.
pub fn parse_generation_message(msg: &OutboundMessage) -> Option<GenerateEventsRequest> {
    if msg.channel != Channel::OnboardingEvents {
        return None;
    }
    serde_json::from_value(msg.payload.clone()).ok()
}
