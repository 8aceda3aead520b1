use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{OutboxId, Timestamp};

// ── Event vocabulary ─────────────────────────────────────────────────────────

/// Every event type the outbox and the bus carry. Payloads are opaque JSON.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum EventType {
    ActivationActive,
    ActivationReceived,
    ActivationFailed,
    ActivationExpired,
    OfferCreated,
    OfferUpdated,
    SagaCompensateCancelNumber,
    ProviderRequest,
    Refund,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::ActivationActive => "activation.active",
            EventType::ActivationReceived => "activation.received",
            EventType::ActivationFailed => "activation.failed",
            EventType::ActivationExpired => "activation.expired",
            EventType::OfferCreated => "offer.created",
            EventType::OfferUpdated => "offer.updated",
            EventType::SagaCompensateCancelNumber => "saga.compensate.cancel_number",
            EventType::ProviderRequest => "provider_request",
            EventType::Refund => "refund",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── OutboxEvent ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

/// One reliable-delivery unit. Consumers are at-least-once and must be
/// idempotent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: OutboxId,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// Earliest time the dispatcher may attempt this row again.
    pub next_attempt_at: Timestamp,
    /// Set once dispatch completed. A PUBLISHED row without it is an in-flight
    /// claim; past the lease window it becomes reclaimable.
    pub published_at: Option<Timestamp>,
}

impl OutboxEvent {
    /// Dead rows (settled or parked) are eligible for housekeeping purge.
    pub fn is_settled(&self) -> bool {
        match self.status {
            OutboxStatus::Published => self.published_at.is_some(),
            OutboxStatus::Failed => true,
            OutboxStatus::Pending => false,
        }
    }
}
