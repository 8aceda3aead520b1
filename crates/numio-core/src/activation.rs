use serde::{Deserialize, Serialize};

use crate::state::ActivationState;
use crate::types::{
    ActivationId, LedgerEntryId, Money, NumberId, ProviderId, ReservationId, Timestamp, TraceId,
    UserId,
};

// ── Activation ───────────────────────────────────────────────────────────────

/// The canonical order row. Created in `RESERVED` by the orchestrator and
/// owned by it until a terminal transition.
///
/// Invariants (enforced by the kernel and checked in tests):
///   * exactly one non-terminal activation per idempotency key
///   * `ACTIVE`/`RECEIVED` imply `phone` and `upstream_id` are present
///   * `REFUNDED` implies `refund_entry` references a prior ledger refund
///   * no state change once `RECEIVED` or `REFUNDED`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Activation {
    pub id: ActivationId,
    pub user_id: UserId,
    pub provider_id: ProviderId,
    pub price: Money,
    pub state: ActivationState,
    pub service_code: String,
    pub country_code: String,
    pub service_name: Option<String>,
    pub country_name: Option<String>,
    pub operator: Option<String>,
    /// Provider-native activation id, set once a number is acquired.
    pub upstream_id: Option<String>,
    pub phone: Option<String>,
    pub created_at: Timestamp,
    pub expires_at: Option<Timestamp>,
    /// Unique among non-terminal activations when present.
    pub idempotency_key: Option<String>,
    pub reservation_id: Option<ReservationId>,
    pub reserve_entry: Option<LedgerEntryId>,
    pub capture_entry: Option<LedgerEntryId>,
    pub refund_entry: Option<LedgerEntryId>,
    pub number_id: Option<NumberId>,
    pub trace_id: TraceId,
}

impl Activation {
    /// True when the order may still be cancelled by its owner.
    pub fn can_cancel(&self) -> bool {
        matches!(
            self.state,
            ActivationState::Reserved | ActivationState::Active
        )
    }
}

// ── ActivationStateHistory ───────────────────────────────────────────────────

/// Append-only forensic record: one row per accepted transition. Never
/// mutated after the commit that wrote it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateHistoryRecord {
    pub activation_id: ActivationId,
    /// Position in the activation's history, starting at 0.
    pub seq: u64,
    pub from_state: ActivationState,
    pub to_state: ActivationState,
    pub reason: String,
    pub metadata: serde_json::Value,
    pub trace_id: TraceId,
    pub at: Timestamp,
}

// ── Number ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum NumberStatus {
    Active,
    Received,
    Completed,
    Cancelled,
    Expired,
}

impl NumberStatus {
    /// Statuses the poll manager and reaper still act on.
    pub fn is_live(self) -> bool {
        matches!(self, NumberStatus::Active | NumberStatus::Received)
    }
}

/// The acquired upstream asset bound to an activation. Created by the
/// orchestrator on successful acquisition; owned by the poll manager and the
/// reaper until terminal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Number {
    pub id: NumberId,
    pub activation_id: ActivationId,
    pub phone: String,
    pub upstream_id: String,
    pub user_id: UserId,
    pub provider_id: ProviderId,
    pub service_code: String,
    pub country_code: String,
    pub price: Money,
    pub status: NumberStatus,
    pub expires_at: Timestamp,
    pub created_at: Timestamp,
}

// ── PollCursor ───────────────────────────────────────────────────────────────

/// Per-activation polling state, kept in the cache keyspace next to the
/// due-index. Feeds the adaptive schedule.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PollCursor {
    pub attempt: u32,
    pub last_error: bool,
    pub last_sms_at: Option<Timestamp>,
}

// ── SmsMessage ───────────────────────────────────────────────────────────────

/// One inbound message. `(number_id, code)` is unique so ingestion is
/// idempotent; re-delivery of the same code never produces a second row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SmsMessage {
    pub number_id: NumberId,
    /// Verification code extracted upstream (or the full text when no code
    /// could be extracted).
    pub code: String,
    pub content: String,
    pub sender: Option<String>,
    pub received_at: Timestamp,
}
