//! The activation kernel: single entry point for every state change.
//!
//! Each accepted transition writes the activation row, appends one forensic
//! history row, bumps the transition counter, and queues any outbox rows the
//! caller staged — all under the activation's write lock. Bus side effects
//! are emitted after the commit; their failures are logged, never propagated.

pub mod bus;
pub mod metrics;

pub use bus::{BusEvent, EventBus};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use numio_core::{
    check_transition, Activation, ActivationId, ActivationState, EventType, NumioError,
    OutboxEvent, OutboxId, OutboxStatus, StateHistoryRecord, Timestamp, TraceId,
};
use numio_store::Store;

// ── Transition context ───────────────────────────────────────────────────────

/// Caller-supplied context for one transition.
pub struct TransitionCtx {
    pub reason: String,
    pub metadata: serde_json::Value,
    pub trace_id: TraceId,
    /// Outbox rows to append in the same commit as the state change. The only
    /// sanctioned way to queue saga compensations.
    pub events: Vec<PendingEvent>,
}

impl TransitionCtx {
    pub fn new(reason: impl Into<String>, trace_id: TraceId) -> Self {
        Self {
            reason: reason.into(),
            metadata: serde_json::Value::Null,
            trace_id,
            events: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_event(mut self, event: PendingEvent) -> Self {
        self.events.push(event);
        self
    }
}

/// An outbox row staged for the next commit.
pub struct PendingEvent {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    /// Seconds before the dispatcher may pick the row up. Zero for most
    /// events; safety-net rows give the inline path a head start.
    pub delay_secs: i64,
}

impl PendingEvent {
    pub fn activation(id: ActivationId, event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            aggregate_type: "activation".into(),
            aggregate_id: id.to_string(),
            event_type,
            payload,
            delay_secs: 0,
        }
    }

    pub fn with_delay(mut self, delay_secs: i64) -> Self {
        self.delay_secs = delay_secs;
        self
    }
}

// ── Kernel ───────────────────────────────────────────────────────────────────

pub struct Kernel {
    store: Arc<Store>,
    bus: EventBus,
    /// Per-activation write locks; satisfies the row-lock contract.
    row_locks: Mutex<HashMap<ActivationId, Arc<Mutex<()>>>>,
    clock: Box<dyn Fn() -> Timestamp + Send + Sync>,
}

impl Kernel {
    pub fn new(store: Arc<Store>, bus: EventBus) -> Self {
        Self::with_clock(store, bus, Box::new(|| chrono::Utc::now().timestamp()))
    }

    pub fn with_clock(
        store: Arc<Store>,
        bus: EventBus,
        clock: Box<dyn Fn() -> Timestamp + Send + Sync>,
    ) -> Self {
        Self {
            store,
            bus,
            row_locks: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn now(&self) -> Timestamp {
        (self.clock)()
    }

    // One entry per activation, kept for the process lifetime.
    fn row_lock(&self, id: ActivationId) -> Arc<Mutex<()>> {
        let mut locks = self.row_locks.lock().expect("row lock map poisoned");
        locks.entry(id).or_default().clone()
    }

    // ── Creation ─────────────────────────────────────────────────────────────

    /// Persist a fresh activation and run its `INIT → RESERVED` transition in
    /// one commit, staging `events` alongside. The activation must arrive in
    /// `INIT`.
    pub fn create(
        &self,
        mut activation: Activation,
        events: Vec<PendingEvent>,
    ) -> Result<Activation, NumioError> {
        if activation.state != ActivationState::Init {
            return Err(NumioError::InvalidTransition {
                from: activation.state,
                to: ActivationState::Reserved,
            });
        }
        let lock = self.row_lock(activation.id);
        let _guard = lock.lock().expect("row lock poisoned");

        activation.state = ActivationState::Reserved;
        self.store.put_activation(&activation)?;
        self.append_history(
            &activation,
            ActivationState::Init,
            ActivationState::Reserved,
            "order created",
            serde_json::Value::Null,
        )?;
        for ev in &events {
            self.append_outbox(ev)?;
        }
        metrics::record_transition("INIT", "RESERVED", activation.provider_id.as_str());
        info!(id = %activation.id, user = %activation.user_id, "activation created");
        Ok(activation)
    }

    // ── Transitions ──────────────────────────────────────────────────────────

    /// Move `id` to `to`. Idempotent when already there; `InvalidTransition`
    /// when the state machine forbids it.
    pub fn transition(
        &self,
        id: ActivationId,
        to: ActivationState,
        ctx: TransitionCtx,
    ) -> Result<Activation, NumioError> {
        self.transition_inner(id, None, to, ctx)
    }

    /// Move `id` to `to` only when it currently sits at `expected`; otherwise
    /// raise `ActivationConflict`. The outbox dispatcher's safety net.
    pub fn transition_expected(
        &self,
        id: ActivationId,
        expected: ActivationState,
        to: ActivationState,
        ctx: TransitionCtx,
    ) -> Result<Activation, NumioError> {
        self.transition_inner(id, Some(expected), to, ctx)
    }

    fn transition_inner(
        &self,
        id: ActivationId,
        expected: Option<ActivationState>,
        to: ActivationState,
        ctx: TransitionCtx,
    ) -> Result<Activation, NumioError> {
        let lock = self.row_lock(id);
        let _guard = lock.lock().expect("row lock poisoned");

        let mut activation = self
            .store
            .get_activation(id)?
            .ok_or(NumioError::ActivationNotFound(id))?;
        let from = activation.state;

        if let Some(expected) = expected {
            if from != expected {
                return Err(NumioError::ActivationConflict { id, expected, actual: from });
            }
        }
        if from == to {
            return Ok(activation); // idempotent re-delivery
        }
        if let Err(e) = check_transition(from, to) {
            // Always a bug in the caller; keep the full context in the log.
            error!(id = %id, %from, %to, trace = %ctx.trace_id, "invalid transition");
            return Err(e);
        }

        activation.state = to;
        activation.trace_id = ctx.trace_id.clone();
        self.store.put_activation(&activation)?;
        self.append_history(&activation, from, to, &ctx.reason, ctx.metadata)?;
        for ev in &ctx.events {
            self.append_outbox(ev)?;
        }
        // Terminal orders stop occupying their idempotency key.
        if to.is_terminal() {
            if let Some(key) = &activation.idempotency_key {
                if let Err(e) = self.store.release_idempotency_key(key) {
                    warn!(id = %id, error = %e, "failed to release idempotency key");
                }
            }
        }
        metrics::record_transition(from.label(), to.label(), activation.provider_id.as_str());
        info!(id = %id, %from, %to, reason = %ctx.reason, "transition");

        // Post-commit side effects: best-effort, never rolled back.
        self.emit_state_events(&activation, from, to);
        Ok(activation)
    }

    /// Update non-state fields of an activation under its row lock. The
    /// mutator must leave `state` untouched; state changes go through
    /// `transition`.
    pub fn update_activation<F>(&self, id: ActivationId, mutate: F) -> Result<Activation, NumioError>
    where
        F: FnOnce(&mut Activation),
    {
        let lock = self.row_lock(id);
        let _guard = lock.lock().expect("row lock poisoned");
        let mut activation = self
            .store
            .get_activation(id)?
            .ok_or(NumioError::ActivationNotFound(id))?;
        let state_before = activation.state;
        mutate(&mut activation);
        if activation.state != state_before {
            return Err(NumioError::Other(
                "state changes must go through Kernel::transition".into(),
            ));
        }
        self.store.put_activation(&activation)?;
        Ok(activation)
    }

    // ── Outbox ───────────────────────────────────────────────────────────────

    /// Append one outbox row outside a transition.
    pub fn dispatch_event(&self, event: PendingEvent) -> Result<OutboxId, NumioError> {
        self.append_outbox(&event)
    }

    fn append_outbox(&self, event: &PendingEvent) -> Result<OutboxId, NumioError> {
        let now = self.now();
        let id = OutboxId(self.store.next_id()?);
        self.store.put_outbox(&OutboxEvent {
            id,
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            event_type: event.event_type,
            payload: event.payload.clone(),
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            next_attempt_at: now + event.delay_secs,
            published_at: None,
        })?;
        Ok(id)
    }

    // ── Side effects ─────────────────────────────────────────────────────────

    fn emit_state_events(&self, activation: &Activation, from: ActivationState, to: ActivationState) {
        let payload = serde_json::json!({
            "activationId": activation.id.to_string(),
            "from": from.label(),
            "to": to.label(),
            "phone": activation.phone,
            "traceId": activation.trace_id.as_str(),
        });
        self.bus.publish("activation.state", Some(&activation.user_id), payload.clone());

        let domain_topic = match to {
            ActivationState::Active => Some(EventType::ActivationActive),
            ActivationState::Received => Some(EventType::ActivationReceived),
            ActivationState::Failed => Some(EventType::ActivationFailed),
            ActivationState::Expired => Some(EventType::ActivationExpired),
            _ => None,
        };
        if let Some(topic) = domain_topic {
            self.bus.publish(topic.as_str(), Some(&activation.user_id), payload);
        }
    }

    fn append_history(
        &self,
        activation: &Activation,
        from: ActivationState,
        to: ActivationState,
        reason: &str,
        metadata: serde_json::Value,
    ) -> Result<(), NumioError> {
        let seq = self.store.history_len(activation.id)?;
        self.store.append_history(&StateHistoryRecord {
            activation_id: activation.id,
            seq,
            from_state: from,
            to_state: to,
            reason: reason.to_string(),
            metadata,
            trace_id: activation.trace_id.clone(),
            at: self.now(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use numio_core::{Money, ProviderId, UserId};

    fn temp_kernel(name: &str) -> (Arc<Store>, Kernel) {
        let dir = std::env::temp_dir().join(format!("numio_kernel_test_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        let store = Arc::new(Store::open(&dir).expect("open temp store"));
        let kernel = Kernel::with_clock(Arc::clone(&store), EventBus::new(64), Box::new(|| 1_000));
        (store, kernel)
    }

    fn new_activation(store: &Store) -> Activation {
        Activation {
            id: ActivationId(store.next_id().unwrap()),
            user_id: UserId::new("u1"),
            provider_id: ProviderId::new("mock"),
            price: Money::from_cents(1000),
            state: ActivationState::Init,
            service_code: "tg".into(),
            country_code: "US".into(),
            service_name: None,
            country_name: None,
            operator: None,
            upstream_id: None,
            phone: None,
            created_at: 1_000,
            expires_at: None,
            idempotency_key: None,
            reservation_id: None,
            reserve_entry: None,
            capture_entry: None,
            refund_entry: None,
            number_id: None,
            trace_id: TraceId::new("t1"),
        }
    }

    #[test]
    fn create_writes_reserved_and_history() {
        let (store, kernel) = temp_kernel("create");
        let act = kernel.create(new_activation(&store), vec![]).unwrap();
        assert_eq!(act.state, ActivationState::Reserved);
        let hist = store.history_for(act.id).unwrap();
        assert_eq!(hist.len(), 1);
        assert_eq!(hist[0].from_state, ActivationState::Init);
        assert_eq!(hist[0].to_state, ActivationState::Reserved);
    }

    #[test]
    fn transition_appends_ordered_history() {
        let (store, kernel) = temp_kernel("hist");
        let act = kernel.create(new_activation(&store), vec![]).unwrap();
        kernel
            .transition(act.id, ActivationState::Active, TransitionCtx::new("acquired", TraceId::new("t2")))
            .unwrap();
        kernel
            .transition(act.id, ActivationState::Received, TransitionCtx::new("sms", TraceId::new("t3")))
            .unwrap();
        let hist = store.history_for(act.id).unwrap();
        let states: Vec<_> = hist.iter().map(|h| h.to_state).collect();
        assert_eq!(
            states,
            vec![ActivationState::Reserved, ActivationState::Active, ActivationState::Received]
        );
    }

    #[test]
    fn same_state_is_noop() {
        let (store, kernel) = temp_kernel("noop");
        let act = kernel.create(new_activation(&store), vec![]).unwrap();
        kernel
            .transition(act.id, ActivationState::Active, TransitionCtx::new("acquired", TraceId::new("t")))
            .unwrap();
        // Re-delivered transition: accepted, no new history row.
        kernel
            .transition(act.id, ActivationState::Active, TransitionCtx::new("dup", TraceId::new("t")))
            .unwrap();
        assert_eq!(store.history_for(act.id).unwrap().len(), 2);
    }

    #[test]
    fn illegal_transition_rejected_and_unwritten() {
        let (store, kernel) = temp_kernel("illegal");
        let act = kernel.create(new_activation(&store), vec![]).unwrap();
        let err = kernel
            .transition(act.id, ActivationState::Received, TransitionCtx::new("skip", TraceId::new("t")))
            .unwrap_err();
        assert!(matches!(err, NumioError::InvalidTransition { .. }));
        let reloaded = store.get_activation(act.id).unwrap().unwrap();
        assert_eq!(reloaded.state, ActivationState::Reserved);
        assert_eq!(store.history_for(act.id).unwrap().len(), 1);
    }

    #[test]
    fn expected_state_mismatch_is_conflict() {
        let (store, kernel) = temp_kernel("conflict");
        let act = kernel.create(new_activation(&store), vec![]).unwrap();
        kernel
            .transition(act.id, ActivationState::Active, TransitionCtx::new("acquired", TraceId::new("t")))
            .unwrap();
        let err = kernel
            .transition_expected(
                act.id,
                ActivationState::Reserved,
                ActivationState::Failed,
                TransitionCtx::new("late", TraceId::new("t")),
            )
            .unwrap_err();
        assert!(matches!(err, NumioError::ActivationConflict { .. }));
    }

    #[test]
    fn staged_events_land_in_outbox() {
        let (store, kernel) = temp_kernel("events");
        let act = kernel.create(new_activation(&store), vec![]).unwrap();
        kernel
            .transition(
                act.id,
                ActivationState::Failed,
                TransitionCtx::new("saga failure", TraceId::new("t")).with_event(
                    PendingEvent::activation(
                        act.id,
                        EventType::SagaCompensateCancelNumber,
                        serde_json::json!({"providerActivationId": "U2"}),
                    ),
                ),
            )
            .unwrap();
        let rows = store.iter_all_outbox().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, EventType::SagaCompensateCancelNumber);
        assert_eq!(rows[0].status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn bus_carries_domain_event_on_user_visible_transition() {
        let (store, kernel) = temp_kernel("bus");
        let mut rx = kernel.bus().subscribe();
        let act = kernel.create(new_activation(&store), vec![]).unwrap();
        kernel
            .transition(act.id, ActivationState::Active, TransitionCtx::new("acquired", TraceId::new("t")))
            .unwrap();
        // First the raw state event, then the domain event.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.topic, "activation.state");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.topic, "activation.active");
    }
}
