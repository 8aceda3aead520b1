use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use numio_adapter::{AcquireOptions, AdapterRegistry};
use numio_catalog::Catalog;
use numio_core::{
    Activation, ActivationId, ActivationState, EventType, Money, Number, NumberId, NumberStatus,
    NumioError, Offer, PurchaseErrorCode, TraceId, UserId,
    INITIAL_POLL_DELAY_SECS, NUMBER_BASE_TIMEOUT_SECS, ZOMBIE_RESERVATION_AGE_SECS,
};
use numio_kernel::{Kernel, PendingEvent, TransitionCtx};
use numio_store::{CacheStore, Store};
use numio_wallet::WalletGateway;

/// Grace period the inline purchase path gets before the outbox dispatcher
/// picks up the `provider_request` safety-net row.
const PROVIDER_REQUEST_GRACE_SECS: i64 = 30;

// ── Request / outcome ────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct PurchaseRequest {
    pub user_id: UserId,
    /// Pin the purchase to one provider; otherwise resolution picks the
    /// cheapest offer across providers.
    pub provider_id: Option<numio_core::ProviderId>,
    pub service: String,
    pub country: String,
    /// The highest price the buyer accepted. The resolved offer must not
    /// exceed it.
    pub max_price: Money,
    /// Provider-native operator string.
    pub operator: Option<String>,
    pub idempotency_key: Option<String>,
    pub trace_id: TraceId,
}

#[derive(Clone, Debug)]
pub enum PurchaseOutcome {
    Success {
        activation_id: ActivationId,
        phone: String,
        upstream_id: String,
    },
    /// An already-running order for the same idempotency key.
    Existing {
        activation_id: ActivationId,
        state: ActivationState,
        phone: Option<String>,
        upstream_id: Option<String>,
    },
    Failure {
        code: PurchaseErrorCode,
        message: String,
        activation_id: Option<ActivationId>,
    },
}

impl PurchaseOutcome {
    fn fail(code: PurchaseErrorCode, message: impl Into<String>) -> Self {
        PurchaseOutcome::Failure { code, message: message.into(), activation_id: None }
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────────────

pub struct Orchestrator {
    store: Arc<Store>,
    cache: Arc<CacheStore>,
    kernel: Arc<Kernel>,
    wallet: Arc<dyn WalletGateway>,
    catalog: Arc<Catalog>,
    adapters: AdapterRegistry,
    /// Forces the next post-acquire commit to fail (compensation-path tests).
    fail_next_commit: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<CacheStore>,
        kernel: Arc<Kernel>,
        wallet: Arc<dyn WalletGateway>,
        catalog: Arc<Catalog>,
        adapters: AdapterRegistry,
    ) -> Self {
        Self {
            store,
            cache,
            kernel,
            wallet,
            catalog,
            adapters,
            fail_next_commit: AtomicBool::new(false),
        }
    }

    #[doc(hidden)]
    pub fn inject_commit_failure(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    // ── Purchase ─────────────────────────────────────────────────────────────

    /// Run the purchase protocol. Steps 1–2 are synchronous and atomic; the
    /// acquisition continues inline, with the queued `provider_request` row
    /// as the crash safety net.
    pub async fn purchase(&self, req: PurchaseRequest) -> PurchaseOutcome {
        // Idempotent replay: an order already exists for this key.
        if let Some(key) = &req.idempotency_key {
            match self.store.find_by_idempotency_key(key) {
                Ok(Some(existing)) => {
                    return PurchaseOutcome::Existing {
                        activation_id: existing.id,
                        state: existing.state,
                        phone: existing.phone,
                        upstream_id: existing.upstream_id,
                    };
                }
                Ok(None) => {}
                Err(e) => return PurchaseOutcome::fail(e.purchase_code(), e.to_string()),
            }
        }

        // Offer resolution (pure, no side effects).
        let offer = match self
            .catalog
            .resolve_purchase(
                &req.service,
                &req.country,
                req.operator.as_deref(),
                req.provider_id.as_ref(),
            )
            .await
        {
            Ok(offer) => offer,
            Err(e) => return PurchaseOutcome::fail(e.purchase_code(), e.to_string()),
        };
        if offer.price > req.max_price {
            return PurchaseOutcome::fail(
                PurchaseErrorCode::InvalidRequest,
                format!("offer price {} exceeds accepted price {}", offer.price, req.max_price),
            );
        }

        // Step 1: balance probe. No side effect on failure.
        match self.wallet.available_balance(&req.user_id).await {
            Ok(available) if available < offer.price => {
                return PurchaseOutcome::fail(
                    PurchaseErrorCode::InsufficientBalance,
                    format!("available {available}, need {}", offer.price),
                );
            }
            Ok(_) => {}
            Err(e) => return PurchaseOutcome::fail(e.purchase_code(), e.to_string()),
        }

        // Step 2: reservation.
        let activation = match self.reserve(&req, &offer).await {
            Ok(act) => act,
            Err(ReserveFailure::Raced(existing)) => {
                return PurchaseOutcome::Existing {
                    activation_id: existing.id,
                    state: existing.state,
                    phone: existing.phone,
                    upstream_id: existing.upstream_id,
                };
            }
            Err(ReserveFailure::Error(e)) => {
                return PurchaseOutcome::fail(e.purchase_code(), e.to_string())
            }
        };

        // Steps 3–7 continue inline.
        self.run_acquisition(activation.id).await
    }

    async fn reserve(
        &self,
        req: &PurchaseRequest,
        offer: &Offer,
    ) -> Result<Activation, ReserveFailure> {
        let now = self.kernel.now();
        let id = ActivationId(self.store.next_id().map_err(ReserveFailure::Error)?);

        // The key is claimed before any money moves; a concurrent twin gets
        // the winner's identity back.
        if let Some(key) = &req.idempotency_key {
            match self.store.claim_idempotency_key(key, id) {
                Ok(Ok(())) => {}
                Ok(Err(winner_id)) => {
                    // The winner may not have committed its row yet.
                    return match self.store.get_activation(winner_id) {
                        Ok(Some(existing)) => Err(ReserveFailure::Raced(existing)),
                        Ok(None) => Err(ReserveFailure::Error(NumioError::Other(
                            "a purchase with this idempotency key is in flight".into(),
                        ))),
                        Err(e) => Err(ReserveFailure::Error(e)),
                    };
                }
                Err(e) => return Err(ReserveFailure::Error(e)),
            }
        }

        let reserve_key = req.idempotency_key.as_ref().map(|k| format!("reserve_{k}"));
        let reserve_entry = self
            .wallet
            .reserve(
                &req.user_id,
                offer.price,
                "number purchase",
                &id.to_string(),
                reserve_key.as_deref(),
            )
            .await
            .map_err(ReserveFailure::Error)?;

        let reservation = match self
            .catalog
            .reserve(&offer.doc_id, 1, ZOMBIE_RESERVATION_AGE_SECS)
            .await
        {
            Ok(resv) => resv,
            Err(e) => {
                // Undo the hold; nothing else has happened yet.
                if let Err(rb) = self.wallet.rollback(reserve_entry.id, None).await {
                    error!(activation = %id, error = %rb, "rollback after stock failure");
                }
                if let Some(key) = &req.idempotency_key {
                    let _ = self.store.release_idempotency_key(key);
                }
                return Err(ReserveFailure::Error(e));
            }
        };

        let activation = Activation {
            id,
            user_id: req.user_id.clone(),
            provider_id: offer.provider_id.clone(),
            price: offer.price,
            state: ActivationState::Init,
            service_code: offer.service_code.clone(),
            country_code: offer.country_code.clone(),
            service_name: Some(offer.service_name.clone()),
            country_name: Some(offer.country_name.clone()),
            operator: offer.operator.clone(),
            upstream_id: None,
            phone: None,
            created_at: now,
            expires_at: None,
            idempotency_key: req.idempotency_key.clone(),
            reservation_id: Some(reservation.id),
            reserve_entry: Some(reserve_entry.id),
            capture_entry: None,
            refund_entry: None,
            number_id: None,
            trace_id: req.trace_id.clone(),
        };

        let provider_request = PendingEvent::activation(
            id,
            EventType::ProviderRequest,
            serde_json::json!({
                "activationId": id.as_u64(),
                "provider": offer.provider_id.as_str(),
                "country": offer.country_code,
                "service": offer.service_code,
                "operator": offer.operator,
                "maxPriceCents": offer.price.cents(),
            }),
        )
        .with_delay(PROVIDER_REQUEST_GRACE_SECS);

        self.kernel
            .create(activation, vec![provider_request])
            .map_err(ReserveFailure::Error)
    }

    // ── Acquisition (saga steps 3–5) ─────────────────────────────────────────

    /// Drive acquisition for a RESERVED activation. Also the entry point the
    /// outbox dispatcher uses when the inline path died.
    pub async fn run_acquisition(&self, id: ActivationId) -> PurchaseOutcome {
        let activation = match self.store.get_activation(id) {
            Ok(Some(act)) => act,
            Ok(None) => {
                return PurchaseOutcome::fail(
                    PurchaseErrorCode::SystemError,
                    format!("activation {id} not found"),
                )
            }
            Err(e) => return PurchaseOutcome::fail(e.purchase_code(), e.to_string()),
        };
        if activation.state != ActivationState::Reserved {
            // Another path already settled this order.
            return PurchaseOutcome::Existing {
                activation_id: activation.id,
                state: activation.state,
                phone: activation.phone,
                upstream_id: activation.upstream_id,
            };
        }

        let adapter = match self.adapters.get(&activation.provider_id) {
            Ok(a) => a,
            Err(e) => {
                self.fail_reserved(&activation, &e.to_string()).await;
                return PurchaseOutcome::Failure {
                    code: PurchaseErrorCode::ProviderError,
                    message: e.to_string(),
                    activation_id: Some(activation.id),
                };
            }
        };

        // Step 3: acquire. Nothing has been bought on failure.
        let acquired = match adapter
            .acquire(
                &activation.country_code,
                &activation.service_code,
                AcquireOptions {
                    max_price: Some(activation.price),
                    operator: activation.operator.clone(),
                },
            )
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(id = %activation.id, error = %e, "acquire failed");
                self.fail_reserved(&activation, &e.to_string()).await;
                return PurchaseOutcome::Failure {
                    code: e.purchase_code(),
                    message: e.to_string(),
                    activation_id: Some(activation.id),
                };
            }
        };

        // Step 4: the critical atomic boundary.
        match self.commit_acquisition(&activation, &acquired).await {
            Ok(()) => {}
            Err(e) => {
                // Step 5: a number exists upstream but was not captured.
                self.compensate_uncaptured(&activation, &acquired.upstream_id, &e)
                    .await;
                return PurchaseOutcome::Failure {
                    code: PurchaseErrorCode::SystemError,
                    message: format!(
                        "order could not be completed; number {} will be auto-cancelled",
                        acquired.phone
                    ),
                    activation_id: Some(activation.id),
                };
            }
        }

        // Step 6: schedule the first poll.
        let first_poll_ms = (self.kernel.now() + INITIAL_POLL_DELAY_SECS) * 1000;
        if let Err(e) = self.cache.due_add(activation.id, first_poll_ms) {
            warn!(id = %activation.id, error = %e, "failed to schedule first poll");
        }

        info!(id = %activation.id, phone = %acquired.phone, "purchase complete");
        PurchaseOutcome::Success {
            activation_id: activation.id,
            phone: acquired.phone,
            upstream_id: acquired.upstream_id,
        }
    }

    /// Saga commit: number row + activation fields + `RESERVED → ACTIVE` +
    /// wallet capture + stock confirm.
    async fn commit_acquisition(
        &self,
        activation: &Activation,
        acquired: &numio_adapter::AcquiredNumber,
    ) -> Result<(), NumioError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(NumioError::Other("injected commit failure".into()));
        }

        let now = self.kernel.now();
        let expires_at = if acquired.expires_at > now {
            acquired.expires_at
        } else {
            now + NUMBER_BASE_TIMEOUT_SECS
        };

        let number = Number {
            id: NumberId(self.store.next_id()?),
            activation_id: activation.id,
            phone: acquired.phone.clone(),
            upstream_id: acquired.upstream_id.clone(),
            user_id: activation.user_id.clone(),
            provider_id: activation.provider_id.clone(),
            service_code: activation.service_code.clone(),
            country_code: activation.country_code.clone(),
            price: activation.price,
            status: NumberStatus::Active,
            expires_at,
            created_at: now,
        };

        // Upstream identity lands on the row before the ACTIVE transition, so
        // the ACTIVE ⇒ phone-present invariant holds at every commit point.
        self.kernel.update_activation(activation.id, |act| {
            act.upstream_id = Some(acquired.upstream_id.clone());
            act.phone = Some(acquired.phone.clone());
            act.expires_at = Some(expires_at);
            act.number_id = Some(number.id);
        })?;

        self.kernel.transition_expected(
            activation.id,
            ActivationState::Reserved,
            ActivationState::Active,
            TransitionCtx::new("number acquired", activation.trace_id.clone()).with_metadata(
                serde_json::json!({
                    "upstreamId": acquired.upstream_id,
                    "phone": acquired.phone,
                }),
            ),
        )?;

        self.store.put_number(&number)?;

        let commit_key = activation
            .idempotency_key
            .as_ref()
            .map(|k| format!("commit_{k}"));
        let reserve_entry = activation
            .reserve_entry
            .ok_or_else(|| NumioError::Other("activation has no reserve entry".into()))?;
        let capture = self
            .wallet
            .commit(reserve_entry, commit_key.as_deref())
            .await?;
        self.kernel.update_activation(activation.id, |act| {
            act.capture_entry = Some(capture.id);
        })?;

        if let Some(resv_id) = activation.reservation_id {
            self.catalog.confirm(resv_id).await?;
        }
        Ok(())
    }

    /// Roll a still-RESERVED activation to FAILED and release its holds.
    async fn fail_reserved(&self, activation: &Activation, reason: &str) {
        if let Some(entry) = activation.reserve_entry {
            if let Err(e) = self.wallet.rollback(entry, None).await {
                error!(id = %activation.id, error = %e, "reservation rollback failed");
            }
        }
        if let Some(resv_id) = activation.reservation_id {
            if let Err(e) = self.catalog.cancel(resv_id).await {
                error!(id = %activation.id, error = %e, "stock release failed");
            }
        }
        match self.kernel.transition_expected(
            activation.id,
            ActivationState::Reserved,
            ActivationState::Failed,
            TransitionCtx::new(format!("acquisition failed: {reason}"), activation.trace_id.clone()),
        ) {
            Ok(_) => {}
            Err(NumioError::ActivationConflict { actual, .. }) => {
                // A concurrent cancel or commit settled the order first.
                warn!(id = %activation.id, %actual, "order settled elsewhere; FAILED not written");
            }
            Err(e) => error!(id = %activation.id, error = %e, "transition to FAILED lost"),
        }
    }

    /// The commit broke after a successful acquire: queue the cancel
    /// compensation before anything is surfaced, then best-effort clean up.
    async fn compensate_uncaptured(
        &self,
        activation: &Activation,
        upstream_id: &str,
        cause: &NumioError,
    ) {
        error!(id = %activation.id, upstream = upstream_id, error = %cause, "saga commit failed after acquire");
        let queued = self.kernel.dispatch_event(PendingEvent::activation(
            activation.id,
            EventType::SagaCompensateCancelNumber,
            serde_json::json!({
                "providerActivationId": upstream_id,
                "provider": activation.provider_id.as_str(),
            }),
        ));
        if let Err(e) = queued {
            // Queueing itself failed; the reaper's number sweep is the last
            // line of defence.
            error!(id = %activation.id, error = %e, "failed to queue cancel compensation");
        }
        self.fail_reserved(activation, "saga commit failure").await;
    }

    // ── Cancel ───────────────────────────────────────────────────────────────

    /// User-requested cancel; allowed from RESERVED and ACTIVE.
    pub async fn cancel(&self, id: ActivationId, user: &UserId) -> Result<(), NumioError> {
        let activation = self.owned_activation(id, user)?;
        if !activation.can_cancel() {
            return Err(NumioError::InvalidRequest(format!(
                "order in state {} cannot be cancelled",
                activation.state
            )));
        }

        // Best-effort upstream cancel.
        if let Some(upstream_id) = &activation.upstream_id {
            if let Ok(adapter) = self.adapters.get(&activation.provider_id) {
                if let Err(e) = adapter.cancel(upstream_id).await {
                    warn!(id = %id, error = %e, "upstream cancel failed");
                }
            }
        }

        self.kernel.transition(
            id,
            ActivationState::Cancelled,
            TransitionCtx::new("cancelled by user", activation.trace_id.clone()),
        )?;

        if let Some(number_id) = activation.number_id {
            if let Some(mut number) = self.store.get_number(number_id)? {
                number.status = NumberStatus::Cancelled;
                self.store.put_number(&number)?;
            }
        }
        self.cache.due_remove(id)?;

        self.process_refund(id, "order cancelled").await
    }

    // ── Refund path ──────────────────────────────────────────────────────────

    /// Return a refundable order's money. Captured charges are refunded and
    /// the order moves to REFUNDED; plain holds are rolled back and the order
    /// keeps its refundable state. Idempotent on re-delivery.
    pub async fn process_refund(&self, id: ActivationId, reason: &str) -> Result<(), NumioError> {
        let activation = self
            .store
            .get_activation(id)?
            .ok_or(NumioError::ActivationNotFound(id))?;
        if activation.state == ActivationState::Refunded {
            return Ok(());
        }
        if !activation.state.is_refundable() {
            return Err(NumioError::InvalidRequest(format!(
                "order in state {} is not refundable",
                activation.state
            )));
        }

        if let Some(capture) = activation.capture_entry {
            let refund_key = format!("refund_{}", activation.id.as_u64());
            let refund = self.wallet.refund(capture, reason, Some(&refund_key)).await?;
            self.kernel.update_activation(activation.id, |act| {
                act.refund_entry = Some(refund.id);
            })?;
            self.kernel.transition(
                activation.id,
                ActivationState::Refunded,
                TransitionCtx::new(format!("refund processed: {reason}"), activation.trace_id.clone()),
            )?;
        } else if let Some(reserve) = activation.reserve_entry {
            self.wallet.rollback(reserve, None).await?;
            if let Some(resv_id) = activation.reservation_id {
                self.catalog.cancel(resv_id).await?;
            }
        }
        Ok(())
    }

    /// Reaper path: fail a RESERVED order whose saga never progressed,
    /// releasing its holds. Returns false when the order moved on by itself.
    pub async fn fail_zombie(&self, id: ActivationId) -> Result<bool, NumioError> {
        let Some(activation) = self.store.get_activation(id)? else {
            return Ok(false);
        };
        if activation.state != ActivationState::Reserved {
            return Ok(false);
        }
        self.fail_reserved(&activation, "zombie reservation").await;
        Ok(true)
    }

    // ── Resend ───────────────────────────────────────────────────────────────

    /// Ask the upstream for another SMS. Only for live orders that already
    /// received at least one message, and only when the adapter supports it.
    pub async fn request_resend(&self, id: ActivationId, user: &UserId) -> Result<(), NumioError> {
        let activation = self.owned_activation(id, user)?;
        if !matches!(
            activation.state,
            ActivationState::Active | ActivationState::Received
        ) {
            return Err(NumioError::InvalidRequest(format!(
                "order in state {} cannot request another SMS",
                activation.state
            )));
        }
        let number_id = activation
            .number_id
            .ok_or_else(|| NumioError::InvalidRequest("order has no number".into()))?;
        if self.store.sms_count(number_id)? == 0 {
            return Err(NumioError::InvalidRequest(
                "no SMS received yet; resend applies after the first message".into(),
            ));
        }

        let adapter = self.adapters.get(&activation.provider_id)?;
        if !adapter.supports_resend() {
            return Err(NumioError::NotSupported(activation.provider_id.clone()));
        }
        let upstream_id = activation
            .upstream_id
            .as_ref()
            .ok_or_else(|| NumioError::InvalidRequest("order has no upstream id".into()))?;
        adapter.request_resend(upstream_id).await?;

        // Extend the window and poll again soon.
        let now = self.kernel.now();
        let extended = now + NUMBER_BASE_TIMEOUT_SECS;
        if let Some(mut number) = self.store.get_number(number_id)? {
            number.expires_at = number.expires_at.max(extended);
            self.store.put_number(&number)?;
        }
        self.kernel.update_activation(id, |act| {
            act.expires_at = Some(act.expires_at.unwrap_or(extended).max(extended));
        })?;
        self.cache.due_add(id, (now + INITIAL_POLL_DELAY_SECS) * 1000)?;
        info!(id = %id, "resend requested");
        Ok(())
    }

    fn owned_activation(&self, id: ActivationId, user: &UserId) -> Result<Activation, NumioError> {
        let activation = self
            .store
            .get_activation(id)?
            .ok_or(NumioError::ActivationNotFound(id))?;
        if activation.user_id != *user {
            return Err(NumioError::NotOrderOwner(user.clone()));
        }
        Ok(activation)
    }
}

/// Reservation step outcome; `Raced` carries the idempotency-key winner.
enum ReserveFailure {
    Raced(Activation),
    Error(NumioError),
}

impl From<NumioError> for ReserveFailure {
    fn from(e: NumioError) -> Self {
        ReserveFailure::Error(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use numio_adapter::MockAdapter;
    use numio_catalog::{MemoryIndex, SearchIndex};
    use numio_core::{Offer, ProviderId};
    use numio_kernel::EventBus;
    use numio_wallet::{EntryKind, LedgerWallet};

    struct Fixture {
        store: Arc<Store>,
        cache: Arc<CacheStore>,
        wallet: Arc<LedgerWallet>,
        adapter: Arc<MockAdapter>,
        orchestrator: Orchestrator,
    }

    async fn fixture(name: &str) -> Fixture {
        let dir = std::env::temp_dir().join(format!("numio_saga_test_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        let store = Arc::new(Store::open(dir.join("store")).expect("open temp store"));
        let cache = Arc::new(CacheStore::open(&store).unwrap());
        let kernel = Arc::new(Kernel::new(Arc::clone(&store), EventBus::new(64)));
        let wallet = Arc::new(LedgerWallet::open(dir.join("wallet")).unwrap());

        let index = Arc::new(MemoryIndex::new());
        let provider = ProviderId::new("mock");
        index
            .upsert(vec![Offer {
                doc_id: Offer::doc_id(&provider, "0", "tg", None),
                provider_id: provider,
                country_code: "0".into(),
                service_code: "tg".into(),
                operator: None,
                price: Money::from_cents(1_000),
                stock: 5,
                service_name: "Telegram".into(),
                country_name: "United States".into(),
                active: true,
                updated_at: 1,
            }])
            .await
            .unwrap();
        let catalog = Arc::new(Catalog::new(index, Arc::clone(&store)));

        let adapter = Arc::new(MockAdapter::new("mock"));
        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::clone(&adapter) as Arc<dyn numio_adapter::ProviderAdapter>);

        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            kernel,
            Arc::clone(&wallet) as Arc<dyn WalletGateway>,
            catalog,
            adapters,
        );
        Fixture { store, cache, wallet, adapter, orchestrator }
    }

    fn request(key: Option<&str>) -> PurchaseRequest {
        PurchaseRequest {
            user_id: UserId::new("u1"),
            provider_id: None,
            service: "telegram".into(),
            country: "us".into(),
            max_price: Money::from_cents(1_000),
            operator: None,
            idempotency_key: key.map(str::to_string),
            trace_id: TraceId::new("trace-1"),
        }
    }

    #[tokio::test]
    async fn purchase_happy_path_commits_and_schedules() {
        let fx = fixture("happy").await;
        fx.wallet.deposit(&UserId::new("u1"), Money::from_cents(10_000)).unwrap();
        fx.adapter.push_acquire_ok("U1", "+15550001", 0, 1_000);

        let outcome = fx.orchestrator.purchase(request(None)).await;
        let PurchaseOutcome::Success { activation_id, phone, upstream_id } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(phone, "+15550001");
        assert_eq!(upstream_id, "U1");

        let act = fx.store.get_activation(activation_id).unwrap().unwrap();
        assert_eq!(act.state, ActivationState::Active);
        assert_eq!(act.phone.as_deref(), Some("+15550001"));
        assert!(act.capture_entry.is_some());

        // One commit of exactly the price.
        let entries = fx.wallet.entries_for_user(&UserId::new("u1")).await.unwrap();
        let commits: Vec<_> = entries.iter().filter(|e| e.kind == EntryKind::Commit).collect();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].amount, Money::from_cents(1_000));

        // First poll scheduled.
        assert!(fx.cache.due_score(activation_id).unwrap().is_some());

        // History: RESERVED, ACTIVE.
        let states: Vec<_> = fx
            .store
            .history_for(activation_id)
            .unwrap()
            .iter()
            .map(|h| h.to_state)
            .collect();
        assert_eq!(states, vec![ActivationState::Reserved, ActivationState::Active]);
    }

    #[tokio::test]
    async fn no_numbers_rolls_back_and_fails() {
        let fx = fixture("no_numbers").await;
        fx.wallet.deposit(&UserId::new("u1"), Money::from_cents(10_000)).unwrap();
        // Mock with an empty acquire queue raises NoNumbers.

        let outcome = fx.orchestrator.purchase(request(None)).await;
        let PurchaseOutcome::Failure { code, activation_id, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(code, PurchaseErrorCode::ProviderError);

        let act = fx.store.get_activation(activation_id.unwrap()).unwrap().unwrap();
        assert_eq!(act.state, ActivationState::Failed);
        assert!(act.number_id.is_none());
        assert_eq!(
            fx.wallet.available_balance(&UserId::new("u1")).await.unwrap(),
            Money::from_cents(10_000)
        );
    }

    #[tokio::test]
    async fn insufficient_balance_has_no_side_effects() {
        let fx = fixture("poor").await;
        fx.wallet.deposit(&UserId::new("u1"), Money::from_cents(100)).unwrap();

        let outcome = fx.orchestrator.purchase(request(None)).await;
        let PurchaseOutcome::Failure { code, activation_id, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(code, PurchaseErrorCode::InsufficientBalance);
        assert!(activation_id.is_none());
        assert!(fx.store.iter_all_outbox().unwrap().is_empty());
        assert_eq!(fx.adapter.acquire_calls(), 0);
    }

    #[tokio::test]
    async fn commit_failure_queues_cancel_compensation() {
        let fx = fixture("saga_fail").await;
        fx.wallet.deposit(&UserId::new("u1"), Money::from_cents(10_000)).unwrap();
        fx.adapter.push_acquire_ok("U2", "+15550002", 0, 1_000);
        fx.orchestrator.inject_commit_failure();

        let outcome = fx.orchestrator.purchase(request(None)).await;
        let PurchaseOutcome::Failure { code, message, activation_id } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(code, PurchaseErrorCode::SystemError);
        assert!(message.contains("auto-cancelled"), "user must be told: {message}");

        let act = fx.store.get_activation(activation_id.unwrap()).unwrap().unwrap();
        assert_eq!(act.state, ActivationState::Failed);

        let compensations: Vec<_> = fx
            .store
            .iter_all_outbox()
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == EventType::SagaCompensateCancelNumber)
            .collect();
        assert_eq!(compensations.len(), 1);
        assert_eq!(compensations[0].payload["providerActivationId"], "U2");

        // The hold never became a charge.
        assert_eq!(
            fx.wallet.available_balance(&UserId::new("u1")).await.unwrap(),
            Money::from_cents(10_000)
        );
    }

    #[tokio::test]
    async fn idempotency_key_replays_existing_order() {
        let fx = fixture("idem").await;
        fx.wallet.deposit(&UserId::new("u1"), Money::from_cents(10_000)).unwrap();
        fx.adapter.push_acquire_ok("U1", "+15550001", 0, 1_000);

        let first = fx.orchestrator.purchase(request(Some("key-1"))).await;
        let PurchaseOutcome::Success { activation_id, .. } = first else {
            panic!("expected success, got {first:?}");
        };

        let replay = fx.orchestrator.purchase(request(Some("key-1"))).await;
        let PurchaseOutcome::Existing { activation_id: replay_id, state, .. } = replay else {
            panic!("expected existing, got {replay:?}");
        };
        assert_eq!(replay_id, activation_id);
        assert_eq!(state, ActivationState::Active);
        assert_eq!(fx.adapter.acquire_calls(), 1);

        // Exactly one reserve despite two purchase calls.
        let entries = fx.wallet.entries_for_user(&UserId::new("u1")).await.unwrap();
        assert_eq!(
            entries.iter().filter(|e| e.kind == EntryKind::Reserve).count(),
            1
        );
    }

    #[tokio::test]
    async fn cancel_active_order_refunds_and_cancels_upstream() {
        let fx = fixture("cancel").await;
        fx.wallet.deposit(&UserId::new("u1"), Money::from_cents(10_000)).unwrap();
        fx.adapter.push_acquire_ok("U1", "+15550001", 0, 1_000);

        let PurchaseOutcome::Success { activation_id, .. } =
            fx.orchestrator.purchase(request(None)).await
        else {
            panic!("purchase failed");
        };

        fx.orchestrator.cancel(activation_id, &UserId::new("u1")).await.unwrap();

        let act = fx.store.get_activation(activation_id).unwrap().unwrap();
        assert_eq!(act.state, ActivationState::Refunded);
        assert!(act.refund_entry.is_some());
        assert_eq!(fx.adapter.cancelled_ids(), vec!["U1".to_string()]);
        assert_eq!(
            fx.wallet.available_balance(&UserId::new("u1")).await.unwrap(),
            Money::from_cents(10_000)
        );
        assert!(fx.cache.due_score(activation_id).unwrap().is_none());

        let number = fx.store.get_number(act.number_id.unwrap()).unwrap().unwrap();
        assert_eq!(number.status, NumberStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_by_stranger_rejected() {
        let fx = fixture("stranger").await;
        fx.wallet.deposit(&UserId::new("u1"), Money::from_cents(10_000)).unwrap();
        fx.adapter.push_acquire_ok("U1", "+15550001", 0, 1_000);
        let PurchaseOutcome::Success { activation_id, .. } =
            fx.orchestrator.purchase(request(None)).await
        else {
            panic!("purchase failed");
        };
        assert!(matches!(
            fx.orchestrator.cancel(activation_id, &UserId::new("intruder")).await,
            Err(NumioError::NotOrderOwner(_))
        ));
    }

    #[tokio::test]
    async fn resend_requires_adapter_capability() {
        let fx = fixture("resend").await;
        fx.wallet.deposit(&UserId::new("u1"), Money::from_cents(10_000)).unwrap();
        fx.adapter.push_acquire_ok("U1", "+15550001", 0, 1_000);
        let PurchaseOutcome::Success { activation_id, .. } =
            fx.orchestrator.purchase(request(None)).await
        else {
            panic!("purchase failed");
        };

        // Simulate a received SMS so the precondition holds.
        let act = fx.store.get_activation(activation_id).unwrap().unwrap();
        fx.store
            .insert_sms_if_absent(&numio_core::SmsMessage {
                number_id: act.number_id.unwrap(),
                code: "123456".into(),
                content: "123456".into(),
                sender: None,
                received_at: 1,
            })
            .unwrap();

        // MockAdapter without resend capability.
        assert!(matches!(
            fx.orchestrator.request_resend(activation_id, &UserId::new("u1")).await,
            Err(NumioError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn offer_price_above_accepted_price_rejected() {
        let fx = fixture("pricey").await;
        fx.wallet.deposit(&UserId::new("u1"), Money::from_cents(10_000)).unwrap();
        let mut req = request(None);
        req.max_price = Money::from_cents(500); // offer costs 1_000
        let outcome = fx.orchestrator.purchase(req).await;
        let PurchaseOutcome::Failure { code, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(code, PurchaseErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn stock_decremented_then_confirmed() {
        let fx = fixture("stock").await;
        fx.wallet.deposit(&UserId::new("u1"), Money::from_cents(10_000)).unwrap();
        fx.adapter.push_acquire_ok("U1", "+15550001", 0, 1_000);

        let PurchaseOutcome::Success { activation_id, .. } =
            fx.orchestrator.purchase(request(None)).await
        else {
            panic!("purchase failed");
        };
        let act = fx.store.get_activation(activation_id).unwrap().unwrap();
        let resv = fx.store.get_reservation(act.reservation_id.unwrap()).unwrap().unwrap();
        assert_eq!(resv.status, numio_core::ReservationStatus::Confirmed);
    }
}
