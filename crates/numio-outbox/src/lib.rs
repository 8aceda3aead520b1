//! The outbox dispatcher: at-least-once delivery of saga compensations,
//! refunds, search-index projections, and bus events.
//!
//! Rows are claimed by conditional update — the claim either wins or another
//! worker already has the row. A claimed row that never completes becomes
//! reclaimable after the lease window. Failures back off exponentially and
//! park the row as FAILED once the retry budget is spent.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use numio_adapter::AdapterRegistry;
use numio_catalog::SearchIndex;
use numio_core::{
    ActivationId, EventType, NumioError, Offer, OutboxEvent, OutboxStatus,
    OUTBOX_BACKOFF_CAP_SECS, OUTBOX_CLAIM_LEASE_SECS, OUTBOX_MAX_RETRIES,
};
use numio_kernel::Kernel;
use numio_saga::{Orchestrator, PurchaseOutcome};
use numio_store::Store;

/// Rows examined per dispatch pass.
const DISPATCH_BATCH: usize = 50;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub claimed: u32,
    pub delivered: u32,
    pub retried: u32,
    pub parked: u32,
}

pub struct Dispatcher {
    store: Arc<Store>,
    kernel: Arc<Kernel>,
    orchestrator: Arc<Orchestrator>,
    adapters: AdapterRegistry,
    index: Arc<dyn SearchIndex>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        kernel: Arc<Kernel>,
        orchestrator: Arc<Orchestrator>,
        adapters: AdapterRegistry,
        index: Arc<dyn SearchIndex>,
    ) -> Self {
        Self { store, kernel, orchestrator, adapters, index }
    }

    /// One dispatch pass over the due rows, in creation order.
    pub async fn run_once(&self) -> Result<DispatchReport, NumioError> {
        let now = self.kernel.now();
        let mut report = DispatchReport::default();

        let due = self.store.iter_dispatchable_outbox(
            now,
            OUTBOX_CLAIM_LEASE_SECS,
            OUTBOX_MAX_RETRIES,
            DISPATCH_BATCH,
        )?;

        for row in due {
            // Optimistic claim; losing means another worker owns the row.
            let mut claimed = row.clone();
            claimed.status = OutboxStatus::Published;
            claimed.retry_count = row.retry_count + 1;
            claimed.updated_at = now;
            if !self.store.cas_outbox(&row, &claimed)? {
                debug!(id = %row.id, "outbox claim lost");
                continue;
            }
            report.claimed += 1;

            match self.dispatch(&claimed).await {
                Ok(()) => {
                    claimed.published_at = Some(self.kernel.now());
                    claimed.updated_at = self.kernel.now();
                    self.store.put_outbox(&claimed)?;
                    report.delivered += 1;
                }
                Err(e) => {
                    warn!(id = %claimed.id, event = %claimed.event_type, error = %e, "dispatch failed");
                    claimed.last_error = Some(e.to_string());
                    claimed.updated_at = self.kernel.now();
                    if claimed.retry_count >= OUTBOX_MAX_RETRIES {
                        claimed.status = OutboxStatus::Failed;
                        report.parked += 1;
                        error!(id = %claimed.id, event = %claimed.event_type, "outbox row parked as FAILED");
                    } else {
                        claimed.status = OutboxStatus::Pending;
                        claimed.next_attempt_at = self.kernel.now() + backoff_secs(claimed.retry_count);
                        report.retried += 1;
                    }
                    self.store.put_outbox(&claimed)?;
                }
            }
        }

        if report.claimed > 0 {
            numio_kernel::metrics::inc_by("outbox_delivered_total", &[], report.delivered as u64);
            numio_kernel::metrics::inc_by("outbox_parked_total", &[], report.parked as u64);
            info!(
                claimed = report.claimed,
                delivered = report.delivered,
                retried = report.retried,
                parked = report.parked,
                "outbox pass"
            );
        }
        Ok(report)
    }

    async fn dispatch(&self, row: &OutboxEvent) -> Result<(), NumioError> {
        match row.event_type {
            EventType::ProviderRequest => self.handle_provider_request(row).await,
            EventType::Refund => self.handle_refund(row).await,
            EventType::SagaCompensateCancelNumber => self.handle_cancel_number(row).await,
            EventType::OfferCreated | EventType::OfferUpdated => self.handle_offer(row).await,
            // Remaining vocabulary goes straight to the bus.
            _ => {
                self.kernel
                    .bus()
                    .publish(row.event_type.as_str(), None, row.payload.clone());
                Ok(())
            }
        }
    }

    // ── Handlers ─────────────────────────────────────────────────────────────

    /// Drive the acquisition steps of the purchase saga for an order whose
    /// inline path never finished. The orchestrator resolves the stale-state
    /// conflict internally by cancelling any number it bought.
    async fn handle_provider_request(&self, row: &OutboxEvent) -> Result<(), NumioError> {
        let id = payload_activation_id(row)?;
        match self.orchestrator.run_acquisition(id).await {
            // Failure outcomes carry their own compensation; the row is done.
            PurchaseOutcome::Success { .. }
            | PurchaseOutcome::Existing { .. }
            | PurchaseOutcome::Failure { .. } => Ok(()),
        }
    }

    async fn handle_refund(&self, row: &OutboxEvent) -> Result<(), NumioError> {
        let id = payload_activation_id(row)?;
        let reason = row.payload["reason"].as_str().unwrap_or("refund");
        self.orchestrator.process_refund(id, reason).await
    }

    async fn handle_cancel_number(&self, row: &OutboxEvent) -> Result<(), NumioError> {
        let upstream_id = row.payload["providerActivationId"]
            .as_str()
            .ok_or_else(|| NumioError::InvalidRequest("payload missing providerActivationId".into()))?;
        let provider = row.payload["provider"]
            .as_str()
            .ok_or_else(|| NumioError::InvalidRequest("payload missing provider".into()))?;
        let adapter = self.adapters.get(&numio_core::ProviderId::new(provider))?;
        adapter.cancel(upstream_id).await?;
        info!(upstream = upstream_id, provider, "stranded number cancelled");
        Ok(())
    }

    async fn handle_offer(&self, row: &OutboxEvent) -> Result<(), NumioError> {
        let offer: Offer = serde_json::from_value(row.payload.clone())
            .map_err(|e| NumioError::Serialization(e.to_string()))?;
        let task = self.index.upsert(vec![offer]).await?;
        self.index.wait(task).await?;
        // Projection applied; fan the event out to subscribers too.
        self.kernel
            .bus()
            .publish(row.event_type.as_str(), None, row.payload.clone());
        Ok(())
    }
}

fn payload_activation_id(row: &OutboxEvent) -> Result<ActivationId, NumioError> {
    row.payload["activationId"]
        .as_u64()
        .map(ActivationId)
        .ok_or_else(|| NumioError::InvalidRequest("payload missing activationId".into()))
}

/// Exponential backoff: 1 s · 2^retries, capped at five minutes.
fn backoff_secs(retry_count: u32) -> i64 {
    let exp = retry_count.min(30);
    (1i64 << exp).min(OUTBOX_BACKOFF_CAP_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use numio_adapter::MockAdapter;
    use numio_catalog::{Catalog, MemoryIndex};
    use numio_core::{
        ActivationState, Money, ProviderId, TraceId, UserId,
    };
    use numio_kernel::{EventBus, PendingEvent};
    use numio_store::CacheStore;
    use numio_wallet::{LedgerWallet, WalletGateway};

    struct Fixture {
        store: Arc<Store>,
        kernel: Arc<Kernel>,
        wallet: Arc<LedgerWallet>,
        adapter: Arc<MockAdapter>,
        index: Arc<MemoryIndex>,
        orchestrator: Arc<Orchestrator>,
        dispatcher: Dispatcher,
    }

    async fn fixture(name: &str) -> Fixture {
        let dir = std::env::temp_dir().join(format!("numio_outbox_test_{name}"));
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
        let catalog = Arc::new(Catalog::new(
            Arc::clone(&index) as Arc<dyn SearchIndex>,
            Arc::clone(&store),
        ));

        let adapter = Arc::new(MockAdapter::new("mock"));
        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::clone(&adapter) as Arc<dyn numio_adapter::ProviderAdapter>);

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            cache,
            Arc::clone(&kernel),
            Arc::clone(&wallet) as Arc<dyn WalletGateway>,
            catalog,
            adapters.clone(),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&kernel),
            Arc::clone(&orchestrator),
            adapters,
            Arc::clone(&index) as Arc<dyn SearchIndex>,
        );
        Fixture { store, kernel, wallet, adapter, index, orchestrator, dispatcher }
    }

    #[tokio::test]
    async fn cancel_compensation_reaches_upstream() {
        let fx = fixture("comp").await;
        fx.kernel
            .dispatch_event(PendingEvent {
                aggregate_type: "activation".into(),
                aggregate_id: "act:1".into(),
                event_type: EventType::SagaCompensateCancelNumber,
                payload: serde_json::json!({
                    "providerActivationId": "U2",
                    "provider": "mock",
                }),
                delay_secs: 0,
            })
            .unwrap();

        let report = fx.dispatcher.run_once().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(fx.adapter.cancelled_ids(), vec!["U2".to_string()]);

        let rows = fx.store.iter_all_outbox().unwrap();
        assert_eq!(rows[0].status, OutboxStatus::Published);
        assert!(rows[0].published_at.is_some());
    }

    #[tokio::test]
    async fn unknown_provider_retries_with_backoff_then_parks() {
        let fx = fixture("backoff").await;
        fx.kernel
            .dispatch_event(PendingEvent {
                aggregate_type: "activation".into(),
                aggregate_id: "act:1".into(),
                event_type: EventType::SagaCompensateCancelNumber,
                payload: serde_json::json!({
                    "providerActivationId": "U9",
                    "provider": "ghost",
                }),
                delay_secs: 0,
            })
            .unwrap();

        let report = fx.dispatcher.run_once().await.unwrap();
        assert_eq!(report.retried, 1);
        let row = &fx.store.iter_all_outbox().unwrap()[0];
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.retry_count, 1);
        assert!(row.next_attempt_at > fx.kernel.now());
        assert!(row.last_error.is_some());

        // Exhaust the budget by making every attempt due immediately.
        for _ in 0..OUTBOX_MAX_RETRIES {
            let mut r = fx.store.iter_all_outbox().unwrap().remove(0);
            r.next_attempt_at = fx.kernel.now();
            fx.store.put_outbox(&r).unwrap();
            fx.dispatcher.run_once().await.unwrap();
        }
        let row = &fx.store.iter_all_outbox().unwrap()[0];
        assert_eq!(row.status, OutboxStatus::Failed);
        assert_eq!(row.retry_count, OUTBOX_MAX_RETRIES);
    }

    #[tokio::test]
    async fn provider_request_resumes_stalled_order() {
        let fx = fixture("resume").await;
        fx.wallet.deposit(&UserId::new("u1"), Money::from_cents(10_000)).unwrap();
        fx.adapter.push_acquire_ok("U1", "+15550001", 0, 1_000);

        // A purchase whose inline path died right after the reservation:
        // simulate by creating the reservation step by hand.
        let outcome = fx
            .orchestrator
            .purchase(numio_saga::PurchaseRequest {
                user_id: UserId::new("u1"),
                provider_id: None,
                service: "telegram".into(),
                country: "us".into(),
                max_price: Money::from_cents(1_000),
                operator: None,
                idempotency_key: None,
                trace_id: TraceId::new("t"),
            })
            .await;
        let PurchaseOutcome::Success { activation_id, .. } = outcome else {
            panic!("purchase failed: {outcome:?}");
        };

        // The inline path completed, so the safety-net row must no-op.
        let mut row = fx
            .store
            .iter_all_outbox()
            .unwrap()
            .into_iter()
            .find(|r| r.event_type == EventType::ProviderRequest)
            .expect("provider_request row");
        row.next_attempt_at = fx.kernel.now();
        fx.store.put_outbox(&row).unwrap();

        let report = fx.dispatcher.run_once().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(fx.adapter.acquire_calls(), 1, "no second acquisition");

        let act = fx.store.get_activation(activation_id).unwrap().unwrap();
        assert_eq!(act.state, ActivationState::Active);
    }

    #[tokio::test]
    async fn refund_event_refunds_expired_order() {
        let fx = fixture("refund").await;
        fx.wallet.deposit(&UserId::new("u1"), Money::from_cents(10_000)).unwrap();
        fx.adapter.push_acquire_ok("U1", "+15550001", 0, 1_000);
        let PurchaseOutcome::Success { activation_id, .. } = fx
            .orchestrator
            .purchase(numio_saga::PurchaseRequest {
                user_id: UserId::new("u1"),
                provider_id: None,
                service: "telegram".into(),
                country: "us".into(),
                max_price: Money::from_cents(1_000),
                operator: None,
                idempotency_key: None,
                trace_id: TraceId::new("t"),
            })
            .await
        else {
            panic!("purchase failed");
        };
        fx.kernel
            .transition(
                activation_id,
                ActivationState::Expired,
                numio_kernel::TransitionCtx::new("timed out", TraceId::new("t")),
            )
            .unwrap();

        fx.kernel
            .dispatch_event(PendingEvent::activation(
                activation_id,
                EventType::Refund,
                serde_json::json!({
                    "activationId": activation_id.as_u64(),
                    "reason": "order expired",
                }),
            ))
            .unwrap();

        // Two rows are due: the provider_request safety net is not yet due
        // (grace delay), so only the refund row dispatches.
        let report = fx.dispatcher.run_once().await.unwrap();
        assert_eq!(report.delivered, 1);

        let act = fx.store.get_activation(activation_id).unwrap().unwrap();
        assert_eq!(act.state, ActivationState::Refunded);
        assert!(act.refund_entry.is_some());
        assert_eq!(
            fx.wallet.available_balance(&UserId::new("u1")).await.unwrap(),
            Money::from_cents(10_000)
        );

        // Re-delivery is a no-op.
        let mut row = fx
            .store
            .iter_all_outbox()
            .unwrap()
            .into_iter()
            .find(|r| r.event_type == EventType::Refund)
            .unwrap();
        row.status = OutboxStatus::Pending;
        row.retry_count = 0;
        row.next_attempt_at = fx.kernel.now();
        row.published_at = None;
        fx.store.put_outbox(&row).unwrap();
        fx.dispatcher.run_once().await.unwrap();
        assert_eq!(
            fx.wallet.available_balance(&UserId::new("u1")).await.unwrap(),
            Money::from_cents(10_000)
        );
    }

    #[tokio::test]
    async fn offer_events_project_into_index() {
        let fx = fixture("project").await;
        let provider = ProviderId::new("mock");
        let offer = Offer {
            doc_id: Offer::doc_id(&provider, "16", "wa", None),
            provider_id: provider,
            country_code: "16".into(),
            service_code: "wa".into(),
            operator: None,
            price: Money::from_cents(222),
            stock: 9,
            service_name: "WhatsApp".into(),
            country_name: "United Kingdom".into(),
            active: true,
            updated_at: 5,
        };
        fx.kernel
            .dispatch_event(PendingEvent {
                aggregate_type: "offer".into(),
                aggregate_id: offer.doc_id.clone(),
                event_type: EventType::OfferCreated,
                payload: serde_json::to_value(&offer).unwrap(),
                delay_secs: 0,
            })
            .unwrap();

        fx.dispatcher.run_once().await.unwrap();
        let projected = fx.index.get(&offer.doc_id).await.unwrap().unwrap();
        assert_eq!(projected.price.cents(), 222);
        assert_eq!(projected.stock, 9);
    }
}
