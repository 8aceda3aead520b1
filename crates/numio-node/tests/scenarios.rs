//! End-to-end scenarios over the full in-process stack: store, wallet
//! ledger, kernel, catalog, saga, poll manager, outbox dispatcher, reaper —
//! with a scripted mock provider upstream.
//!
//! Run with:
//!   cargo test -p numio-node --test scenarios

use std::path::PathBuf;
use std::sync::Arc;

use numio_adapter::{
    AdapterRegistry, MockAdapter, ProviderAdapter, RawOffer, StatusResult, UpstreamMessage,
    UpstreamStatus,
};
use numio_catalog::SearchIndex;
use numio_core::{
    check_transition, ActivationId, ActivationState, EventType, Money, NumberStatus,
    Offer, OutboxStatus, ProviderId, TraceId, UserId,
};
use numio_node::Node;
use numio_saga::{PurchaseOutcome, PurchaseRequest};
use numio_wallet::{EntryKind, WalletGateway};

// ── Harness ───────────────────────────────────────────────────────────────────

struct Harness {
    node: Node,
    adapter: Arc<MockAdapter>,
    _data_dir: DirGuard,
}

struct DirGuard(PathBuf);

impl Drop for DirGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn harness(name: &str) -> Harness {
    harness_with(name, MockAdapter::new("mock"))
}

fn harness_with(name: &str, adapter: MockAdapter) -> Harness {
    let dir = std::env::temp_dir().join(format!("numio_scenario_{name}"));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();

    let adapter = Arc::new(adapter);
    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::clone(&adapter) as Arc<dyn ProviderAdapter>);

    let node = Node::open(&dir, adapters).expect("wire node");
    Harness { node, adapter, _data_dir: DirGuard(dir) }
}

fn user() -> UserId {
    UserId::new("alice")
}

async fn seed_offer(h: &Harness, cents: i64, stock: u32) {
    let provider = ProviderId::new("mock");
    h.node
        .index
        .upsert(vec![Offer {
            doc_id: Offer::doc_id(&provider, "0", "tg", None),
            provider_id: provider,
            country_code: "0".into(),
            service_code: "tg".into(),
            operator: None,
            price: Money::from_cents(cents),
            stock,
            service_name: "Telegram".into(),
            country_name: "United States".into(),
            active: true,
            updated_at: 1,
        }])
        .await
        .unwrap();
}

fn request() -> PurchaseRequest {
    PurchaseRequest {
        user_id: user(),
        provider_id: None,
        service: "telegram".into(),
        country: "us".into(),
        max_price: Money::from_cents(1_000),
        operator: None,
        idempotency_key: None,
        trace_id: TraceId::new("scenario"),
    }
}

async fn purchase_ok(h: &Harness) -> (ActivationId, String) {
    let outcome = h.node.orchestrator.purchase(request()).await;
    let PurchaseOutcome::Success { activation_id, upstream_id, .. } = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    (activation_id, upstream_id)
}

/// Every pair of consecutive history rows must be a legal transition and the
/// chain must be gapless.
fn assert_history_legal(h: &Harness, id: ActivationId) {
    let rows = h.node.store.history_for(id).unwrap();
    assert!(!rows.is_empty(), "history must not be empty");
    for row in &rows {
        check_transition(row.from_state, row.to_state)
            .unwrap_or_else(|e| panic!("illegal history row: {e}"));
    }
    for pair in rows.windows(2) {
        assert_eq!(pair[0].to_state, pair[1].from_state, "history chain has a gap");
    }
}

fn backdate_number(h: &Harness, id: ActivationId) {
    let act = h.node.store.get_activation(id).unwrap().unwrap();
    let mut number = h.node.store.get_number(act.number_id.unwrap()).unwrap().unwrap();
    number.expires_at = h.node.kernel.now() - 1;
    h.node.store.put_number(&number).unwrap();
}

// ── Happy path ────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_sms_delivers_and_charges_once() {
    let h = harness("happy");
    seed_offer(&h, 1_000, 5).await;
    h.node.wallet.deposit(&user(), Money::from_cents(10_000)).unwrap();
    h.adapter.push_acquire_ok("U1", "+15550001", 0, 1_000);

    let (id, upstream) = purchase_ok(&h).await;
    assert_eq!(upstream, "U1");

    // The verification SMS arrives upstream; the next poll cycle finds it.
    h.adapter.set_status(
        "U1",
        StatusResult {
            status: UpstreamStatus::Received,
            messages: vec![UpstreamMessage {
                id: "m1".into(),
                sender: Some("TG".into()),
                content: "your code is 123456".into(),
                code: Some("123456".into()),
                received_at: h.node.kernel.now(),
            }],
        },
    );
    h.node.cache.due_add(id, h.node.kernel.now() * 1000).unwrap();
    let report = h.node.poll.run_cycle().await.unwrap();
    assert_eq!(report.sms_received, 1);

    let act = h.node.store.get_activation(id).unwrap().unwrap();
    assert_eq!(act.state, ActivationState::Received);

    // Exactly one commit of −10.00.
    let entries = h.node.wallet.entries_for_user(&user()).await.unwrap();
    let commits: Vec<_> = entries.iter().filter(|e| e.kind == EntryKind::Commit).collect();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].amount, Money::from_cents(1_000));
    assert_eq!(
        h.node.wallet.available_balance(&user()).await.unwrap(),
        Money::from_cents(9_000)
    );

    // History: RESERVED, ACTIVE, RECEIVED.
    let states: Vec<_> = h
        .node
        .store
        .history_for(id)
        .unwrap()
        .iter()
        .map(|r| r.to_state)
        .collect();
    assert_eq!(
        states,
        vec![ActivationState::Reserved, ActivationState::Active, ActivationState::Received]
    );
    assert_history_legal(&h, id);
}

// ── Provider has no numbers ──────────────────────────────────────────────

#[tokio::test]
async fn no_numbers_fails_and_rolls_back() {
    let h = harness("no_numbers");
    seed_offer(&h, 1_000, 5).await;
    h.node.wallet.deposit(&user(), Money::from_cents(10_000)).unwrap();
    // Empty acquire queue: the mock raises NoNumbers.

    let outcome = h.node.orchestrator.purchase(request()).await;
    let PurchaseOutcome::Failure { code, activation_id, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(code.label(), "PROVIDER_ERROR");

    let act = h.node.store.get_activation(activation_id.unwrap()).unwrap().unwrap();
    assert_eq!(act.state, ActivationState::Failed);
    assert!(act.number_id.is_none(), "no Number row may exist");
    assert_eq!(
        h.node.wallet.available_balance(&user()).await.unwrap(),
        Money::from_cents(10_000)
    );
    assert_history_legal(&h, act.id);
}

// ── Saga failure after acquire ───────────────────────────────────────────

#[tokio::test]
async fn commit_failure_compensates_bought_number() {
    let h = harness("commit_fail");
    seed_offer(&h, 1_000, 5).await;
    h.node.wallet.deposit(&user(), Money::from_cents(10_000)).unwrap();
    h.adapter.push_acquire_ok("U2", "+15550002", 0, 1_000);
    h.node.orchestrator.inject_commit_failure();

    let outcome = h.node.orchestrator.purchase(request()).await;
    let PurchaseOutcome::Failure { code, message, activation_id } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(code.label(), "SYSTEM_ERROR");
    assert!(message.contains("auto-cancelled"));

    let comp = h
        .node
        .store
        .iter_all_outbox()
        .unwrap()
        .into_iter()
        .find(|r| r.event_type == EventType::SagaCompensateCancelNumber)
        .expect("compensation row");
    assert_eq!(comp.payload["providerActivationId"], "U2");

    // The dispatcher delivers the compensation: upstream cancel observed.
    h.node.dispatcher.run_once().await.unwrap();
    assert!(h.adapter.cancelled_ids().contains(&"U2".to_string()));
    let comp = h.node.store.get_outbox(comp.id).unwrap().unwrap();
    assert_eq!(comp.status, OutboxStatus::Published);
    assert!(comp.published_at.is_some());

    let act = h.node.store.get_activation(activation_id.unwrap()).unwrap().unwrap();
    assert_eq!(act.state, ActivationState::Failed);
    assert_eq!(
        h.node.wallet.available_balance(&user()).await.unwrap(),
        Money::from_cents(10_000)
    );
    assert_history_legal(&h, act.id);
}

// ── Timeout without SMS ──────────────────────────────────────────────────

#[tokio::test]
async fn timeout_expires_cancels_and_refunds() {
    let h = harness("timeout");
    seed_offer(&h, 1_000, 5).await;
    h.node.wallet.deposit(&user(), Money::from_cents(10_000)).unwrap();
    h.adapter.push_acquire_ok("U1", "+15550001", 0, 1_000);

    let (id, _) = purchase_ok(&h).await;
    backdate_number(&h, id);

    h.node.reaper.run_once().await.unwrap();

    assert_eq!(h.adapter.cancelled_ids(), vec!["U1".to_string()]);
    let act = h.node.store.get_activation(id).unwrap().unwrap();
    assert_eq!(act.state, ActivationState::Refunded);
    let number = h.node.store.get_number(act.number_id.unwrap()).unwrap().unwrap();
    assert_eq!(number.status, NumberStatus::Expired);

    // Wallet net zero: one commit, one refund.
    assert_eq!(
        h.node.wallet.available_balance(&user()).await.unwrap(),
        Money::from_cents(10_000)
    );
    let states: Vec<_> = h
        .node
        .store
        .history_for(id)
        .unwrap()
        .iter()
        .map(|r| r.to_state)
        .collect();
    assert_eq!(
        states,
        vec![
            ActivationState::Reserved,
            ActivationState::Active,
            ActivationState::Expired,
            ActivationState::Refunded,
        ]
    );
    assert_history_legal(&h, id);
}

// ── Late SMS wins the expiry race ────────────────────────────────────────

#[tokio::test]
async fn late_sms_completes_instead_of_refund() {
    let h = harness("late_sms");
    seed_offer(&h, 1_000, 5).await;
    h.node.wallet.deposit(&user(), Money::from_cents(10_000)).unwrap();
    h.adapter.push_acquire_ok("U1", "+15550001", 0, 1_000);

    let (id, _) = purchase_ok(&h).await;
    backdate_number(&h, id);

    // The reaper's final probe sees a message the polls never caught.
    h.adapter.set_status(
        "U1",
        StatusResult {
            status: UpstreamStatus::Received,
            messages: vec![UpstreamMessage {
                id: "m1".into(),
                sender: None,
                content: "999".into(),
                code: Some("999".into()),
                received_at: h.node.kernel.now(),
            }],
        },
    );

    h.node.reaper.run_once().await.unwrap();

    assert!(h.adapter.cancelled_ids().is_empty(), "no upstream cancel");
    let act = h.node.store.get_activation(id).unwrap().unwrap();
    assert_eq!(act.state, ActivationState::Received);
    let number = h.node.store.get_number(act.number_id.unwrap()).unwrap().unwrap();
    assert_eq!(number.status, NumberStatus::Completed);

    // The charge stands: net −10.00, no refund entry.
    assert_eq!(
        h.node.wallet.available_balance(&user()).await.unwrap(),
        Money::from_cents(9_000)
    );
    assert!(act.refund_entry.is_none());
    assert_history_legal(&h, id);
}

// ── Zombie reservation ───────────────────────────────────────────────────

#[tokio::test]
async fn zombie_reservation_is_failed_and_released() {
    let h = harness("zombie");
    seed_offer(&h, 1_000, 5).await;
    h.node.wallet.deposit(&user(), Money::from_cents(5_000)).unwrap();

    // A reservation stranded 15 minutes ago with no saga progress.
    let reserve = h
        .node
        .wallet
        .reserve(&user(), Money::from_cents(1_000), "number purchase", "", None)
        .await
        .unwrap();
    let resv = h.node.catalog.reserve("mock:0:tg:any", 1, 600).await.unwrap();
    let id = ActivationId(h.node.store.next_id().unwrap());
    h.node
        .kernel
        .create(
            numio_core::Activation {
                id,
                user_id: user(),
                provider_id: ProviderId::new("mock"),
                price: Money::from_cents(1_000),
                state: ActivationState::Init,
                service_code: "tg".into(),
                country_code: "0".into(),
                service_name: None,
                country_name: None,
                operator: None,
                upstream_id: None,
                phone: None,
                created_at: h.node.kernel.now() - 900,
                expires_at: None,
                idempotency_key: None,
                reservation_id: Some(resv.id),
                reserve_entry: Some(reserve.id),
                capture_entry: None,
                refund_entry: None,
                number_id: None,
                trace_id: TraceId::new("scenario"),
            },
            vec![],
        )
        .unwrap();

    let report = h.node.reaper.run_once().await.unwrap();
    assert_eq!(report.zombies_failed, 1);

    let act = h.node.store.get_activation(id).unwrap().unwrap();
    assert_eq!(act.state, ActivationState::Failed);
    assert!(act.number_id.is_none(), "no number was ever acquired");
    assert_eq!(
        h.node.wallet.available_balance(&user()).await.unwrap(),
        Money::from_cents(5_000)
    );
    assert_eq!(h.adapter.acquire_calls(), 0);
    assert_history_legal(&h, id);
}

// ── Offer pipeline: sync → outbox → index → purchase ─────────────────────────

#[tokio::test]
async fn offer_sync_feeds_purchases_through_the_outbox() {
    let h = harness("pipeline");
    h.node.wallet.deposit(&user(), Money::from_cents(10_000)).unwrap();
    h.adapter.set_offers(vec![RawOffer {
        country_code: "0".into(),
        country_name: "United States".into(),
        service_code: "tg".into(),
        service_name: "Telegram".into(),
        operator: None,
        price: Money::from_cents(900),
        stock: 3,
    }]);

    // Sync queues offer.created; the dispatcher projects it into the index.
    h.node
        .offer_sync
        .sync_provider(h.adapter.as_ref(), h.node.index.as_ref(), h.node.kernel.now())
        .await
        .unwrap();
    assert!(h.node.index.is_empty(), "index is written only by the dispatcher");
    h.node.dispatcher.run_once().await.unwrap();
    assert_eq!(h.node.index.len(), 1);

    // The projected offer is now purchasable.
    h.adapter.push_acquire_ok("U7", "+15550007", 0, 900);
    let (id, _) = purchase_ok(&h).await;
    let act = h.node.store.get_activation(id).unwrap().unwrap();
    assert_eq!(act.state, ActivationState::Active);
    assert_eq!(act.price, Money::from_cents(900));
}

// ── Cancel round-trip over the full stack ────────────────────────────────────

#[tokio::test]
async fn cancel_after_activation_refunds_everything() {
    let h = harness("cancel_e2e");
    seed_offer(&h, 1_000, 5).await;
    h.node.wallet.deposit(&user(), Money::from_cents(10_000)).unwrap();
    h.adapter.push_acquire_ok("U1", "+15550001", 0, 1_000);

    let (id, _) = purchase_ok(&h).await;
    h.node.orchestrator.cancel(id, &user()).await.unwrap();

    let act = h.node.store.get_activation(id).unwrap().unwrap();
    assert_eq!(act.state, ActivationState::Refunded);
    assert_eq!(
        h.node.wallet.available_balance(&user()).await.unwrap(),
        Money::from_cents(10_000)
    );
    assert!(h.adapter.cancelled_ids().contains(&"U1".to_string()));
    assert_history_legal(&h, id);
}

// ── No money without delivery / no leaked numbers ────────────────────────────

#[tokio::test]
async fn committed_funds_match_delivery_across_outcomes() {
    let h = harness("conservation");
    seed_offer(&h, 1_000, 10).await;
    h.node.wallet.deposit(&user(), Money::from_cents(50_000)).unwrap();

    // One delivered order, one provider failure, one commit failure.
    h.adapter.push_acquire_ok("A1", "+15550001", 0, 1_000);
    let (delivered, _) = purchase_ok(&h).await;

    let PurchaseOutcome::Failure { .. } = h.node.orchestrator.purchase(request()).await else {
        panic!("expected NoNumbers failure");
    };

    h.adapter.push_acquire_ok("A3", "+15550003", 0, 1_000);
    h.node.orchestrator.inject_commit_failure();
    let PurchaseOutcome::Failure { .. } = h.node.orchestrator.purchase(request()).await else {
        panic!("expected injected failure");
    };

    // Settle the compensation queue.
    h.node.dispatcher.run_once().await.unwrap();

    // Committed total equals price × orders that reached ACTIVE.
    let entries = h.node.wallet.entries_for_user(&user()).await.unwrap();
    let committed: i64 = entries
        .iter()
        .filter(|e| e.kind == EntryKind::Commit)
        .map(|e| e.amount.cents())
        .sum();
    assert_eq!(committed, 1_000);

    // Every acquired upstream id either belongs to a live order or has been
    // cancelled upstream.
    let delivered_act = h.node.store.get_activation(delivered).unwrap().unwrap();
    assert_eq!(delivered_act.upstream_id.as_deref(), Some("A1"));
    assert!(h.adapter.cancelled_ids().contains(&"A3".to_string()));
    assert!(!h.adapter.cancelled_ids().contains(&"A1".to_string()));
}

// ── Resend on a capable provider ─────────────────────────────────────────────

#[tokio::test]
async fn resend_extends_window_and_reaches_upstream() {
    let h = harness_with("resend", MockAdapter::new("mock").with_resend());
    seed_offer(&h, 1_000, 5).await;
    h.node.wallet.deposit(&user(), Money::from_cents(10_000)).unwrap();
    h.adapter.push_acquire_ok("U1", "+15550001", 0, 1_000);

    let (id, _) = purchase_ok(&h).await;

    // No SMS yet: resend is rejected.
    let err = h.node.orchestrator.request_resend(id, &user()).await.unwrap_err();
    assert!(matches!(err, numio_core::NumioError::InvalidRequest(_)));

    // First message arrives through a poll cycle.
    h.adapter.set_status(
        "U1",
        StatusResult {
            status: UpstreamStatus::Received,
            messages: vec![UpstreamMessage {
                id: "m1".into(),
                sender: None,
                content: "code 111".into(),
                code: Some("111".into()),
                received_at: h.node.kernel.now(),
            }],
        },
    );
    h.node.cache.due_add(id, h.node.kernel.now() * 1000).unwrap();
    h.node.poll.run_cycle().await.unwrap();

    let status = numio_saga::status::order_status(&h.node.store, id, &user(), true).unwrap();
    assert_eq!(status.state, ActivationState::Received);
    assert_eq!(status.sms_count, 1);
    assert_eq!(status.messages[0].code, "111");
    assert!(status.can_request_resend);

    let act = h.node.store.get_activation(id).unwrap().unwrap();
    let before = h.node.store.get_number(act.number_id.unwrap()).unwrap().unwrap();

    h.node.orchestrator.request_resend(id, &user()).await.unwrap();
    assert_eq!(h.adapter.resent_ids(), vec!["U1".to_string()]);

    // The delivery window stretched and a prompt poll is scheduled.
    let after = h.node.store.get_number(act.number_id.unwrap()).unwrap().unwrap();
    assert!(after.expires_at >= before.expires_at);
    assert!(h.node.cache.due_score(id).unwrap().is_some());
}
