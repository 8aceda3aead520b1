//! The reaper: periodic sweeps for everything the happy path missed.
//!
//! Four bounded sweeps per cycle: lapsed offer reservations, expired
//! numbers (with a final status probe for late SMS), zombie funds stuck in
//! RESERVED, and probabilistic housekeeping purges.

use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use numio_adapter::AdapterRegistry;
use numio_catalog::{Catalog, SearchIndex};
use numio_core::{
    ActivationState, EventType, Number, NumberStatus, NumioError, SmsMessage,
    HOUSEKEEPING_PROBABILITY, HOUSEKEEPING_PURGE_AGE_SECS, REAPER_BATCH_SIZE,
    ZOMBIE_RESERVATION_AGE_SECS,
};
use numio_kernel::{Kernel, PendingEvent, TransitionCtx};
use numio_saga::Orchestrator;
use numio_store::{CacheStore, Store};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub reservations_expired: u32,
    pub numbers_expired: u32,
    /// Numbers rescued by the final probe or locally stored messages.
    pub numbers_completed: u32,
    pub zombies_failed: u32,
    pub purged_reservations: u32,
    pub purged_outbox: u32,
    pub housekeeping_ran: bool,
}

pub struct Reaper {
    store: Arc<Store>,
    cache: Arc<CacheStore>,
    kernel: Arc<Kernel>,
    orchestrator: Arc<Orchestrator>,
    catalog: Arc<Catalog>,
    adapters: AdapterRegistry,
    rng: Mutex<StdRng>,
}

impl Reaper {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<CacheStore>,
        kernel: Arc<Kernel>,
        orchestrator: Arc<Orchestrator>,
        catalog: Arc<Catalog>,
        adapters: AdapterRegistry,
    ) -> Self {
        Self {
            store,
            cache,
            kernel,
            orchestrator,
            catalog,
            adapters,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// One full sweep. Per-item errors are logged and skipped; a sweep never
    /// aborts the cycle.
    pub async fn run_once(&self) -> Result<SweepReport, NumioError> {
        let mut report = SweepReport::default();
        self.sweep_reservations(&mut report).await;
        self.sweep_numbers(&mut report).await;
        self.sweep_zombies(&mut report).await;

        let roll: f64 = self.rng.lock().expect("rng poisoned").gen();
        if roll < HOUSEKEEPING_PROBABILITY {
            report.housekeeping_ran = true;
            self.sweep_housekeeping(&mut report);
        }

        if report != SweepReport::default() {
            info!(?report, "reaper sweep");
        }
        Ok(report)
    }

    /// Housekeeping regardless of the dice roll (operator tooling and tests).
    pub fn run_housekeeping(&self) -> SweepReport {
        let mut report = SweepReport { housekeeping_ran: true, ..Default::default() };
        self.sweep_housekeeping(&mut report);
        report
    }

    // ── Sweep 1: lapsed offer reservations ───────────────────────────────────

    async fn sweep_reservations(&self, report: &mut SweepReport) {
        let now = self.kernel.now();
        let lapsed = match self.store.iter_expired_pending_reservations(now, REAPER_BATCH_SIZE) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "reservation sweep scan failed");
                return;
            }
        };
        for resv in lapsed {
            if let Err(e) = self.catalog.expire(resv.id).await {
                warn!(reservation = %resv.id, error = %e, "reservation expiry failed");
                continue;
            }
            report.reservations_expired += 1;
            // Stock changed; let projections and subscribers know.
            if let Ok(Some(offer)) = self.catalog.index().get(&resv.offer_doc_id).await {
                let _ = self.kernel.dispatch_event(PendingEvent {
                    aggregate_type: "offer".into(),
                    aggregate_id: offer.doc_id.clone(),
                    event_type: EventType::OfferUpdated,
                    payload: serde_json::to_value(&offer).unwrap_or_default(),
                    delay_secs: 0,
                });
            }
        }
    }

    // ── Sweep 2: expired numbers ─────────────────────────────────────────────

    async fn sweep_numbers(&self, report: &mut SweepReport) {
        let now = self.kernel.now();
        let expired = match self.store.iter_expired_live_numbers(now, REAPER_BATCH_SIZE) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "number sweep scan failed");
                return;
            }
        };
        for number in expired {
            if let Err(e) = self.settle_number(number, now, report).await {
                warn!(error = %e, "number settlement failed");
            }
        }
    }

    async fn settle_number(
        &self,
        mut number: Number,
        now: i64,
        report: &mut SweepReport,
    ) -> Result<(), NumioError> {
        let activation_id = number.activation_id;

        // Final probe: a message may have landed between the last poll and
        // the expiry boundary.
        let mut probe_found_sms = false;
        if let Ok(adapter) = self.adapters.get(&number.provider_id) {
            match adapter.status(&number.upstream_id).await {
                Ok(status) => {
                    probe_found_sms = !status.messages.is_empty();
                    for msg in &status.messages {
                        let code = msg.code.clone().unwrap_or_else(|| msg.content.clone());
                        self.store.insert_sms_if_absent(&SmsMessage {
                            number_id: number.id,
                            code,
                            content: msg.content.clone(),
                            sender: msg.sender.clone(),
                            received_at: if msg.received_at > 0 { msg.received_at } else { now },
                        })?;
                    }
                }
                Err(e) => debug!(number = %number.id, error = %e, "final probe failed"),
            }
        }
        let has_sms = probe_found_sms || self.store.sms_count(number.id)? > 0;

        if has_sms {
            // Delivered after all: complete instead of expiring.
            number.status = NumberStatus::Completed;
            self.store.put_number(&number)?;
            let activation = self.store.get_activation(activation_id)?;
            if let Some(act) = activation {
                if act.state == ActivationState::Active {
                    self.kernel.transition(
                        activation_id,
                        ActivationState::Received,
                        TransitionCtx::new("sms found at expiry", act.trace_id.clone()),
                    )?;
                }
            }
            report.numbers_completed += 1;
        } else {
            // No delivery: release upstream, expire, refund.
            if let Ok(adapter) = self.adapters.get(&number.provider_id) {
                if let Err(e) = adapter.cancel(&number.upstream_id).await {
                    debug!(number = %number.id, error = %e, "upstream cancel failed");
                }
            }
            number.status = NumberStatus::Expired;
            self.store.put_number(&number)?;

            match self.kernel.transition_expected(
                activation_id,
                ActivationState::Active,
                ActivationState::Expired,
                TransitionCtx::new("no sms before expiry", numio_core::TraceId::new("reaper")),
            ) {
                Ok(_) => {
                    self.orchestrator
                        .process_refund(activation_id, "order expired")
                        .await?;
                    report.numbers_expired += 1;
                }
                Err(NumioError::ActivationConflict { actual, .. }) => {
                    debug!(id = %activation_id, %actual, "expiry lost to concurrent settle");
                }
                Err(e) => return Err(e),
            }
        }

        self.cache.due_remove(activation_id)?;
        self.cache.remove_cursor(activation_id)?;
        Ok(())
    }

    // ── Sweep 3: zombie funds ────────────────────────────────────────────────

    async fn sweep_zombies(&self, report: &mut SweepReport) {
        let cutoff = self.kernel.now() - ZOMBIE_RESERVATION_AGE_SECS;
        let zombies = match self.store.iter_stale_reserved(cutoff, REAPER_BATCH_SIZE) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "zombie sweep scan failed");
                return;
            }
        };
        for activation in zombies {
            match self.orchestrator.fail_zombie(activation.id).await {
                Ok(true) => report.zombies_failed += 1,
                Ok(false) => {}
                Err(e) => warn!(id = %activation.id, error = %e, "zombie settlement failed"),
            }
        }
    }

    // ── Sweep 4: housekeeping ────────────────────────────────────────────────

    fn sweep_housekeeping(&self, report: &mut SweepReport) {
        let cutoff = self.kernel.now() - HOUSEKEEPING_PURGE_AGE_SECS;

        match self.store.iter_dead_reservations(cutoff, REAPER_BATCH_SIZE) {
            Ok(dead) => {
                for resv in dead {
                    if self.store.remove_reservation(resv.id).is_ok() {
                        report.purged_reservations += 1;
                    }
                }
            }
            Err(e) => warn!(error = %e, "reservation purge scan failed"),
        }

        match self.store.iter_settled_outbox(cutoff, REAPER_BATCH_SIZE) {
            Ok(settled) => {
                for row in settled {
                    if self.store.remove_outbox(row.id).is_ok() {
                        report.purged_outbox += 1;
                    }
                }
            }
            Err(e) => warn!(error = %e, "outbox purge scan failed"),
        }
    }
}
