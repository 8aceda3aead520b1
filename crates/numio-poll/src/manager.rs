use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use numio_adapter::{AdapterRegistry, ProviderAdapter, StatusResult, UpstreamStatus};
use numio_core::{
    Activation, ActivationId, ActivationState, NumberId, NumioError, PollCursor, ProviderId,
    SmsMessage, Timestamp, ADAPTER_CALL_TIMEOUT_SECS, BATCH_CHUNK_SIZE,
    BATCH_CHUNK_TIMEOUT_SECS, BATCH_MAX_PARALLEL_CHUNKS, BATCH_MIN_GROUP,
    NUMBER_EXTENDED_TIMEOUT_SECS, POLL_CYCLE_LOCK_KEY, POLL_CYCLE_LOCK_TTL_SECS,
};
use numio_kernel::{Kernel, TransitionCtx};
use numio_store::{CacheStore, Store};

use crate::breaker::CircuitBreaker;
use crate::schedule::{next_poll, ScheduleDecision, ScheduleInput};

// ── Report ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize)]
pub struct CycleReport {
    /// True when another worker held the cycle lock.
    pub skipped: bool,
    pub total_polled: u32,
    pub providers_polled: u32,
    pub sms_received: u32,
    pub errors: u32,
    /// Individual calls avoided by riding batched status calls.
    pub api_calls_saved: u32,
    pub duration_ms: u64,
    pub phase_distribution: BTreeMap<String, u32>,
}

// ── Manager ──────────────────────────────────────────────────────────────────

struct PollItem {
    activation: Activation,
    number_id: NumberId,
    upstream_id: String,
    cursor: PollCursor,
}

enum ItemOutcome {
    Status(StatusResult),
    Error(String),
}

pub struct PollManager {
    store: Arc<Store>,
    cache: Arc<CacheStore>,
    kernel: Arc<Kernel>,
    adapters: AdapterRegistry,
    breakers: Mutex<HashMap<ProviderId, CircuitBreaker>>,
    rng: Mutex<StdRng>,
}

impl PollManager {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<CacheStore>,
        kernel: Arc<Kernel>,
        adapters: AdapterRegistry,
    ) -> Self {
        Self {
            store,
            cache,
            kernel,
            adapters,
            breakers: Mutex::new(HashMap::new()),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic jitter for tests.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Run one poll cycle. Single writer across all processes; returns a
    /// skipped report when the cycle lock is held elsewhere.
    pub async fn run_cycle(&self) -> Result<CycleReport, NumioError> {
        let started = Instant::now();
        let now = self.kernel.now();
        let now_ms = now * 1000;

        let Some(_lock) = self
            .cache
            .try_lock(POLL_CYCLE_LOCK_KEY, now, POLL_CYCLE_LOCK_TTL_SECS)?
        else {
            debug!("poll cycle lock held elsewhere");
            return Ok(CycleReport { skipped: true, ..Default::default() });
        };

        let mut report = CycleReport::default();
        let due = self.cache.due_fetch(now_ms)?;
        if due.is_empty() {
            report.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(report);
        }

        // Load rows; anything not pollable leaves the index.
        let mut by_provider: BTreeMap<ProviderId, Vec<PollItem>> = BTreeMap::new();
        for id in due {
            match self.load_pollable(id)? {
                Some(item) => by_provider
                    .entry(item.activation.provider_id.clone())
                    .or_default()
                    .push(item),
                None => {
                    self.cache.due_remove(id)?;
                    self.cache.remove_cursor(id)?;
                }
            }
        }

        for (provider_id, items) in by_provider {
            report.providers_polled += 1;
            self.poll_provider(&provider_id, items, now, &mut report).await?;
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        numio_kernel::metrics::inc("poll_cycles_total", &[]);
        numio_kernel::metrics::inc_by("poll_sms_received_total", &[], report.sms_received as u64);
        info!(
            polled = report.total_polled,
            providers = report.providers_polled,
            sms = report.sms_received,
            errors = report.errors,
            saved = report.api_calls_saved,
            "poll cycle"
        );
        Ok(report)
    }

    fn load_pollable(&self, id: ActivationId) -> Result<Option<PollItem>, NumioError> {
        let Some(activation) = self.store.get_activation(id)? else {
            return Ok(None);
        };
        if !matches!(
            activation.state,
            ActivationState::Active | ActivationState::Received
        ) {
            return Ok(None);
        }
        let (Some(number_id), Some(upstream_id)) =
            (activation.number_id, activation.upstream_id.clone())
        else {
            return Ok(None);
        };
        let cursor = self.cache.cursor(id)?;
        Ok(Some(PollItem { activation, number_id, upstream_id, cursor }))
    }

    // ── Provider group ───────────────────────────────────────────────────────

    async fn poll_provider(
        &self,
        provider_id: &ProviderId,
        mut items: Vec<PollItem>,
        now: Timestamp,
        report: &mut CycleReport,
    ) -> Result<(), NumioError> {
        let adapter = match self.adapters.get(provider_id) {
            Ok(a) => a,
            Err(e) => {
                warn!(provider = %provider_id, error = %e, "no adapter for provider");
                report.errors += items.len() as u32;
                for item in items {
                    self.reschedule(item, now, true, false, report)?;
                }
                return Ok(());
            }
        };

        // Breaker gate: open means rule-1 rescheduling for the whole group;
        // half-open lets exactly one trial item through.
        let (open, half_open) = {
            let mut breakers = self.breakers.lock().expect("breakers poisoned");
            let b = breakers.entry(provider_id.clone()).or_default();
            (b.is_open(now), b.is_half_open())
        };
        if open {
            for item in items {
                self.reschedule(item, now, false, true, report)?;
            }
            return Ok(());
        }
        if half_open {
            let trial = items.pop();
            for item in items {
                self.reschedule(item, now, false, true, report)?;
            }
            if let Some(item) = trial {
                let outcomes = self.poll_individual(&adapter, vec![item]).await;
                self.settle(provider_id, outcomes, now, report)?;
            }
            return Ok(());
        }

        let use_batch = adapter.supports_status_batch() && items.len() >= BATCH_MIN_GROUP;
        let outcomes = if use_batch {
            let chunk_count = items.len().div_ceil(BATCH_CHUNK_SIZE);
            report.api_calls_saved += (items.len() - chunk_count) as u32;
            self.poll_batched(&adapter, items).await
        } else {
            self.poll_individual(&adapter, items).await
        };
        self.settle(provider_id, outcomes, now, report)
    }

    async fn poll_individual(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        items: Vec<PollItem>,
    ) -> Vec<(PollItem, ItemOutcome)> {
        let futures = items.into_iter().map(|item| {
            let adapter = Arc::clone(adapter);
            async move {
                let result = tokio::time::timeout(
                    Duration::from_secs(ADAPTER_CALL_TIMEOUT_SECS),
                    adapter.status(&item.upstream_id),
                )
                .await;
                let outcome = match result {
                    Ok(Ok(status)) => ItemOutcome::Status(status),
                    Ok(Err(e)) => ItemOutcome::Error(e.to_string()),
                    Err(_) => ItemOutcome::Error("status call timed out".into()),
                };
                (item, outcome)
            }
        });
        join_all(futures).await
    }

    async fn poll_batched(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        items: Vec<PollItem>,
    ) -> Vec<(PollItem, ItemOutcome)> {
        let mut chunks: Vec<Vec<PollItem>> = Vec::new();
        let mut current = Vec::with_capacity(BATCH_CHUNK_SIZE);
        for item in items {
            current.push(item);
            if current.len() == BATCH_CHUNK_SIZE {
                chunks.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        let mut outcomes = Vec::new();
        // At most BATCH_MAX_PARALLEL_CHUNKS chunks in flight.
        let mut iter = chunks.into_iter().peekable();
        while iter.peek().is_some() {
            let wave: Vec<Vec<PollItem>> =
                iter.by_ref().take(BATCH_MAX_PARALLEL_CHUNKS).collect();
            let futures = wave.into_iter().map(|chunk| {
                let adapter = Arc::clone(adapter);
                async move {
                    let ids: Vec<String> =
                        chunk.iter().map(|i| i.upstream_id.clone()).collect();
                    let result = tokio::time::timeout(
                        Duration::from_secs(BATCH_CHUNK_TIMEOUT_SECS),
                        adapter.status_batch(&ids),
                    )
                    .await;
                    (chunk, result)
                }
            });
            for (chunk, result) in join_all(futures).await {
                match result {
                    Ok(Ok(mut map)) => {
                        for item in chunk {
                            let outcome = match map.remove(&item.upstream_id) {
                                Some(Ok(status)) => ItemOutcome::Status(status),
                                Some(Err(e)) => ItemOutcome::Error(e.to_string()),
                                None => ItemOutcome::Error("missing from batch response".into()),
                            };
                            outcomes.push((item, outcome));
                        }
                    }
                    Ok(Err(e)) => {
                        let msg = e.to_string();
                        for item in chunk {
                            outcomes.push((item, ItemOutcome::Error(msg.clone())));
                        }
                    }
                    Err(_) => {
                        for item in chunk {
                            outcomes
                                .push((item, ItemOutcome::Error("batch call timed out".into())));
                        }
                    }
                }
            }
        }
        outcomes
    }

    // ── Result settlement ────────────────────────────────────────────────────

    fn settle(
        &self,
        provider_id: &ProviderId,
        outcomes: Vec<(PollItem, ItemOutcome)>,
        now: Timestamp,
        report: &mut CycleReport,
    ) -> Result<(), NumioError> {
        for (item, outcome) in outcomes {
            report.total_polled += 1;
            match outcome {
                ItemOutcome::Status(status) => {
                    self.record_breaker(provider_id, now, true);
                    if !status.messages.is_empty() {
                        let new = self.ingest_messages(&item, &status.messages, now)?;
                        report.sms_received += new;
                        let mut item = item;
                        if new > 0 {
                            item.cursor.last_sms_at = Some(now);
                        }
                        self.reschedule(item, now, false, false, report)?;
                    } else if matches!(
                        status.status,
                        UpstreamStatus::Cancelled | UpstreamStatus::Expired
                    ) {
                        // Settled upstream; the reaper reconciles the rows.
                        self.cache.due_remove(item.activation.id)?;
                        self.cache.remove_cursor(item.activation.id)?;
                    } else if status.status == UpstreamStatus::Error {
                        report.errors += 1;
                        self.reschedule(item, now, true, false, report)?;
                    } else {
                        self.reschedule(item, now, false, false, report)?;
                    }
                }
                ItemOutcome::Error(msg) => {
                    debug!(id = %item.activation.id, error = %msg, "poll error");
                    report.errors += 1;
                    self.record_breaker(provider_id, now, false);
                    self.reschedule(item, now, true, false, report)?;
                }
            }
        }
        Ok(())
    }

    fn record_breaker(&self, provider_id: &ProviderId, now: Timestamp, ok: bool) {
        let mut breakers = self.breakers.lock().expect("breakers poisoned");
        let b = breakers.entry(provider_id.clone()).or_default();
        if ok {
            b.record_success(now);
        } else {
            b.record_failure(now);
        }
    }

    /// SMS arrival: idempotent ingestion, first-message transition, expiry
    /// extension.
    fn ingest_messages(
        &self,
        item: &PollItem,
        messages: &[numio_adapter::UpstreamMessage],
        now: Timestamp,
    ) -> Result<u32, NumioError> {
        let mut new = 0u32;
        for msg in messages {
            let code = msg
                .code
                .clone()
                .unwrap_or_else(|| msg.content.clone());
            let inserted = self.store.insert_sms_if_absent(&SmsMessage {
                number_id: item.number_id,
                code,
                content: msg.content.clone(),
                sender: msg.sender.clone(),
                received_at: if msg.received_at > 0 { msg.received_at } else { now },
            })?;
            if inserted {
                new += 1;
            }
        }
        if new == 0 {
            return Ok(0);
        }

        if item.activation.state == ActivationState::Active {
            self.kernel.transition(
                item.activation.id,
                ActivationState::Received,
                TransitionCtx::new("sms received", item.activation.trace_id.clone())
                    .with_metadata(serde_json::json!({ "newMessages": new })),
            )?;
        }

        // First message stretches the window from base to extended timeout.
        if let Some(mut number) = self.store.get_number(item.number_id)? {
            let extended = number.created_at + NUMBER_EXTENDED_TIMEOUT_SECS;
            if number.expires_at < extended {
                number.expires_at = extended;
            }
            if number.status == numio_core::NumberStatus::Active {
                number.status = numio_core::NumberStatus::Received;
            }
            self.store.put_number(&number)?;
        }
        Ok(new)
    }

    fn reschedule(
        &self,
        item: PollItem,
        now: Timestamp,
        errored: bool,
        circuit_open: bool,
        report: &mut CycleReport,
    ) -> Result<(), NumioError> {
        let sms_count = self.store.sms_count(item.number_id)?;
        let input = ScheduleInput {
            order_age_secs: now - item.activation.created_at,
            sms_count,
            since_last_sms_secs: item
                .cursor
                .last_sms_at
                .map(|at| now - at)
                .unwrap_or(i64::MAX),
            poll_attempt: item.cursor.attempt,
            circuit_open,
            last_poll_error: errored,
        };
        let decision: ScheduleDecision = {
            let mut rng = self.rng.lock().expect("rng poisoned");
            next_poll(input, &mut *rng)
        };
        *report
            .phase_distribution
            .entry(decision.phase.label().to_string())
            .or_insert(0) += 1;

        let due_ms = now * 1000 + (decision.delay_secs * 1000.0) as i64;
        self.cache.due_add(item.activation.id, due_ms)?;
        self.cache.put_cursor(
            item.activation.id,
            &PollCursor {
                attempt: item.cursor.attempt.wrapping_add(1),
                last_error: errored,
                last_sms_at: item.cursor.last_sms_at,
            },
        )?;
        Ok(())
    }
}
