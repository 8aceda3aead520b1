//! Scriptable in-memory adapter, the workhorse of the scenario tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use numio_core::{Money, NumioError, ProviderId};

use crate::{
    AcquireOptions, AcquiredNumber, Country, ProviderAdapter, Service, StatusResult,
    UpstreamStatus,
};

#[derive(Default)]
struct MockState {
    acquire_queue: VecDeque<Result<AcquiredNumber, NumioError>>,
    statuses: HashMap<String, StatusResult>,
    offers: Vec<crate::RawOffer>,
    cancelled: Vec<String>,
    resent: Vec<String>,
    acquire_calls: u32,
    status_calls: u32,
    batch_calls: u32,
    /// When set, every status call fails with a transport error.
    status_failing: bool,
}

pub struct MockAdapter {
    provider_id: ProviderId,
    state: Mutex<MockState>,
    batch_capable: bool,
    resend_capable: bool,
}

impl MockAdapter {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: ProviderId::new(provider_id),
            state: Mutex::new(MockState::default()),
            batch_capable: false,
            resend_capable: false,
        }
    }

    pub fn with_batch(mut self) -> Self {
        self.batch_capable = true;
        self
    }

    pub fn with_resend(mut self) -> Self {
        self.resend_capable = true;
        self
    }

    // ── Scripting ────────────────────────────────────────────────────────────

    /// Queue the result of the next `acquire` call.
    pub fn push_acquire(&self, result: Result<AcquiredNumber, NumioError>) {
        self.state.lock().unwrap().acquire_queue.push_back(result);
    }

    pub fn push_acquire_ok(&self, upstream_id: &str, phone: &str, expires_at: i64, cents: i64) {
        self.push_acquire(Ok(AcquiredNumber {
            upstream_id: upstream_id.into(),
            phone: phone.into(),
            expires_at,
            price: Money::from_cents(cents),
        }));
    }

    /// Set what `status(upstream_id)` reports from now on.
    pub fn set_status(&self, upstream_id: &str, result: StatusResult) {
        self.state
            .lock()
            .unwrap()
            .statuses
            .insert(upstream_id.into(), result);
    }

    pub fn set_status_failing(&self, failing: bool) {
        self.state.lock().unwrap().status_failing = failing;
    }

    /// Replace the priced catalog `offers()` reports.
    pub fn set_offers(&self, offers: Vec<crate::RawOffer>) {
        self.state.lock().unwrap().offers = offers;
    }

    // ── Observations ─────────────────────────────────────────────────────────

    pub fn cancelled_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn resent_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().resent.clone()
    }

    pub fn acquire_calls(&self) -> u32 {
        self.state.lock().unwrap().acquire_calls
    }

    pub fn status_calls(&self) -> u32 {
        self.state.lock().unwrap().status_calls
    }

    pub fn batch_calls(&self) -> u32 {
        self.state.lock().unwrap().batch_calls
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn provider_id(&self) -> ProviderId {
        self.provider_id.clone()
    }

    async fn list_countries(&self) -> Result<Vec<Country>, NumioError> {
        Ok(vec![
            Country { id: "0".into(), name: "United States".into() },
            Country { id: "16".into(), name: "United Kingdom".into() },
        ])
    }

    async fn list_services(&self, _country: Option<&str>) -> Result<Vec<Service>, NumioError> {
        Ok(vec![
            Service { id: "tg".into(), name: "Telegram".into(), icon_url: None },
            Service { id: "wa".into(), name: "WhatsApp".into(), icon_url: None },
        ])
    }

    async fn acquire(
        &self,
        _country: &str,
        _service: &str,
        _opts: AcquireOptions,
    ) -> Result<AcquiredNumber, NumioError> {
        let mut st = self.state.lock().unwrap();
        st.acquire_calls += 1;
        st.acquire_queue.pop_front().unwrap_or(Err(NumioError::NoNumbers))
    }

    async fn status(&self, upstream_id: &str) -> Result<StatusResult, NumioError> {
        let mut st = self.state.lock().unwrap();
        st.status_calls += 1;
        if st.status_failing {
            return Err(NumioError::Transport("mock outage".into()));
        }
        Ok(st
            .statuses
            .get(upstream_id)
            .cloned()
            .unwrap_or(StatusResult { status: UpstreamStatus::Pending, messages: vec![] }))
    }

    async fn cancel(&self, upstream_id: &str) -> Result<(), NumioError> {
        let mut st = self.state.lock().unwrap();
        st.cancelled.push(upstream_id.to_string());
        st.statuses.insert(
            upstream_id.to_string(),
            StatusResult { status: UpstreamStatus::Cancelled, messages: vec![] },
        );
        Ok(())
    }

    fn supports_status_batch(&self) -> bool {
        self.batch_capable
    }

    async fn status_batch(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Result<StatusResult, NumioError>>, NumioError> {
        let mut st = self.state.lock().unwrap();
        st.batch_calls += 1;
        if st.status_failing {
            return Err(NumioError::Transport("mock outage".into()));
        }
        Ok(ids
            .iter()
            .map(|id| {
                let result = st.statuses.get(id).cloned().unwrap_or(StatusResult {
                    status: UpstreamStatus::Pending,
                    messages: vec![],
                });
                (id.clone(), Ok(result))
            })
            .collect())
    }

    fn supports_resend(&self) -> bool {
        self.resend_capable
    }

    async fn request_resend(&self, upstream_id: &str) -> Result<(), NumioError> {
        if !self.resend_capable {
            return Err(NumioError::NotSupported(self.provider_id()));
        }
        self.state.lock().unwrap().resent.push(upstream_id.to_string());
        Ok(())
    }

    fn supports_offers(&self) -> bool {
        true
    }

    async fn offers(&self) -> Result<Vec<crate::RawOffer>, NumioError> {
        Ok(self.state.lock().unwrap().offers.clone())
    }
}
